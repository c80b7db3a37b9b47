//! Visual readiness detection for asynchronously rendered pages.
//!
//! `load` and `networkidle` fire before web fonts, images and charts have been
//! painted. The detector instead samples the DOM until nearly every element is
//! visible and sized. Elements hidden on purpose (off-screen carousel slides,
//! collapsed menus) keep the ratio below 1.0 forever, which is why the
//! threshold is a tolerance band that needs calibrating per template rather
//! than a proof of completeness.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::DomProbe;

pub const DEFAULT_COMPLETION_THRESHOLD: f64 = 0.99;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunables for [`ReadinessDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessPolicy {
    /// Longest time to keep polling before capturing anyway.
    pub timeout: Duration,
    /// Delay between DOM samples.
    pub poll_interval: Duration,
    /// Completion ratio at or above which the page counts as painted.
    pub threshold: f64,
    /// Extra wait after the threshold is met, for last-frame layout jitter.
    pub settle_delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            threshold: DEFAULT_COMPLETION_THRESHOLD,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Outcome of waiting for a page. Neither variant is an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Readiness {
    Ready {
        ratio: f64,
        waited: Duration,
    },
    /// The budget ran out first; capture proceeds with whatever has painted.
    Degraded {
        last_ratio: Option<f64>,
        waited: Duration,
    },
}

impl Readiness {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Readiness::Degraded { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Ready { .. } => "ready",
            Readiness::Degraded { .. } => "degraded",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessDetector {
    policy: ReadinessPolicy,
}

impl ReadinessDetector {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Poll `probe` until the page is ready or the budget is exhausted.
    ///
    /// Sampling failures (for example an execution context destroyed by a
    /// client-side redirect) count as "not ready yet".
    pub async fn wait<P>(&self, probe: &P) -> Readiness
    where
        P: DomProbe + ?Sized,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut ticker = time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_ratio = None;
        let mut samples: u64 = 0;

        loop {
            if time::timeout_at(deadline, ticker.tick()).await.is_err() {
                break;
            }

            let sample = match time::timeout_at(deadline, probe.sample_dom()).await {
                Err(_) => break,
                Ok(Err(err)) => {
                    debug!(
                        target = "application::render::readiness",
                        op = "readiness::sample",
                        error = %err,
                        "DOM sample failed; retrying"
                    );
                    continue;
                }
                Ok(Ok(sample)) => sample,
            };

            samples += 1;
            let ratio = sample.completion_ratio();
            last_ratio = Some(ratio);

            if sample.is_document_complete() && ratio >= self.policy.threshold {
                time::sleep(self.policy.settle_delay).await;
                let waited = started.elapsed();
                info!(
                    target = "application::render::readiness",
                    op = "readiness::wait",
                    result = "ready",
                    ratio,
                    samples,
                    elapsed_ms = waited.as_millis() as u64,
                    "Page reached readiness threshold"
                );
                return Readiness::Ready { ratio, waited };
            }
        }

        let waited = started.elapsed();
        warn!(
            target = "application::render::readiness",
            op = "readiness::wait",
            result = "degraded",
            last_ratio = last_ratio.unwrap_or(0.0),
            threshold = self.policy.threshold,
            samples,
            elapsed_ms = waited.as_millis() as u64,
            "Readiness budget exhausted; capturing with incomplete content"
        );
        Readiness::Degraded { last_ratio, waited }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::render::types::{DomSample, RenderError};

    /// Replays scripted samples, then repeats the last one forever.
    struct ScriptedProbe {
        script: Mutex<VecDeque<Result<DomSample, RenderError>>>,
        steady: DomSample,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<DomSample, RenderError>>, steady: DomSample) -> Self {
            Self {
                script: Mutex::new(script.into()),
                steady,
                calls: AtomicUsize::new(0),
            }
        }

        fn steady(sample: DomSample) -> Self {
            Self::new(Vec::new(), sample)
        }
    }

    #[async_trait]
    impl DomProbe for ScriptedProbe {
        async fn sample_dom(&self) -> Result<DomSample, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or_else(|| Ok(self.steady.clone()))
        }
    }

    /// Never answers; simulates a page whose renderer is wedged.
    struct HungProbe;

    #[async_trait]
    impl DomProbe for HungProbe {
        async fn sample_dom(&self) -> Result<DomSample, RenderError> {
            std::future::pending().await
        }
    }

    fn policy(timeout_secs: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(timeout_secs),
            ..ReadinessPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_once_threshold_met_then_settles() {
        let probe = ScriptedProbe::new(
            vec![
                Ok(DomSample::new("loading", 50, 10)),
                Ok(DomSample::new("complete", 100, 80)),
            ],
            DomSample::new("complete", 100, 99),
        );
        let detector = ReadinessDetector::new(policy(30));

        let outcome = detector.wait(&probe).await;

        match outcome {
            Readiness::Ready { ratio, waited } => {
                assert!(ratio >= DEFAULT_COMPLETION_THRESHOLD);
                assert!(waited >= DEFAULT_SETTLE_DELAY);
                assert!(waited < Duration::from_secs(30));
            }
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_document_is_not_ready_even_at_full_ratio() {
        let probe = ScriptedProbe::new(
            vec![Ok(DomSample::new("interactive", 10, 10))],
            DomSample::new("complete", 10, 10),
        );
        let outcome = ReadinessDetector::new(policy(30)).wait(&probe).await;
        assert!(!outcome.is_degraded());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_when_threshold_never_reached() {
        let probe = ScriptedProbe::steady(DomSample::new("complete", 100, 90));
        let detector = ReadinessDetector::new(policy(5));

        let outcome = detector.wait(&probe).await;

        match outcome {
            Readiness::Degraded { last_ratio, waited } => {
                assert_eq!(last_ratio, Some(0.9));
                assert!(waited >= Duration::from_secs(5));
                assert!(waited < Duration::from_secs(6));
            }
            other => panic!("expected degraded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn static_dom_reports_the_same_ratio_every_sample() {
        let probe = ScriptedProbe::steady(DomSample::new("complete", 311, 287));
        let expected = DomSample::new("complete", 311, 287).completion_ratio();

        let outcome = ReadinessDetector::new(policy(2)).wait(&probe).await;

        assert!(probe.calls.load(Ordering::SeqCst) > 1);
        assert!(matches!(
            outcome,
            Readiness::Degraded { last_ratio: Some(ratio), .. } if ratio == expected
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_errors_are_retried() {
        let probe = ScriptedProbe::new(
            vec![
                Err(RenderError::evaluation("execution context was destroyed")),
                Err(RenderError::evaluation("execution context was destroyed")),
            ],
            DomSample::new("complete", 40, 40),
        );
        let outcome = ReadinessDetector::new(policy(30)).wait(&probe).await;
        assert!(matches!(outcome, Readiness::Ready { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_cannot_outlast_the_budget() {
        let outcome = ReadinessDetector::new(policy(3)).wait(&HungProbe).await;
        assert_eq!(
            outcome,
            Readiness::Degraded {
                last_ratio: None,
                waited: Duration::from_secs(3),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn custom_threshold_is_respected() {
        let probe = ScriptedProbe::steady(DomSample::new("complete", 100, 90));
        let detector = ReadinessDetector::new(ReadinessPolicy {
            threshold: 0.85,
            settle_delay: Duration::ZERO,
            ..policy(10)
        });
        assert!(matches!(
            detector.wait(&probe).await,
            Readiness::Ready { .. }
        ));
    }
}
