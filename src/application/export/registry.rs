use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::export::{PresentationId, UserId};

const IN_FLIGHT_GAUGE: &str = "deckpress_exports_in_flight";

#[derive(Debug, Clone)]
struct InFlightEntry {
    presentation_id: PresentationId,
    user_id: UserId,
    started_at: OffsetDateTime,
    started: Instant,
}

/// Point-in-time view of one running export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightExport {
    pub export_id: Uuid,
    pub presentation_id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_ms: u64,
}

/// Exports currently running in this process, keyed by a generated id.
///
/// Entries are removed by [`ExportGuard`] on drop, which covers success,
/// failure and a caller that disconnects mid-render.
#[derive(Default, Clone)]
pub struct InFlightExports {
    exports: Arc<DashMap<Uuid, InFlightEntry>>,
}

impl InFlightExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, presentation_id: &PresentationId, user_id: &UserId) -> ExportGuard {
        let export_id = Uuid::new_v4();
        self.exports.insert(
            export_id,
            InFlightEntry {
                presentation_id: presentation_id.clone(),
                user_id: user_id.clone(),
                started_at: OffsetDateTime::now_utc(),
                started: Instant::now(),
            },
        );
        gauge!(IN_FLIGHT_GAUGE).set(self.exports.len() as f64);

        ExportGuard {
            export_id,
            exports: Arc::clone(&self.exports),
        }
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Running exports, oldest first.
    pub fn snapshot(&self) -> Vec<InFlightExport> {
        let mut exports: Vec<InFlightExport> = self
            .exports
            .iter()
            .map(|entry| InFlightExport {
                export_id: *entry.key(),
                presentation_id: entry.presentation_id.as_str().to_string(),
                user_id: entry.user_id.as_str().to_string(),
                started_at: entry.started_at,
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        exports.sort_by_key(|export| export.started_at);
        exports
    }
}

pub struct ExportGuard {
    export_id: Uuid,
    exports: Arc<DashMap<Uuid, InFlightEntry>>,
}

impl ExportGuard {
    pub fn export_id(&self) -> Uuid {
        self.export_id
    }
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        self.exports.remove(&self.export_id);
        gauge!(IN_FLIGHT_GAUGE).set(self.exports.len() as f64);
    }
}
