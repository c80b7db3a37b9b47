//! Headless-browser PDF export for rendered presentations.
//!
//! A presentation page is loaded in an isolated Chromium instance, captured
//! once it has visibly finished rendering, and published to object storage
//! behind a time-limited signed URL.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
