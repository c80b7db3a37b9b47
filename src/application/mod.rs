//! Application services: rendering, publishing and the export pipeline.

pub mod error;
pub mod export;
pub mod identity;
pub mod publish;
pub mod render;
