use serde::Serialize;

/// Body returned by a successful export.
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub success: bool,
    /// Time-limited signed URL of the stored PDF.
    pub path: String,
}

impl ExportResponse {
    pub fn published(path: impl Into<String>) -> Self {
        Self {
            success: true,
            path: path.into(),
        }
    }
}
