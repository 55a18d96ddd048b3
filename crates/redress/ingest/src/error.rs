use thiserror::Error;

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Ingestion-layer errors. Per-row problems are values, not errors; only
/// file- and upload-level conditions surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file error: {0}")]
    File(String),

    #[error("unsupported spreadsheet format: {0}")]
    UnsupportedFormat(String),

    #[error("file exceeds the size limit: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("spreadsheet has no header row")]
    NoHeaders,

    #[error("required columns missing: {0}")]
    MissingColumns(String),

    #[error("storage error: {0}")]
    Store(#[from] redress_store::StoreError),
}
