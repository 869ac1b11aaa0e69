use thiserror::Error;

use crate::model::{GroupId, RecordRef};

/// Raised by the sanitizer only when the candidate batch itself is not a list.
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("NotASequence: expected a list of mask candidates, got {0}")]
    NotASequence(&'static str),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("ProviderFailed: {0}")]
    Failed(String),
    #[error("ProviderTimeout: no answer after {0}s")]
    Timeout(u64),
    #[error("MalformedOutput: {0}")]
    MalformedOutput(String),
    #[error("MalformedOutput: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("DatabaseError: {0}")]
    Database(#[from] libsql::Error),
    #[error("RecordNotFound: {0}")]
    NotFound(RecordRef),
    #[error("GroupNotFound: {0}")]
    GroupNotFound(GroupId),
    #[error("PersistenceError: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("ExportError: no image selected")]
    NoImage,
    #[error("ExportError: no masks to export")]
    NoMasks,
    #[error("ExportError: missing group id on this session")]
    MissingGroup,
    #[error("ExportError: mask #{position} is degenerate ({reason})")]
    InvalidMask { position: usize, reason: &'static str },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("ValidationError: {0}")]
    ValidationError(String),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
