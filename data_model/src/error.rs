use thiserror::Error;

/// Protocol level failures shared by the registry, the blob store adapter and
/// the HTTP surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("signed url expired")]
    ExpiredClaim,

    #[error("signed url signature is invalid")]
    InvalidSignature,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("size mismatch: declared {declared} bytes, stored {stored} bytes")]
    SizeMismatch { declared: u64, stored: u64 },

    #[error("range not satisfiable for object of {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    #[error("conflicting write: {0}")]
    ConflictingWrite(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArtifactError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

impl From<anyhow::Error> for ArtifactError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;
