use data_model::ArtifactError;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No chunk exists for the object.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// Storage url or object path could not be parsed.
    #[error("invalid blob path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A chunk already exists at the target offset.
    #[error("chunk at offset {offset} of {key} already exists")]
    ConflictingWrite { key: String, offset: u64 },

    #[error("range not satisfiable for {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    /// Chunk request body exceeded the configured limit.
    #[error("chunk exceeds the {limit} byte limit")]
    ChunkTooLarge { limit: u64 },

    /// Stored chunks do not form one contiguous byte sequence.
    #[error("inconsistent chunks for {key}: {reason}")]
    Inconsistent { key: String, reason: String },

    #[error("blob store error: {source:#}")]
    Backend {
        #[source]
        source: anyhow::Error,
    },
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { key: path },
            object_store::Error::AlreadyExists { path, .. } => BlobError::ConflictingWrite {
                key: path,
                offset: 0,
            },
            _ => BlobError::Backend {
                source: anyhow::Error::from(err),
            },
        }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Backend { source: err }
    }
}

impl From<url::ParseError> for BlobError {
    fn from(err: url::ParseError) -> Self {
        BlobError::InvalidPath {
            path: String::new(),
            reason: err.to_string(),
        }
    }
}

impl From<BlobError> for ArtifactError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { key } => ArtifactError::NotFound(key),
            BlobError::ConflictingWrite { .. } => ArtifactError::ConflictingWrite(err.to_string()),
            BlobError::RangeNotSatisfiable { total } => {
                ArtifactError::RangeNotSatisfiable { total }
            }
            BlobError::ChunkTooLarge { .. } => ArtifactError::InvalidArgument(err.to_string()),
            BlobError::InvalidPath { .. } |
            BlobError::Inconsistent { .. } |
            BlobError::Backend { .. } => ArtifactError::Internal(err.to_string()),
        }
    }
}
