use std::sync::Arc;

use axum::body::Body;
use blob_store::BlobStorage;
use bytes::Bytes;
use data_model::{
    ArtifactError,
    ArtifactKey,
    ArtifactRecord,
    ArtifactResult,
    ArtifactScope,
    ArtifactStatus,
    Completion,
    ContentHash,
    HashAlgorithm,
    SizeCheck,
};
use futures::{Stream, StreamExt};
use metrics::api_io_stats;
use opentelemetry::KeyValue;
use state_store::{ArtifactRegistry, CreateOutcome, DeleteOutcome, ListFilter};
use tracing::{info, instrument, warn};

use crate::{
    key_locks::KeyLocks,
    range::ServedRange,
    signed_url::{ClaimPurpose, SignedUrlIssuer},
};

pub struct CreatedArtifact {
    pub record: ArtifactRecord,
    pub upload_url: String,
}

/// A download ready to be streamed.
pub struct ArtifactDownload {
    pub record: ArtifactRecord,
    pub range: ServedRange,
    pub body: Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadSurface {
    Signed,
    User,
}

/// Drives the create, upload, finalize lifecycle. Mutations of one artifact
/// are serialized by a per-key lock; unrelated artifacts proceed
/// independently.
pub struct ArtifactService {
    registry: Arc<dyn ArtifactRegistry>,
    blob_storage: Arc<BlobStorage>,
    signer: Arc<SignedUrlIssuer>,
    size_check: SizeCheck,
    locks: KeyLocks,
    metrics: Arc<api_io_stats::Metrics>,
}

impl ArtifactService {
    pub fn new(
        registry: Arc<dyn ArtifactRegistry>,
        blob_storage: Arc<BlobStorage>,
        signer: Arc<SignedUrlIssuer>,
        size_check: SizeCheck,
        metrics: Arc<api_io_stats::Metrics>,
    ) -> Self {
        Self {
            registry,
            blob_storage,
            signer,
            size_check,
            locks: KeyLocks::new(),
            metrics,
        }
    }

    pub fn signer(&self) -> &SignedUrlIssuer {
        &self.signer
    }

    #[instrument(skip(self), fields(run_id = %key.scope.run_id, job_id = %key.scope.job_id, artifact = %key.name))]
    pub async fn create_artifact(
        &self,
        key: &ArtifactKey,
        expires_at: Option<u64>,
    ) -> ArtifactResult<CreatedArtifact> {
        let _guard = self.locks.lock(&key.key()).await;
        let outcome = self.registry.create(key, expires_at).await?;
        match &outcome {
            CreateOutcome::Created(record) => {
                // chunks left by an earlier incarnation of this key
                self.blob_storage.delete(key).await?;
                self.metrics.artifacts_created.add(1, &[]);
                info!(artifact_id = record.id, "artifact created");
            }
            CreateOutcome::Pending(record) => {
                // a retried upload starts over from offset 0
                self.blob_storage.delete(key).await?;
                info!(artifact_id = record.id, "pending artifact reset for retry");
            }
            CreateOutcome::Complete(record) => {
                info!(artifact_id = record.id, "artifact already complete");
            }
        }
        Ok(CreatedArtifact {
            upload_url: self.signer.issue(ClaimPurpose::Upload, key),
            record: outcome.into_record(),
        })
    }

    /// Appends one chunk at the current end of a Pending artifact.
    #[instrument(skip(self, data), fields(run_id = %key.scope.run_id, job_id = %key.scope.job_id, artifact = %key.name))]
    pub async fn upload_chunk<S, E>(&self, key: &ArtifactKey, data: S) -> ArtifactResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Into<anyhow::Error>,
    {
        let _guard = self.locks.lock(&key.key()).await;
        let record = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| ArtifactError::not_found(format!("artifact {}", key)))?;
        if record.status != ArtifactStatus::Pending {
            return Err(ArtifactError::ConflictingWrite(format!(
                "artifact {} is {}",
                key, record.status
            )));
        }
        let mut handle = self.blob_storage.open_for_write(key).await?;
        let written = self.blob_storage.append(&mut handle, data).await?;
        self.metrics.upload_bytes.add(written, &[]);
        Ok(written)
    }

    #[instrument(skip(self, declared_hash), fields(run_id = %key.scope.run_id, job_id = %key.scope.job_id, artifact = %key.name))]
    pub async fn finalize_artifact(
        &self,
        key: &ArtifactKey,
        declared_size: u64,
        declared_hash: Option<ContentHash>,
    ) -> ArtifactResult<ArtifactRecord> {
        let _guard = self.locks.lock(&key.key()).await;
        match self.registry.get(key).await? {
            Some(record) if record.status == ArtifactStatus::Pending => {}
            _ => {
                return Err(ArtifactError::not_found(format!(
                    "no pending artifact {}",
                    key
                )))
            }
        }

        let algorithm = match (&declared_hash, self.size_check) {
            (Some(hash), _) => hash.algorithm,
            (None, SizeCheck::Strict) => {
                return Err(ArtifactError::invalid_argument(
                    "hash is required to finalize an artifact",
                ))
            }
            (None, SizeCheck::Advisory) => HashAlgorithm::Sha256,
        };

        let completion = match self
            .verify_stored(key, declared_size, algorithm, declared_hash)
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                self.metrics.finalize_failures.add(1, &[]);
                warn!(error = %err, "finalize verification failed, discarding uploaded chunks");
                if let Err(discard_err) = self.blob_storage.delete(key).await {
                    warn!(error = %discard_err, "failed to discard uploaded chunks");
                }
                return Err(err);
            }
        };

        let record = self.registry.complete(key, completion).await?;
        self.metrics.artifacts_finalized.add(1, &[]);
        info!(artifact_id = record.id, size = ?record.size, "artifact finalized");
        Ok(record)
    }

    /// Reads the stored bytes once, checking length and digest against the
    /// declared values.
    async fn verify_stored(
        &self,
        key: &ArtifactKey,
        declared_size: u64,
        algorithm: HashAlgorithm,
        declared_hash: Option<ContentHash>,
    ) -> ArtifactResult<Completion> {
        let stored = self.blob_storage.length(key).await?;
        if stored != declared_size {
            match self.size_check {
                SizeCheck::Strict => {
                    return Err(ArtifactError::SizeMismatch {
                        declared: declared_size,
                        stored,
                    })
                }
                SizeCheck::Advisory => {
                    warn!(
                        declared = declared_size,
                        stored, "declared size differs from stored bytes"
                    );
                }
            }
        }

        let mut hasher = algorithm.hasher();
        if stored > 0 {
            let mut read = self.blob_storage.read_range(key, 0, None).await?;
            while let Some(chunk) = read.stream.next().await {
                hasher.update(&chunk?);
            }
        }
        let computed = hasher.finalize();

        if let Some(declared) = declared_hash {
            if declared != computed {
                return Err(ArtifactError::HashMismatch {
                    declared: declared.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        Ok(Completion {
            size: stored,
            declared_size,
            hash: computed,
        })
    }

    pub async fn list_artifacts(
        &self,
        scope: &ArtifactScope,
        filter: &ListFilter,
    ) -> ArtifactResult<Vec<ArtifactRecord>> {
        self.registry.list(scope, filter).await
    }

    pub async fn signed_download_url(&self, key: &ArtifactKey) -> ArtifactResult<String> {
        self.complete_record(key).await?;
        Ok(self.signer.issue(ClaimPurpose::Download, key))
    }

    #[instrument(skip(self), fields(run_id = %key.scope.run_id, job_id = %key.scope.job_id, artifact = %key.name))]
    pub async fn delete_artifact(&self, key: &ArtifactKey) -> ArtifactResult<ArtifactRecord> {
        let _guard = self.locks.lock(&key.key()).await;
        let outcome = self.registry.delete(key).await?;
        // a repeated delete retries the release of bytes a failed attempt left behind
        self.blob_storage.delete(key).await?;
        Ok(match outcome {
            DeleteOutcome::Deleted(record) => {
                info!(artifact_id = record.id, "artifact deleted");
                record
            }
            DeleteOutcome::AlreadyDeleted(record) => record,
        })
    }

    async fn complete_record(&self, key: &ArtifactKey) -> ArtifactResult<ArtifactRecord> {
        self.registry
            .get(key)
            .await?
            .filter(|r| r.is_complete())
            .ok_or_else(|| ArtifactError::not_found(format!("artifact {}", key)))
    }

    /// Download addressed by a verified signed URL claim.
    pub async fn download_by_key(
        &self,
        key: &ArtifactKey,
        range: impl FnOnce(u64) -> ArtifactResult<Option<(u64, u64)>>,
    ) -> ArtifactResult<ArtifactDownload> {
        let record = self.complete_record(key).await?;
        self.open_download(record, range, DownloadSurface::Signed)
            .await
    }

    /// Download addressed by run id and artifact name, choosing the newest
    /// complete artifact of that name among the run's jobs.
    pub async fn download_from_run(
        &self,
        run_id: &str,
        name: &str,
        range: impl FnOnce(u64) -> ArtifactResult<Option<(u64, u64)>>,
    ) -> ArtifactResult<ArtifactDownload> {
        data_model::validate_run_id(run_id)?;
        data_model::validate_artifact_name(name)?;
        let record = self
            .registry
            .find_in_run(run_id, name)
            .await?
            .ok_or_else(|| {
                ArtifactError::not_found(format!("artifact {} in run {}", name, run_id))
            })?;
        self.open_download(record, range, DownloadSurface::User)
            .await
    }

    async fn open_download(
        &self,
        record: ArtifactRecord,
        range: impl FnOnce(u64) -> ArtifactResult<Option<(u64, u64)>>,
        surface: DownloadSurface,
    ) -> ArtifactResult<ArtifactDownload> {
        let total = record.size.unwrap_or_default();
        let requested = range(total)?;
        let (served, body) = match requested {
            None if total == 0 => (
                ServedRange {
                    start: 0,
                    end: 0,
                    total,
                    partial: false,
                },
                Body::empty(),
            ),
            requested => {
                let (start, end) = requested.unwrap_or((0, total - 1));
                let read = self
                    .blob_storage
                    .read_range(&record.artifact_key(), start, Some(end))
                    .await?;
                if read.total != total {
                    return Err(ArtifactError::Internal(format!(
                        "stored size {} differs from recorded size {}",
                        read.total, total
                    )));
                }
                (
                    ServedRange {
                        start: read.start,
                        end: read.end,
                        total,
                        partial: requested.is_some(),
                    },
                    Body::from_stream(read.stream),
                )
            }
        };
        let labels = [KeyValue::new("surface", surface.as_ref().to_string())];
        self.metrics.downloads.add(1, &labels);
        self.metrics
            .download_bytes
            .add(served.content_length(), &labels);
        Ok(ArtifactDownload {
            record,
            range: served,
            body,
        })
    }
}
