use std::{env, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{
    ArtifactError,
    ArtifactKey,
    ArtifactRecord,
    ArtifactRecordBuilder,
    ArtifactResult,
    ArtifactScope,
    ArtifactStatus,
    Completion,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod in_memory;
pub mod rocksdb_registry;
pub mod serializer;

pub use in_memory::InMemoryRegistry;
pub use rocksdb_registry::RocksDBRegistry;

/// Result of a create call, telling the caller which state it found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ArtifactRecord),
    /// A Pending record already existed and was returned unchanged.
    Pending(ArtifactRecord),
    /// A Complete record already existed and was returned unchanged.
    Complete(ArtifactRecord),
}

impl CreateOutcome {
    pub fn into_record(self) -> ArtifactRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Pending(r) | CreateOutcome::Complete(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(ArtifactRecord),
    AlreadyDeleted(ArtifactRecord),
}

impl DeleteOutcome {
    pub fn record(&self) -> &ArtifactRecord {
        match self {
            DeleteOutcome::Deleted(r) | DeleteOutcome::AlreadyDeleted(r) => r,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Exact artifact name.
    pub name: Option<String>,
    pub id: Option<u64>,
}

impl ListFilter {
    fn matches(&self, record: &ArtifactRecord) -> bool {
        self.name.as_ref().map_or(true, |name| &record.name == name) &&
            self.id.map_or(true, |id| record.id == id)
    }
}

/// Metadata store for artifact records. Every mutation on one key is atomic
/// with respect to other mutations on the same key.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn create(
        &self,
        key: &ArtifactKey,
        expires_at: Option<u64>,
    ) -> ArtifactResult<CreateOutcome>;

    async fn get(&self, key: &ArtifactKey) -> ArtifactResult<Option<ArtifactRecord>>;

    /// Pending -> Complete. Fails with `NotFound` unless the record is
    /// Pending.
    async fn complete(
        &self,
        key: &ArtifactKey,
        completion: Completion,
    ) -> ArtifactResult<ArtifactRecord>;

    /// Complete records of `scope` ordered by id.
    async fn list(
        &self,
        scope: &ArtifactScope,
        filter: &ListFilter,
    ) -> ArtifactResult<Vec<ArtifactRecord>>;

    /// Newest Complete record named `name` across all jobs of `run_id`.
    async fn find_in_run(&self, run_id: &str, name: &str)
        -> ArtifactResult<Option<ArtifactRecord>>;

    async fn delete(&self, key: &ArtifactKey) -> ArtifactResult<DeleteOutcome>;
}

fn new_pending_record(
    id: u64,
    key: &ArtifactKey,
    expires_at: Option<u64>,
) -> ArtifactResult<ArtifactRecord> {
    ArtifactRecordBuilder::default()
        .id(id)
        .scope(key.scope.clone())
        .name(key.name.clone())
        .status(ArtifactStatus::Pending)
        .expires_at(expires_at)
        .build()
        .map_err(|e| ArtifactError::Internal(e.to_string()))
}

/// Decides what create does given the stored record. `None` in the outcome
/// means a new record must be allocated.
fn create_transition(existing: Option<ArtifactRecord>) -> Option<CreateOutcome> {
    match existing {
        Some(r) if r.status == ArtifactStatus::Complete => Some(CreateOutcome::Complete(r)),
        Some(r) if r.status == ArtifactStatus::Pending => Some(CreateOutcome::Pending(r)),
        _ => None,
    }
}

fn complete_transition(
    key: &ArtifactKey,
    existing: Option<ArtifactRecord>,
    completion: Completion,
) -> ArtifactResult<ArtifactRecord> {
    let mut record = match existing {
        Some(r) if r.status == ArtifactStatus::Pending => r,
        _ => {
            return Err(ArtifactError::not_found(format!(
                "no pending artifact {}",
                key
            )))
        }
    };
    record.status = ArtifactStatus::Complete;
    record.size = Some(completion.size);
    record.declared_size = Some(completion.declared_size);
    record.hash = Some(completion.hash);
    record.updated_at = artifact_utils::get_epoch_time_in_ms();
    Ok(record)
}

fn delete_transition(
    key: &ArtifactKey,
    existing: Option<ArtifactRecord>,
) -> ArtifactResult<DeleteOutcome> {
    match existing {
        None => Err(ArtifactError::not_found(format!("artifact {}", key))),
        Some(r) if r.status == ArtifactStatus::Deleted => Ok(DeleteOutcome::AlreadyDeleted(r)),
        Some(mut r) => {
            r.status = ArtifactStatus::Deleted;
            r.updated_at = artifact_utils::get_epoch_time_in_ms();
            Ok(DeleteOutcome::Deleted(r))
        }
    }
}

fn newest_complete<'a>(
    records: impl Iterator<Item = &'a ArtifactRecord>,
    name: &str,
) -> Option<ArtifactRecord> {
    records
        .filter(|r| r.is_complete() && r.name == name)
        .max_by_key(|r| r.id)
        .cloned()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    #[default]
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,
    #[serde(default = "default_registry_path")]
    pub path: String,
}

fn default_registry_path() -> String {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("artifact_storage/registry")
        .display()
        .to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            backend: RegistryBackend::default(),
            path: default_registry_path(),
        }
    }
}

pub fn open_registry(config: &RegistryConfig) -> Result<Arc<dyn ArtifactRegistry>> {
    match config.backend {
        RegistryBackend::Memory => {
            info!("using in-memory artifact registry");
            Ok(Arc::new(InMemoryRegistry::new()))
        }
        RegistryBackend::Rocksdb => {
            info!(path = %config.path, "using rocksdb artifact registry");
            Ok(Arc::new(RocksDBRegistry::open(PathBuf::from(&config.path))?))
        }
    }
}

/// Behaviour shared by every registry implementation.
#[cfg(test)]
pub(crate) mod registry_tests {
    use data_model::test_objects::tests::{
        mock_completion,
        mock_key,
        mock_other_job_scope,
        mock_scope,
    };

    use super::*;

    pub async fn create_is_idempotent(registry: &dyn ArtifactRegistry) {
        let key = mock_key("artifact");
        let first = registry.create(&key, Some(1000)).await.unwrap();
        let CreateOutcome::Created(first) = first else {
            panic!("expected a new record");
        };
        assert_eq!(first.status, ArtifactStatus::Pending);
        assert_eq!(first.expires_at, Some(1000));

        let second = registry.create(&key, None).await.unwrap();
        assert_eq!(second, CreateOutcome::Pending(first.clone()));

        registry
            .complete(&key, mock_completion(b"abc"))
            .await
            .unwrap();
        let third = registry.create(&key, None).await.unwrap();
        let CreateOutcome::Complete(third) = third else {
            panic!("expected the complete record");
        };
        assert_eq!(third.id, first.id);
        assert_eq!(
            registry.list(&mock_scope(), &ListFilter::default()).await.unwrap(),
            vec![third]
        );
    }

    pub async fn complete_only_once(registry: &dyn ArtifactRegistry) {
        let key = mock_key("artifact");
        assert!(matches!(
            registry.complete(&key, mock_completion(b"abc")).await,
            Err(ArtifactError::NotFound(_))
        ));
        registry.create(&key, None).await.unwrap();
        let record = registry
            .complete(&key, mock_completion(b"abc"))
            .await
            .unwrap();
        assert_eq!(record.status, ArtifactStatus::Complete);
        assert_eq!(record.size, Some(3));
        assert_eq!(record.hash, Some(mock_completion(b"abc").hash));
        assert!(matches!(
            registry.complete(&key, mock_completion(b"xyz")).await,
            Err(ArtifactError::NotFound(_))
        ));
        let stored = registry.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.hash, Some(mock_completion(b"abc").hash));
    }

    pub async fn list_is_scoped_and_filtered(registry: &dyn ArtifactRegistry) {
        for name in ["a", "b", "pending"] {
            registry.create(&mock_key(name), None).await.unwrap();
        }
        for name in ["a", "b"] {
            registry
                .complete(&mock_key(name), mock_completion(name.as_bytes()))
                .await
                .unwrap();
        }
        let other = ArtifactKey {
            scope: mock_other_job_scope(),
            name: "a".to_string(),
        };
        registry.create(&other, None).await.unwrap();
        registry
            .complete(&other, mock_completion(b"other"))
            .await
            .unwrap();

        let names: Vec<String> = registry
            .list(&mock_scope(), &ListFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        let filtered = registry
            .list(
                &mock_scope(),
                &ListFilter {
                    name: Some("b".to_string()),
                    id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        let by_id = registry
            .list(
                &mock_scope(),
                &ListFilter {
                    name: None,
                    id: Some(filtered[0].id),
                },
            )
            .await
            .unwrap();
        assert_eq!(by_id, filtered);

        let other_list = registry
            .list(&mock_other_job_scope(), &ListFilter::default())
            .await
            .unwrap();
        assert_eq!(other_list.len(), 1);
        assert_eq!(other_list[0].scope, mock_other_job_scope());

        let newest = registry
            .find_in_run(&mock_scope().run_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.scope, mock_other_job_scope());
        assert!(registry
            .find_in_run(&mock_scope().run_id, "pending")
            .await
            .unwrap()
            .is_none());
        assert!(registry.find_in_run("1", "a").await.unwrap().is_none());
    }

    pub async fn delete_is_final(registry: &dyn ArtifactRegistry) {
        let key = mock_key("artifact");
        assert!(matches!(
            registry.delete(&key).await,
            Err(ArtifactError::NotFound(_))
        ));
        let created = registry.create(&key, None).await.unwrap().into_record();
        registry
            .complete(&key, mock_completion(b"abc"))
            .await
            .unwrap();

        let deleted = registry.delete(&key).await.unwrap();
        assert!(matches!(deleted, DeleteOutcome::Deleted(_)));
        assert_eq!(deleted.record().status, ArtifactStatus::Deleted);
        assert!(matches!(
            registry.delete(&key).await.unwrap(),
            DeleteOutcome::AlreadyDeleted(_)
        ));
        assert!(registry
            .list(&mock_scope(), &ListFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            registry.complete(&key, mock_completion(b"abc")).await,
            Err(ArtifactError::NotFound(_))
        ));

        let recreated = registry.create(&key, None).await.unwrap();
        let CreateOutcome::Created(recreated) = recreated else {
            panic!("expected a fresh record");
        };
        assert!(recreated.id > created.id);
    }
}
