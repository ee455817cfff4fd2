use std::{fs, path::PathBuf, sync::Arc};

use ::rocksdb::{
    BoundColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    IteratorMode,
    Options,
    ReadOptions,
    TransactionDB,
    TransactionDBOptions,
};
use anyhow::{anyhow, Result};
use artifact_utils::OptionInspectNone;
use async_trait::async_trait;
use data_model::{
    ArtifactError,
    ArtifactKey,
    ArtifactRecord,
    ArtifactResult,
    ArtifactScope,
    Completion,
};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use tracing::{debug, error};

use crate::{
    complete_transition,
    create_transition,
    delete_transition,
    new_pending_record,
    newest_complete,
    serializer::RecordCodec,
    ArtifactRegistry,
    CreateOutcome,
    DeleteOutcome,
    ListFilter,
};

const NEXT_ID_KEY: &[u8] = b"next_id";

#[derive(AsRefStr, Display, EnumIter, Debug, Clone, Copy)]
pub enum ArtifactColumns {
    Artifacts, // run|job|name -> ArtifactRecord
    Metadata,  // next_id -> u64
}

impl ArtifactColumns {
    pub fn cf_db(self, db: &TransactionDB) -> Result<Arc<BoundColumnFamily<'_>>> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                error!("failed to get column family handle for {}", self.as_ref());
            })
            .ok_or_else(|| anyhow!("column family {} is missing", self.as_ref()))
    }
}

fn db_err(err: ::rocksdb::Error) -> ArtifactError {
    ArtifactError::Internal(format!("rocksdb: {}", err))
}

/// Registry persisted in a RocksDB `TransactionDB`. Each mutation runs in a
/// pessimistic transaction holding the record key with `get_for_update`.
pub struct RocksDBRegistry {
    db: Arc<TransactionDB>,
}

impl RocksDBRegistry {
    pub fn open(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)
            .map_err(|e| anyhow!("failed to create registry dir: {}", e))?;
        let column_families = ArtifactColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path,
            column_families,
        )
        .map_err(|e| anyhow!("failed to open db: {}", e))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn scan_prefix(&self, prefix: &str) -> ArtifactResult<Vec<ArtifactRecord>> {
        let cf = ArtifactColumns::Artifacts.cf_db(&self.db)?;
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let iter = self.db.iterator_cf_opt(
            &cf,
            read_options,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            records.push(RecordCodec::decode(&key, &value)?);
        }
        Ok(records)
    }

    /// Reads, transforms and writes back one record inside a transaction.
    fn update<T>(
        &self,
        key: &ArtifactKey,
        apply: impl FnOnce(Option<ArtifactRecord>) -> ArtifactResult<(ArtifactRecord, T)>,
    ) -> ArtifactResult<T> {
        let cf = ArtifactColumns::Artifacts.cf_db(&self.db)?;
        let txn = self.db.transaction();
        let existing = txn
            .get_for_update_cf(&cf, key.key(), true)
            .map_err(db_err)?
            .map(|bytes| RecordCodec::decode(key.key().as_bytes(), &bytes))
            .transpose()?;
        let (record, result) = apply(existing)?;
        txn.put_cf(&cf, key.key(), RecordCodec::encode(&record)?)
            .map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        Ok(result)
    }
}

#[async_trait]
impl ArtifactRegistry for RocksDBRegistry {
    async fn create(
        &self,
        key: &ArtifactKey,
        expires_at: Option<u64>,
    ) -> ArtifactResult<CreateOutcome> {
        let cf = ArtifactColumns::Artifacts.cf_db(&self.db)?;
        let meta_cf = ArtifactColumns::Metadata.cf_db(&self.db)?;
        let txn = self.db.transaction();
        let existing = txn
            .get_for_update_cf(&cf, key.key(), true)
            .map_err(db_err)?
            .map(|bytes| RecordCodec::decode(key.key().as_bytes(), &bytes))
            .transpose()?;
        if let Some(outcome) = create_transition(existing) {
            return Ok(outcome);
        }

        let id = match txn
            .get_for_update_cf(&meta_cf, NEXT_ID_KEY, true)
            .map_err(db_err)?
        {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt next_id counter"))?;
                u64::from_be_bytes(bytes)
            }
            None => 1,
        };
        txn.put_cf(&meta_cf, NEXT_ID_KEY, (id + 1).to_be_bytes())
            .map_err(db_err)?;

        let record = new_pending_record(id, key, expires_at)?;
        txn.put_cf(&cf, key.key(), RecordCodec::encode(&record)?)
            .map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        debug!(key = %key, id, "created artifact record");
        Ok(CreateOutcome::Created(record))
    }

    async fn get(&self, key: &ArtifactKey) -> ArtifactResult<Option<ArtifactRecord>> {
        let cf = ArtifactColumns::Artifacts.cf_db(&self.db)?;
        let value = self.db.get_cf(&cf, key.key()).map_err(db_err)?;
        Ok(value
            .map(|bytes| RecordCodec::decode(key.key().as_bytes(), &bytes))
            .transpose()?)
    }

    async fn complete(
        &self,
        key: &ArtifactKey,
        completion: Completion,
    ) -> ArtifactResult<ArtifactRecord> {
        self.update(key, |existing| {
            let record = complete_transition(key, existing, completion)?;
            Ok((record.clone(), record))
        })
    }

    async fn list(
        &self,
        scope: &ArtifactScope,
        filter: &ListFilter,
    ) -> ArtifactResult<Vec<ArtifactRecord>> {
        let mut records: Vec<ArtifactRecord> = self
            .scan_prefix(&scope.key_prefix())?
            .into_iter()
            .filter(|r| r.is_complete() && filter.matches(r))
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find_in_run(
        &self,
        run_id: &str,
        name: &str,
    ) -> ArtifactResult<Option<ArtifactRecord>> {
        let records = self.scan_prefix(&ArtifactScope::run_prefix(run_id))?;
        Ok(newest_complete(records.iter(), name))
    }

    async fn delete(&self, key: &ArtifactKey) -> ArtifactResult<DeleteOutcome> {
        self.update(key, |existing| {
            let outcome = delete_transition(key, existing)?;
            Ok((outcome.record().clone(), outcome))
        })
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_completion, mock_key};

    use super::*;
    use crate::registry_tests;

    fn open_temp() -> (tempfile::TempDir, RocksDBRegistry) {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = RocksDBRegistry::open(temp_dir.path().join("registry")).unwrap();
        (temp_dir, registry)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_dir, registry) = open_temp();
        registry_tests::create_is_idempotent(&registry).await;
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let (_dir, registry) = open_temp();
        registry_tests::complete_only_once(&registry).await;
    }

    #[tokio::test]
    async fn test_list_is_scoped_and_filtered() {
        let (_dir, registry) = open_temp();
        registry_tests::list_is_scoped_and_filtered(&registry).await;
    }

    #[tokio::test]
    async fn test_delete_is_final() {
        let (_dir, registry) = open_temp();
        registry_tests::delete_is_final(&registry).await;
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("registry");
        let first_id = {
            let registry = RocksDBRegistry::open(path.clone()).unwrap();
            let record = registry
                .create(&mock_key("artifact"), None)
                .await
                .unwrap()
                .into_record();
            registry
                .complete(&mock_key("artifact"), mock_completion(b"abc"))
                .await
                .unwrap();
            record.id
        };

        let registry = RocksDBRegistry::open(path).unwrap();
        let stored = registry.get(&mock_key("artifact")).await.unwrap().unwrap();
        assert!(stored.is_complete());
        assert_eq!(stored.id, first_id);
        let next = registry
            .create(&mock_key("other"), None)
            .await
            .unwrap()
            .into_record();
        assert_eq!(next.id, first_id + 1);
    }
}
