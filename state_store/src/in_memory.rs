use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{ArtifactKey, ArtifactRecord, ArtifactResult, ArtifactScope, Completion};

use crate::{
    complete_transition,
    create_transition,
    delete_transition,
    new_pending_record,
    newest_complete,
    ArtifactRegistry,
    CreateOutcome,
    DeleteOutcome,
    ListFilter,
};

/// Registry held in process memory. Mutations on one key run under the
/// map's shard lock for that key.
#[derive(Debug)]
pub struct InMemoryRegistry {
    records: DashMap<String, ArtifactRecord>,
    next_id: AtomicU64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ArtifactRegistry for InMemoryRegistry {
    async fn create(
        &self,
        key: &ArtifactKey,
        expires_at: Option<u64>,
    ) -> ArtifactResult<CreateOutcome> {
        match self.records.entry(key.key()) {
            Entry::Occupied(mut entry) => {
                if let Some(outcome) = create_transition(Some(entry.get().clone())) {
                    return Ok(outcome);
                }
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let record = new_pending_record(id, key, expires_at)?;
                entry.insert(record.clone());
                Ok(CreateOutcome::Created(record))
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let record = new_pending_record(id, key, expires_at)?;
                entry.insert(record.clone());
                Ok(CreateOutcome::Created(record))
            }
        }
    }

    async fn get(&self, key: &ArtifactKey) -> ArtifactResult<Option<ArtifactRecord>> {
        Ok(self.records.get(&key.key()).map(|r| r.value().clone()))
    }

    async fn complete(
        &self,
        key: &ArtifactKey,
        completion: Completion,
    ) -> ArtifactResult<ArtifactRecord> {
        match self.records.get_mut(&key.key()) {
            Some(mut entry) => {
                let record = complete_transition(key, Some(entry.clone()), completion)?;
                *entry = record.clone();
                Ok(record)
            }
            None => complete_transition(key, None, completion),
        }
    }

    async fn list(
        &self,
        scope: &ArtifactScope,
        filter: &ListFilter,
    ) -> ArtifactResult<Vec<ArtifactRecord>> {
        let prefix = scope.key_prefix();
        let mut records: Vec<ArtifactRecord> = self
            .records
            .iter()
            .filter(|r| r.key().starts_with(&prefix))
            .filter(|r| r.is_complete() && filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find_in_run(
        &self,
        run_id: &str,
        name: &str,
    ) -> ArtifactResult<Option<ArtifactRecord>> {
        let prefix = ArtifactScope::run_prefix(run_id);
        let matching: Vec<ArtifactRecord> = self
            .records
            .iter()
            .filter(|r| r.key().starts_with(&prefix))
            .map(|r| r.value().clone())
            .collect();
        Ok(newest_complete(matching.iter(), name))
    }

    async fn delete(&self, key: &ArtifactKey) -> ArtifactResult<DeleteOutcome> {
        match self.records.get_mut(&key.key()) {
            Some(mut entry) => {
                let outcome = delete_transition(key, Some(entry.clone()))?;
                *entry = outcome.record().clone();
                Ok(outcome)
            }
            None => delete_transition(key, None),
        }
    }
}
