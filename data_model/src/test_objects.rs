pub mod tests {
    use super::super::{ArtifactKey, ArtifactScope, Completion, ContentHash, HashAlgorithm};

    pub const TEST_RUN_ID: &str = "792";
    pub const TEST_JOB_ID: &str = "193";
    pub const TEST_OTHER_JOB_ID: &str = "194";

    pub fn mock_scope() -> ArtifactScope {
        ArtifactScope {
            run_id: TEST_RUN_ID.to_string(),
            job_id: TEST_JOB_ID.to_string(),
        }
    }

    pub fn mock_other_job_scope() -> ArtifactScope {
        ArtifactScope {
            run_id: TEST_RUN_ID.to_string(),
            job_id: TEST_OTHER_JOB_ID.to_string(),
        }
    }

    pub fn mock_key(name: &str) -> ArtifactKey {
        ArtifactKey {
            scope: mock_scope(),
            name: name.to_string(),
        }
    }

    pub fn mock_completion(content: &[u8]) -> Completion {
        Completion {
            size: content.len() as u64,
            declared_size: content.len() as u64,
            hash: ContentHash::of(HashAlgorithm::Sha256, content),
        }
    }
}
