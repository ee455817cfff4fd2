pub mod error;
pub mod test_objects;

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use derive_builder::Builder;
pub use error::{ArtifactError, ArtifactResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

/// Characters an artifact name may not contain. They would break object
/// store paths, registry keys, or download headers.
const INVALID_NAME_CHARS: &[char] = &['\\', '/', '"', ':', '<', '>', '|', '*', '?', '\r', '\n'];

fn validate_identifier(kind: &str, value: &str) -> ArtifactResult<()> {
    if value.is_empty() {
        return Err(ArtifactError::InvalidScope(format!("{kind} is empty")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ArtifactError::InvalidScope(format!(
            "{kind} `{value}` contains unsupported characters"
        )));
    }
    Ok(())
}

pub fn validate_run_id(run_id: &str) -> ArtifactResult<()> {
    validate_identifier("run id", run_id)
}

pub fn validate_artifact_name(name: &str) -> ArtifactResult<()> {
    if name.trim().is_empty() {
        return Err(ArtifactError::invalid_argument("artifact name is empty"));
    }
    if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARS.contains(c)) {
        return Err(ArtifactError::invalid_argument(format!(
            "artifact name `{name}` contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Namespace for artifact names: one workflow run and one job of that run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactScope {
    pub run_id: String,
    pub job_id: String,
}

impl ArtifactScope {
    pub fn new(run_id: impl Into<String>, job_id: impl Into<String>) -> ArtifactResult<Self> {
        let run_id = run_id.into();
        let job_id = job_id.into();
        validate_identifier("run id", &run_id)?;
        validate_identifier("job id", &job_id)?;
        Ok(Self { run_id, job_id })
    }

    pub fn key_prefix(&self) -> String {
        format!("{}|{}|", self.run_id, self.job_id)
    }

    pub fn run_prefix(run_id: &str) -> String {
        format!("{}|", run_id)
    }
}

impl Display for ArtifactScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} job {}", self.run_id, self.job_id)
    }
}

/// Fully qualified artifact identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub scope: ArtifactScope,
    pub name: String,
}

impl ArtifactKey {
    pub fn new(scope: ArtifactScope, name: impl Into<String>) -> ArtifactResult<Self> {
        let name = name.into();
        validate_artifact_name(&name)?;
        Ok(Self { scope, name })
    }

    pub fn key(&self) -> String {
        ArtifactKey::key_from(&self.scope, &self.name)
    }

    pub fn key_from(scope: &ArtifactScope, name: &str) -> String {
        format!("{}{}", scope.key_prefix(), name)
    }
}

impl Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope.run_id, self.scope.job_id, self.name)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    AsRefStr,
    StrumDisplay,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Pending,
    Complete,
    Deleted,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn hasher(&self) -> ContentHasher {
        match self {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }

    fn digest_hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

/// Incremental digest over streamed content.
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ContentHash {
        match self {
            ContentHasher::Sha256(h) => ContentHash {
                algorithm: HashAlgorithm::Sha256,
                hex_digest: hex::encode(h.finalize()),
            },
            ContentHasher::Sha512(h) => ContentHash {
                algorithm: HashAlgorithm::Sha512,
                hex_digest: hex::encode(h.finalize()),
            },
        }
    }
}

/// Algorithm-prefixed digest, `sha256:<hex>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex_digest: String,
}

impl ContentHash {
    pub fn of(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl FromStr for ContentHash {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s.split_once(':').ok_or_else(|| {
            ArtifactError::invalid_argument(format!("hash `{s}` is not of the form algo:hex"))
        })?;
        let algorithm = HashAlgorithm::from_str(algorithm).map_err(|_| {
            ArtifactError::invalid_argument(format!("unsupported hash algorithm `{algorithm}`"))
        })?;
        let hex_digest = digest.to_ascii_lowercase();
        if hex_digest.len() != algorithm.digest_hex_len() ||
            !hex_digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ArtifactError::invalid_argument(format!(
                "malformed {algorithm} digest `{digest}`"
            )));
        }
        Ok(ContentHash {
            algorithm,
            hex_digest,
        })
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ArtifactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_string()
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex_digest)
    }
}

/// How finalize treats a declared size that differs from the stored bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SizeCheck {
    /// Log the mismatch and commit the stored byte count.
    #[default]
    Advisory,
    /// Reject the finalize.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct ArtifactRecord {
    pub id: u64,
    pub scope: ArtifactScope,
    pub name: String,
    #[builder(default)]
    pub status: ArtifactStatus,
    /// Stored byte count, set at finalize.
    #[builder(default, setter(strip_option))]
    pub size: Option<u64>,
    /// Size the uploader declared at finalize.
    #[builder(default, setter(strip_option))]
    pub declared_size: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub hash: Option<ContentHash>,
    /// Epoch milliseconds.
    #[builder(default)]
    pub expires_at: Option<u64>,
    #[builder(default = "artifact_utils::get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default = "artifact_utils::get_epoch_time_in_ms()")]
    pub updated_at: u64,
}

impl ArtifactRecord {
    pub fn key(&self) -> String {
        ArtifactKey::key_from(&self.scope, &self.name)
    }

    pub fn artifact_key(&self) -> ArtifactKey {
        ArtifactKey {
            scope: self.scope.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ArtifactStatus::Complete
    }
}

/// Verified integrity metadata committed by finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub size: u64,
    pub declared_size: u64,
    pub hash: ContentHash,
}
