use std::{fmt::Debug, net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use data_model::SizeCheck;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::RegistryConfig;
use url::Url;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "ARTIFACTS_";
/// Longest lifetime a signed URL may be issued for.
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base of the absolute URLs handed to clients.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8900".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8900".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            public_url: default_public_url(),
            blob_storage: Default::default(),
            registry: Default::default(),
            artifacts: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Loads the config from an optional YAML file, then applies
    /// `ARTIFACTS_` environment overrides (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let figment = match path {
            Some(path) => {
                let config_str = std::fs::read_to_string(path)
                    .map_err(|e| anyhow!("unable to read {}: {}", path.display(), e))?;
                Figment::new().merge(Yaml::string(&config_str))
            }
            None => Figment::from(Serialized::defaults(ServerConfig::default())),
        };
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config.with_instance_id())
    }

    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config.with_instance_id())
    }

    /// Pins a generated instance id when none is configured, so every
    /// consumer of this config reports the same one.
    pub fn with_instance_id(mut self) -> Self {
        if self.telemetry.instance_id.is_none() {
            self.telemetry.instance_id =
                Some(format!("{}-{:08x}", self.env, rand::random::<u32>()));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.public_url.parse::<Url>().is_err() {
            return Err(anyhow!("invalid public url: {}", self.public_url));
        }
        if self.artifacts.token_ttl_secs == 0 {
            return Err(anyhow!("artifacts.token_ttl_secs must be greater than 0"));
        }
        if self.artifacts.signed_url_ttl_secs == 0 {
            return Err(anyhow!(
                "artifacts.signed_url_ttl_secs must be greater than 0"
            ));
        }
        if self.artifacts.signed_url_ttl() > MAX_SIGNED_URL_TTL {
            return Err(anyhow!(
                "artifacts.signed_url_ttl_secs must be at most {}",
                MAX_SIGNED_URL_TTL.as_secs()
            ));
        }
        if self.artifacts.max_chunk_bytes == 0 {
            return Err(anyhow!("artifacts.max_chunk_bytes must be greater than 0"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| self.env.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// HMAC secret for bearer tokens and signed URLs. A random secret is
    /// generated at startup when unset, which invalidates outstanding
    /// credentials on restart.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    #[serde(default)]
    pub size_check: SizeCheck,
    /// Body limit for a single chunk upload.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
}

fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_signed_url_ttl_secs() -> u64 {
    60 * 60
}

fn default_max_chunk_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            size_check: SizeCheck::default(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

impl ArtifactsConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics.
    #[serde(default)]
    pub enable_metrics: bool,
    // Export spans over OTLP.
    #[serde(default)]
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde", default = "default_metrics_interval")]
    pub metrics_interval: Duration,
    // Used as a metric attribute "artifacts.instance.id".
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval: default_metrics_interval(),
            instance_id: None,
        }
    }
}

// Serde module for Duration serialization/deserialization
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use state_store::RegistryBackend;

    use super::*;

    #[test]
    pub fn should_parse_sample_config() {
        let config_yaml = include_str!("../sample_config.yaml");
        let config = ServerConfig::from_yaml_str(config_yaml).expect("unable to parse from yaml");

        assert_eq!("local", config.env);
        assert!(!config.structured_logging());
        assert_eq!(config.registry.backend, RegistryBackend::Rocksdb);
        assert_eq!(config.artifacts.size_check, SizeCheck::Advisory);
        assert_eq!(
            config.artifacts.signing_secret.as_deref(),
            Some("change-me-in-production")
        );
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = ServerConfig::from_yaml_str("env: prod\n").unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.listen_addr, "0.0.0.0:8900");
        assert_eq!(config.artifacts.token_ttl_secs, 86400);
        assert_eq!(config.artifacts.signed_url_ttl_secs, 3600);
        assert_eq!(config.artifacts.max_chunk_bytes, 256 * 1024 * 1024);
        assert!(config.blob_storage.path.ends_with("artifact_storage/blobs"));
        assert!(config.instance_id().starts_with("prod-"));
    }

    #[test]
    fn test_instance_id_is_stable() {
        let config = ServerConfig::from_yaml_str("env: prod\n").unwrap();
        assert_eq!(config.instance_id(), config.instance_id());
        assert_eq!(config.clone().instance_id(), config.instance_id());

        let configured =
            ServerConfig::from_yaml_str("telemetry:\n  instance_id: node-7\n").unwrap();
        assert_eq!(configured.instance_id(), "node-7");
    }

    #[test]
    fn test_strict_size_check() {
        let config = ServerConfig::from_yaml_str("artifacts:\n  size_check: strict\n").unwrap();
        assert_eq!(config.artifacts.size_check, SizeCheck::Strict);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::from_yaml_str("listen_addr: nowhere\n").is_err());
        assert!(ServerConfig::from_yaml_str("public_url: not a url\n").is_err());
        assert!(ServerConfig::from_yaml_str("artifacts:\n  token_ttl_secs: 0\n").is_err());
        assert!(
            ServerConfig::from_yaml_str("artifacts:\n  signed_url_ttl_secs: 604801\n").is_err()
        );
        assert!(
            ServerConfig::from_yaml_str("artifacts:\n  signed_url_ttl_secs: 604800\n").is_ok()
        );
    }
}
