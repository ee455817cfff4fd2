use anyhow::Result;
use axum::Router;
use blob_store::BlobStorageConfig;
use data_model::SizeCheck;
use state_store::{RegistryBackend, RegistryConfig};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub const TEST_SECRET: &str = "integration-test-secret";

pub struct TestService {
    pub service: Service,
    pub router: Router,
    // keeps the rocksdb directory alive for the lifetime of the test
    _temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_size_check(SizeCheck::Advisory).await
    }

    pub async fn with_size_check(size_check: SizeCheck) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let mut cfg = ServerConfig {
            blob_storage: BlobStorageConfig {
                path: "memory:///".to_string(),
                region: None,
            },
            registry: RegistryConfig {
                backend: RegistryBackend::Rocksdb,
                path: temp_dir.path().join("registry").display().to_string(),
            },
            ..Default::default()
        };
        cfg.artifacts.signing_secret = Some(TEST_SECRET.to_string());
        cfg.artifacts.size_check = size_check;
        cfg.validate()?;

        let service = Service::new(cfg.with_instance_id())?;
        let router = service.router();
        Ok(Self {
            service,
            router,
            _temp_dir: temp_dir,
        })
    }

    pub fn token(&self, run_id: &str, job_id: &str) -> String {
        self.service
            .tokens
            .issue("test-runner", run_id, job_id)
            .expect("token for valid scope")
    }
}
