use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::BlobStorage;
use metrics::api_io_stats;
use state_store::{open_registry, ArtifactRegistry};
use tokio::signal;
use tracing::{error, info};

use crate::{
    artifacts::ArtifactService,
    auth::TokenService,
    config::ServerConfig,
    middleware::InstanceRequestSpan,
    routes::{create_routes, RouteState},
    signed_url::SignedUrlIssuer,
    signing::SigningKey,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub blob_storage: Arc<BlobStorage>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub artifacts: Arc<ArtifactService>,
    pub tokens: Arc<TokenService>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?
                .with_max_chunk_bytes(config.artifacts.max_chunk_bytes),
        );
        let registry =
            open_registry(&config.registry).context("error initializing artifact registry")?;

        let signing_key = SigningKey::from_config(config.artifacts.signing_secret.as_deref())?;
        let tokens = Arc::new(TokenService::new(
            signing_key.clone(),
            config.artifacts.token_ttl(),
        ));
        let signer = Arc::new(SignedUrlIssuer::new(
            signing_key,
            &config.public_url,
            config.artifacts.signed_url_ttl(),
        )?);

        let artifacts = Arc::new(ArtifactService::new(
            registry.clone(),
            blob_storage.clone(),
            signer,
            config.artifacts.size_check,
            Arc::new(api_io_stats::Metrics::new()),
        ));

        Ok(Self {
            config,
            blob_storage,
            registry,
            artifacts,
            tokens,
        })
    }

    pub fn router(&self) -> Router {
        let route_state = RouteState {
            service: self.artifacts.clone(),
            tokens: self.tokens.clone(),
        };
        let request_span = InstanceRequestSpan::new(&self.config.env, &self.config.instance_id());
        create_routes(route_state, request_span)
    }

    pub async fn start(&self) -> Result<()> {
        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
