use axum::{
    http::Method,
    routing::{get, post, put},
    Json,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

mod download;
pub mod routes_state;
mod twirp;
mod upload;

use download::{download_artifact, download_run_artifact};
pub use routes_state::RouteState;
use twirp::artifact_rpc;
use upload::upload_artifact;

use crate::{
    http_objects::{
        ArtifactAPIError,
        CreateArtifactRequest,
        CreateArtifactResponse,
        DeleteArtifactRequest,
        DeleteArtifactResponse,
        FinalizeArtifactRequest,
        FinalizeArtifactResponse,
        GetSignedArtifactURLRequest,
        GetSignedArtifactURLResponse,
        HealthCheck,
        ListArtifactsRequest,
        ListArtifactsResponse,
        ListArtifactsResponseMonolithArtifact,
    },
    middleware::InstanceRequestSpan,
    signed_url::ARTIFACT_SERVICE_PATH,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            twirp::artifact_rpc,
            upload::upload_artifact,
            download::download_artifact,
            download::download_run_artifact,
            health,
        ),
        components(
            schemas(
                ArtifactAPIError,
                CreateArtifactRequest,
                CreateArtifactResponse,
                FinalizeArtifactRequest,
                FinalizeArtifactResponse,
                ListArtifactsRequest,
                ListArtifactsResponse,
                ListArtifactsResponseMonolithArtifact,
                GetSignedArtifactURLRequest,
                GetSignedArtifactURLResponse,
                DeleteArtifactRequest,
                DeleteArtifactResponse,
                HealthCheck,
            )
        ),
        tags(
            (name = "artifacts", description = "Workflow artifact API")
        )
    )]
pub struct ApiDoc;

pub fn create_routes(route_state: RouteState, request_span: InstanceRequestSpan) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health))
        .route("/docs/openapi.json", get(openapi_json))
        .route(
            &format!("{}/UploadArtifact", ARTIFACT_SERVICE_PATH),
            put(upload_artifact).with_state(route_state.clone()),
        )
        .route(
            &format!("{}/DownloadArtifact", ARTIFACT_SERVICE_PATH),
            get(download_artifact).with_state(route_state.clone()),
        )
        .route(
            &format!("{}/{{method}}", ARTIFACT_SERVICE_PATH),
            post(artifact_rpc).with_state(route_state.clone()),
        )
        .route(
            "/runs/{run_id}/artifacts/{*name}",
            get(download_run_artifact).with_state(route_state),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_failure(()),
        )
        .layer(cors)
}

/// Liveness check
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "operations",
    responses(
        (status = 200, description = "Server is up", body = HealthCheck),
    ),
)]
async fn health() -> Json<HealthCheck> {
    Json(HealthCheck {
        status: "ok".to_string(),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
