use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::HeaderMap,
    response::Response,
};

use super::{upload::signed_claim, RouteState};
use crate::{
    http_objects::ArtifactAPIError,
    range::{build_response, requested_range},
    signed_url::{ClaimPurpose, SignedClaim},
};

/// Download an artifact through a signed URL
#[utoipa::path(
    get,
    path = "/twirp/github.actions.results.api.v1.ArtifactService/DownloadArtifact",
    tag = "artifacts",
    params(SignedClaim),
    responses(
        (status = 200, description = "Artifact content"),
        (status = PARTIAL_CONTENT, description = "Requested byte range"),
        (status = UNAUTHORIZED, description = "Invalid or expired signed url", body = ArtifactAPIError),
        (status = NOT_FOUND, description = "Artifact not found", body = ArtifactAPIError),
        (status = RANGE_NOT_SATISFIABLE, description = "Range outside the artifact", body = ArtifactAPIError)
    ),
)]
pub async fn download_artifact(
    State(state): State<RouteState>,
    claim: Result<Query<SignedClaim>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response<Body>, ArtifactAPIError> {
    let claim = signed_claim(claim)?;
    let key = state
        .service
        .signer()
        .verify(ClaimPurpose::Download, &claim)?;
    let download = state
        .service
        .download_by_key(&key, |total| requested_range(&headers, total))
        .await?;
    Ok(build_response(
        download.range,
        &download.record.name,
        download.body,
    ))
}

/// Download the newest artifact with this name from a workflow run
#[utoipa::path(
    get,
    path = "/runs/{run_id}/artifacts/{name}",
    tag = "artifacts",
    params(
        ("run_id" = String, Path, description = "Workflow run backend id"),
        ("name" = String, Path, description = "Artifact name"),
    ),
    responses(
        (status = 200, description = "Artifact content"),
        (status = PARTIAL_CONTENT, description = "Requested byte range"),
        (status = NOT_FOUND, description = "Artifact not found", body = ArtifactAPIError),
        (status = RANGE_NOT_SATISFIABLE, description = "Range outside the artifact", body = ArtifactAPIError)
    ),
)]
pub async fn download_run_artifact(
    Path((run_id, name)): Path<(String, String)>,
    State(state): State<RouteState>,
    headers: HeaderMap,
) -> Result<Response<Body>, ArtifactAPIError> {
    let download = state
        .service
        .download_from_run(&run_id, &name, |total| requested_range(&headers, total))
        .await?;
    Ok(build_response(
        download.range,
        &download.record.name,
        download.body,
    ))
}
