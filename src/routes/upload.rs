use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
};
use data_model::ArtifactError;
use serde::Deserialize;
use tracing::debug;
use utoipa::IntoParams;

use super::RouteState;
use crate::{
    http_objects::ArtifactAPIError,
    signed_url::{ClaimPurpose, SignedClaim},
};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UploadParams {
    /// `block` or `appendBlock`; both append at the current end.
    #[serde(default)]
    pub comp: Option<String>,
}

/// Extracts a signed claim, reporting a missing or malformed one as an
/// authorization failure.
pub(super) fn signed_claim(
    claim: Result<Query<SignedClaim>, QueryRejection>,
) -> Result<SignedClaim, ArtifactAPIError> {
    claim
        .map(|Query(claim)| claim)
        .map_err(|e| ArtifactError::unauthorized(format!("invalid signed url: {}", e.body_text())).into())
}

/// Upload one chunk through a signed URL
#[utoipa::path(
    put,
    path = "/twirp/github.actions.results.api.v1.ArtifactService/UploadArtifact",
    tag = "artifacts",
    params(SignedClaim, UploadParams),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = CREATED, description = "Chunk stored"),
        (status = BAD_REQUEST, description = "Unsupported comp value", body = ArtifactAPIError),
        (status = UNAUTHORIZED, description = "Invalid or expired signed url", body = ArtifactAPIError),
        (status = NOT_FOUND, description = "Artifact was never created", body = ArtifactAPIError),
        (status = CONFLICT, description = "Artifact is no longer pending", body = ArtifactAPIError)
    ),
)]
pub async fn upload_artifact(
    State(state): State<RouteState>,
    claim: Result<Query<SignedClaim>, QueryRejection>,
    Query(params): Query<UploadParams>,
    body: Body,
) -> Result<StatusCode, ArtifactAPIError> {
    let claim = signed_claim(claim)?;
    let key = state
        .service
        .signer()
        .verify(ClaimPurpose::Upload, &claim)?;
    match params.comp.as_deref() {
        None | Some("block") | Some("appendBlock") => {}
        Some(other) => {
            return Err(ArtifactError::invalid_argument(format!(
                "unsupported comp value `{}`",
                other
            ))
            .into())
        }
    }
    let written = state
        .service
        .upload_chunk(&key, body.into_data_stream())
        .await?;
    debug!(artifact = %key, written, "chunk uploaded");
    Ok(StatusCode::CREATED)
}
