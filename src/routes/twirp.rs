use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use state_store::ListFilter;

use super::RouteState;
use crate::{
    auth::AuthorizedScope,
    http_objects::{
        ArtifactAPIError,
        ArtifactRpc,
        CreateArtifactResponse,
        DeleteArtifactResponse,
        FinalizeArtifactResponse,
        GetSignedArtifactURLResponse,
        ListArtifactsResponse,
    },
};

/// Artifact service RPC
#[utoipa::path(
    post,
    path = "/twirp/github.actions.results.api.v1.ArtifactService/{method}",
    tag = "artifacts",
    params(
        ("method" = String, Path, description = "CreateArtifact, FinalizeArtifact, ListArtifacts, GetSignedArtifactURL or DeleteArtifact"),
    ),
    responses(
        (status = 200, description = "RPC response, shape depends on the method"),
        (status = BAD_REQUEST, description = "Malformed request", body = ArtifactAPIError),
        (status = UNAUTHORIZED, description = "Missing or foreign token", body = ArtifactAPIError),
        (status = NOT_FOUND, description = "Unknown method or artifact", body = ArtifactAPIError),
        (status = INTERNAL_SERVER_ERROR, description = "Integrity check failed", body = ArtifactAPIError)
    ),
)]
pub async fn artifact_rpc(
    Path(method): Path<String>,
    State(state): State<RouteState>,
    authorized: AuthorizedScope,
    body: Bytes,
) -> Result<Response, ArtifactAPIError> {
    let service = &state.service;
    let response = match ArtifactRpc::decode(&method, &body)? {
        ArtifactRpc::CreateArtifact(req) => {
            let key = req.key()?;
            authorized.ensure(&key.scope)?;
            let created = service.create_artifact(&key, req.expires_at_ms()?).await?;
            Json(CreateArtifactResponse {
                ok: true,
                signed_upload_url: created.upload_url,
            })
            .into_response()
        }
        ArtifactRpc::FinalizeArtifact(req) => {
            let key = req.key()?;
            authorized.ensure(&key.scope)?;
            let hash = req.content_hash()?;
            let record = service.finalize_artifact(&key, req.size, hash).await?;
            Json(FinalizeArtifactResponse {
                ok: true,
                artifact_id: record.id,
            })
            .into_response()
        }
        ArtifactRpc::ListArtifacts(req) => {
            let scope = req.scope()?;
            authorized.ensure(&scope)?;
            let filter = ListFilter {
                name: req.name_filter.filter(|n| !n.is_empty()),
                id: req.id_filter,
            };
            let artifacts = service.list_artifacts(&scope, &filter).await?;
            Json(ListArtifactsResponse {
                artifacts: artifacts.into_iter().map(Into::into).collect(),
            })
            .into_response()
        }
        ArtifactRpc::GetSignedArtifactURL(req) => {
            let key = req.key()?;
            authorized.ensure(&key.scope)?;
            let signed_url = service.signed_download_url(&key).await?;
            Json(GetSignedArtifactURLResponse { signed_url }).into_response()
        }
        ArtifactRpc::DeleteArtifact(req) => {
            let key = req.key()?;
            authorized.ensure(&key.scope)?;
            let record = service.delete_artifact(&key).await?;
            Json(DeleteArtifactResponse {
                ok: true,
                artifact_id: record.id,
            })
            .into_response()
        }
    };
    Ok(response)
}
