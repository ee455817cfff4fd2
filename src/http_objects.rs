use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, TimeZone, Utc};
use data_model::{ArtifactError, ArtifactKey, ArtifactRecord, ArtifactScope, ContentHash};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use utoipa::ToSchema;

/// Twirp style error body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ArtifactAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    code: String,
    msg: String,
    #[serde(skip)]
    total: Option<u64>,
}

impl ArtifactAPIError {
    pub fn new(status_code: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status_code,
            code: code.to_string(),
            msg: message.to_string(),
            total: None,
        }
    }

    pub fn bad_route(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "bad_route", message)
    }

    pub fn malformed(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "malformed", message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl IntoResponse for ArtifactAPIError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.msg);
        } else {
            debug!("API Error: {} - {}", self.status_code, self.msg);
        }
        let status_code = self.status_code;
        let total = self.total;
        let mut response = (status_code, Json(self)).into_response();
        if let Some(total) = total {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl From<ArtifactError> for ArtifactAPIError {
    fn from(err: ArtifactError) -> Self {
        let message = err.to_string();
        let (status_code, code) = match &err {
            ArtifactError::Unauthorized(_) |
            ArtifactError::ExpiredClaim |
            ArtifactError::InvalidSignature => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ArtifactError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ArtifactError::InvalidScope(_) | ArtifactError::InvalidArgument(_) => {
                (StatusCode::BAD_REQUEST, "invalid_argument")
            }
            ArtifactError::ConflictingWrite(_) => (StatusCode::CONFLICT, "already_exists"),
            ArtifactError::RangeNotSatisfiable { .. } => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "out_of_range")
            }
            ArtifactError::HashMismatch { .. } |
            ArtifactError::SizeMismatch { .. } |
            ArtifactError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let mut api_error = Self::new(status_code, code, &message);
        if let ArtifactError::RangeNotSatisfiable { total } = err {
            api_error.total = Some(total);
        }
        api_error
    }
}

impl From<serde_json::Error> for ArtifactAPIError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed(&e.to_string())
    }
}

/// protojson renders int64 as a string and accepts either form.
mod int64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(repr: Repr) -> Result<u64, E> {
        match repr {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.parse().map_err(E::custom),
        }
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse(Repr::deserialize(deserializer)?)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<super::Repr>::deserialize(deserializer)? {
                Some(repr) => super::parse(repr).map(Some),
                None => Ok(None),
            }
        }
    }
}

fn artifact_key(run_id: &str, job_id: &str, name: &str) -> Result<ArtifactKey, ArtifactError> {
    ArtifactKey::new(ArtifactScope::new(run_id, job_id)?, name)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactRequest {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<i32>,
}

impl CreateArtifactRequest {
    pub fn key(&self) -> Result<ArtifactKey, ArtifactError> {
        artifact_key(
            &self.workflow_run_backend_id,
            &self.workflow_job_run_backend_id,
            &self.name,
        )
    }

    pub fn expires_at_ms(&self) -> Result<Option<u64>, ArtifactError> {
        self.expires_at
            .map(|t| {
                u64::try_from(t.timestamp_millis()).map_err(|_| {
                    ArtifactError::invalid_argument(format!("expiresAt {} is before the epoch", t))
                })
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactResponse {
    pub ok: bool,
    pub signed_upload_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeArtifactRequest {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    pub name: String,
    #[serde(with = "int64")]
    #[schema(value_type = String)]
    pub size: u64,
    /// `algo:hex`, for example `sha256:...`.
    #[serde(default)]
    pub hash: Option<String>,
}

impl FinalizeArtifactRequest {
    pub fn key(&self) -> Result<ArtifactKey, ArtifactError> {
        artifact_key(
            &self.workflow_run_backend_id,
            &self.workflow_job_run_backend_id,
            &self.name,
        )
    }

    pub fn content_hash(&self) -> Result<Option<ContentHash>, ArtifactError> {
        self.hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(str::parse)
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeArtifactResponse {
    pub ok: bool,
    #[serde(with = "int64")]
    #[schema(value_type = String)]
    pub artifact_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListArtifactsRequest {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    #[serde(default)]
    pub name_filter: Option<String>,
    #[serde(default, deserialize_with = "int64::option::deserialize")]
    #[schema(value_type = Option<String>)]
    pub id_filter: Option<u64>,
}

impl ListArtifactsRequest {
    pub fn scope(&self) -> Result<ArtifactScope, ArtifactError> {
        ArtifactScope::new(
            self.workflow_run_backend_id.as_str(),
            self.workflow_job_run_backend_id.as_str(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListArtifactsResponseMonolithArtifact {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    #[serde(with = "int64")]
    #[schema(value_type = String)]
    pub database_id: u64,
    pub name: String,
    #[serde(with = "int64")]
    #[schema(value_type = String)]
    pub size: u64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl From<ArtifactRecord> for ListArtifactsResponseMonolithArtifact {
    fn from(record: ArtifactRecord) -> Self {
        let created_at = i64::try_from(record.created_at)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_default();
        Self {
            workflow_run_backend_id: record.scope.run_id,
            workflow_job_run_backend_id: record.scope.job_id,
            database_id: record.id,
            name: record.name,
            size: record.size.unwrap_or_default(),
            status: record.status.to_string(),
            created_at,
            digest: record.hash.map(|h| h.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListArtifactsResponse {
    pub artifacts: Vec<ListArtifactsResponseMonolithArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetSignedArtifactURLRequest {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    pub name: String,
}

impl GetSignedArtifactURLRequest {
    pub fn key(&self) -> Result<ArtifactKey, ArtifactError> {
        artifact_key(
            &self.workflow_run_backend_id,
            &self.workflow_job_run_backend_id,
            &self.name,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetSignedArtifactURLResponse {
    pub signed_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteArtifactRequest {
    pub workflow_run_backend_id: String,
    pub workflow_job_run_backend_id: String,
    pub name: String,
}

impl DeleteArtifactRequest {
    pub fn key(&self) -> Result<ArtifactKey, ArtifactError> {
        artifact_key(
            &self.workflow_run_backend_id,
            &self.workflow_job_run_backend_id,
            &self.name,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteArtifactResponse {
    pub ok: bool,
    #[serde(with = "int64")]
    #[schema(value_type = String)]
    pub artifact_id: u64,
}

/// One decoded RPC call, keyed by the Twirp method name.
#[derive(Debug, Clone)]
pub enum ArtifactRpc {
    CreateArtifact(CreateArtifactRequest),
    FinalizeArtifact(FinalizeArtifactRequest),
    ListArtifacts(ListArtifactsRequest),
    GetSignedArtifactURL(GetSignedArtifactURLRequest),
    DeleteArtifact(DeleteArtifactRequest),
}

impl ArtifactRpc {
    pub fn decode(method: &str, body: &[u8]) -> Result<Self, ArtifactAPIError> {
        let rpc = match method {
            "CreateArtifact" => ArtifactRpc::CreateArtifact(serde_json::from_slice(body)?),
            "FinalizeArtifact" => ArtifactRpc::FinalizeArtifact(serde_json::from_slice(body)?),
            "ListArtifacts" => ArtifactRpc::ListArtifacts(serde_json::from_slice(body)?),
            "GetSignedArtifactURL" => {
                ArtifactRpc::GetSignedArtifactURL(serde_json::from_slice(body)?)
            }
            "DeleteArtifact" => ArtifactRpc::DeleteArtifact(serde_json::from_slice(body)?),
            _ => {
                return Err(ArtifactAPIError::bad_route(&format!(
                    "no handler for method {}",
                    method
                )))
            }
        };
        Ok(rpc)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthCheck {
    pub status: String,
}
