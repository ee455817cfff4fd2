use std::time::Duration;

use axum::{extract::FromRequestParts, http::request::Parts};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use data_model::{ArtifactError, ArtifactResult, ArtifactScope};
use serde::{Deserialize, Serialize};

use crate::{http_objects::ArtifactAPIError, routes::RouteState, signing::SigningKey};

const SCOPE_PREFIX: &str = "Actions.Results";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub runner_id: String,
    pub run_id: String,
    pub job_id: String,
    /// `Actions.Results:<run>:<job>`
    pub scp: String,
    pub iat: u64,
    pub exp: u64,
}

pub fn scope_claim(run_id: &str, job_id: &str) -> String {
    format!("{}:{}:{}", SCOPE_PREFIX, run_id, job_id)
}

/// Issues and validates runner bearer tokens of the form
/// `base64url(claims).base64url(hmac)`.
#[derive(Debug, Clone)]
pub struct TokenService {
    key: SigningKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(key: SigningKey, ttl: Duration) -> Self {
        Self { key, ttl }
    }

    pub fn issue(&self, runner_id: &str, run_id: &str, job_id: &str) -> ArtifactResult<String> {
        self.issue_at(
            runner_id,
            run_id,
            job_id,
            artifact_utils::get_epoch_time_in_secs(),
        )
    }

    pub fn issue_at(
        &self,
        runner_id: &str,
        run_id: &str,
        job_id: &str,
        issued_at: u64,
    ) -> ArtifactResult<String> {
        if runner_id.is_empty() {
            return Err(ArtifactError::InvalidScope("runner id is empty".to_string()));
        }
        let scope = ArtifactScope::new(run_id, job_id)?;
        let claims = TokenClaims {
            runner_id: runner_id.to_string(),
            scp: scope_claim(&scope.run_id, &scope.job_id),
            run_id: scope.run_id,
            job_id: scope.job_id,
            iat: issued_at,
            exp: issued_at + self.ttl.as_secs(),
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| ArtifactError::Internal(format!("failed to encode claims: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = self.key.sign(payload.as_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Checks the MAC, then expiry, then that the scope claim agrees with
    /// the run and job ids.
    pub fn validate(&self, token: &str) -> ArtifactResult<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ArtifactError::unauthorized("malformed token"))?;
        if !self.key.verify(payload.as_bytes(), signature) {
            return Err(ArtifactError::unauthorized("invalid token signature"));
        }
        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| ArtifactError::unauthorized("malformed token claims"))?;
        if claims.exp <= artifact_utils::get_epoch_time_in_secs() {
            return Err(ArtifactError::unauthorized("token expired"));
        }
        if claims.scp != scope_claim(&claims.run_id, &claims.job_id) {
            return Err(ArtifactError::unauthorized("token scope mismatch"));
        }
        Ok(claims)
    }

    pub fn validate_scope(&self, token: &str) -> ArtifactResult<ArtifactScope> {
        let claims = self.validate(token)?;
        ArtifactScope::new(claims.run_id, claims.job_id)
            .map_err(|_| ArtifactError::unauthorized("token scope is invalid"))
    }
}

/// Scope carried by a validated `Authorization: Bearer` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedScope(pub ArtifactScope);

impl AuthorizedScope {
    /// Rejects requests addressing a scope other than the token's own.
    pub fn ensure(&self, requested: &ArtifactScope) -> ArtifactResult<()> {
        if &self.0 != requested {
            return Err(ArtifactError::unauthorized(
                "token is not valid for the requested run and job",
            ));
        }
        Ok(())
    }
}

impl FromRequestParts<RouteState> for AuthorizedScope {
    type Rejection = ArtifactAPIError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RouteState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ArtifactError::unauthorized("missing bearer token"))?;
        let scope = state.tokens.validate_scope(token)?;
        Ok(AuthorizedScope(scope))
    }
}
