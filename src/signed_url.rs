use std::time::Duration;

use anyhow::{anyhow, Result};
use data_model::{ArtifactError, ArtifactKey, ArtifactResult, ArtifactScope};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use url::Url;
use utoipa::IntoParams;

use crate::signing::SigningKey;

pub const ARTIFACT_SERVICE_PATH: &str = "/twirp/github.actions.results.api.v1.ArtifactService";

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ClaimPurpose {
    Upload,
    Download,
}

impl ClaimPurpose {
    fn route(&self) -> &'static str {
        match self {
            ClaimPurpose::Upload => "UploadArtifact",
            ClaimPurpose::Download => "DownloadArtifact",
        }
    }
}

/// Claim carried in the query string of a signed URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SignedClaim {
    pub artifact_name: String,
    pub run_id: String,
    pub job_id: String,
    /// Unix seconds after which the URL is refused.
    pub expires: u64,
    pub sig: String,
}

fn claim_payload(
    purpose: ClaimPurpose,
    run_id: &str,
    job_id: &str,
    name: &str,
    expires: u64,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        purpose, run_id, job_id, name, expires
    )
}

/// Mints and verifies signed upload and download URLs. Verification is
/// stateless: the claim itself names the artifact.
#[derive(Debug, Clone)]
pub struct SignedUrlIssuer {
    key: SigningKey,
    base_url: Url,
    ttl: Duration,
}

impl SignedUrlIssuer {
    pub fn new(key: SigningKey, public_url: &str, ttl: Duration) -> Result<Self> {
        let base_url = public_url
            .parse::<Url>()
            .map_err(|e| anyhow!("invalid public url {}: {}", public_url, e))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("public url {} cannot be a base", public_url));
        }
        Ok(Self { key, base_url, ttl })
    }

    pub fn claim(&self, purpose: ClaimPurpose, key: &ArtifactKey, expires: u64) -> SignedClaim {
        let payload = claim_payload(
            purpose,
            &key.scope.run_id,
            &key.scope.job_id,
            &key.name,
            expires,
        );
        SignedClaim {
            artifact_name: key.name.clone(),
            run_id: key.scope.run_id.clone(),
            job_id: key.scope.job_id.clone(),
            expires,
            sig: self.key.sign(payload.as_bytes()),
        }
    }

    pub fn issue(&self, purpose: ClaimPurpose, key: &ArtifactKey) -> String {
        let expires = artifact_utils::get_epoch_time_in_secs() + self.ttl.as_secs();
        self.issue_until(purpose, key, expires)
    }

    pub fn issue_until(&self, purpose: ClaimPurpose, key: &ArtifactKey, expires: u64) -> String {
        let claim = self.claim(purpose, key, expires);
        let mut url = self.base_url.clone();
        let path = format!(
            "{}{}/{}",
            url.path().trim_end_matches('/'),
            ARTIFACT_SERVICE_PATH,
            purpose.route()
        );
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("artifactName", &claim.artifact_name)
            .append_pair("runId", &claim.run_id)
            .append_pair("jobId", &claim.job_id)
            .append_pair("expires", &claim.expires.to_string())
            .append_pair("sig", &claim.sig);
        url.to_string()
    }

    /// Signature first, then expiry.
    pub fn verify(&self, purpose: ClaimPurpose, claim: &SignedClaim) -> ArtifactResult<ArtifactKey> {
        let payload = claim_payload(
            purpose,
            &claim.run_id,
            &claim.job_id,
            &claim.artifact_name,
            claim.expires,
        );
        if !self.key.verify(payload.as_bytes(), &claim.sig) {
            return Err(ArtifactError::InvalidSignature);
        }
        if claim.expires < artifact_utils::get_epoch_time_in_secs() {
            return Err(ArtifactError::ExpiredClaim);
        }
        let scope = ArtifactScope::new(claim.run_id.as_str(), claim.job_id.as_str())?;
        ArtifactKey::new(scope, claim.artifact_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_key;

    use super::*;

    fn issuer() -> SignedUrlIssuer {
        SignedUrlIssuer::new(
            SigningKey::new(b"secret").unwrap(),
            "http://localhost:8900",
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn claim_from_url(url: &str) -> SignedClaim {
        let url = Url::parse(url).unwrap();
        let query = url.query().unwrap().to_string();
        serde_json::from_value(serde_json::Value::Object(
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| {
                    let value = if k == "expires" {
                        serde_json::Value::from(v.parse::<u64>().unwrap())
                    } else {
                        serde_json::Value::from(v.to_string())
                    };
                    (k.to_string(), value)
                })
                .collect(),
        ))
        .unwrap()
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let issuer = issuer();
        let key = mock_key("my artifact");
        let url = issuer.issue(ClaimPurpose::Download, &key);
        assert!(url.starts_with(
            "http://localhost:8900/twirp/github.actions.results.api.v1.ArtifactService/DownloadArtifact?"
        ));
        let claim = claim_from_url(&url);
        assert_eq!(claim.artifact_name, "my artifact");
        assert_eq!(issuer.verify(ClaimPurpose::Download, &claim).unwrap(), key);
    }

    #[test]
    fn test_purposes_are_not_interchangeable() {
        let issuer = issuer();
        let claim = issuer.claim(ClaimPurpose::Upload, &mock_key("artifact"), u64::MAX);
        assert_eq!(
            issuer.verify(ClaimPurpose::Download, &claim),
            Err(ArtifactError::InvalidSignature)
        );
        assert!(issuer.verify(ClaimPurpose::Upload, &claim).is_ok());
    }

    #[test]
    fn test_tampered_claims_are_rejected() {
        let issuer = issuer();
        let claim = issuer.claim(ClaimPurpose::Download, &mock_key("artifact"), u64::MAX);

        let mut other_name = claim.clone();
        other_name.artifact_name = "other".to_string();
        assert_eq!(
            issuer.verify(ClaimPurpose::Download, &other_name),
            Err(ArtifactError::InvalidSignature)
        );

        let mut other_job = claim.clone();
        other_job.job_id = "194".to_string();
        assert_eq!(
            issuer.verify(ClaimPurpose::Download, &other_job),
            Err(ArtifactError::InvalidSignature)
        );

        let mut extended = claim;
        extended.expires -= 1;
        assert_eq!(
            issuer.verify(ClaimPurpose::Download, &extended),
            Err(ArtifactError::InvalidSignature)
        );
    }

    #[test]
    fn test_expired_claim() {
        let issuer = issuer();
        let claim = issuer.claim(ClaimPurpose::Download, &mock_key("artifact"), 1_000);
        assert_eq!(
            issuer.verify(ClaimPurpose::Download, &claim),
            Err(ArtifactError::ExpiredClaim)
        );
    }

    #[test]
    fn test_public_url_with_prefix() {
        let issuer = SignedUrlIssuer::new(
            SigningKey::new(b"secret").unwrap(),
            "https://ci.example.com/artifacts/",
            Duration::from_secs(60),
        )
        .unwrap();
        let url = issuer.issue(ClaimPurpose::Upload, &mock_key("artifact"));
        assert!(url.starts_with(
            "https://ci.example.com/artifacts/twirp/github.actions.results.api.v1.ArtifactService/UploadArtifact?"
        ));
    }
}
