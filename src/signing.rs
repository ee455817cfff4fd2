use std::fmt;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 key shared by bearer tokens and signed URLs.
#[derive(Clone)]
pub struct SigningKey {
    mac: HmacSha256,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

impl SigningKey {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("signing secret is empty"));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow!("invalid signing secret: {}", e))?;
        Ok(Self { mac })
    }

    pub fn generate() -> Result<Self> {
        Self::new(&rand::random::<[u8; 32]>())
    }

    pub fn from_config(secret: Option<&str>) -> Result<Self> {
        match secret {
            Some(secret) => Self::new(secret.as_bytes()),
            None => {
                warn!(
                    "artifacts.signing_secret is not set, using a random secret; tokens and signed urls will not survive a restart"
                );
                Self::generate()
            }
        }
    }

    /// Base64url encoded MAC of `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Constant time check of a base64url encoded MAC.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(tag) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.verify_slice(&tag).is_ok()
    }
}
