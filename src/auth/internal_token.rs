//! The `InternalToken` — a signed, opaque-to-clients bearer blob handed to
//! downstream services via the forward-auth header. Consumed by services
//! that trust this gateway's signature; never decoded by clients.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalToken {
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub actor: String,
    pub subject: String,
    pub scope: Vec<String>,
}

impl InternalToken {
    pub fn encode(&self, secret: &str) -> String {
        let payload = serde_json::to_vec(self).expect("InternalToken is always serializable");
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{payload_b64}.{signature_b64}")
    }

    pub fn decode(token: &str, secret: &str) -> anyhow::Result<Self> {
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("malformed internal token"))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
        mac.update(payload_b64.as_bytes());

        let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature_b64)?;
        mac.verify_slice(&signature)
            .map_err(|_| anyhow::anyhow!("internal token signature mismatch"))?;

        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}
