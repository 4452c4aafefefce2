//! The `AuthState` codec (C1).
//!
//! `AuthState` threads client context across IdP redirects without any
//! server-side session object: it is carried as the `state` query parameter
//! to the IdP and handed back verbatim on callback. Integrity is mandatory
//! (HMAC-SHA256 over the payload); confidentiality is not, since the only
//! sensitive field — the IdP `id_token` — is independently AES-256-GCM
//! encrypted before being embedded here.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::db::crypto;
use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Transient, unpersisted login-flow context. Threaded through redirects as
/// a signed, URL-safe string (see [`AuthState::encode`]/[`AuthState::decode`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub fe_url: String,
    pub return_url: String,
    /// Keys the persisted `OidcAuthState` PKCE row for this flow. Generated
    /// once in [`AuthState::new`] and carried unchanged through every hop.
    pub login_nonce: String,
    #[serde(default)]
    pub terms_accepted: bool,
    #[serde(default)]
    pub terms_version: Option<String>,
    /// AES-256-GCM ciphertext of the IdP's raw id_token, base64-encoded.
    /// Never the plaintext token.
    #[serde(default)]
    pub id_token_enc: Option<String>,
    #[serde(default)]
    pub tin: Option<String>,
    #[serde(default)]
    pub identity_provider: Option<String>,
    #[serde(default)]
    pub external_subject: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl AuthState {
    /// Build the initial state for a fresh `/oidc/login` request.
    pub fn new(fe_url: impl Into<String>, return_url: impl Into<String>) -> Self {
        Self {
            fe_url: fe_url.into(),
            return_url: return_url.into(),
            login_nonce: uuid::Uuid::new_v4().to_string(),
            terms_accepted: false,
            terms_version: None,
            id_token_enc: None,
            tin: None,
            identity_provider: None,
            external_subject: None,
            issued_at: Utc::now(),
        }
    }

    /// Encrypt and attach the IdP id_token under the given key.
    pub fn with_id_token(mut self, id_token: &str, encryption_key: &str) -> anyhow::Result<Self> {
        self.id_token_enc = Some(crypto::encrypt(id_token, encryption_key)?);
        Ok(self)
    }

    /// Decrypt the embedded id_token, if any.
    pub fn decrypt_id_token(&self, encryption_key: &str) -> anyhow::Result<Option<String>> {
        self.id_token_enc
            .as_deref()
            .map(|enc| crypto::decrypt(enc, encryption_key))
            .transpose()
    }

    /// Sign and base64url-encode this state as `payload.signature`.
    pub fn encode(&self, secret: &str) -> String {
        let payload = serde_json::to_vec(self).expect("AuthState is always serializable");
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{payload_b64}.{signature_b64}")
    }

    /// Verify the signature, parse the payload, and reject tokens older than
    /// `max_age_secs`.
    pub fn decode(token: &str, secret: &str, max_age_secs: i64) -> Result<Self, GatewayError> {
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or(GatewayError::DecodeError)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| GatewayError::DecodeError)?;
        mac.update(payload_b64.as_bytes());

        let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| GatewayError::DecodeError)?;
        mac.verify_slice(&signature)
            .map_err(|_| GatewayError::DecodeError)?;

        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| GatewayError::DecodeError)?;
        let state: AuthState =
            serde_json::from_slice(&payload).map_err(|_| GatewayError::DecodeError)?;

        let age = Utc::now().signed_duration_since(state.issued_at);
        if age.num_seconds() > max_age_secs {
            return Err(GatewayError::DecodeError);
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-hmac-secret";

    #[test]
    fn round_trips_for_every_valid_state() {
        let state = AuthState::new("https://fe.example", "https://app.example/r");
        let encoded = state.encode(SECRET);
        let decoded = AuthState::decode(&encoded, SECRET, 900).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn round_trips_with_all_optional_fields_set() {
        let mut state = AuthState::new("https://fe.example", "https://app.example/r");
        state.terms_accepted = true;
        state.terms_version = Some("1".into());
        state.tin = Some("39315041".into());
        state.identity_provider = Some("mitid".into());
        state.external_subject = Some("S1".into());
        let state = state.with_id_token("raw-id-token", "enc-key").unwrap();

        let encoded = state.encode(SECRET);
        let decoded = AuthState::decode(&encoded, SECRET, 900).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(
            decoded.decrypt_id_token("enc-key").unwrap().as_deref(),
            Some("raw-id-token")
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let state = AuthState::new("https://fe.example", "https://app.example/r");
        let encoded = state.encode(SECRET);
        let (payload, sig) = encoded.split_once('.').unwrap();
        let mut tampered_payload = payload.to_string();
        tampered_payload.push('X');
        let tampered = format!("{tampered_payload}.{sig}");

        let result = AuthState::decode(&tampered, SECRET, 900);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let state = AuthState::new("https://fe.example", "https://app.example/r");
        let encoded = state.encode(SECRET);
        let result = AuthState::decode(&encoded, "other-secret", 900);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_expired_state() {
        let mut state = AuthState::new("https://fe.example", "https://app.example/r");
        state.issued_at = Utc::now() - chrono::Duration::seconds(1000);
        let encoded = state.encode(SECRET);
        let result = AuthState::decode(&encoded, SECRET, 900);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_token() {
        let result = AuthState::decode("not-a-valid-token", SECRET, 900);
        assert!(result.is_err());
    }
}
