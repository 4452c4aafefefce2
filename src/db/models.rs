use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A resolved identity, keyed by an opaque, server-generated `subject`.
///
/// Invariant: at least one of `ssn`, `tin` is non-null (enforced by a check
/// constraint). `ssn`, when present, is unique across the table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub subject: String,
    /// AES-256-GCM encrypted, never stored in the clear.
    pub ssn_enc: Option<String>,
    pub tin: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Binds one IdP identity to one `User`.
///
/// Invariant: `(identity_provider, external_subject)` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalUser {
    pub id: String,
    pub subject: String,
    pub identity_provider: String,
    pub external_subject: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row written once per successful login. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoginRecord {
    pub id: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// A minted session. `opaque_token` is the value placed in the session
/// cookie; `internal_token` is the signed bearer string handed to
/// downstream services via forward-auth; `id_token` is the raw (decrypted)
/// IdP ID token, retained so logout can invalidate the IdP-side session.
///
/// Invariant: `issued < expires`. Valid at instant `t` iff `issued <= t < expires`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionToken {
    pub opaque_token: String,
    pub internal_token: String,
    pub id_token: String,
    pub subject: String,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Ambient CSRF/PKCE tracking row for one in-flight `/oidc/login` redirect.
///
/// Keyed by the nonce embedded in the signed `AuthState` token so the PKCE
/// code verifier — which must never leave the server — doesn't ride along
/// in the client-visible state. Swept by the periodic cleanup task once
/// `expires_at` has passed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OidcAuthState {
    pub nonce: String,
    pub pkce_verifier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
