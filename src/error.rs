use axum::{
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;

use crate::auth::state_token::AuthState;

/// Error codes surfaced to clients on redirect-path failures, per the
/// `success=0&error_code=...` contract.
pub const E0_GENERIC_IDP_FAILURE: &str = "E0";
pub const E1_USER_ABORTED: &str = "E1";
pub const E4_TERMS_DECLINED: &str = "E4";
pub const E505_IDP_TOKEN_EXCHANGE_FAILURE: &str = "E505";

/// Unified fault type for the gateway. Handlers return this and either
/// convert it directly into an HTTP response (JSON-path endpoints) or call
/// [`GatewayError::into_redirect`] to carry the failure back to the client's
/// `return_url` (redirect-path endpoints).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid or expired auth state")]
    DecodeError,

    #[error("identity provider error: {code}")]
    IdpError { code: &'static str, detail: String },

    #[error("conflicting write, retry")]
    Conflict,

    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error("signing error")]
    Signing,

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// The `error_code` to bake into a failure redirect, if this error
    /// corresponds to one of the taxonomy's public codes.
    fn error_code(&self) -> &'static str {
        match self {
            GatewayError::IdpError { code, .. } => code,
            GatewayError::DecodeError => "E0",
            _ => "E0",
        }
    }

    /// Build the `return_url?success=0&error_code=...` URL used by every
    /// failure path that must land back on the client's `return_url`
    /// instead of surfacing an HTTP error status.
    pub fn failure_url(&self, state: &AuthState) -> Option<String> {
        let mut url = url::Url::parse(&state.return_url).ok()?;
        url.query_pairs_mut()
            .append_pair("success", "0")
            .append_pair("error_code", self.error_code());
        Some(url.to_string())
    }

    /// Same failure target as [`GatewayError::failure_url`], delivered as a
    /// `307` redirect — used by the browser-facing callback endpoint.
    pub fn into_redirect(self, state: &AuthState) -> Response {
        tracing::warn!(error = %self, error_code = self.error_code(), "login flow failed");
        match self.failure_url(state) {
            Some(url) => Redirect::temporary(&url).into_response(),
            None => self.into_response(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::DecodeError => {
                tracing::warn!("rejected malformed or expired auth state");
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_state"})),
                )
                    .into_response()
            }
            GatewayError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
            }
            GatewayError::IdpError { code, detail } => {
                tracing::error!(code = %code, detail = %detail, "identity provider error");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "idp_error", "code": code})),
                )
                    .into_response()
            }
            GatewayError::Conflict => {
                tracing::error!("unresolved write conflict reached the HTTP boundary");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "conflict"})))
                    .into_response()
            }
            GatewayError::Db(err) => {
                tracing::error!(error = %err, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
            GatewayError::Signing => {
                tracing::error!("token signing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
            GatewayError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal"})),
                )
                    .into_response()
            }
        }
    }
}
