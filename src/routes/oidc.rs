//! `/oidc/login`, `/oidc/login/callback`, `/oidc/login/invalidate` — the
//! browser-facing half of the login flow. The terms hop lives in
//! `routes::terms`; both sides feed the same orchestrator.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use openidconnect::PkceCodeVerifier;
use serde::Deserialize;
use serde_json::json;

use crate::auth::state_token::AuthState;
use crate::auth::{controller, orchestrator};
use crate::auth::orchestrator::OrchestratorPolicy;
use crate::db::models::OidcAuthState;
use crate::error::GatewayError;
use crate::routes::next_step_redirect_response;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub return_url: String,
    pub fe_url: String,
    #[serde(default)]
    pub validate_ssn: bool,
}

/// `GET /oidc/login` — build the IdP authorize URL and stash the PKCE
/// verifier server-side, keyed by the fresh `AuthState`'s `login_nonce`.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let auth_state = AuthState::new(params.fe_url, params.return_url);
    let encoded_state = auth_state.encode(&state.config.internal_token_secret);

    let (url, pkce_verifier) = state
        .idp
        .create_authorization_url(
            encoded_state,
            &state.config.oidc_callback_url(),
            params.validate_ssn,
            state.config.oidc_language.as_deref(),
        )
        .await
        .map_err(|e| GatewayError::IdpError {
            code: "E505",
            detail: e.to_string(),
        })?;

    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(state.config.auth_state_max_age_secs);
    sqlx::query(
        "INSERT INTO oidc_auth_state (nonce, pkce_verifier, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&auth_state.login_nonce)
    .bind(pkce_verifier.secret())
    .bind(now)
    .bind(expires_at)
    .execute(&state.db.pool)
    .await?;

    Ok(Json(json!({ "next_url": url.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub state: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// `GET /oidc/login/callback` — the IdP redirect target. Classifies
/// IdP-signalled errors, otherwise completes the code exchange and hands
/// the decision to the orchestrator.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let auth_state = match AuthState::decode(
        &params.state,
        &state.config.internal_token_secret,
        state.config.auth_state_max_age_secs,
    ) {
        Ok(s) => s,
        Err(err) => return err.into_response(),
    };

    if let Some(error) = params.error {
        orchestrator::invalidate_login(&state.idp, &state.config, &auth_state).await;
        let code = classify_idp_error(&error, params.error_description.as_deref());
        return GatewayError::IdpError {
            code,
            detail: params.error_description.unwrap_or(error),
        }
        .into_redirect(&auth_state);
    }

    let Some(code) = params.code else {
        return GatewayError::DecodeError.into_response();
    };

    match complete_login(&state, &auth_state, &code).await {
        Ok(response) => response,
        Err(err) => err.into_redirect(&auth_state),
    }
}

fn classify_idp_error(error: &str, description: Option<&str>) -> &'static str {
    if error == "access_denied" {
        if let Some(description) = description {
            if description.contains("mitid_user_aborted") || description.contains("user_aborted")
            {
                return "E1";
            }
        }
    }
    "E0"
}

async fn complete_login(
    state: &Arc<AppState>,
    auth_state: &AuthState,
    code: &str,
) -> Result<Response, GatewayError> {
    let pkce_row = sqlx::query_as::<_, OidcAuthState>(
        "SELECT nonce, pkce_verifier, created_at, expires_at FROM oidc_auth_state WHERE nonce = ?",
    )
    .bind(&auth_state.login_nonce)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| GatewayError::IdpError {
        code: "E505",
        detail: "no pending authorization for this state".into(),
    })?;

    sqlx::query("DELETE FROM oidc_auth_state WHERE nonce = ?")
        .bind(&auth_state.login_nonce)
        .execute(&state.db.pool)
        .await?;

    let idp_token = state
        .idp
        .fetch_token(
            code,
            PkceCodeVerifier::new(pkce_row.pkce_verifier),
            &state.config.oidc_callback_url(),
        )
        .await
        .map_err(|e| GatewayError::IdpError {
            code: "E505",
            detail: e.to_string(),
        })?;

    let mut auth_state = auth_state
        .clone()
        .with_id_token(&idp_token.id_token, &state.config.state_encryption_key)
        .map_err(GatewayError::Internal)?;
    auth_state.tin = idp_token.tin.clone();
    auth_state.identity_provider = Some(idp_token.provider.clone());
    auth_state.external_subject = Some(idp_token.subject.clone());

    let mut tx = state.db.pool.begin().await?;
    let user = controller::get_user_by_external_subject(&mut *tx, &idp_token.provider, &idp_token.subject)
        .await
        .map_err(GatewayError::Internal)?;

    let next = orchestrator::next_step(
        &mut tx,
        &state.config,
        OrchestratorPolicy::Standard,
        &auth_state,
        user,
    )
    .await?;
    tx.commit().await?;

    next_step_redirect_response(&state.config, next)
}


#[derive(Debug, Deserialize)]
pub struct InvalidateBody {
    pub state: String,
}

/// `POST /oidc/login/invalidate` — best-effort cleanup for a flow the
/// client abandoned before reaching terms or success.
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InvalidateBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let auth_state = AuthState::decode(
        &body.state,
        &state.config.internal_token_secret,
        state.config.auth_state_max_age_secs,
    )?;
    orchestrator::invalidate_login(&state.idp, &state.config, &auth_state).await;
    Ok(Json(json!({ "success": true })))
}
