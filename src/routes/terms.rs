//! `/terms` and `/terms/accept` (C6): the terms-acceptance hop between an
//! unknown user's callback and a minted session.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::orchestrator::OrchestratorPolicy;
use crate::auth::state_token::AuthState;
use crate::auth::{orchestrator, terms};
use crate::error::GatewayError;
use crate::routes::next_step_json_response;
use crate::AppState;

pub async fn get_terms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let doc = terms::load_latest(&state.config.terms_markdown_dir).map_err(GatewayError::Internal)?;
    Ok(Json(json!({
        "headline": doc.headline,
        "terms": doc.terms_html,
        "version": doc.version,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AcceptBody {
    pub state: String,
    pub accepted: bool,
    pub version: String,
}

/// Accepting hands off to the orchestrator's CREATE → SUCCESS path;
/// declining invalidates the pending IdP session and reports `E4` without
/// ever creating a user.
pub async fn accept_terms(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcceptBody>,
) -> Result<Response, GatewayError> {
    let mut auth_state = AuthState::decode(
        &body.state,
        &state.config.internal_token_secret,
        state.config.auth_state_max_age_secs,
    )?;
    auth_state.terms_accepted = body.accepted;
    auth_state.terms_version = Some(body.version);

    if !body.accepted {
        orchestrator::invalidate_login(&state.idp, &state.config, &auth_state).await;
        let error = GatewayError::IdpError {
            code: "E4",
            detail: "terms declined".into(),
        };
        let next_url = error
            .failure_url(&auth_state)
            .ok_or(GatewayError::DecodeError)?;
        return Ok(Json(json!({ "next_url": next_url })).into_response());
    }

    let mut tx = state.db.pool.begin().await?;
    let next = orchestrator::next_step(
        &mut tx,
        &state.config,
        OrchestratorPolicy::CreateOnTermsAccept,
        &auth_state,
        None,
    )
    .await?;
    tx.commit().await?;

    Ok(next_step_json_response(&state.config, next))
}
