//! Login orchestrator (C2): the single stateful decision point in the
//! gateway. Given `(AuthState, executor, Option<User>)` it decides the next
//! step of a login and, on success, executes the atomic SUCCESS mint
//! sequence.
//!
//! The source models the callback endpoint as a base class with overridable
//! success/failure hooks; this implementation instead takes a `policy`
//! parameter selecting between the callback's redirect-only behavior and
//! `/terms/accept`'s response-with-body behavior, since the two differ only
//! in what they do with the same next-step decision, not in the decision
//! itself.

use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use crate::auth::controller;
use crate::auth::idp::IdpAdapter;
use crate::auth::state_token::AuthState;
use crate::config::AppConfig;
use crate::db::models::User;
use crate::error::GatewayError;

/// Default scopes granted to every minted `InternalToken`.
const TOKEN_DEFAULT_SCOPES: &[&str] = &["meteringpoints.read", "measurements.read"];

/// Distinguishes the two call sites that drive the same state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPolicy {
    /// `/oidc/login/callback`: decide the next redirect purely from
    /// `(state, user)`, never creating a user directly (an unknown user
    /// is sent to the terms prompt).
    Standard,
    /// `/terms/accept`: the caller has just recorded `terms_accepted` on
    /// `state`; if accepted, this policy is allowed to create the user.
    CreateOnTermsAccept,
}

/// The decided next step of a login flow.
#[derive(Debug, Clone)]
pub enum NextStep {
    /// Redirect/respond to the frontend's terms-acceptance page, carrying
    /// the re-encoded `state`.
    PromptTerms { next_url: String, state: AuthState },
    /// Login succeeded: redirect/respond to `return_url` with the success
    /// query parameter and a `Set-Cookie` carrying `opaque_token`.
    Success { next_url: String, opaque_token: String },
}

/// Decide and, where applicable, execute the next step of a login.
///
/// `tx` is a single transaction spanning the whole decision: even the
/// read-only PROMPT-TERMS branch runs inside one so that a caller chaining
/// `fetch_token` → `get_user_by_external_subject` → orchestrate stays
/// within one atomic unit of work through to SUCCESS.
pub async fn next_step(
    tx: &mut Transaction<'_, Sqlite>,
    config: &AppConfig,
    policy: OrchestratorPolicy,
    state: &AuthState,
    user: Option<User>,
) -> Result<NextStep, GatewayError> {
    match user {
        Some(user) => mint_success(tx, config, state, &user).await,
        None if !state.terms_accepted => {
            if policy == OrchestratorPolicy::CreateOnTermsAccept {
                // `/terms/accept` invoked this policy only when accepted=true;
                // an explicit decline is handled by the caller before reaching
                // here (see routes::terms::accept). Reaching this branch with
                // CreateOnTermsAccept and terms_accepted=false is a caller bug.
                return Err(GatewayError::Internal(anyhow::anyhow!(
                    "CreateOnTermsAccept policy invoked without terms_accepted"
                )));
            }
            let next_url = format!("{}/terms", state.fe_url.trim_end_matches('/'));
            Ok(NextStep::PromptTerms {
                next_url,
                state: state.clone(),
            })
        }
        None => {
            // terms_accepted = true, user unknown: CREATE then SUCCESS.
            let tin = state
                .tin
                .as_deref()
                .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("state missing tin on CREATE path")))?;
            let identity_provider = state.identity_provider.as_deref().ok_or_else(|| {
                GatewayError::Internal(anyhow::anyhow!("state missing identity_provider on CREATE path"))
            })?;
            let external_subject = state.external_subject.as_deref().ok_or_else(|| {
                GatewayError::Internal(anyhow::anyhow!("state missing external_subject on CREATE path"))
            })?;

            let user = controller::get_or_create_user(
                &mut *tx,
                None,
                Some(tin),
                &config.state_encryption_key,
            )
            .await
            .map_err(GatewayError::Internal)?;

            controller::attach_external_user(&mut *tx, &user, identity_provider, external_subject)
                .await
                .map_err(GatewayError::Internal)?;

            mint_success(tx, config, state, &user).await
        }
    }
}

/// The atomic SUCCESS mint sequence (§4.2): login record, `InternalToken`
/// signing, `SessionToken` insert. All within the caller's transaction.
async fn mint_success(
    tx: &mut Transaction<'_, Sqlite>,
    config: &AppConfig,
    state: &AuthState,
    user: &User,
) -> Result<NextStep, GatewayError> {
    let id_token = state
        .decrypt_id_token(&config.state_encryption_key)
        .map_err(GatewayError::Internal)?
        .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("state missing id_token on SUCCESS path")))?;

    controller::register_user_login(&mut *tx, user)
        .await
        .map_err(GatewayError::Internal)?;

    let issued = Utc::now();
    let expires = issued + chrono::Duration::seconds(config.token_expiry_secs);
    let scope = TOKEN_DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();

    let opaque_token = controller::create_token(
        &mut *tx,
        issued,
        expires,
        &user.subject,
        &id_token,
        scope,
        &config.internal_token_secret,
    )
    .await
    .map_err(|_| GatewayError::Signing)?;

    let mut url = url::Url::parse(&state.return_url).map_err(|_| GatewayError::DecodeError)?;
    url.query_pairs_mut().append_pair("success", "1");

    Ok(NextStep::Success {
        next_url: url.to_string(),
        opaque_token,
    })
}

/// Best-effort invalidation of a pending login that never reached SUCCESS
/// (terms declined, or the client abandoned the flow). Calls the IdP
/// back-channel logout when the state carries an id_token; always
/// succeeds locally since no server-side record of the pending flow exists
/// beyond the `OidcAuthState` PKCE row, which expires on its own.
pub async fn invalidate_login(idp: &IdpAdapter, config: &AppConfig, state: &AuthState) {
    if let Ok(Some(id_token)) = state.decrypt_id_token(&config.state_encryption_key) {
        idp.logout(&id_token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_config() -> AppConfig {
        AppConfig {
            listen_addr: "0.0.0.0:8443".into(),
            database_url: "sqlite::memory:".into(),
            service_url: "https://auth.example.com".into(),
            internal_token_secret: "internal-secret".into(),
            state_encryption_key: "state-key".into(),
            oidc_client_id: "client".into(),
            oidc_client_secret: "secret".into(),
            oidc_authority_url: "https://idp.example".into(),
            oidc_login_callback_path: "/oidc/login/callback".into(),
            oidc_language: None,
            token_cookie_name: "idp_token".into(),
            token_cookie_domain: "example.com".into(),
            token_cookie_path: "/".into(),
            secure_cookies: true,
            terms_markdown_dir: "./terms".into(),
            auth_state_max_age_secs: 900,
            token_expiry_secs: 3600,
            debug_endpoints: false,
        }
    }

    #[tokio::test]
    async fn unknown_user_without_terms_prompts_terms() {
        let db = Database::test_db().await;
        let config = test_config();
        let state = AuthState::new("https://fe.example", "https://app.example/r")
            .with_id_token("raw-id-token", &config.state_encryption_key)
            .unwrap();

        let mut tx = db.pool.begin().await.unwrap();
        let result = next_step(&mut tx, &config, OrchestratorPolicy::Standard, &state, None)
            .await
            .unwrap();

        match result {
            NextStep::PromptTerms { next_url, .. } => {
                assert_eq!(next_url, "https://fe.example/terms");
            }
            other => panic!("expected PromptTerms, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn known_user_mints_session() {
        let db = Database::test_db().await;
        let config = test_config();
        let mut conn = db.pool.acquire().await.unwrap();
        let user = controller::get_or_create_user(&mut conn, None, Some("39315041"), &config.state_encryption_key)
            .await
            .unwrap();
        drop(conn);

        let state = AuthState::new("https://fe.example", "https://app.example/r")
            .with_id_token("raw-id-token", &config.state_encryption_key)
            .unwrap();

        let mut tx = db.pool.begin().await.unwrap();
        let result = next_step(
            &mut tx,
            &config,
            OrchestratorPolicy::Standard,
            &state,
            Some(user.clone()),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        match result {
            NextStep::Success { next_url, opaque_token } => {
                assert!(next_url.contains("success=1"));
                let session = controller::get_token(&db.pool, &opaque_token, true)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(session.subject, user.subject);
                assert_eq!(session.id_token, "raw-id-token");
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_on_terms_accept_creates_user_and_links_external_identity() {
        let db = Database::test_db().await;
        let config = test_config();

        let mut state = AuthState::new("https://fe.example", "https://app.example/r")
            .with_id_token("raw-id-token", &config.state_encryption_key)
            .unwrap();
        state.terms_accepted = true;
        state.tin = Some("39315041".into());
        state.identity_provider = Some("mitid".into());
        state.external_subject = Some("S1".into());

        let mut tx = db.pool.begin().await.unwrap();
        let result = next_step(&mut tx, &config, OrchestratorPolicy::CreateOnTermsAccept, &state, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        match result {
            NextStep::Success { .. } => {
                let mut conn = db.pool.acquire().await.unwrap();
                let user = controller::get_user_by_external_subject(&mut conn, "mitid", "S1")
                    .await
                    .unwrap()
                    .expect("user should now be linked");
                assert_eq!(user.tin.as_deref(), Some("39315041"));
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }
}
