pub mod health;
pub mod oidc;
pub mod profile;
pub mod terms;
pub mod token;

use std::sync::Arc;

use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use cookie::time::Duration as CookieDuration;
use cookie::SameSite;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::bearer_auth_middleware;
use crate::auth::orchestrator::NextStep;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::AppState;

/// Build the `Set-Cookie` value carrying a freshly minted session.
pub fn session_cookie(config: &AppConfig, opaque_token: &str) -> Cookie<'static> {
    Cookie::build((config.token_cookie_name.clone(), opaque_token.to_string()))
        .domain(config.token_cookie_domain.clone())
        .path(config.token_cookie_path.clone())
        .http_only(true)
        .secure(config.secure_cookies)
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::seconds(config.token_expiry_secs))
        .build()
}

/// Build the expired `Set-Cookie` value that clears a session cookie on logout.
pub fn expired_session_cookie(config: &AppConfig) -> Cookie<'static> {
    Cookie::build((config.token_cookie_name.clone(), ""))
        .domain(config.token_cookie_domain.clone())
        .path(config.token_cookie_path.clone())
        .http_only(true)
        .secure(config.secure_cookies)
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::seconds(-1))
        .build()
}

/// Turn an orchestrator decision into the `307` redirect the browser-facing
/// `/oidc/login/callback` endpoint returns.
pub fn next_step_redirect_response(config: &AppConfig, next: NextStep) -> Result<Response, GatewayError> {
    match next {
        NextStep::PromptTerms { next_url, state } => {
            let encoded = state.encode(&config.internal_token_secret);
            let mut url = url::Url::parse(&next_url).map_err(|_| GatewayError::DecodeError)?;
            url.query_pairs_mut().append_pair("state", &encoded);
            Ok(Redirect::temporary(url.as_str()).into_response())
        }
        NextStep::Success { next_url, opaque_token } => {
            let jar = CookieJar::new().add(session_cookie(config, &opaque_token));
            Ok((jar, Redirect::temporary(&next_url)).into_response())
        }
    }
}

/// Turn an orchestrator decision into the `{next_url, state?}` JSON body
/// the programmatic `/terms/accept` endpoint returns.
pub fn next_step_json_response(config: &AppConfig, next: NextStep) -> Response {
    match next {
        NextStep::PromptTerms { next_url, state } => {
            let encoded = state.encode(&config.internal_token_secret);
            Json(json!({ "next_url": next_url, "state": encoded })).into_response()
        }
        NextStep::Success { next_url, opaque_token } => {
            let jar = CookieJar::new().add(session_cookie(config, &opaque_token));
            (jar, Json(json!({ "next_url": next_url }))).into_response()
        }
    }
}

/// Assemble the full router from shared application state, mirroring the
/// reference service's one-function `build_router` pattern: unauthenticated
/// routes sit unnested, bearer-guarded routes go through a small
/// `middleware::from_fn_with_state` layer.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/oidc/login", get(oidc::login))
        .route("/oidc/login/callback", get(oidc::callback))
        .route("/oidc/login/invalidate", post(oidc::invalidate))
        .route("/logout", post(token::logout))
        .route("/token/forward-auth", get(token::forward_auth))
        .route("/terms", get(terms::get_terms))
        .route("/terms/accept", post(terms::accept_terms));

    let bearer_routes = Router::new()
        .route("/profile", get(profile::profile))
        .route("/token/inspect", get(token::inspect))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    let mut router = Router::new().merge(public_routes).merge(bearer_routes);

    if state.config.debug_endpoints {
        router = router.route("/token/create-test-token", post(token::create_test_token));
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
