//! `/token/forward-auth` (C5), `/token/inspect`, `/token/create-test-token`,
//! and `/logout`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;

use crate::auth::internal_token::InternalToken;
use crate::auth::{controller, extract_bearer_token, InternalTokenCtx};
use crate::routes::expired_session_cookie;
use crate::AppState;

/// `GET /token/forward-auth` — translate the session cookie into the
/// `Authorization: Bearer: <internal_token>` header an edge proxy forwards
/// downstream. Side-effect-free: a single indexed lookup, no IdP contact.
pub async fn forward_auth(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let Some(cookie) = jar.get(&state.config.token_cookie_name) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match controller::get_token(&state.db.pool, cookie.value(), true).await {
        Ok(Some(session)) => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer: {}", session.internal_token))
            {
                response
                    .headers_mut()
                    .insert(axum::http::header::AUTHORIZATION, value);
            }
            response
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// `POST /logout` — delete the session identified by either the session
/// cookie or a bearer `InternalToken`, best-effort invalidate the IdP-side
/// session, and clear the cookie. Requires at least one valid credential;
/// an unknown cookie and no bearer token perform no IdP call and delete no
/// rows.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    req: axum::extract::Request,
) -> Response {
    let cookie_token = jar.get(&state.config.token_cookie_name).map(|c| c.value().to_string());
    let bearer_subject = extract_bearer_token(req.headers())
        .and_then(|raw| InternalToken::decode(raw, &state.config.internal_token_secret).ok())
        .filter(|token| token.expires >= chrono::Utc::now())
        .map(|token| token.subject);

    if cookie_token.is_none() && bearer_subject.is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Ok(mut conn) = state.db.pool.acquire().await {
        let session = if let Some(opaque_token) = &cookie_token {
            controller::delete_token(&mut *conn, opaque_token).await.ok().flatten()
        } else {
            None
        };

        let session = match session {
            Some(session) => Some(session),
            None => {
                if let Some(subject) = &bearer_subject {
                    controller::delete_session_by_subject(&mut *conn, subject)
                        .await
                        .ok()
                        .flatten()
                } else {
                    None
                }
            }
        };

        if let Some(session) = session {
            state.idp.logout(&session.id_token).await;
        }
    }

    let jar = jar.add(expired_session_cookie(&state.config));
    (jar, Json(json!({ "success": true }))).into_response()
}

/// `GET /token/inspect` — decode the caller's own bearer token back to its
/// claims. Guarded by `bearer_auth_middleware`.
pub async fn inspect(Extension(ctx): Extension<InternalTokenCtx>) -> Json<serde_json::Value> {
    Json(json!({ "token": ctx.0 }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTestTokenBody {
    pub token: InternalToken,
}

/// `POST /token/create-test-token` — sign an arbitrary caller-supplied
/// `InternalToken`. Only mounted when `debug_endpoints` is enabled.
pub async fn create_test_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTestTokenBody>,
) -> Json<serde_json::Value> {
    let encoded = body.token.encode(&state.config.internal_token_secret);
    Json(json!({ "token": encoded }))
}
