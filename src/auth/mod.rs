pub mod controller;
pub mod idp;
pub mod internal_token;
pub mod orchestrator;
pub mod state_token;
pub mod terms;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::internal_token::InternalToken;
use crate::AppState;

/// `InternalToken` extracted from a valid `Authorization: Bearer: <token>`
/// header, attached to the request by [`bearer_auth_middleware`] and
/// consumed by handlers via `Extension<InternalTokenCtx>`.
#[derive(Debug, Clone)]
pub struct InternalTokenCtx(pub InternalToken);

/// Middleware guarding `/profile` and `/token/inspect`: requires a valid,
/// unexpired `InternalToken` signed by this gateway.
pub async fn bearer_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(bearer_token) = extract_bearer_token(req.headers()) else {
        return Err(unauthorized());
    };

    let token = InternalToken::decode(bearer_token, &state.config.internal_token_secret)
        .map_err(|_| unauthorized())?;

    if token.expires < chrono::Utc::now() {
        return Err(unauthorized());
    }

    req.extensions_mut().insert(InternalTokenCtx(token));
    Ok(next.run(req).await)
}

/// Pull the bearer token out of an `Authorization` header, accepting both
/// the `Bearer: <token>` form this gateway itself mints (see
/// `forward_auth`) and the standard `Bearer <token>` form.
pub fn extract_bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer: ").or_else(|| h.strip_prefix("Bearer ")))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn extract_bearer_token_accepts_colon_form() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer: abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn extract_bearer_token_accepts_standard_form() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn extract_bearer_token_returns_none_when_absent() {
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }
}
