//! `GET /profile` — profile fields sourced from the caller's own
//! `InternalToken`. `name`/`company` are placeholders, matching the
//! original's hard-coded behavior; wiring those to a real identity
//! enrichment lookup is out of scope here (see DESIGN.md).

use axum::Extension;
use axum::Json;
use serde_json::json;

use crate::auth::InternalTokenCtx;

pub async fn profile(Extension(ctx): Extension<InternalTokenCtx>) -> Json<serde_json::Value> {
    let token = ctx.0;
    Json(json!({
        "success": true,
        "profile": {
            "id": token.subject,
            "name": "Unknown",
            "scope": token.scope,
            "company": serde_json::Value::Null,
        }
    }))
}
