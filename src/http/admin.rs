//! Operator HTTP routes for inspecting and resetting client quotas.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use crate::error::GatekeeperError;
use crate::ratelimit::{ClientKey, RateLimitAdmin};

#[derive(Debug, Default, Deserialize)]
pub struct ClassQuery {
    pub class: Option<String>,
}

/// Error body for admin routes.
pub struct AdminError(GatekeeperError);

impl From<GatekeeperError> for AdminError {
    fn from(e: GatekeeperError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            GatekeeperError::InvalidClientKey(_) => (StatusCode::BAD_REQUEST, "INVALID_CLIENT_KEY"),
            GatekeeperError::UnknownPolicy(_) => (StatusCode::NOT_FOUND, "UNKNOWN_POLICY"),
            e => {
                error!(error = %e, "Admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let body = serde_json::json!({
            "success": false,
            "error": { "code": code, "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

/// Routes under `/admin/rate-limits`, already bound to their state.
pub fn admin_routes(admin: RateLimitAdmin) -> Router {
    Router::new()
        .route(
            "/admin/rate-limits/{client_key}",
            get(inspect_client).delete(reset_client),
        )
        .with_state(admin)
}

async fn inspect_client(
    State(admin): State<RateLimitAdmin>,
    Path(client_key): Path<String>,
    Query(query): Query<ClassQuery>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let client: ClientKey = client_key.parse()?;
    let quotas = admin.inspect(&client, query.class.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "clientKey": client.to_string(),
        "quotas": quotas,
    })))
}

async fn reset_client(
    State(admin): State<RateLimitAdmin>,
    Path(client_key): Path<String>,
    Query(query): Query<ClassQuery>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let client: ClientKey = client_key.parse()?;
    let removed = admin.reset(&client, query.class.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "clientKey": client.to_string(),
        "class": query.class,
        "removed": removed,
    })))
}
