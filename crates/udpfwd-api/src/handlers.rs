use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use udpfwd_proto::RelayRule;

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Turn the request body into a validated rule
fn parse_rule(payload: Result<Json<RelayRule>, JsonRejection>) -> Result<RelayRule, ApiError> {
    let rule = match payload {
        Ok(Json(rule)) => rule,
        Err(rejection) => {
            debug!("Rejected request body: {}", rejection);
            return Err(bad_request(rejection.body_text()));
        }
    };

    rule.validate().map_err(|e| bad_request(e.to_string()))?;
    Ok(rule)
}

fn bad_request(detail: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "Invalid request".to_string(),
            code: Some(detail),
        }),
    )
}

/// Register a relay rule
#[utoipa::path(
    post,
    path = "/v1/proxy/add",
    request_body = RelayRule,
    responses(
        (status = 200, description = "Add outcome", body = RuleResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn add_rule(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RelayRule>, JsonRejection>,
) -> Result<Json<RuleResponse>, ApiError> {
    let rule = parse_rule(payload)?;
    info!("Adding relay {}", rule);

    match state.registry.add(rule).await {
        Ok(success) => Ok(Json(RuleResponse::ok(success))),
        Err(e) => {
            warn!("Failed to add relay: {}", e);
            Ok(Json(RuleResponse::failed(e)))
        }
    }
}

/// Remove a relay rule
#[utoipa::path(
    post,
    path = "/v1/proxy/remove",
    request_body = RelayRule,
    responses(
        (status = 200, description = "Remove outcome", body = RuleResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn remove_rule(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RelayRule>, JsonRejection>,
) -> Result<Json<RuleResponse>, ApiError> {
    let rule = parse_rule(payload)?;
    info!("Removing relay {}", rule);

    match state.registry.remove(&rule).await {
        Ok(success) => Ok(Json(RuleResponse::ok(success))),
        Err(e) => {
            warn!("Failed to remove relay: {}", e);
            Ok(Json(RuleResponse::failed(e)))
        }
    }
}

/// Check whether a relay rule is active
#[utoipa::path(
    post,
    path = "/v1/proxy/exist",
    request_body = RelayRule,
    responses(
        (status = 200, description = "Existence of the rule", body = ExistsResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "relays"
)]
pub async fn rule_exists(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RelayRule>, JsonRejection>,
) -> Result<Json<ExistsResponse>, ApiError> {
    let rule = parse_rule(payload)?;
    let exist = state.registry.exists(&rule).await;
    Ok(Json(ExistsResponse { exist }))
}

/// List active relay identities (`<port>:<service>:<targetPort>`)
#[utoipa::path(
    get,
    path = "/v1/proxy/list",
    responses(
        (status = 200, description = "Active rule identities", body = Vec<String>)
    ),
    tag = "relays"
)]
pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.registry.list().await)
}

/// Health check
#[utoipa::path(
    get,
    path = "/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_relays: state.registry.len().await,
    })
}
