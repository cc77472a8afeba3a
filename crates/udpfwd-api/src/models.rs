use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Outcome of an add or remove request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleResponse {
    /// Whether the rule is now in the requested state
    pub success: bool,
    /// Failure reason, empty on success
    pub error: String,
}

impl RuleResponse {
    pub fn ok(success: bool) -> Self {
        Self {
            success,
            error: String::new(),
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: error.to_string(),
        }
    }
}

/// Existence check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExistsResponse {
    pub exist: bool,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Active relays count
    pub active_relays: usize,
}

/// Error response for rejected requests
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
