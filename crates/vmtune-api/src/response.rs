//! Caller-visible outcomes

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Result class of an endpoint call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    /// Read succeeded
    Ok,
    /// Change accepted; completion is observed later
    Accepted,
    /// Schema or value validation failed
    BadRequest,
    /// Policy or quota refused the caller
    Forbidden,
    /// Unknown instance or unresolved location
    NotFound,
    /// Lifecycle state or agent rejection
    Conflict,
    /// Unexpected failure below the boundary
    InternalError,
    /// Backend cannot perform the change at all
    NotImplemented,
}

impl ApiStatus {
    /// HTTP status code
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ApiStatus::Ok => 200,
            ApiStatus::Accepted => 202,
            ApiStatus::BadRequest => 400,
            ApiStatus::Forbidden => 403,
            ApiStatus::NotFound => 404,
            ApiStatus::Conflict => 409,
            ApiStatus::InternalError => 500,
            ApiStatus::NotImplemented => 501,
        }
    }

    /// Fault key wrapping the error body
    #[inline]
    #[must_use]
    pub fn fault_key(&self) -> Option<&'static str> {
        match self {
            ApiStatus::Ok | ApiStatus::Accepted => None,
            ApiStatus::BadRequest => Some("badRequest"),
            ApiStatus::Forbidden => Some("forbidden"),
            ApiStatus::NotFound => Some("itemNotFound"),
            ApiStatus::Conflict => Some("conflictingRequest"),
            ApiStatus::InternalError => Some("computeFault"),
            ApiStatus::NotImplemented => Some("notImplemented"),
        }
    }

    /// Whether the call succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ApiStatus::Ok | ApiStatus::Accepted)
    }
}

/// Status plus JSON body; `Value::Null` is an empty body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Outcome class
    pub status: ApiStatus,
    /// Response body
    pub body: Value,
}

impl ApiResponse {
    /// 200 with a body
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: ApiStatus::Ok,
            body,
        }
    }

    /// 202 with an empty body
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            status: ApiStatus::Accepted,
            body: Value::Null,
        }
    }

    /// Error response `{ "<faultKey>": { "code": N, "message": "..." } }`
    #[must_use]
    pub fn fault(status: ApiStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        let body = match status.fault_key() {
            Some(key) => json!({ key: { "code": status.code(), "message": message } }),
            None => Value::Null,
        };
        Self { status, body }
    }

    /// HTTP status code
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        self.status.code()
    }

    /// Fault message, if this is an error response
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        let key = self.status.fault_key()?;
        self.body.get(key)?.get("message")?.as_str()
    }
}
