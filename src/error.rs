//! Live-query error types with protocol code and HTTP status mapping.
//!
//! [`LiveQueryError`] is the central error type. Over the WebSocket each
//! variant becomes an `error` push carrying a numeric code and a
//! `reconnect` hint; over REST it maps to an HTTP status and a structured
//! JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::{ClientId, RequestId};

/// Structured JSON error response body.
///
/// All REST error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 4,
///     "message": "key in request is not valid",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (same table as the WebSocket protocol).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error raised by an extension hook.
///
/// Hooks may pick their own protocol code; when they don't, the error is
/// reported with [`SCRIPT_FAILED`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    /// Optional protocol code chosen by the hook.
    pub code: Option<u32>,
    /// Message forwarded to the client.
    pub message: String,
}

impl HookError {
    /// Creates a hook error with the default code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Creates a hook error with an explicit protocol code.
    #[must_use]
    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Protocol code used for hook failures that don't carry their own.
pub const SCRIPT_FAILED: u32 = 141;

/// Protocol code for an invalid or expired session token.
pub const INVALID_SESSION_TOKEN: u32 = 209;

/// Server-side error enum.
///
/// # Protocol Codes
///
/// | Code | Category                              | HTTP Status        |
/// |------|---------------------------------------|--------------------|
/// | 1    | Malformed request / schema violation  | 400 Bad Request    |
/// | 2    | Unknown client or subscription        | 404 Not Found      |
/// | 3    | Unknown operation                     | 400 Bad Request    |
/// | 4    | Invalid keys                          | 403 Forbidden      |
/// | 141  | Extension hook failure                | 422 Unprocessable  |
/// | 209  | Invalid session token                 | 403 Forbidden      |
/// | 3000 | Server                                | 500 Internal Error |
#[derive(Debug, thiserror::Error)]
pub enum LiveQueryError {
    /// The message was not valid JSON or violated the op schema.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The `op` field named an operation the server doesn't know.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The socket sent a request that needs a connected client first.
    #[error("can not find this client, make sure you connect to server before {0}")]
    NotConnected(&'static str),

    /// The socket already completed `connect`.
    #[error("client {0} is already connected")]
    AlreadyConnected(ClientId),

    /// The client id is not present in the registry.
    #[error("cannot find client with clientId {0}")]
    ClientNotFound(ClientId),

    /// The client has no subscription with this request id.
    #[error(
        "cannot find subscription with clientId {client_id} subscriptionId {request_id}, make sure you subscribe to live query server before unsubscribing"
    )]
    SubscriptionNotFound {
        /// Owning client.
        client_id: ClientId,
        /// Missing request id.
        request_id: RequestId,
    },

    /// The client already uses this request id.
    #[error("requestId {0} is already in use by this client")]
    DuplicateRequestId(RequestId),

    /// None of the configured key-pairs matched the connect request.
    #[error("key in request is not valid")]
    InvalidKeys,

    /// A session token could not be resolved to a user.
    #[error("invalid session token")]
    InvalidSessionToken,

    /// Request lacks the credentials needed for a REST endpoint.
    #[error("unauthorized")]
    Unauthorized,

    /// An extension hook rejected the operation.
    #[error("hook failed: {0}")]
    Hook(#[from] HookError),

    /// The identity store failed (database error, decode failure).
    #[error("identity store error: {0}")]
    IdentityStore(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LiveQueryError {
    /// Returns the numeric protocol code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) | Self::AlreadyConnected(_) | Self::DuplicateRequestId(_) => 1,
            Self::NotConnected(_) | Self::ClientNotFound(_) | Self::SubscriptionNotFound { .. } => {
                2
            }
            Self::UnknownOperation(_) => 3,
            Self::InvalidKeys | Self::Unauthorized => 4,
            Self::Hook(HookError {
                code: Some(code), ..
            }) => *code,
            Self::Hook(_) => SCRIPT_FAILED,
            Self::InvalidSessionToken => INVALID_SESSION_TOKEN,
            Self::IdentityStore(_) | Self::Internal(_) => 3000,
        }
    }

    /// Whether the client should reconnect after receiving this error.
    ///
    /// Protocol violations ask the client to reconnect; errors scoped to a
    /// single request (hooks, sessions) don't.
    #[must_use]
    pub const fn reconnect(&self) -> bool {
        !matches!(
            self,
            Self::Hook(_) | Self::InvalidSessionToken | Self::DuplicateRequestId(_)
        )
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::UnknownOperation(_)
            | Self::AlreadyConnected(_)
            | Self::DuplicateRequestId(_) => StatusCode::BAD_REQUEST,
            Self::NotConnected(_) | Self::ClientNotFound(_) | Self::SubscriptionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidKeys | Self::InvalidSessionToken | Self::Unauthorized => {
                StatusCode::FORBIDDEN
            }
            Self::Hook(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::IdentityStore(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LiveQueryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_error_defaults_to_script_failed() {
        let err = LiveQueryError::from(HookError::new("nope"));
        assert_eq!(err.error_code(), SCRIPT_FAILED);
        assert!(!err.reconnect());
    }

    #[test]
    fn hook_error_keeps_custom_code() {
        let err = LiveQueryError::from(HookError::with_code(101, "missing"));
        assert_eq!(err.error_code(), 101);
    }

    #[test]
    fn protocol_errors_request_reconnect() {
        assert!(LiveQueryError::InvalidKeys.reconnect());
        assert!(LiveQueryError::UnknownOperation("ping".to_string()).reconnect());
        assert_eq!(LiveQueryError::InvalidKeys.error_code(), 4);
        assert_eq!(
            LiveQueryError::UnknownOperation("ping".to_string()).error_code(),
            3
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            LiveQueryError::Unauthorized.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            LiveQueryError::NotConnected("subscribing").status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
