/// Unified error taxonomy for the PDS
///
/// A closed set of error kinds maps onto HTTP statuses at the boundary.
/// Semantic sub-codes (swap failures, takedowns, missing blobs) are carried
/// as their own variants so callers can match on them and clients see the
/// code verbatim in the `error` field.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the PDS
#[derive(Error, Debug)]
pub enum PdsError {
    /// Malformed input or semantic rejection
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials; message is intentionally opaque
    #[error("{0}")]
    AuthRequired(String),

    /// Authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown NSID or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Body exceeds the configured limit
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Wrong request encoding
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Quota exhausted
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Stub endpoint
    #[error("Method not implemented")]
    MethodNotImplemented,

    /// Dependent service error
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Backpressure or shutdown
    #[error("Not enough resources: {0}")]
    NotEnoughResources(String),

    /// Dependent service timed out
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Repository does not exist for the given actor
    #[error("Repo not found for {0}")]
    RepoNotFound(String),

    /// Record does not exist at the given URI
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Repository exists but has been taken down
    #[error("Repo has been taken down")]
    RepoTakendown,

    /// Repository exists but is deactivated
    #[error("Repo is deactivated")]
    RepoDeactivated,

    /// Account has been taken down
    #[error("Account has been taken down")]
    AccountTakedown,

    /// Invite code missing, disabled, or exhausted
    #[error("Invite code not available")]
    InvalidInviteCode,

    /// `swapCommit` assertion did not match the current repo root
    #[error("Commit was at a different location than expected")]
    BadCommitSwap,

    /// Per-record swap assertion did not match the current record CID
    #[error("Record was at a different location than expected")]
    BadRecordSwap,

    /// Blob missing from the object store
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// Handle could not be resolved to a DID
    #[error("Handle resolution failed: {0}")]
    HandleResolutionFailed(String),

    /// DID document could not be located
    #[error("DID not found: {0}")]
    DidNotFound(String),

    /// Resolved DID document does not declare the handle it was found by
    #[error("Handle {handle} does not match document for {did}")]
    HandleMismatch { handle: String, did: String },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bug or infrastructure failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PdsError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        PdsError::InvalidRequest(msg.into())
    }

    /// Opaque credential failure; never reveals whether the identifier exists
    pub fn auth_required() -> Self {
        PdsError::AuthRequired("Invalid identifier or password".to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        PdsError::Internal(err.to_string())
    }

    /// Wire code for the `error` field of the response body
    pub fn error_code(&self) -> &'static str {
        match self {
            PdsError::InvalidRequest(_) => "InvalidRequest",
            PdsError::AuthRequired(_) => "AuthRequired",
            PdsError::Forbidden(_) => "Forbidden",
            PdsError::NotFound(_) => "XRPCNotSupported",
            PdsError::PayloadTooLarge => "PayloadTooLarge",
            PdsError::UnsupportedMediaType(_) => "UnsupportedMediaType",
            PdsError::RateLimitExceeded => "RateLimitExceeded",
            PdsError::MethodNotImplemented => "MethodNotImplemented",
            PdsError::UpstreamFailure(_) => "UpstreamFailure",
            PdsError::NotEnoughResources(_) => "NotEnoughResources",
            PdsError::UpstreamTimeout(_) => "UpstreamTimeout",
            PdsError::RepoNotFound(_) => "RepoNotFound",
            PdsError::RecordNotFound(_) => "RecordNotFound",
            PdsError::RepoTakendown => "RepoTakendown",
            PdsError::RepoDeactivated => "RepoDeactivated",
            PdsError::AccountTakedown => "AccountTakedown",
            PdsError::InvalidInviteCode => "InvalidInviteCode",
            PdsError::BadCommitSwap => "BadCommitSwap",
            PdsError::BadRecordSwap => "BadRecordSwap",
            PdsError::BlobNotFound(_) => "BlobNotFound",
            PdsError::HandleResolutionFailed(_) => "HandleResolutionFailed",
            PdsError::DidNotFound(_) => "DidNotFound",
            PdsError::HandleMismatch { .. } => "HandleMismatch",
            PdsError::Database(_) | PdsError::Io(_) | PdsError::Internal(_) => {
                "InternalServerError"
            }
        }
    }

    /// HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            PdsError::InvalidRequest(_)
            | PdsError::RepoNotFound(_)
            | PdsError::RecordNotFound(_)
            | PdsError::RepoTakendown
            | PdsError::RepoDeactivated
            | PdsError::AccountTakedown
            | PdsError::InvalidInviteCode
            | PdsError::BadCommitSwap
            | PdsError::BadRecordSwap
            | PdsError::BlobNotFound(_)
            | PdsError::HandleResolutionFailed(_)
            | PdsError::DidNotFound(_)
            | PdsError::HandleMismatch { .. } => StatusCode::BAD_REQUEST,
            PdsError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            PdsError::Forbidden(_) => StatusCode::FORBIDDEN,
            PdsError::NotFound(_) => StatusCode::NOT_FOUND,
            PdsError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            PdsError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PdsError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            PdsError::MethodNotImplemented => StatusCode::NOT_IMPLEMENTED,
            PdsError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            PdsError::NotEnoughResources(_) => StatusCode::SERVICE_UNAVAILABLE,
            PdsError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PdsError::Database(_) | PdsError::Io(_) | PdsError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// XRPC error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct XrpcErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for PdsError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Don't leak internals
            tracing::error!(error = %self, "internal server error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(XrpcErrorResponse {
            error: self.error_code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for PDS operations
pub type PdsResult<T> = Result<T, PdsError>;
