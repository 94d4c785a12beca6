//! Error taxonomy and JSON error responses for the API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

use crate::model::{EntityId, EntityKind};

/// Invalid or conflicting entity state found while rendering.
///
/// Always recoverable: the previously active configuration stays in force.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("duplicate domain: {0}")]
    DuplicateDomain(String),

    #[error("empty upstream: {0}")]
    EmptyUpstream(String),

    #[error("proxy host {host_id} has ssl enabled but no certificate")]
    MissingCertificate { host_id: EntityId },

    #[error("proxy host {host_id} references unknown certificate {certificate_id}")]
    CertificateNotFound {
        host_id: EntityId,
        certificate_id: EntityId,
    },

    #[error("certificate {certificate_id} used by proxy host {host_id} is {status}, not active")]
    CertificateNotActive {
        host_id: EntityId,
        certificate_id: EntityId,
        status: String,
    },

    #[error("certificate {certificate_id} does not cover {domain} (proxy host {host_id})")]
    CertificateCoverage {
        host_id: EntityId,
        certificate_id: EntityId,
        domain: String,
    },

    #[error("failed to serialize render input: {0}")]
    Canonicalize(String),
}

/// Failures surfaced by the entity store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: EntityKind, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn invalid(kind: EntityKind, reason: impl Into<String>) -> Self {
        StoreError::Invalid {
            kind,
            reason: reason.into(),
        }
    }
}

/// A bounded subprocess run that did not produce an exit status
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("invalid command: {0}")]
    Template(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// nginx rejected the candidate. Carries the raw diagnostic text.
    #[error("syntax check failed: {diagnostics}")]
    Rejected { diagnostics: String },

    #[error("failed to stage candidate configuration: {0}")]
    Staging(#[source] std::io::Error),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("reload command failed: {detail}")]
    ReloadFailed { detail: String },

    #[error("nginx did not acknowledge reload within {timeout:?}: {detail}")]
    NotAcknowledged { timeout: Duration, detail: String },

    #[error("status unavailable: {0}")]
    StatusUnavailable(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Error codes returned by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Malformed body, bad id or an entity that fails validation
    InvalidRequest,
    /// Unknown route or entity
    NotFound,
    /// The write would violate a uniqueness or reference rule
    Conflict,
    /// The current entity set cannot be rendered
    RenderError,
    /// nginx rejected the rendered configuration
    SyntaxError,
    /// Reload failed or was not acknowledged
    ReloadError,
    /// The status endpoint is unreachable or unparsable
    StatusUnavailable,
    /// Persistence failure
    StoreError,
    /// Anything else
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::Conflict => StatusCode::CONFLICT,
            ApiErrorCode::RenderError => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::SyntaxError => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::ReloadError => StatusCode::BAD_GATEWAY,
            ApiErrorCode::StatusUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidRequest => "INVALID_REQUEST",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::Conflict => "CONFLICT",
            ApiErrorCode::RenderError => "RENDER_ERROR",
            ApiErrorCode::SyntaxError => "SYNTAX_ERROR",
            ApiErrorCode::ReloadError => "RELOAD_ERROR",
            ApiErrorCode::StatusUnavailable => "STATUS_UNAVAILABLE",
            ApiErrorCode::StoreError => "STORE_ERROR",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&StoreError> for ApiErrorCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiErrorCode::NotFound,
            StoreError::Invalid { .. } => ApiErrorCode::InvalidRequest,
            StoreError::Conflict(_) => ApiErrorCode::Conflict,
            StoreError::Database(_) | StoreError::Corrupt(_) => ApiErrorCode::StoreError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ApiErrorCode::InvalidRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiErrorCode::SyntaxError.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiErrorCode::ReloadError.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiErrorCode::StatusUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_render_error_messages() {
        assert_eq!(
            RenderError::DuplicateDomain("a.example.com".into()).to_string(),
            "duplicate domain: a.example.com"
        );
        assert_eq!(
            RenderError::EmptyUpstream("backend".into()).to_string(),
            "empty upstream: backend"
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::NotFound, "proxy_host 7 not found");
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["message"], "proxy_host 7 not found");
        assert_eq!(json["status"], 404);
    }

    #[test]
    fn test_store_error_codes() {
        let err = StoreError::Conflict("domain a.example.com already in use".into());
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::Conflict);

        let err = StoreError::NotFound {
            kind: EntityKind::Upstream,
            id: 3,
        };
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::NotFound);
        assert_eq!(err.to_string(), "upstream 3 not found");
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ApiErrorCode::RenderError, "empty upstream: backend");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
