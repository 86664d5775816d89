//! Domain errors and their JSON rendering for the control plane

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors produced by the supervisor, the registry and the control plane
#[derive(Debug, Error)]
pub enum HotifyError {
    /// Durable configuration could not be read or written
    #[error("configuration error: {0}")]
    Config(String),

    /// `git clone` or `git pull` failed
    #[error("git {action} failed: {output}")]
    Git { action: &'static str, output: String },

    /// The build command exited with a non-zero status
    #[error("build failed ({status}): {output}")]
    Build { status: String, output: String },

    /// The exec command could not be launched
    #[error("failed to launch '{command}': {source}")]
    Process {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The reverse proxy rejected a route change
    #[error("proxy route error: {0}")]
    Proxy(String),

    /// Request signature did not match
    #[error("invalid request signature")]
    Signature,

    /// Unknown service name
    #[error("service not found: {0}")]
    NotFound(String),

    /// Duplicate service name on create
    #[error("service already exists: {0}")]
    Conflict(String),

    /// Malformed request body or invalid service definition
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service was deleted while the operation was waiting
    #[error("service has been removed: {0}")]
    Removed(String),

    /// The daemon is stopping and no longer launches processes
    #[error("daemon is shutting down: {0}")]
    ShuttingDown(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = HotifyError> = std::result::Result<T, E>;

/// Error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSignature,
    NotFound,
    Conflict,
    BadRequest,
    MethodNotAllowed,
    GitFailed,
    BuildFailed,
    LaunchFailed,
    ProxyFailed,
    ConfigFailed,
    ShuttingDown,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidSignature => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::GitFailed
            | ErrorCode::BuildFailed
            | ErrorCode::LaunchFailed
            | ErrorCode::ProxyFailed
            | ErrorCode::ConfigFailed
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Hotify-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::GitFailed => "GIT_FAILED",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ErrorCode::ProxyFailed => "PROXY_FAILED",
            ErrorCode::ConfigFailed => "CONFIG_FAILED",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl HotifyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HotifyError::Config(_) => ErrorCode::ConfigFailed,
            HotifyError::Git { .. } => ErrorCode::GitFailed,
            HotifyError::Build { .. } => ErrorCode::BuildFailed,
            HotifyError::Process { .. } => ErrorCode::LaunchFailed,
            HotifyError::Proxy(_) => ErrorCode::ProxyFailed,
            HotifyError::Signature => ErrorCode::InvalidSignature,
            HotifyError::NotFound(_) | HotifyError::Removed(_) => ErrorCode::NotFound,
            HotifyError::Conflict(_) => ErrorCode::Conflict,
            HotifyError::InvalidRequest(_) => ErrorCode::BadRequest,
            HotifyError::ShuttingDown(_) => ErrorCode::ShuttingDown,
            HotifyError::Io(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Hotify-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Hotify-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&HotifyError> for Response<Full<Bytes>> {
    fn from(err: &HotifyError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_status_codes() {
        assert_eq!(HotifyError::Signature.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            HotifyError::NotFound("app".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HotifyError::Conflict("app".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HotifyError::InvalidRequest("bad json".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HotifyError::ShuttingDown("app".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HotifyError::Build {
                status: "exit status: 2".into(),
                output: "make: *** no rule".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            HotifyError::Git {
                action: "clone",
                output: "fatal".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_build_error_carries_output() {
        let err = HotifyError::Build {
            status: "exit status: 1".into(),
            output: "cc: error: missing.c".into(),
        };
        assert!(err.to_string().contains("cc: error: missing.c"));
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ErrorCode::NotFound, "service not found: app");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"service not found: app\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ErrorCode::InvalidSignature, "invalid request signature");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Hotify-Error").unwrap(),
            "INVALID_SIGNATURE"
        );
    }
}
