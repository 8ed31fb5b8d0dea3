use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Maximum length for error response bodies kept on an error
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Display text used when nothing better is available
pub const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred.";

/// Field name -> list of messages, as returned by the backend's validation layer
pub type ValidationErrors = BTreeMap<String, Vec<String>>;

/// Shared underlying cause. `Arc` keeps `ApiError` cheap to clone, which the
/// refresh path needs to hand one failure to every queued request.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Payload carried by every `ApiError` variant.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ErrorDetail {
    /// HTTP status, `None` when no response was received
    pub status_code: Option<u16>,
    pub message: String,
    pub body: Option<Value>,
    pub validation_errors: Option<ValidationErrors>,
    #[source]
    pub cause: Option<Cause>,
}

/// Fieldless discriminant of `ApiError`, handy for assertions and match arms
/// that don't care about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Server,
    Network,
    Timeout,
    Generic,
}

impl ErrorKind {
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Invalid request. Please check your input.",
            ErrorKind::Unauthorized => "Your session has expired. Please sign in again.",
            ErrorKind::Forbidden => "You do not have permission to perform this action.",
            ErrorKind::NotFound => "The requested resource was not found.",
            ErrorKind::Conflict => "This resource conflicts with an existing one.",
            ErrorKind::Server => "Something went wrong on our end. Please try again later.",
            ErrorKind::Network => "Unable to connect. Please check your internet connection.",
            ErrorKind::Timeout => "The request timed out. Please try again.",
            ErrorKind::Generic => UNEXPECTED_ERROR_MESSAGE,
        }
    }

    fn for_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            500 => ErrorKind::Server,
            _ => ErrorKind::Generic,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error(transparent)]
    BadRequest(ErrorDetail),

    #[error(transparent)]
    Unauthorized(ErrorDetail),

    #[error(transparent)]
    Forbidden(ErrorDetail),

    #[error(transparent)]
    NotFound(ErrorDetail),

    #[error(transparent)]
    Conflict(ErrorDetail),

    #[error(transparent)]
    Server(ErrorDetail),

    #[error(transparent)]
    Network(ErrorDetail),

    #[error(transparent)]
    Timeout(ErrorDetail),

    #[error(transparent)]
    Generic(ErrorDetail),
}

/// Build a typed error from an HTTP status.
///
/// Total over `u16`: statuses without a dedicated variant become `Generic`
/// and keep the raw code. An empty `message` falls back to the variant's
/// default text.
pub fn create_api_error(
    status_code: u16,
    message: impl Into<String>,
    body: Option<Value>,
    cause: Option<Cause>,
) -> ApiError {
    let kind = ErrorKind::for_status(status_code);
    let validation_errors = body.as_ref().and_then(extract_validation_errors);
    ApiError::build(
        kind,
        ErrorDetail {
            status_code: Some(status_code),
            message: non_empty_or_default(message.into(), kind),
            body,
            validation_errors,
            cause,
        },
    )
}

/// Single display string for any error, never panics.
///
/// Walks the source chain so an `ApiError` wrapped in `anyhow` context is
/// still found.
pub fn format_error_message(error: Option<&(dyn StdError + 'static)>) -> String {
    let Some(error) = error else {
        return UNEXPECTED_ERROR_MESSAGE.to_string();
    };

    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(api) = err.downcast_ref::<ApiError>() {
            return api.user_message().to_string();
        }
        current = err.source();
    }

    let message = error.to_string();
    if message.trim().is_empty() {
        UNEXPECTED_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}

impl ApiError {
    fn build(kind: ErrorKind, detail: ErrorDetail) -> Self {
        match kind {
            ErrorKind::BadRequest => ApiError::BadRequest(detail),
            ErrorKind::Unauthorized => ApiError::Unauthorized(detail),
            ErrorKind::Forbidden => ApiError::Forbidden(detail),
            ErrorKind::NotFound => ApiError::NotFound(detail),
            ErrorKind::Conflict => ApiError::Conflict(detail),
            ErrorKind::Server => ApiError::Server(detail),
            ErrorKind::Network => ApiError::Network(detail),
            ErrorKind::Timeout => ApiError::Timeout(detail),
            ErrorKind::Generic => ApiError::Generic(detail),
        }
    }

    fn without_status(kind: ErrorKind, message: String, cause: Option<Cause>) -> Self {
        ApiError::build(
            kind,
            ErrorDetail {
                status_code: None,
                message: non_empty_or_default(message, kind),
                body: None,
                validation_errors: None,
                cause,
            },
        )
    }

    /// The error handed to callers once a refresh was impossible or failed.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        create_api_error(401, message, None, None)
    }

    pub fn network(message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::without_status(ErrorKind::Network, message.into(), cause)
    }

    pub fn timeout(message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::without_status(ErrorKind::Timeout, message.into(), cause)
    }

    /// A payload that could not be encoded or decoded
    pub fn invalid_data(status_code: Option<u16>, cause: serde_json::Error) -> Self {
        let cause: Cause = Arc::new(cause);
        ApiError::Generic(ErrorDetail {
            status_code,
            message: "Invalid response from server".to_string(),
            body: None,
            validation_errors: None,
            cause: Some(cause),
        })
    }

    /// Map an unsuccessful response, pulling `message` and `errors` out of a
    /// JSON body when the backend sent one.
    pub fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let body = match parsed {
            Some(value) => Some(value),
            None if body.is_empty() => None,
            None => Some(Value::String(truncate_body(body))),
        };
        create_api_error(status.as_u16(), message, body, None)
    }

    /// Map a transport failure where no usable response arrived.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let text = err.to_string();
        let is_timeout = err.is_timeout() || text.to_lowercase().contains("timeout");
        let cause: Cause = Arc::new(err);
        if is_timeout {
            ApiError::timeout(String::new(), Some(cause))
        } else {
            ApiError::network(String::new(), Some(cause))
        }
    }

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            ApiError::BadRequest(d)
            | ApiError::Unauthorized(d)
            | ApiError::Forbidden(d)
            | ApiError::NotFound(d)
            | ApiError::Conflict(d)
            | ApiError::Server(d)
            | ApiError::Network(d)
            | ApiError::Timeout(d)
            | ApiError::Generic(d) => d,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) => ErrorKind::BadRequest,
            ApiError::Unauthorized(_) => ErrorKind::Unauthorized,
            ApiError::Forbidden(_) => ErrorKind::Forbidden,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::Server(_) => ErrorKind::Server,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Timeout(_) => ErrorKind::Timeout,
            ApiError::Generic(_) => ErrorKind::Generic,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.detail().status_code
    }

    pub fn user_message(&self) -> &str {
        &self.detail().message
    }

    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        self.detail().validation_errors.as_ref()
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// Transient failures the query cache may retry. Client errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Server(_) | ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Generic(d) => matches!(d.status_code, Some(500..=599)),
            _ => false,
        }
    }
}

fn non_empty_or_default(message: String, kind: ErrorKind) -> String {
    if message.trim().is_empty() {
        kind.default_message().to_string()
    } else {
        message
    }
}

/// Accepts `{"errors": {"field": ["msg", ...]}}` or `{"errors": {"field": "msg"}}`
fn extract_validation_errors(body: &Value) -> Option<ValidationErrors> {
    let errors = body.get("errors")?.as_object()?;
    let mut out = ValidationErrors::new();
    for (field, value) in errors {
        let messages: Vec<String> = match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => continue,
        };
        if !messages.is_empty() {
            out.insert(field.clone(), messages);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Truncate a response body to avoid keeping excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}
