use std::fmt;

use serde_json::Value;

/// Status code reported for failures that never produced an HTTP response.
pub const NO_STATUS: i32 = -1;

/// Key used by hosts to pick an error message. One per `ApiError` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidCredential,
    Http,
    Listing,
    Network,
    Decode,
    Storage,
    Internal,
}

/// One entry of the `json.errors` array Reddit returns with a 200 status,
/// e.g. `["RATELIMIT", "you are doing that too much", "ratelimit"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldError {
    pub code: String,
    pub message: String,
    pub field: String,
}

impl FieldError {
    pub fn from_values(values: &[Value]) -> Self {
        let text = |idx: usize| {
            values
                .get(idx)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            code: text(0),
            message: text(1),
            field: text(2),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message.is_empty(), self.field.is_empty()) {
            (true, _) => write!(f, "{}", self.code),
            (false, true) => write!(f, "{}: {}", self.code, self.message),
            (false, false) => write!(f, "{}: {} ({})", self.code, self.message, self.field),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("a logged-in account is required")]
    InvalidCredential,
    #[error("reddit: http {code}: {body}")]
    Http { code: u16, body: String },
    #[error("reddit: network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("reddit: {}", join_field_errors(.0))]
    Listing(Vec<FieldError>),
    #[error("reddit: decode: {0}")]
    Decode(String),
    #[error("credentials: {0}")]
    Storage(String),
    /// The operation itself failed without an API answer, e.g. it panicked
    /// on a worker thread.
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidCredential => ErrorKind::InvalidCredential,
            ApiError::Http { .. } => ErrorKind::Http,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Listing(_) => ErrorKind::Listing,
            ApiError::Decode(_) => ErrorKind::Decode,
            ApiError::Storage(_) => ErrorKind::Storage,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status of the failure, or [`NO_STATUS`] when there was none.
    pub fn code(&self) -> i32 {
        match self {
            ApiError::Http { code, .. } => i32::from(*code),
            _ => NO_STATUS,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { code: 401, .. })
    }

    /// Stickying an already-stickied item answers 409; callers treat it as done.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Http { code: 409, .. })
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::Listing(errors) => errors,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for ApiError {
    fn from(err: url::ParseError) -> Self {
        ApiError::Decode(format!("url: {err}"))
    }
}

/// Parses a `json.errors` array into field errors; unknown shapes are skipped.
pub fn field_errors_from(errors: &[Value]) -> Vec<FieldError> {
    errors
        .iter()
        .filter_map(Value::as_array)
        .map(|entry| FieldError::from_values(entry))
        .collect()
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
