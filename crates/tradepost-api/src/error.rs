use serde::Deserialize;
use thiserror::Error;

/// Everything the backend can throw back at us
///
/// Auth failures, missing rows, constraint violations and network trouble
/// all end up here. The backend's message and code are kept as-is.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    /// Backend error code (e.g. `23505` for a unique violation), if any
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            BackendError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Build an error from a non-2xx response body
    ///
    /// The data API answers with `{code, message, details, hint}` while the
    /// auth API uses `{error, error_description}` or `{msg, error_code}`.
    /// Anything else keeps the raw body as the message.
    pub fn from_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => {
                let message = parsed
                    .message
                    .or(parsed.msg)
                    .or(parsed.error_description)
                    .or_else(|| parsed.error.clone())
                    .unwrap_or_else(|| body.to_string());
                let code = parsed
                    .code
                    .map(|c| match c {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .or(parsed.error_code)
                    .or(parsed.error);

                BackendError::Api {
                    status,
                    code,
                    message,
                    details: parsed.details,
                    hint: parsed.hint,
                }
            }
            Err(_) => BackendError::Api {
                status,
                code: None,
                message: body.to_string(),
                details: None,
                hint: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<serde_json::Value>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_data_api_error() {
        let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint","details":"Key (email)=(a@b.c) already exists.","hint":null}"#;
        let err = BackendError::from_body(409, body);

        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.status(), Some(409));
        match err {
            BackendError::Api { message, details, .. } => {
                assert_eq!(message, "duplicate key value violates unique constraint");
                assert_eq!(details.as_deref(), Some("Key (email)=(a@b.c) already exists."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parses_auth_error() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        let err = BackendError::from_body(400, body);

        assert_eq!(err.code(), Some("invalid_grant"));
        assert_eq!(err.to_string(), "Backend returned 400: Invalid login credentials");
    }

    #[test]
    fn test_numeric_code_is_kept() {
        let err = BackendError::from_body(422, r#"{"code":422,"msg":"Password should be at least 6 characters"}"#);
        assert_eq!(err.code(), Some("422"));
    }

    #[test]
    fn test_non_json_body_becomes_message() {
        let err = BackendError::from_body(502, "Bad Gateway");
        assert_eq!(err.to_string(), "Backend returned 502: Bad Gateway");
        assert_eq!(err.code(), None);
    }
}
