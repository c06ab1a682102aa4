use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::auth::jwt::TokenError;
use crate::auth::repo_types::StoreError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Why a local login was refused. Both kinds produce the same response body;
/// the distinction only reaches the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    UnknownEmail,
    WrongPassword,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("email already registered")]
    DuplicateEmail,

    #[error("invalid credentials ({0:?})")]
    InvalidCredentials(CredentialFailure),

    #[error("account has no password; external sign-in required")]
    ExternalOnlyAccount,

    #[error("not authenticated")]
    Unauthenticated,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("user not found")]
    UserNotFound,

    #[error("external provider is not configured")]
    ProviderDisabled,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AuthError::UserNotFound,
            StoreError::Conflict => AuthError::Internal("unexpected uniqueness conflict".into()),
            StoreError::Unavailable(msg) => AuthError::Unavailable(msg),
        }
    }
}

/// A body that does not deserialize is reported like any other invalid
/// input, naming the offending field when serde reports one.
impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        let detail = match &rejection {
            JsonRejection::JsonDataError(e) => {
                let text = e.body_text();
                let reason = text
                    .split_once("target type: ")
                    .map(|(_, r)| r.to_string())
                    .unwrap_or(text);
                FieldError::new(field_of(&reason).unwrap_or("body"), reason.clone())
            }
            JsonRejection::JsonSyntaxError(_) => FieldError::new("body", "Malformed JSON body"),
            JsonRejection::MissingJsonContentType(_) => {
                FieldError::new("body", "Expected a JSON body (Content-Type: application/json)")
            }
            other => FieldError::new("body", other.body_text()),
        };
        AuthError::Validation(vec![detail])
    }
}

/// `missing field `x`` or `x: invalid type ...` -> `x`.
fn field_of(reason: &str) -> Option<&str> {
    if let Some(rest) = reason.strip_prefix("missing field `") {
        return rest.split('`').next();
    }
    let (path, _) = reason.split_once(": ")?;
    path.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        .then_some(path)
        .filter(|p| !p.is_empty() && *p != ".")
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AuthError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Validation error", "details": details }),
            ),
            AuthError::DuplicateEmail => (
                StatusCode::CONFLICT,
                json!({ "error": "User with this email already exists" }),
            ),
            AuthError::InvalidCredentials(_) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Invalid credentials" }),
            ),
            AuthError::ExternalOnlyAccount => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "This account uses Google Sign-In. Please login with Google.",
                    "useGoogle": true,
                }),
            ),
            AuthError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Not authenticated" }),
            ),
            AuthError::Token(TokenError::Malformed) => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "Invalid token" }))
            }
            AuthError::Token(TokenError::Expired) => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "Token expired" }))
            }
            AuthError::UserNotFound => {
                (StatusCode::NOT_FOUND, json!({ "error": "User not found" }))
            }
            AuthError::ProviderDisabled => (
                StatusCode::NOT_FOUND,
                json!({ "error": "Google sign-in is not configured" }),
            ),
            AuthError::Unavailable(msg) => {
                tracing::error!(error = %msg, "store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "Service temporarily unavailable, please retry" }),
                )
            }
            AuthError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Something went wrong" }),
                )
            }
        };
        (status, axum::Json(body)).into_response()
    }
}
