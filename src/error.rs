use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderValue, StatusCode};
use serde::Serialize;
use tower::BoxError;

pub(crate) const AUTHORIZATION_MALFORMED: &str = "Authorization malformed.";
pub(crate) const UNPARSEABLE_TOKEN: &str = "Unable to parse authentication token.";
pub(crate) const NO_MATCHING_KEY: &str = "Unable to find the appropriate key.";
pub(crate) const INCORRECT_CLAIMS: &str = "Incorrect claims. Please, check the audience and issuer.";
pub(crate) const PERMISSIONS_MISSING: &str = "Permissions not included in JWT.";
pub(crate) const HEADER_MISSING: &str = "Authorization header is expected.";
pub(crate) const HEADER_NOT_BEARER: &str = "Authorization header must be bearer token.";
pub(crate) const TOKEN_MISSING: &str = "Token not found.";

/// Every way a request can fail authentication or authorization.
///
/// The set is closed: each variant has a stable `code`, an HTTP status and a client-facing description. Failures that
/// don't fit any of the token-related kinds end up as [`Error::Internal`] and are answered with a 500.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid header: {description}")]
    InvalidHeader {
        description: &'static str,
        status_code: StatusCode,
    },
    #[error("token signature does not verify")]
    InvalidSignature,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid claims: {description}")]
    InvalidClaims {
        description: &'static str,
        status_code: StatusCode,
    },
    #[error("required permission not granted")]
    Unauthorized,
    #[error("key directory unavailable")]
    KeyDirectoryUnavailable(#[from] KeyDirectoryError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why the JWK set could not be obtained from the key directory.
#[derive(thiserror::Error, Debug)]
pub enum KeyDirectoryError {
    #[error("failed to fetch JWK set")]
    Request(#[from] reqwest::Error),
    #[error("received error response when fetching JWK set: {status_code}")]
    ErrorResponse { status_code: StatusCode },
    #[error("JWK set fetch service failed")]
    Service(#[source] BoxError),
}

impl Error {
    pub(crate) fn invalid_header(description: &'static str, status_code: StatusCode) -> Self {
        Error::InvalidHeader {
            description,
            status_code,
        }
    }

    pub(crate) fn invalid_claims(description: &'static str, status_code: StatusCode) -> Self {
        Error::InvalidClaims {
            description,
            status_code,
        }
    }

    /// Catch-all for token content that can't be parsed at all.
    pub(crate) fn unparseable_token() -> Self {
        Error::invalid_header(UNPARSEABLE_TOKEN, StatusCode::BAD_REQUEST)
    }

    /// Stable, machine readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidHeader { .. } => "invalid_header",
            Error::InvalidSignature => "invalid_signature",
            Error::TokenExpired => "token_expired",
            Error::InvalidClaims { .. } => "invalid_claims",
            Error::Unauthorized => "unauthorized",
            Error::KeyDirectoryUnavailable(_) => "key_directory_unavailable",
            Error::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidHeader { status_code, .. } | Error::InvalidClaims { status_code, .. } => {
                *status_code
            }
            Error::InvalidSignature | Error::TokenExpired => StatusCode::UNAUTHORIZED,
            Error::Unauthorized => StatusCode::FORBIDDEN,
            Error::KeyDirectoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human readable description that is safe to hand out to clients.
    ///
    /// Details of key directory and internal failures are kept out of it; they only end up in the logs.
    pub fn description(&self) -> &'static str {
        match self {
            Error::InvalidHeader { description, .. } | Error::InvalidClaims { description, .. } => {
                description
            }
            Error::InvalidSignature => "Token signature is invalid.",
            Error::TokenExpired => "Token expired.",
            Error::Unauthorized => "Permission not found.",
            Error::KeyDirectoryUnavailable(_) => "Unable to fetch the signing keys.",
            Error::Internal(_) => "Internal server error.",
        }
    }

    /// Whether retrying the same request later may succeed.
    ///
    /// Only key directory outages qualify. Expired or invalid tokens need a fresh token instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::KeyDirectoryUnavailable(_))
    }

    /// Recovers an error that was handed to every caller waiting on the same JWK set fetch.
    pub(crate) fn from_shared(error: Arc<Error>) -> Self {
        Arc::try_unwrap(error).unwrap_or_else(|shared| {
            if let Error::Internal(detail) = shared.as_ref() {
                return Error::Internal(detail.clone());
            }
            Error::KeyDirectoryUnavailable(KeyDirectoryError::Service(Box::new(shared)))
        })
    }

    /// Recovers our own error from a `tower` middleware error, e.g. coming out of a `Buffer`.
    pub(crate) fn from_box_error(error: BoxError) -> Self {
        match error.downcast::<Error>() {
            Ok(error) => *error,
            Err(error) => Error::KeyDirectoryUnavailable(KeyDirectoryError::Service(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: u16,
    message: ErrorMessage,
}

#[derive(Serialize)]
struct ErrorMessage {
    code: &'static str,
    description: &'static str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let body = Json(ErrorBody {
            success: false,
            error: status_code.as_u16(),
            message: ErrorMessage {
                code: self.code(),
                description: self.description(),
            },
        });

        let mut response = (status_code, body).into_response();
        if status_code == StatusCode::UNAUTHORIZED {
            let challenge = format!("Bearer error=\"{}\"", self.code());
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}
