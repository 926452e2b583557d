use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StorageError;
use crate::types::ApiResponse;

#[derive(Error, Debug)]
pub enum ApiError {
    // Input errors
    #[error("Invalid auth data: {0}")]
    InvalidAuthData(String),

    #[error("Unsupported public key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // Auth errors
    #[error("Timestamp is too old or too far in the future")]
    StaleTimestamp,

    #[error("Invalid nonce. Expected: {expected}")]
    InvalidNonce { expected: u64 },

    #[error("No signature provided")]
    NoSignatureProvided,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token has been invalidated")]
    TokenInvalidated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Conflicts
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable label clients can match on
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidAuthData(_) => "INVALID_AUTH_DATA",
            ApiError::UnsupportedKeyType(_) => "UNSUPPORTED_KEY_TYPE",
            ApiError::UnknownChain(_) => "UNKNOWN_CHAIN",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::StaleTimestamp => "STALE_TIMESTAMP",
            ApiError::InvalidNonce { .. } => "INVALID_NONCE",
            ApiError::NoSignatureProvided => "NO_SIGNATURE_PROVIDED",
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::TokenExpired => "TOKEN_EXPIRED",
            ApiError::TokenInvalidated => "TOKEN_INVALIDATED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidAuthData(_)
            | ApiError::UnsupportedKeyType(_)
            | ApiError::UnknownChain(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::StaleTimestamp
            | ApiError::InvalidNonce { .. }
            | ApiError::NoSignatureProvided
            | ApiError::InvalidSignature
            | ApiError::Unauthorized
            | ApiError::InvalidToken
            | ApiError::TokenExpired
            | ApiError::TokenInvalidated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, hint) = match &self {
            ApiError::InvalidAuthData(msg) => (
                format!("Invalid auth data: {}", msg),
                Some("Sign `data.auth` with every field of the PFPK auth object"),
            ),
            ApiError::UnsupportedKeyType(key_type) => {
                (format!("Unsupported public key type: {}", key_type), None)
            }
            ApiError::UnknownChain(chain_id) => (format!("Unknown chain: {}", chain_id), None),
            ApiError::BadRequest(msg) => (msg.clone(), None),
            ApiError::StaleTimestamp => (
                self.to_string(),
                Some("Sign a fresh request with the current time"),
            ),
            ApiError::InvalidNonce { .. } => (
                self.to_string(),
                Some("Fetch the current nonce and sign again"),
            ),
            ApiError::Unauthorized => (
                "Missing bearer token".to_string(),
                Some("Include 'Authorization: Bearer <token>' header"),
            ),
            ApiError::Forbidden(msg) | ApiError::Conflict(msg) => (msg.clone(), None),
            // Never echo internals
            ApiError::Internal(_) => (
                "Internal server error".to_string(),
                Some("Please try again later"),
            ),
            _ => (self.to_string(), None),
        };

        let body = match hint {
            Some(h) => ApiResponse::<()>::error_with_hint(code, message, h),
            None => ApiResponse::<()>::error(code, message),
        };

        (status, Json(body)).into_response()
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnsupportedKeyType(key_type) => ApiError::UnsupportedKeyType(key_type),
            CryptoError::InvalidPublicKey(msg) => {
                ApiError::BadRequest(format!("Invalid public key: {}", msg))
            }
            CryptoError::InvalidSignature(_) => ApiError::InvalidSignature,
            CryptoError::InvalidAddress(msg) => {
                ApiError::BadRequest(format!("Invalid address: {}", msg))
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => ApiError::Conflict(msg),
            other => {
                tracing::error!(error = %other, "Storage failure");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
