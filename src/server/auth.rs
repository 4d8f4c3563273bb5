//! API key check
//!
//! Requests carry the shared secret in the `X-API-KEY` header. Only the last
//! whitespace separated token of the header is compared, so both `<key>`
//! and `Bearer <key>` are accepted.

use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use super::AppState;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Extractor that rejects requests without the configured API key
pub struct RequireApiKey;

impl FromRequestParts<AppState> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|val| val.to_str().ok());

        match header {
            Some(value) if key_matches(value, &state.api_key) => Ok(RequireApiKey),
            Some(_) => {
                warn!("Rejected request with wrong API key");
                Err(ApiError::Unauthorized)
            }
            None => {
                warn!("Rejected request without API key");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

/// Compare the last token of a header value with the expected key
pub fn key_matches(header_value: &str, expected: &str) -> bool {
    header_value
        .split_whitespace()
        .last()
        .is_some_and(|token| token == expected)
}
