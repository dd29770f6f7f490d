//! Request extractors whose rejections render as `ApiError` bodies.
//!
//! Plain axum extractors answer malformed paths, queries and JSON with their
//! own plain-text responses. These wrappers keep the `{"error", "status"}`
//! shape for every 400.

use axum::extract::{FromRequest, FromRequestParts};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, ApiResult};

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Decode an optional JSON body; an empty body yields `T::default()`.
pub fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}
