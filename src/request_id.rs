//! Request correlation ids.

use http::header::HeaderName;
use http::{HeaderValue, Request};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Identifier attached to cache events and forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Random UUID v4.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Reuses a valid `x-request-id` header, or generates a new id.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        req.headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Self(value.to_owned()))
            .unwrap_or_else(Self::generate)
    }

    /// Returns the id for `req`, writing a generated one into its headers so
    /// the upstream sees the same value.
    pub fn ensure<B>(req: &mut Request<B>) -> Self {
        let id = Self::from_request(req);
        if !req.headers().contains_key(&REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&id.0) {
                req.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }
        id
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
