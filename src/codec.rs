//! Persisted entry envelope.
//!
//! Adapters never see a live entry: they store the textual envelope produced
//! here. The schema is versioned and binary-safe.
//!
//! ```json
//! { "v": 1, "createdAt": "2024-05-01T12:00:00Z", "statusCode": 200,
//!   "headers": [{ "name": "content-type", "value": "text/html" }],
//!   "data": "aGVsbG8=" }
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::entry::CachedResponse;
use crate::error::CacheError;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// A serialized snapshot of a ready entry.
#[derive(Debug, Clone)]
pub struct PersistedEntry {
    pub created_at: DateTime<Utc>,
    pub response: CachedResponse,
}

/// Serialization strategy for persisted entries.
pub trait CacheCodec: Send + Sync + 'static {
    fn encode(&self, entry: &PersistedEntry) -> Result<String, CacheError>;
    fn decode(&self, payload: &str) -> Result<PersistedEntry, CacheError>;
}

/// Default [`CacheCodec`]: JSON envelope with a base64 body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    v: u32,
    created_at: DateTime<Utc>,
    status_code: u16,
    headers: Vec<StoredHeader>,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct StoredHeader {
    name: String,
    value: String,
    // Set when `value` holds base64 of a non-UTF-8 header value.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    binary: bool,
}

impl CacheCodec for JsonCodec {
    fn encode(&self, entry: &PersistedEntry) -> Result<String, CacheError> {
        let headers = entry
            .response
            .headers
            .iter()
            .map(|(name, value)| match value.to_str() {
                Ok(text) => StoredHeader {
                    name: name.as_str().to_owned(),
                    value: text.to_owned(),
                    binary: false,
                },
                Err(_) => StoredHeader {
                    name: name.as_str().to_owned(),
                    value: STANDARD.encode(value.as_bytes()),
                    binary: true,
                },
            })
            .collect();

        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            created_at: entry.created_at,
            status_code: entry.response.status.as_u16(),
            headers,
            data: STANDARD.encode(&entry.response.body),
        };

        Ok(serde_json::to_string(&envelope)?)
    }

    fn decode(&self, payload: &str) -> Result<PersistedEntry, CacheError> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(CacheError::Serialization(format!(
                "unsupported envelope version {}",
                envelope.v
            )));
        }

        let status = StatusCode::from_u16(envelope.status_code)
            .map_err(|err| CacheError::Serialization(err.to_string()))?;

        let mut headers = HeaderMap::with_capacity(envelope.headers.len());
        for stored in envelope.headers {
            let name = HeaderName::from_bytes(stored.name.as_bytes())
                .map_err(|err| CacheError::Serialization(err.to_string()))?;
            let value = if stored.binary {
                let raw = STANDARD
                    .decode(stored.value.as_bytes())
                    .map_err(|err| CacheError::Serialization(err.to_string()))?;
                HeaderValue::from_bytes(&raw)
            } else {
                HeaderValue::from_str(&stored.value)
            }
            .map_err(|err| CacheError::Serialization(err.to_string()))?;
            headers.append(name, value);
        }

        let body = STANDARD
            .decode(envelope.data.as_bytes())
            .map_err(|err| CacheError::Serialization(err.to_string()))?;

        Ok(PersistedEntry {
            created_at: envelope.created_at,
            response: CachedResponse {
                status,
                headers,
                body: Bytes::from(body),
            },
        })
    }
}
