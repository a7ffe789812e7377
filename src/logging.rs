//! Structured cache event log.
//!
//! Besides the ordinary `tracing` diagnostics, the store can emit one JSON
//! record per cache decision under the [`EVENT_TARGET`] target. Records are
//! sampled and keys can be hashed before they leave the process.

use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::request_id::RequestId;

/// `tracing` target that carries event records.
pub const EVENT_TARGET: &str = "tower_proxy_cache::events";

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Controls the structured event log.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Fraction of events written, from `0.0` to `1.0`.
    pub sample_rate: f64,
    /// Replace keys with their SHA-256 digest.
    pub hash_keys: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
            hash_keys: true,
        }
    }
}

impl EventLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self
    }

    pub fn with_hash_keys(mut self, hash: bool) -> Self {
        self.hash_keys = hash;
        self
    }

    pub fn should_sample(&self) -> bool {
        if !self.enabled || self.sample_rate <= 0.0 {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        use std::collections::hash_map::RandomState;
        use std::hash::BuildHasher;

        let roll = RandomState::new().hash_one(Utc::now().timestamp_nanos_opt()) as f64
            / u64::MAX as f64;
        roll < self.sample_rate
    }
}

/// Kind of cache decision being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventType {
    /// Served from a ready entry.
    Hit,
    /// No entry; forwarded upstream.
    Miss,
    /// Entry restored from the external adapter.
    ExternalHit,
    /// Coalesced onto a pending or refreshing entry.
    Pooled,
    /// Entry became ready from an upstream response.
    Store,
    Refresh,
    RefreshFailure,
    Invalidate,
    Evict,
    Bypass,
}

/// One structured record.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub timestamp: DateTime<Utc>,
    pub event: CacheEventType,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "ser_method")]
    pub method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "ser_status")]
    pub status: Option<StatusCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

fn ser_method<S: serde::Serializer>(method: &Option<Method>, s: S) -> Result<S::Ok, S::Error> {
    match method {
        Some(method) => s.serialize_str(method.as_str()),
        None => s.serialize_none(),
    }
}

fn ser_status<S: serde::Serializer>(status: &Option<StatusCode>, s: S) -> Result<S::Ok, S::Error> {
    match status {
        Some(status) => s.serialize_u16(status.as_u16()),
        None => s.serialize_none(),
    }
}

impl CacheEvent {
    pub fn new(event: CacheEventType, key: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            key: key.into(),
            request_id: None,
            method: None,
            status: None,
            hits: None,
            size_bytes: None,
            latency_us: None,
            detail: None,
        }
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = Some(hits);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Renders the record as the JSON line that [`CacheEvent::log`] writes.
    pub fn to_json(&self, config: &EventLogConfig) -> String {
        let rendered = if config.hash_keys {
            let mut hashed = self.clone();
            hashed.key = hash_key(&self.key);
            serde_json::to_string(&hashed)
        } else {
            serde_json::to_string(self)
        };
        rendered.unwrap_or_else(|err| format!(r#"{{"serialization_error":"{err}"}}"#))
    }

    /// Writes the record if sampling selects it.
    pub fn log(&self, config: &EventLogConfig) {
        if !config.should_sample() {
            return;
        }
        tracing::info!(target: EVENT_TARGET, event = %self.to_json(config));
    }
}

/// Hex-encoded SHA-256 of `key`.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
