use http::header::{CACHE_CONTROL, PRAGMA};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;
use crate::key::{path_and_query, DeviceClassifier, KeyBuilder, KeyPattern, UserAgentClassifier};
use crate::logging::EventLogConfig;

type MethodPredicateFn = Arc<dyn Fn(&Method) -> bool + Send + Sync>;
type CacheablePredicateFn = Arc<dyn Fn(&Method, &Uri, &HeaderMap) -> bool + Send + Sync>;
type StatusPredicateFn = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

pub const DEFAULT_MEMORY_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Decides which upstream statuses may populate an entry.
///
/// The default accepts every status up to and including `200`.
#[derive(Clone, Default)]
pub struct SuccessStatuses {
    predicate: Option<StatusPredicateFn>,
}

impl SuccessStatuses {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Accepts exactly the listed status codes.
    pub fn only(statuses: impl IntoIterator<Item = u16>) -> Self {
        let allowed: Vec<u16> = statuses.into_iter().collect();
        Self::new(move |status| allowed.contains(&status.as_u16()))
    }

    pub fn is_success(&self, status: StatusCode) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(status),
            None => status.as_u16() <= 200,
        }
    }
}

impl fmt::Debug for SuccessStatuses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.predicate {
            Some(_) => f.write_str("SuccessStatuses(custom)"),
            None => f.write_str("SuccessStatuses(<= 200)"),
        }
    }
}

/// Why a request skipped the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    IgnorePattern,
    CacheControl,
    Predicate,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Method => "method",
            BypassReason::IgnorePattern => "ignore_pattern",
            BypassReason::CacheControl => "cache_control",
            BypassReason::Predicate => "predicate",
        }
    }
}

/// Runtime configuration shared by the store, the layer, and the watchers.
///
/// Immutable once built; the `with_*` helpers return updated copies.
#[derive(Clone)]
pub struct ProxyCacheConfig {
    allow_stale: bool,
    success_statuses: SuccessStatuses,
    memory_threshold: u64,
    memory_check_interval: Option<Duration>,
    stale_check_interval: Option<Duration>,
    ignore_patterns: Vec<KeyPattern>,
    method_predicate: Option<MethodPredicateFn>,
    cacheable: Option<CacheablePredicateFn>,
    respect_cache_control: bool,
    host_override: Option<HeaderValue>,
    classifier: Arc<dyn DeviceClassifier>,
    event_log: EventLogConfig,
}

impl fmt::Debug for ProxyCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCacheConfig")
            .field("allow_stale", &self.allow_stale)
            .field("success_statuses", &self.success_statuses)
            .field("memory_threshold", &self.memory_threshold)
            .field("memory_check_interval", &self.memory_check_interval)
            .field("stale_check_interval", &self.stale_check_interval)
            .field("ignore_patterns", &self.ignore_patterns)
            .field("respect_cache_control", &self.respect_cache_control)
            .field("host_override", &self.host_override)
            .field("event_log", &self.event_log)
            .finish()
    }
}

impl Default for ProxyCacheConfig {
    fn default() -> Self {
        Self {
            allow_stale: false,
            success_statuses: SuccessStatuses::default(),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            memory_check_interval: Some(DEFAULT_CHECK_INTERVAL),
            stale_check_interval: Some(DEFAULT_CHECK_INTERVAL),
            ignore_patterns: Vec::new(),
            method_predicate: None,
            cacheable: None,
            respect_cache_control: false,
            host_override: None,
            classifier: Arc::new(UserAgentClassifier),
            event_log: EventLogConfig::default(),
        }
    }
}

impl ProxyCacheConfig {
    pub fn allow_stale(&self) -> bool {
        self.allow_stale
    }

    pub fn success_statuses(&self) -> &SuccessStatuses {
        &self.success_statuses
    }

    /// Resident memory, in bytes, above which eviction kicks in.
    pub fn memory_threshold(&self) -> u64 {
        self.memory_threshold
    }

    /// `None` when the memory watcher is disabled.
    pub fn memory_check_interval(&self) -> Option<Duration> {
        self.memory_check_interval
    }

    /// `None` when the staleness watcher is disabled.
    pub fn stale_check_interval(&self) -> Option<Duration> {
        self.stale_check_interval
    }

    pub fn ignore_patterns(&self) -> &[KeyPattern] {
        &self.ignore_patterns
    }

    pub fn respect_cache_control(&self) -> bool {
        self.respect_cache_control
    }

    pub fn host_override(&self) -> Option<&HeaderValue> {
        self.host_override.as_ref()
    }

    pub fn event_log(&self) -> &EventLogConfig {
        &self.event_log
    }

    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(self.classifier.clone()).with_host_override(self.host_override.clone())
    }

    /// Only `GET` by default. Keys carry no method, so a `HEAD` must never
    /// populate or read a `GET` entry.
    pub fn should_cache_method(&self, method: &Method) -> bool {
        match &self.method_predicate {
            Some(predicate) => predicate(method),
            None => *method == Method::GET,
        }
    }

    /// Returns the first rule that excludes `req` from caching, if any.
    pub fn bypass_reason<B>(&self, req: &Request<B>) -> Option<BypassReason> {
        if !self.should_cache_method(req.method()) {
            return Some(BypassReason::Method);
        }

        let target = path_and_query(req.uri());
        if self
            .ignore_patterns
            .iter()
            .any(|pattern| pattern.matches(target))
        {
            return Some(BypassReason::IgnorePattern);
        }

        if self.respect_cache_control && requests_fresh_copy(req.headers()) {
            return Some(BypassReason::CacheControl);
        }

        if let Some(cacheable) = &self.cacheable {
            if !cacheable(req.method(), req.uri(), req.headers()) {
                return Some(BypassReason::Predicate);
            }
        }

        None
    }

    pub fn with_allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }

    pub fn with_success_statuses(mut self, statuses: SuccessStatuses) -> Self {
        self.success_statuses = statuses;
        self
    }

    pub fn with_memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// A zero interval disables the memory watcher.
    pub fn with_memory_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.memory_check_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    /// A zero interval disables the staleness watcher.
    pub fn with_stale_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.stale_check_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    pub fn with_ignore_patterns<I, P>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPattern>,
    {
        self.ignore_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.method_predicate = Some(Arc::new(predicate));
        self
    }

    /// Installs the bypass predicate. Requests it rejects are forwarded
    /// without touching the cache.
    pub fn with_cacheable_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method, &Uri, &HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.cacheable = Some(Arc::new(predicate));
        self
    }

    pub fn with_respect_cache_control(mut self, enabled: bool) -> Self {
        self.respect_cache_control = enabled;
        self
    }

    pub fn with_host_override(mut self, host: Option<HeaderValue>) -> Self {
        self.host_override = host;
        self
    }

    pub fn with_classifier<C: DeviceClassifier>(mut self, classifier: C) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_event_log(mut self, config: EventLogConfig) -> Self {
        self.event_log = config;
        self
    }
}

fn requests_fresh_copy(headers: &HeaderMap) -> bool {
    let cache_control = headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store");

    let pragma = headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.trim().eq_ignore_ascii_case("no-cache"));

    cache_control || pragma
}

/// Plain-data form of [`ProxyCacheConfig`] for loading from files or the
/// environment.
///
/// Intervals are milliseconds; zero or negative values disable the watcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyCacheSettings {
    pub allow_stale_cache: bool,
    #[serde(rename = "memGiBThreshold")]
    pub mem_gib_threshold: f64,
    pub mem_check_interval_ms: i64,
    pub stale_check_interval_ms: i64,
    pub ignore_patterns: Vec<String>,
    pub respect_cache_control: bool,
    pub spoof_host_header: Option<String>,
    pub log_events: bool,
    pub event_sample_rate: f64,
    pub hash_event_keys: bool,
}

impl Default for ProxyCacheSettings {
    fn default() -> Self {
        Self {
            allow_stale_cache: false,
            mem_gib_threshold: 2.0,
            mem_check_interval_ms: 30_000,
            stale_check_interval_ms: 30_000,
            ignore_patterns: Vec::new(),
            respect_cache_control: false,
            spoof_host_header: None,
            log_events: false,
            event_sample_rate: 1.0,
            hash_event_keys: true,
        }
    }
}

fn interval_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

impl TryFrom<ProxyCacheSettings> for ProxyCacheConfig {
    type Error = CacheError;

    fn try_from(settings: ProxyCacheSettings) -> Result<Self, Self::Error> {
        if !settings.mem_gib_threshold.is_finite() || settings.mem_gib_threshold < 0.0 {
            return Err(CacheError::InvalidConfig(format!(
                "memGiBThreshold must be a non-negative number, got {}",
                settings.mem_gib_threshold
            )));
        }

        let host_override = settings
            .spoof_host_header
            .map(|host| {
                HeaderValue::from_str(&host).map_err(|err| {
                    CacheError::InvalidConfig(format!("spoofHostHeader {host:?}: {err}"))
                })
            })
            .transpose()?;

        let threshold = (settings.mem_gib_threshold * (1u64 << 30) as f64) as u64;

        Ok(ProxyCacheConfig::default()
            .with_allow_stale(settings.allow_stale_cache)
            .with_memory_threshold(threshold)
            .with_memory_check_interval(interval_from_ms(settings.mem_check_interval_ms))
            .with_stale_check_interval(interval_from_ms(settings.stale_check_interval_ms))
            .with_ignore_patterns(settings.ignore_patterns)
            .with_respect_cache_control(settings.respect_cache_control)
            .with_host_override(host_override)
            .with_event_log(
                EventLogConfig::new()
                    .with_enabled(settings.log_events)
                    .with_sample_rate(settings.event_sample_rate)
                    .with_hash_keys(settings.hash_event_keys),
            ))
    }
}
