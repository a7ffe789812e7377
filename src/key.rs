//! Cache key derivation and key patterns.
//!
//! A [`CacheKey`] is `{classification}:{host}:{path+query}`. The
//! classification comes from a [`DeviceClassifier`] so that a phone-optimized
//! body is never served to a desktop client (or the reverse).

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use http::header::{HOST, USER_AGENT};
use http::{HeaderValue, Request};
use regex::Regex;

/// Device category reported by a [`DeviceClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Phone,
    NotPhone,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Phone => "phone",
            DeviceClass::NotPhone => "not_phone",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a user agent string to a [`DeviceClass`].
pub trait DeviceClassifier: Send + Sync + 'static {
    fn classify(&self, user_agent: Option<&str>) -> DeviceClass;
}

/// Substring heuristic that separates phones from tablets and desktops.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserAgentClassifier;

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "kindle", "silk/", "playbook"];

const PHONE_MARKERS: &[&str] = &[
    "iphone",
    "ipod",
    "windows phone",
    "iemobile",
    "blackberry",
    "bb10",
    "opera mini",
    "webos",
    "mobile safari",
];

impl DeviceClassifier for UserAgentClassifier {
    fn classify(&self, user_agent: Option<&str>) -> DeviceClass {
        let Some(ua) = user_agent else {
            return DeviceClass::NotPhone;
        };
        let ua = ua.to_ascii_lowercase();

        if TABLET_MARKERS.iter().any(|marker| ua.contains(marker)) {
            return DeviceClass::NotPhone;
        }
        if PHONE_MARKERS.iter().any(|marker| ua.contains(marker)) {
            return DeviceClass::Phone;
        }
        // Android tablets omit the "Mobile" token.
        if ua.contains("android") && ua.contains("mobile") {
            return DeviceClass::Phone;
        }
        DeviceClass::NotPhone
    }
}

/// Stable identifier of a cacheable resource variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds `{classification}:{host}:{path}`.
    pub fn build(classification: impl fmt::Display, host: &str, path: &str) -> Self {
        Self(format!("{classification}:{host}:{path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Derives cache keys from inbound requests.
#[derive(Clone)]
pub struct KeyBuilder {
    classifier: Arc<dyn DeviceClassifier>,
    host_override: Option<HeaderValue>,
}

impl KeyBuilder {
    pub fn new(classifier: Arc<dyn DeviceClassifier>) -> Self {
        Self {
            classifier,
            host_override: None,
        }
    }

    pub fn with_host_override(mut self, host: Option<HeaderValue>) -> Self {
        self.host_override = host;
        self
    }

    pub fn host_override(&self) -> Option<&HeaderValue> {
        self.host_override.as_ref()
    }

    /// Computes the key for `req`.
    ///
    /// The host is taken from the override when configured, then the `Host`
    /// header, then the URI authority.
    pub fn key_for<B>(&self, req: &Request<B>) -> CacheKey {
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok());
        let class = self.classifier.classify(user_agent);

        let host = self
            .host_override
            .as_ref()
            .or_else(|| req.headers().get(HOST))
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
            .unwrap_or("");

        CacheKey::build(class, host, path_and_query(req.uri()))
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(Arc::new(UserAgentClassifier))
    }
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("host_override", &self.host_override)
            .finish()
    }
}

pub(crate) fn path_and_query(uri: &http::Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
}

/// Glob over cache keys (or request paths) where `*` matches any run of
/// characters, including `:` and `/`. Every other character is literal.
///
/// The glob is compiled to an anchored [`Regex`] once, when the pattern is
/// built.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    compiled: Option<Regex>,
}

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let compiled = match Regex::new(&glob_to_regex(&raw)) {
            Ok(compiled) => Some(compiled),
            Err(err) => {
                tracing::warn!(pattern = %raw, error = %err, "pattern not compiled; matching literally");
                None
            }
        };
        Self { raw, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match &self.compiled {
            Some(compiled) => compiled.is_match(candidate),
            None => self.raw == candidate,
        }
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for KeyPattern {}

impl From<&str> for KeyPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyPattern {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut source = String::from("(?s)^");
    for (idx, literal) in glob.split('*').enumerate() {
        if idx > 0 {
            source.push_str(".*");
        }
        source.push_str(&regex::escape(literal));
    }
    source.push('$');
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 8_0 like Mac OS X) AppleWebKit/600.1.3 (KHTML, like Gecko) Version/8.0 Mobile/12A4345d Safari/600.1.4";
    const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 5.0.2; SM-G9250 Build/LRX22G; wv) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/43.0.2357.121 Mobile Safari/537.36 [FB_IAB/FB4A;FBAV/35.0.0.48.273;]";
    const DESKTOP_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_10_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/43.0.2357.124 Safari/537.36";
    const IPAD_UA: &str = "Mozilla/5.0 (iPad; CPU OS 9_1 like Mac OS X) AppleWebKit/601.1.46 (KHTML, like Gecko) Version/9.0 Mobile/13B143 Safari/601.1";

    #[test]
    fn classifier_separates_phones_from_desktops_and_tablets() {
        let classifier = UserAgentClassifier;
        assert_eq!(classifier.classify(Some(IPHONE_UA)), DeviceClass::Phone);
        assert_eq!(classifier.classify(Some(ANDROID_UA)), DeviceClass::Phone);
        assert_eq!(classifier.classify(Some(DESKTOP_UA)), DeviceClass::NotPhone);
        assert_eq!(classifier.classify(Some(IPAD_UA)), DeviceClass::NotPhone);
        assert_eq!(classifier.classify(None), DeviceClass::NotPhone);
    }

    #[test]
    fn key_uses_host_header_and_path_with_query() {
        let req = Request::builder()
            .uri("/search?q=rust")
            .header(HOST, "localhost:8181")
            .body(())
            .unwrap();

        let key = KeyBuilder::default().key_for(&req);
        assert_eq!(key.as_str(), "not_phone:localhost:8181:/search?q=rust");
    }

    #[test]
    fn key_differs_by_device_class() {
        let phone = Request::builder()
            .uri("/page")
            .header(HOST, "example.com")
            .header(USER_AGENT, IPHONE_UA)
            .body(())
            .unwrap();
        let desktop = Request::builder()
            .uri("/page")
            .header(HOST, "example.com")
            .header(USER_AGENT, DESKTOP_UA)
            .body(())
            .unwrap();

        let builder = KeyBuilder::default();
        assert_eq!(builder.key_for(&phone).as_str(), "phone:example.com:/page");
        assert_eq!(
            builder.key_for(&desktop).as_str(),
            "not_phone:example.com:/page"
        );
    }

    #[test]
    fn host_override_takes_precedence() {
        let req = Request::builder()
            .uri("http://ignored.test/a")
            .header(HOST, "client.test")
            .body(())
            .unwrap();

        let builder = KeyBuilder::default()
            .with_host_override(Some(HeaderValue::from_static("origin.test:80")));
        assert_eq!(builder.key_for(&req).as_str(), "not_phone:origin.test:80:/a");
    }

    #[test]
    fn falls_back_to_uri_authority_and_root_path() {
        let req = Request::builder()
            .uri("http://origin.test")
            .body(())
            .unwrap();
        assert_eq!(
            KeyBuilder::default().key_for(&req).as_str(),
            "not_phone:origin.test:/"
        );
    }

    #[test]
    fn pattern_matching() {
        let key = "not_phone:localhost:8181:/hello";
        assert!(KeyPattern::new("*/hello").matches(key));
        assert!(KeyPattern::new("*").matches(key));
        assert!(KeyPattern::new("not_phone:*").matches(key));
        assert!(KeyPattern::new("*:localhost:*:/h*o").matches(key));
        assert!(KeyPattern::new(key).matches(key));
        assert!(!KeyPattern::new("*/delay").matches(key));
        assert!(!KeyPattern::new("phone:*").matches(key));
        assert!(!KeyPattern::new("").matches(key));
    }

    #[test]
    fn regex_metacharacters_in_patterns_are_literal() {
        let pattern = KeyPattern::new("*/search?q=a.b+(c)");
        assert!(pattern.matches("not_phone:origin.test:/search?q=a.b+(c)"));
        assert!(!pattern.matches("not_phone:origin.test:/search?q=aXb+(c)"));
        assert!(!pattern.matches("not_phone:origin.test:/searchq=a.b+(c)"));
        assert!(KeyPattern::new("/health*").matches("/healthz?full=1"));
        assert_eq!(KeyPattern::new("/a*"), KeyPattern::from("/a*"));
    }
}
