//! Payload scrubbing before callback fan-out
//!
//! Telemetry callbacks must never see credentials or multi-megabyte
//! blobs: base64 payloads and embedded image URLs become placeholders,
//! long strings are truncated with a marker, configured regex patterns
//! are blanked, and values under sensitive key names are replaced
//! wholesale.

use base64::Engine;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";
/// Replacement for binary blobs
pub const BLOB_PLACEHOLDER: &str = "[BASE64_BLOB]";
/// Replacement for embedded image URLs
pub const IMAGE_PLACEHOLDER: &str = "[IMAGE_URL]";
/// Marker appended to truncated strings
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

/// Key names whose values are replaced wholesale (substring match)
static SENSITIVE_KEY_FRAGMENTS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["key", "token", "secret", "password", "auth", "credential"]);

/// Headers always redacted regardless of configuration
static SENSITIVE_HEADERS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "authorization",
        "proxy-authorization",
        "x-api-key",
        "api-key",
        "x-auth-token",
        "cookie",
        "set-cookie",
    ]
    .into_iter()
    .collect()
});

/// Scrubbing configuration
#[derive(Debug, Clone)]
pub struct ScrubConfig {
    /// Strings longer than this are truncated with a marker
    pub max_string_len: usize,
    /// Regex patterns whose matches are blanked
    pub patterns: Vec<Regex>,
    /// Extra sensitive key names (exact, case-insensitive)
    pub extra_sensitive_keys: Vec<String>,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            max_string_len: 4096,
            patterns: Vec::new(),
            extra_sensitive_keys: Vec::new(),
        }
    }
}

impl ScrubConfig {
    fn is_sensitive_key(&self, key: &str) -> bool {
        let key_lower = key.to_lowercase();
        SENSITIVE_KEY_FRAGMENTS
            .iter()
            .any(|fragment| key_lower.contains(fragment))
            || self
                .extra_sensitive_keys
                .iter()
                .any(|extra| extra.to_lowercase() == key_lower)
    }
}

/// Whether a string is an embedded binary payload
fn is_base64_blob(value: &str) -> bool {
    if value.starts_with("data:") && value.contains(";base64,") {
        return true;
    }
    if value.len() < 256 || !value.is_ascii() {
        return false;
    }
    // Long run of base64 alphabet that actually decodes: treat as blob
    let candidate: &str = &value[..value.len().min(512)];
    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
    {
        return false;
    }
    let head = &candidate[..candidate.len() - candidate.len() % 4];
    base64::engine::general_purpose::STANDARD.decode(head).is_ok()
}

fn looks_like_image_url(value: &str) -> bool {
    (value.starts_with("http://") || value.starts_with("https://"))
        && [".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"]
            .iter()
            .any(|ext| value.to_lowercase().split('?').next().unwrap_or("").ends_with(ext))
}

/// Scrub a single string value
pub fn scrub_string(value: &str, config: &ScrubConfig) -> String {
    if is_base64_blob(value) {
        return BLOB_PLACEHOLDER.to_string();
    }
    if looks_like_image_url(value) {
        return IMAGE_PLACEHOLDER.to_string();
    }

    let mut scrubbed = value.to_string();
    for pattern in &config.patterns {
        scrubbed = pattern.replace_all(&scrubbed, REDACTED).to_string();
    }

    if scrubbed.chars().count() > config.max_string_len {
        let mut truncated: String = scrubbed.chars().take(config.max_string_len).collect();
        truncated.push_str(TRUNCATION_MARKER);
        return truncated;
    }
    scrubbed
}

/// Scrub a JSON tree in place
pub fn scrub_value(value: &mut Value, config: &ScrubConfig) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if config.is_sensitive_key(key) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    scrub_value(entry, config);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_value(item, config);
            }
        }
        Value::String(text) => {
            let scrubbed = scrub_string(text, config);
            if scrubbed != *text {
                *value = Value::String(scrubbed);
            }
        }
        _ => {}
    }
}

/// Redact sensitive headers from a header list
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            if SENSITIVE_HEADERS.contains(name.to_lowercase().as_str()) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
