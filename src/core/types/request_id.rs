//! Request id validation and generation
//!
//! The gateway preserves a client-supplied `X-Request-ID` only when it is
//! well-formed; otherwise a fresh 128-bit hex id is substituted. The
//! effective id is always echoed back in the same header.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum accepted length of a client-supplied id, in octets
pub const MAX_REQUEST_ID_LEN: usize = 128;

static REQUEST_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static pattern"));

/// Validate a client-supplied request id
///
/// Accepts the trimmed id when it is non-empty, at most 128 octets, and
/// matches `[A-Za-z0-9._-]+`.
pub fn validate_request_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_REQUEST_ID_LEN {
        return None;
    }
    REQUEST_ID_PATTERN.is_match(trimmed).then_some(trimmed)
}

/// Generate a fresh 128-bit hex request id
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Adopt a valid client id or substitute a generated one
pub fn effective_request_id(client_supplied: Option<&str>) -> String {
    client_supplied
        .and_then(validate_request_id)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}
