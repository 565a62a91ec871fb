//! SSRF (Server-Side Request Forgery) protection for provider base URLs
//!
//! Every adapter base URL must pass this validation before a deployment
//! is registered. Private and internal targets are rejected unless the
//! embedder explicitly allows them (self-hosted backends on a LAN).

use std::net::{IpAddr, Ipv4Addr};
use url::Url;

/// Options for base-URL validation
#[derive(Debug, Clone, Default)]
pub struct SsrfPolicy {
    /// Permit loopback, link-local, and RFC 1918 targets
    pub allow_private_networks: bool,
}

/// Validate a provider base URL
///
/// Checks that:
/// - the URL is well-formed and uses http(s)
/// - it carries no userinfo and no query component
/// - the host is not a loopback/link-local/private address or a known
///   metadata endpoint, unless `allow_private_networks` is set
pub fn validate_base_url(url_str: &str, policy: &SsrfPolicy) -> Result<(), String> {
    let url = Url::parse(url_str).map_err(|e| format!("invalid base URL format: {e}"))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(format!(
                "base URL must use http:// or https:// scheme, got: {scheme}"
            ));
        }
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err("base URL must not carry userinfo".to_string());
    }

    if url.query().is_some() {
        return Err("base URL must not carry a query component".to_string());
    }

    let host = url
        .host_str()
        .ok_or_else(|| "base URL must have a valid host".to_string())?;

    if policy.allow_private_networks {
        return Ok(());
    }

    let host_lower = host.to_lowercase();
    let blocked_hosts = [
        "localhost",
        "0",
        // Cloud metadata endpoints
        "metadata.google.internal",
        "metadata",
        // Common internal hostnames
        "internal",
        "local",
    ];

    for blocked in blocked_hosts {
        if host_lower == blocked || host_lower.ends_with(&format!(".{blocked}")) {
            return Err(format!(
                "base URL host '{host}' is blocked (SSRF protection)"
            ));
        }
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_or_internal_ip(&ip) {
            return Err(format!(
                "base URL host '{host}' is a private or internal address (SSRF protection)"
            ));
        }
    }

    // Bracketed IPv6 literal
    if host.starts_with('[') && host.ends_with(']') {
        if let Ok(ip) = host[1..host.len() - 1].parse::<IpAddr>() {
            if is_private_or_internal_ip(&ip) {
                return Err(format!(
                    "base URL host '{host}' is a private or internal address (SSRF protection)"
                ));
            }
        }
    }

    // Decimal-encoded IPv4 that bypasses hostname filters,
    // e.g. 2130706433 = 127.0.0.1
    if host.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(num) = host.parse::<u32>() {
            if is_private_or_internal_ip(&IpAddr::V4(Ipv4Addr::from(num))) {
                return Err(format!(
                    "base URL host '{host}' is a decimal-encoded private address (SSRF protection)"
                ));
            }
        }
    }

    // Hex-encoded IPv4 (0x prefix)
    if let Some(hex) = host.strip_prefix("0x").or_else(|| host.strip_prefix("0X")) {
        if let Ok(num) = u32::from_str_radix(hex, 16) {
            if is_private_or_internal_ip(&IpAddr::V4(Ipv4Addr::from(num))) {
                return Err(format!(
                    "base URL host '{host}' is a hex-encoded private address (SSRF protection)"
                ));
            }
        }
    }

    Ok(())
}

/// Check if an IP address is private, internal, or reserved
fn is_private_or_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                // Link-local (169.254.0.0/16), includes cloud metadata endpoints
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
                // Shared address space (100.64.0.0/10), RFC 6598
                || (ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64)
                // Reserved (240.0.0.0/4)
                || ipv4.octets()[0] >= 240
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // Unique local (fc00::/7)
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local (fe80::/10)
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
                // IPv4-mapped addresses inherit the IPv4 verdict
                || ipv6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_or_internal_ip(&IpAddr::V4(v4)))
        }
    }
}
