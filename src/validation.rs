//! Centralized validation functions for pbr-keeper.
//!
//! This module provides unified validation for:
//! - Kernel object names (address sets, list names)
//! - Network interface names
//! - Remote list and proxy URLs
//! - DNS server addresses

use std::net::{IpAddr, SocketAddr};

use crate::error::{PbrError, Result};

/// Maximum length of an ipset name (IPSET_MAXNAMELEN - 1).
pub const MAX_SET_NAME_LEN: usize = 31;

/// Maximum length of a Linux interface name (IFNAMSIZ - 1).
pub const MAX_IFACE_NAME_LEN: usize = 15;

/// Routing tables reserved by the kernel (unspec, default, main, local).
pub const RESERVED_TABLES: &[u32] = &[0, 253, 254, 255];

/// Validate a name that becomes a kernel object identifier.
///
/// Allowed: ASCII letters, digits, `_` and `-`, starting with a letter,
/// at most 31 characters.
///
/// # Examples
/// ```
/// use pbr_keeper::validation::validate_object_name;
/// assert!(validate_object_name("vpn_1").is_ok());
/// assert!(validate_object_name("1vpn").is_err());
/// assert!(validate_object_name("vpn;rm").is_err());
/// ```
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SET_NAME_LEN {
        return Err(PbrError::Validation(format!(
            "Name '{}' must be 1-{} characters",
            name, MAX_SET_NAME_LEN
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(PbrError::Validation(format!(
            "Name '{}' must start with a letter",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PbrError::Validation(format!(
            "Name '{}' contains invalid characters (allowed: a-z, A-Z, 0-9, _, -)",
            name
        )));
    }
    Ok(())
}

/// Validate a network interface name.
///
/// # Examples
/// ```
/// use pbr_keeper::validation::validate_interface_name;
/// assert!(validate_interface_name("eth0").is_ok());
/// assert!(validate_interface_name("nwg0.100").is_ok());
/// assert!(validate_interface_name("eth 0").is_err());
/// ```
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFACE_NAME_LEN {
        return Err(PbrError::Validation(format!(
            "Interface name '{}' must be 1-{} characters",
            name, MAX_IFACE_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(PbrError::Validation(format!(
            "Invalid interface name '{}'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-.@".contains(c))
    {
        return Err(PbrError::Validation(format!(
            "Interface name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Validate a remote list URL (http or https).
pub fn validate_http_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| PbrError::Validation(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(PbrError::Validation(format!(
            "URL '{}' must use http or https",
            url
        ))),
    }
}

/// Validate a proxy URL such as `socks5://127.0.0.1:1080`.
pub fn validate_proxy_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(PbrError::Validation("Proxy URL is required".to_string()));
    }
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| PbrError::Validation(format!("Invalid proxy URL '{}': {}", url, e)))?;
    if parsed.host_str().is_none() || parsed.port_or_known_default().is_none() {
        return Err(PbrError::Validation(format!(
            "Proxy URL '{}' must include host and port",
            url
        )));
    }
    Ok(())
}

/// Parse a DNS server given as `ip` or `ip:port` (IPv6 as `[ip]:port`).
///
/// # Examples
/// ```
/// use pbr_keeper::validation::parse_dns_server;
/// assert_eq!(parse_dns_server("8.8.8.8").unwrap().port(), 53);
/// assert_eq!(parse_dns_server("1.1.1.1:5353").unwrap().port(), 5353);
/// assert!(parse_dns_server("dns.google").is_err());
/// ```
pub fn parse_dns_server(server: &str) -> Result<SocketAddr> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    server
        .parse::<SocketAddr>()
        .map_err(|_| PbrError::Validation(format!("Invalid DNS server '{}'", server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_length_limit() {
        assert!(validate_object_name(&"a".repeat(31)).is_ok());
        assert!(validate_object_name(&"a".repeat(32)).is_err());
        assert!(validate_object_name("").is_err());
    }

    #[test]
    fn test_object_name_rejects_injection() {
        assert!(validate_object_name("vpn set").is_err());
        assert!(validate_object_name("vpn$(id)").is_err());
        assert!(validate_object_name("vpn\n").is_err());
        assert!(validate_object_name("-vpn").is_err());
    }

    #[test]
    fn test_interface_name() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("ppp0@eth1").is_ok());
        assert!(validate_interface_name("averyveryverylongname").is_err());
        assert!(validate_interface_name("eth/0").is_err());
        assert!(validate_interface_name("..").is_err());
    }

    #[test]
    fn test_http_url() {
        assert!(validate_http_url("https://example.com/list.txt").is_ok());
        assert!(validate_http_url("http://10.0.0.1:8080/l").is_ok());
        assert!(validate_http_url("ftp://example.com/list").is_err());
        assert!(validate_http_url("not a url").is_err());
    }

    #[test]
    fn test_proxy_url() {
        assert!(validate_proxy_url("socks5://127.0.0.1:1080").is_ok());
        assert!(validate_proxy_url("http://127.0.0.1:3128").is_ok());
        assert!(validate_proxy_url("").is_err());
        assert!(validate_proxy_url("socks5://127.0.0.1").is_err());
    }

    #[test]
    fn test_dns_server() {
        assert_eq!(
            parse_dns_server("[2001:4860:4860::8888]:53").unwrap().port(),
            53
        );
        assert!(parse_dns_server("").is_err());
    }
}
