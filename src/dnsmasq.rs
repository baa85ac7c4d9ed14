//! Resolver hook configuration.
//!
//! Domains can't be matched by the packet filter directly; instead the
//! resolver adds every address it resolves for a listed domain to the
//! policy's set (`ipset=/<domain>/<set>`), optionally forwarding those
//! lookups to the policy's DNS server (`server=/<domain>/<addr>`).

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;

use crate::classify::ParsedList;
use crate::config::PolicyConfig;
use crate::fetcher::write_atomic;
use crate::validation::parse_dns_server;

/// dnsmasq's `#` server syntax: `1.1.1.1#5353`.
fn server_directive(addr: SocketAddr) -> String {
    if addr.port() == 53 {
        addr.ip().to_string()
    } else {
        format!("{}#{}", addr.ip(), addr.port())
    }
}

/// Render the configuration for policies in order, with each policy's
/// domains sorted.
pub fn render(policies: &[(&PolicyConfig, &ParsedList)]) -> crate::error::Result<String> {
    let mut out = String::from("# Generated by pbr-keeper. Do not edit.\n");

    for (policy, entries) in policies {
        let mut domains: Vec<&str> = entries.domains().collect();
        if domains.is_empty() {
            continue;
        }
        domains.sort_unstable();
        domains.dedup();

        let dns = policy
            .routing
            .override_dns
            .as_deref()
            .map(parse_dns_server)
            .transpose()?
            .map(server_directive);

        out.push_str(&format!("\n# {}\n", policy.name));
        for domain in domains {
            out.push_str(&format!("ipset=/{}/{}\n", domain, policy.name));
            if let Some(dns) = &dns {
                out.push_str(&format!("server=/{}/{}\n", domain, dns));
            }
        }
    }

    Ok(out)
}

/// Write the file atomically. Returns whether the content changed.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if std::fs::read_to_string(path).ok().as_deref() == Some(content) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, content.as_bytes())?;
    Ok(true)
}
