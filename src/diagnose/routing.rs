//! "How would this host be routed?"
//!
//! Each policy is evaluated against the addresses its own resolver would
//! return: the override server when one is configured, the system resolver
//! otherwise.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::output::{PolicyMatch, RoutingCheck};
use super::Diagnostics;
use crate::classify::{Entry, ParsedList};
use crate::config::PolicyConfig;
use crate::error::{PbrError, Result};
use crate::validation::parse_dns_server;

/// True if `host` is `domain` or one of its subdomains.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// List entries that place `ip` (resolved from `host`) in the policy.
pub fn matching_entries(entries: &ParsedList, host: &str, ip: IpAddr) -> Vec<String> {
    entries
        .entries
        .iter()
        .filter(|entry| match entry {
            Entry::Domain(d) => domain_matches(host, d),
            Entry::Ip(net) => net.contains(&ip),
        })
        .map(|entry| entry.to_string())
        .collect()
}

impl Diagnostics {
    /// Compare live set membership with list membership for every policy
    /// a resolved address of `host` relates to.
    pub async fn check_routing(&self, host: &str, cancel: &CancellationToken) -> Result<RoutingCheck> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        let policies = self.config.read().await.policies();

        let mut resolutions: HashMap<Option<SocketAddr>, Result<Vec<IpAddr>>> = HashMap::new();
        let mut servers = Vec::with_capacity(policies.len());
        for policy in &policies {
            let server = policy
                .routing
                .override_dns
                .as_deref()
                .map(parse_dns_server)
                .transpose()?;
            if !resolutions.contains_key(&server) {
                let resolved = tokio::select! {
                    _ = cancel.cancelled() => return Err(PbrError::Cancelled),
                    r = self.resolver.resolve(&host, server) => r,
                };
                if let Err(e) = &resolved {
                    warn!("Resolving {} via {}: {}", host, describe(server), e);
                }
                resolutions.insert(server, resolved);
            }
            servers.push(server);
        }
        if policies.is_empty() {
            let resolved = self.resolver.resolve(&host, None).await;
            resolutions.insert(None, resolved);
        }

        let mut resolved = BTreeSet::new();
        for addrs in resolutions.values().flatten() {
            resolved.extend(addrs.iter().copied());
        }
        if resolved.is_empty() {
            // Every resolution failed; report the first error.
            if let Some(Err(e)) = resolutions.into_values().next() {
                return Err(e);
            }
            return Err(PbrError::NotFound(format!("No addresses for {}", host)));
        }

        let mut matches = Vec::new();
        for (policy, server) in policies.iter().zip(servers) {
            let addrs = match &resolutions[&server] {
                Ok(addrs) => addrs.clone(),
                Err(_) => continue,
            };
            matches.extend(self.evaluate_policy(policy, &host, &addrs, cancel).await?);
        }

        let stale = matches.iter().any(PolicyMatch::mismatch);
        Ok(RoutingCheck {
            host,
            resolved: resolved.into_iter().collect(),
            matches,
            stale,
        })
    }

    async fn evaluate_policy(
        &self,
        policy: &PolicyConfig,
        host: &str,
        addrs: &[IpAddr],
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyMatch>> {
        let (entries, list_error) = match self.registry.resolve_all(&policy.lists, cancel).await {
            Ok(entries) => (entries, None),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => (ParsedList::default(), Some(e.to_string())),
        };

        let mut matches = Vec::new();
        for &ip in addrs.iter().filter(|ip| policy.ip_version.matches_addr(ip)) {
            let matched_by = matching_entries(&entries, host, ip);
            let (present_in_ipset, kernel_error) = match self.reconciler.present_in_set(policy, ip).await {
                Ok(present) => (present, None),
                Err(e) => (false, Some(e.to_string())),
            };
            let error = list_error.clone().or(kernel_error);
            let should_be_present = !matched_by.is_empty();
            if !present_in_ipset && !should_be_present && error.is_none() {
                continue;
            }
            debug!(
                policy = %policy.name,
                "{}: in set {}, expected {}",
                ip, present_in_ipset, should_be_present
            );
            matches.push(PolicyMatch {
                policy: policy.name.clone(),
                ip,
                present_in_ipset,
                should_be_present,
                matched_by,
                error,
            });
        }
        Ok(matches)
    }
}

fn describe(server: Option<SocketAddr>) -> String {
    server
        .map(|s| s.to_string())
        .unwrap_or_else(|| "system resolver".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::parse_entries;

    #[test]
    fn test_domain_matches_subdomains_only_on_label_boundary() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("www.example.com", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
        assert!(!domain_matches("com", "example.com"));
    }

    #[test]
    fn test_matching_entries() {
        let entries = parse_entries("example.com\n10.0.0.0/8\n192.168.0.0/16\n", "#");
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(
            matching_entries(&entries, "www.example.com", ip),
            vec!["example.com".to_string(), "10.0.0.0/8".to_string()]
        );
        assert!(matching_entries(&entries, "other.org", "8.8.8.8".parse().unwrap()).is_empty());
    }
}
