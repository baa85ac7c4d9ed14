//! Configuration management for pbr-keeper.
//!
//! The configuration holds named list sources, routing policies (one address
//! set per policy) and an alternate outbound/rule representation that is
//! lowered into the same policy type before reconciliation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::PbrError;
use crate::validation::{
    parse_dns_server, validate_http_url, validate_interface_name, validate_object_name,
    validate_proxy_url, RESERVED_TABLES,
};

/// Placeholders accepted in custom rule templates.
pub const TEMPLATE_PLACEHOLDERS: &[&str] =
    &["{{ipset_name}}", "{{fwmark}}", "{{table}}", "{{priority}}"];

/// Configuration shared between components.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Wrap a configuration for injection into components.
pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    /// Named list sources
    pub lists: Vec<ListConfig>,

    /// Routing policies, one address set each
    pub ipsets: Vec<PolicyConfig>,

    /// Outbound registry for the rule representation
    pub outbounds: Vec<OutboundConfig>,

    /// Rules binding lists to outbound tables
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding downloaded list copies
    pub cache_dir: PathBuf,

    /// Generated resolver configuration file
    pub dnsmasq_config_path: PathBuf,

    /// Lines starting with this marker are comments
    pub comment_marker: String,

    /// Require router-reported connectivity when selecting interfaces
    pub use_router_api: bool,

    /// Base URL of the router management API
    pub router_api_url: String,

    /// Seconds a router API response stays cached
    pub router_api_cache_ttl_secs: u64,

    /// Interval of the interface monitor loop
    pub interface_monitor_interval_secs: u64,

    /// Lock file preventing concurrent apply runs
    pub lock_file: PathBuf,

    /// Binaries used by reachability probes
    pub ping_command: String,
    pub traceroute_command: String,

    /// fwmark/table/priority allocated to the first rule; later rules count up
    pub rule_fwmark_base: u32,
    pub rule_table_base: u32,
    pub rule_priority_base: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/pbr-keeper/lists"),
            dnsmasq_config_path: PathBuf::from("/etc/dnsmasq.d/pbr-keeper.conf"),
            comment_marker: "#".to_string(),
            use_router_api: false,
            router_api_url: "http://127.0.0.1:79/rci".to_string(),
            router_api_cache_ttl_secs: 3,
            interface_monitor_interval_secs: 10,
            lock_file: PathBuf::from("/var/run/pbr-keeper.lock"),
            ping_command: "ping".to_string(),
            traceroute_command: "traceroute".to_string(),
            rule_fwmark_base: 1000,
            rule_table_base: 1000,
            rule_priority_base: 1000,
        }
    }
}

impl GeneralConfig {
    /// Record of applied policies, kept beside the list cache.
    pub fn state_path(&self) -> PathBuf {
        self.cache_dir.join(crate::state::STATE_FILE)
    }
}

/// A named list source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListConfig {
    pub name: String,
    #[serde(flatten)]
    pub source: ListSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListSource {
    /// Entries given directly in the configuration
    Inline { entries: Vec<String> },
    /// Local file, re-read when its mtime changes
    File { path: PathBuf },
    /// Remote URL, downloaded into the cache directory
    Url { url: String },
}

impl ListSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ListSource::Inline { .. } => "inline",
            ListSource::File { .. } => "file",
            ListSource::Url { .. } => "url",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    pub fn number(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// ipset family name
    pub fn family(&self) -> &'static str {
        match self {
            IpVersion::V4 => "inet",
            IpVersion::V6 => "inet6",
        }
    }

    /// Flag for the `ip` utility
    pub fn ip_flag(&self) -> &'static str {
        match self {
            IpVersion::V4 => "-4",
            IpVersion::V6 => "-6",
        }
    }

    pub fn iptables(&self) -> &'static str {
        match self {
            IpVersion::V4 => "iptables",
            IpVersion::V6 => "ip6tables",
        }
    }

    pub fn matches(&self, net: &ipnet::IpNet) -> bool {
        matches!(
            (self, net),
            (IpVersion::V4, ipnet::IpNet::V4(_)) | (IpVersion::V6, ipnet::IpNet::V6(_))
        )
    }

    pub fn matches_addr(&self, addr: &std::net::IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpVersion::V4, std::net::IpAddr::V4(_)) | (IpVersion::V6, std::net::IpAddr::V6(_))
        )
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(format!("ip_version must be 4 or 6, got {}", other)),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(v: IpVersion) -> Self {
        v.number()
    }
}

fn default_true() -> bool {
    true
}

/// A routing policy: one address set routed through one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Address set name, also the policy identifier
    pub name: String,
    #[serde(default)]
    pub ip_version: IpVersion,
    pub lists: Vec<String>,
    #[serde(default = "default_true")]
    pub flush_before_applying: bool,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Candidate interfaces in preference order
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "default_true")]
    pub kill_switch: bool,
    pub fwmark: u32,
    pub table: u32,
    pub priority: u32,
    /// DNS server used for this policy's domains (`ip` or `ip:port`)
    #[serde(default)]
    pub override_dns: Option<String>,
    /// Packet-filter rule templates replacing the default marking rule
    #[serde(default)]
    pub custom_rules: Vec<String>,
    /// Redirect matched traffic to a local transparent proxy on this port
    #[serde(default)]
    pub tproxy_port: Option<u16>,
}

/// Interface- or proxy-bound outbound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundConfig {
    Interface {
        tag: String,
        interface: String,
    },
    Proxy {
        tag: String,
        url: String,
        /// Local transparent-proxy listener
        tproxy_port: u16,
    },
}

impl OutboundConfig {
    pub fn tag(&self) -> &str {
        match self {
            OutboundConfig::Interface { tag, .. } | OutboundConfig::Proxy { tag, .. } => tag,
        }
    }

    fn validate(&self) -> std::result::Result<(), PbrError> {
        match self {
            OutboundConfig::Interface { tag, interface } => {
                if interface.is_empty() {
                    return Err(PbrError::Validation(format!(
                        "Outbound '{}': interface name is required",
                        tag
                    )));
                }
                validate_interface_name(interface)
            }
            OutboundConfig::Proxy {
                tag,
                url,
                tproxy_port,
            } => {
                validate_proxy_url(url)
                    .map_err(|e| PbrError::Validation(format!("Outbound '{}': {}", tag, e)))?;
                if *tproxy_port == 0 {
                    return Err(PbrError::Validation(format!(
                        "Outbound '{}': tproxy_port must be non-zero",
                        tag
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Static single outbound or URL-tested selection among several.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundTable {
    Static {
        outbound: String,
    },
    UrlTest {
        outbounds: Vec<String>,
        probe_url: String,
        #[serde(default = "default_probe_interval")]
        interval_secs: u64,
    },
}

fn default_probe_interval() -> u64 {
    300
}

impl OutboundTable {
    pub fn outbound_tags(&self) -> Vec<&str> {
        match self {
            OutboundTable::Static { outbound } => vec![outbound.as_str()],
            OutboundTable::UrlTest { outbounds, .. } => {
                outbounds.iter().map(String::as_str).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleConfig {
    pub name: String,
    pub lists: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default = "default_true")]
    pub kill_switch: bool,
    pub outbound_table: OutboundTable,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }

    /// Validate the whole configuration. No kernel state is touched.
    pub fn validate(&self) -> std::result::Result<(), PbrError> {
        if self.general.comment_marker.chars().any(char::is_whitespace) {
            return Err(PbrError::Validation(
                "comment_marker must not contain whitespace".to_string(),
            ));
        }
        if self.general.use_router_api {
            validate_http_url(&self.general.router_api_url)?;
        }

        let mut list_names = HashSet::new();
        for list in &self.lists {
            validate_list(list)?;
            if !list_names.insert(list.name.as_str()) {
                return Err(PbrError::Conflict(format!(
                    "Duplicate list name '{}'",
                    list.name
                )));
            }
        }

        let mut tags = HashSet::new();
        for outbound in &self.outbounds {
            outbound.validate()?;
            if !tags.insert(outbound.tag()) {
                return Err(PbrError::Conflict(format!(
                    "Duplicate outbound tag '{}'",
                    outbound.tag()
                )));
            }
        }

        for rule in &self.rules {
            self.validate_rule(rule)?;
        }
        self.validate_rule_ids()?;

        let policies = self.policies();
        let mut names = HashSet::new();
        let mut fwmarks = HashMap::new();
        let mut tables = HashMap::new();
        let mut priorities = HashMap::new();

        for policy in &policies {
            validate_policy(policy, &list_names)?;

            if !names.insert(policy.name.as_str()) {
                return Err(PbrError::Conflict(format!(
                    "Duplicate policy name '{}'",
                    policy.name
                )));
            }
            let r = &policy.routing;
            check_unique(&mut fwmarks, "fwmark", r.fwmark, &policy.name)?;
            check_unique(&mut tables, "table", r.table, &policy.name)?;
            check_unique(&mut priorities, "priority", r.priority, &policy.name)?;
        }

        Ok(())
    }

    /// Rule ids are `base + index`; the last one must still fit.
    fn validate_rule_ids(&self) -> std::result::Result<(), PbrError> {
        let Some(last) = self.rules.len().checked_sub(1) else {
            return Ok(());
        };
        let last = u32::try_from(last)
            .map_err(|_| PbrError::Validation("Too many rules".to_string()))?;
        let g = &self.general;
        for (what, base) in [
            ("rule_fwmark_base", g.rule_fwmark_base),
            ("rule_table_base", g.rule_table_base),
            ("rule_priority_base", g.rule_priority_base),
        ] {
            if base.checked_add(last).is_none() {
                return Err(PbrError::Validation(format!(
                    "{} {} leaves no room for {} rules",
                    what,
                    base,
                    self.rules.len()
                )));
            }
        }
        Ok(())
    }

    fn validate_rule(&self, rule: &RuleConfig) -> std::result::Result<(), PbrError> {
        let tags = rule.outbound_table.outbound_tags();
        if tags.is_empty() {
            return Err(PbrError::Validation(format!(
                "Rule '{}': outbound table has no outbounds",
                rule.name
            )));
        }
        if let OutboundTable::UrlTest { probe_url, .. } = &rule.outbound_table {
            validate_http_url(probe_url)?;
        }
        if !tags.iter().any(|tag| self.find_outbound(tag).is_some()) {
            return Err(PbrError::NotFound(format!(
                "Rule '{}': none of the outbounds [{}] exist",
                rule.name,
                tags.join(", ")
            )));
        }
        for server in &rule.dns_servers {
            parse_dns_server(server)?;
        }
        Ok(())
    }

    pub fn find_list(&self, name: &str) -> Option<&ListConfig> {
        self.lists.iter().find(|l| l.name == name)
    }

    pub fn find_outbound(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|o| o.tag() == tag)
    }

    /// All policies: configured ipsets followed by lowered rules.
    pub fn policies(&self) -> Vec<PolicyConfig> {
        let mut policies = self.ipsets.clone();
        policies.extend(
            self.rules
                .iter()
                .enumerate()
                .map(|(idx, rule)| self.lower_rule(idx as u32, rule)),
        );
        policies
    }

    pub fn find_policy(&self, name: &str) -> Option<PolicyConfig> {
        self.policies().into_iter().find(|p| p.name == name)
    }

    /// Lower a rule to a policy. Interface outbounds become candidate
    /// interfaces in table order; the first proxy outbound selects
    /// transparent-proxy redirection.
    fn lower_rule(&self, idx: u32, rule: &RuleConfig) -> PolicyConfig {
        let mut interfaces = Vec::new();
        let mut tproxy_port = None;

        for tag in rule.outbound_table.outbound_tags() {
            match self.find_outbound(tag) {
                Some(OutboundConfig::Interface { interface, .. }) => {
                    interfaces.push(interface.clone())
                }
                Some(OutboundConfig::Proxy {
                    tproxy_port: port, ..
                }) => {
                    tproxy_port.get_or_insert(*port);
                }
                None => {}
            }
        }

        let g = &self.general;
        PolicyConfig {
            name: rule.name.clone(),
            ip_version: IpVersion::V4,
            lists: rule.lists.clone(),
            flush_before_applying: true,
            routing: RoutingConfig {
                interfaces,
                kill_switch: rule.kill_switch,
                // Overflow is rejected by validate
                fwmark: g.rule_fwmark_base.saturating_add(idx),
                table: g.rule_table_base.saturating_add(idx),
                priority: g.rule_priority_base.saturating_add(idx),
                override_dns: rule.dns_servers.first().cloned(),
                custom_rules: Vec::new(),
                tproxy_port,
            },
        }
    }

    /// Names of policies referencing a list.
    pub fn list_references(&self, list_name: &str) -> Vec<String> {
        self.policies()
            .into_iter()
            .filter(|p| p.lists.iter().any(|l| l == list_name))
            .map(|p| p.name)
            .collect()
    }

    pub fn add_list(&mut self, list: ListConfig) -> std::result::Result<(), PbrError> {
        if self.find_list(&list.name).is_some() {
            return Err(PbrError::Conflict(format!(
                "List '{}' already exists",
                list.name
            )));
        }
        validate_list(&list)?;
        self.lists.push(list);
        Ok(())
    }

    pub fn update_list(&mut self, list: ListConfig) -> std::result::Result<(), PbrError> {
        validate_list(&list)?;
        let slot = self
            .lists
            .iter_mut()
            .find(|l| l.name == list.name)
            .ok_or_else(|| PbrError::NotFound(format!("List '{}'", list.name)))?;
        *slot = list;
        Ok(())
    }

    /// Remove a list. Rejected while any policy references it.
    pub fn remove_list(&mut self, name: &str) -> std::result::Result<ListConfig, PbrError> {
        let idx = self
            .lists
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| PbrError::NotFound(format!("List '{}'", name)))?;

        let users = self.list_references(name);
        if !users.is_empty() {
            return Err(PbrError::Conflict(format!(
                "List '{}' is used by: {}",
                name,
                users.join(", ")
            )));
        }
        Ok(self.lists.remove(idx))
    }

    /// Replace all rules at once. Nothing changes unless the resulting
    /// configuration validates.
    pub fn replace_rules(&mut self, rules: Vec<RuleConfig>) -> std::result::Result<(), PbrError> {
        let mut candidate = self.clone();
        candidate.rules = rules;
        candidate.validate()?;
        self.rules = candidate.rules;
        Ok(())
    }
}

fn validate_list(list: &ListConfig) -> std::result::Result<(), PbrError> {
    validate_object_name(&list.name)?;
    match &list.source {
        ListSource::Inline { .. } => Ok(()),
        ListSource::File { path } => {
            if path.as_os_str().is_empty() {
                Err(PbrError::Validation(format!(
                    "List '{}': file path is empty",
                    list.name
                )))
            } else {
                Ok(())
            }
        }
        ListSource::Url { url } => validate_http_url(url),
    }
}

fn validate_policy(
    policy: &PolicyConfig,
    list_names: &HashSet<&str>,
) -> std::result::Result<(), PbrError> {
    validate_object_name(&policy.name)?;

    for list in &policy.lists {
        if !list_names.contains(list.as_str()) {
            return Err(PbrError::NotFound(format!(
                "Policy '{}' references unknown list '{}'",
                policy.name, list
            )));
        }
    }

    let r = &policy.routing;
    if r.fwmark == 0 {
        return Err(PbrError::Validation(format!(
            "Policy '{}': fwmark must be non-zero",
            policy.name
        )));
    }
    if RESERVED_TABLES.contains(&r.table) {
        return Err(PbrError::Validation(format!(
            "Policy '{}': table {} is reserved",
            policy.name, r.table
        )));
    }
    if r.priority == 0 || r.priority >= 32766 {
        return Err(PbrError::Validation(format!(
            "Policy '{}': priority must be between 1 and 32765",
            policy.name
        )));
    }
    if r.tproxy_port.is_none() && r.interfaces.is_empty() && !r.kill_switch {
        return Err(PbrError::Validation(format!(
            "Policy '{}': at least one interface is required",
            policy.name
        )));
    }
    for iface in &r.interfaces {
        validate_interface_name(iface)?;
    }
    if let Some(dns) = &r.override_dns {
        parse_dns_server(dns)?;
    }
    for template in &r.custom_rules {
        validate_template(&policy.name, template)?;
    }
    Ok(())
}

/// Custom rules may only use known placeholders and must reference the set.
fn validate_template(policy: &str, template: &str) -> std::result::Result<(), PbrError> {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let end = rest[start..].find("}}").ok_or_else(|| {
            PbrError::Validation(format!(
                "Policy '{}': unterminated placeholder in '{}'",
                policy, template
            ))
        })?;
        let placeholder = &rest[start..start + end + 2];
        if !TEMPLATE_PLACEHOLDERS.contains(&placeholder) {
            return Err(PbrError::Validation(format!(
                "Policy '{}': unknown placeholder {} in custom rule",
                policy, placeholder
            )));
        }
        rest = &rest[start + end + 2..];
    }
    if !template.contains("{{ipset_name}}") {
        return Err(PbrError::Validation(format!(
            "Policy '{}': custom rule must reference {{{{ipset_name}}}}",
            policy
        )));
    }
    Ok(())
}

fn check_unique(
    seen: &mut HashMap<u32, String>,
    what: &str,
    value: u32,
    owner: &str,
) -> std::result::Result<(), PbrError> {
    if let Some(other) = seen.insert(value, owner.to_string()) {
        return Err(PbrError::Conflict(format!(
            "{} {} is used by both '{}' and '{}'",
            what, value, other, owner
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn inline_list(name: &str, entries: &[&str]) -> ListConfig {
        ListConfig {
            name: name.to_string(),
            source: ListSource::Inline {
                entries: entries.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    pub fn policy(name: &str, id: u32, interfaces: &[&str], lists: &[&str]) -> PolicyConfig {
        PolicyConfig {
            name: name.to_string(),
            ip_version: IpVersion::V4,
            lists: lists.iter().map(|s| s.to_string()).collect(),
            flush_before_applying: true,
            routing: RoutingConfig {
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                kill_switch: true,
                fwmark: id,
                table: id,
                priority: id,
                override_dns: None,
                custom_rules: Vec::new(),
                tproxy_port: None,
            },
        }
    }

    /// `p1` (fwmark/table/priority 100, `[eth1, eth0]`, kill-switch on) over list `l1`.
    pub fn sample_config() -> Config {
        Config {
            lists: vec![inline_list("l1", &["example.com", "10.0.0.0/8", "not a domain!!"])],
            ipsets: vec![policy("p1", 100, &["eth1", "eth0"], &["l1"])],
            ..Default::default()
        }
    }
}
