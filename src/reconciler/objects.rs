//! Kernel objects managed per policy, and how a policy maps onto them.

use ipnet::IpNet;
use serde::Serialize;
use std::fmt;

use crate::config::{IpVersion, PolicyConfig};
use crate::error::{PbrError, Result};

/// Address set (`hash:net`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SetSpec {
    pub name: String,
    pub ip_version: IpVersion,
}

/// Packet-filter rule, identified by table, chain and match/target args.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FilterRule {
    pub ip_version: IpVersion,
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "dev", rename_all = "lowercase")]
pub enum RouteTarget {
    Dev(String),
    Blackhole,
    /// `local default dev lo`, delivering to a transparent proxy
    Local,
}

/// Default route of a policy table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRoute {
    pub ip_version: IpVersion,
    pub table: u32,
    pub target: RouteTarget,
}

/// `fwmark -> table` rule at a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PolicyRule {
    pub ip_version: IpVersion,
    pub fwmark: u32,
    pub table: u32,
    pub priority: u32,
}

impl fmt::Display for SetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set {} ({})", self.name, self.ip_version.family())
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -t {} {} {}",
            self.ip_version.iptables(),
            self.table,
            self.chain,
            self.spec.join(" ")
        )
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Dev(dev) => write!(f, "dev {}", dev),
            RouteTarget::Blackhole => write!(f, "blackhole"),
            RouteTarget::Local => write!(f, "local dev lo"),
        }
    }
}

impl fmt::Display for TableRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "default route {} table {}", self.target, self.table)
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule fwmark {:#x} lookup {} priority {}",
            self.fwmark, self.table, self.priority
        )
    }
}

/// Kernel objects a policy owns, independent of interface selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyObjects {
    pub set: SetSpec,
    pub filter_rules: Vec<FilterRule>,
    pub rule: PolicyRule,
    pub ip_version: IpVersion,
    pub table: u32,
    pub tproxy_port: Option<u16>,
}

impl PolicyObjects {
    pub fn for_policy(policy: &PolicyConfig) -> Result<Self> {
        let r = &policy.routing;
        let v = policy.ip_version;

        let filter_rules = if !r.custom_rules.is_empty() {
            r.custom_rules
                .iter()
                .map(|t| parse_custom_rule(v, &render_template(t, policy)))
                .collect::<Result<Vec<_>>>()?
        } else if let Some(port) = r.tproxy_port {
            ["tcp", "udp"]
                .iter()
                .map(|proto| tproxy_rule(v, &policy.name, *proto, port, r.fwmark))
                .collect()
        } else {
            vec![mark_rule(v, &policy.name, r.fwmark)]
        };

        Ok(Self {
            set: SetSpec {
                name: policy.name.clone(),
                ip_version: v,
            },
            filter_rules,
            rule: PolicyRule {
                ip_version: v,
                fwmark: r.fwmark,
                table: r.table,
                priority: r.priority,
            },
            ip_version: v,
            table: r.table,
            tproxy_port: r.tproxy_port,
        })
    }

    pub fn route(&self, target: RouteTarget) -> TableRoute {
        TableRoute {
            ip_version: self.ip_version,
            table: self.table,
            target,
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// `-m set --match-set <set> dst -j MARK --set-mark <fwmark>`
pub fn mark_rule(v: IpVersion, set: &str, fwmark: u32) -> FilterRule {
    FilterRule {
        ip_version: v,
        table: "mangle".to_string(),
        chain: "PREROUTING".to_string(),
        spec: strings(&[
            "-m",
            "set",
            "--match-set",
            set,
            "dst",
            "-j",
            "MARK",
            "--set-mark",
            &fwmark.to_string(),
        ]),
    }
}

pub fn tproxy_rule(v: IpVersion, set: &str, proto: &str, port: u16, fwmark: u32) -> FilterRule {
    FilterRule {
        ip_version: v,
        table: "mangle".to_string(),
        chain: "PREROUTING".to_string(),
        spec: strings(&[
            "-p",
            proto,
            "-m",
            "set",
            "--match-set",
            set,
            "dst",
            "-j",
            "TPROXY",
            "--on-port",
            &port.to_string(),
            "--tproxy-mark",
            &fwmark.to_string(),
        ]),
    }
}

pub fn render_template(template: &str, policy: &PolicyConfig) -> String {
    template
        .replace("{{ipset_name}}", &policy.name)
        .replace("{{fwmark}}", &policy.routing.fwmark.to_string())
        .replace("{{table}}", &policy.routing.table.to_string())
        .replace("{{priority}}", &policy.routing.priority.to_string())
}

/// Split a rendered custom rule into table, chain and spec.
/// Accepts `[-t <table>] -A|-I <chain> <spec...>`; table defaults to `filter`.
pub fn parse_custom_rule(v: IpVersion, rendered: &str) -> Result<FilterRule> {
    let mut table = "filter".to_string();
    let mut chain = None;
    let mut spec = Vec::new();

    let mut tokens = rendered.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-t" | "--table" => {
                table = tokens.next().map(str::to_string).ok_or_else(|| {
                    PbrError::Validation(format!("Missing table in custom rule '{}'", rendered))
                })?;
            }
            "-A" | "--append" | "-I" | "--insert" if chain.is_none() => {
                chain = tokens.next().map(str::to_string);
            }
            "-D" | "--delete" | "-F" | "--flush" | "-X" | "-N" | "-P" => {
                return Err(PbrError::Validation(format!(
                    "Custom rule '{}' must append a rule, not {}",
                    rendered, token
                )));
            }
            other => spec.push(other.to_string()),
        }
    }

    let chain = chain.ok_or_else(|| {
        PbrError::Validation(format!("Custom rule '{}' has no -A <chain>", rendered))
    })?;
    if spec.is_empty() {
        return Err(PbrError::Validation(format!(
            "Custom rule '{}' has no match or target",
            rendered
        )));
    }

    Ok(FilterRule {
        ip_version: v,
        table,
        chain,
        spec,
    })
}

/// `ipset restore` script for a set.
///
/// The set is created if missing (`-exist`), optionally flushed, then
/// populated. Entries of the other family and zero-length prefixes (which
/// `hash:net` rejects) are left out; the second value is how many were.
pub fn restore_script(set: &SetSpec, entries: &[IpNet], flush: bool) -> (String, usize) {
    let mut script = format!(
        "create {} hash:net family {} -exist\n",
        set.name,
        set.ip_version.family()
    );
    if flush {
        script.push_str(&format!("flush {}\n", set.name));
    }

    let mut skipped = 0;
    for net in entries {
        if !set.ip_version.matches(net) || net.prefix_len() == 0 {
            skipped += 1;
            continue;
        }
        script.push_str(&format!("add {} {} -exist\n", set.name, net));
    }
    (script, skipped)
}
