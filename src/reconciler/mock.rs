//! In-memory kernel.
//!
//! Behaves like the real tools where it matters for reconciliation: rules
//! and `ip rule` entries may be duplicated, deleting something absent fails,
//! a set referenced by a rule cannot be destroyed. Used by tests and by
//! `apply --dry-run`.

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

use super::objects::{FilterRule, PolicyRule, RouteTarget, SetSpec, TableRoute};
use super::KernelOps;
use crate::config::IpVersion;
use crate::error::{PbrError, Result};
use crate::interfaces::LinkState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySet {
    pub ip_version: IpVersion,
    pub members: BTreeSet<IpNet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub sets: BTreeMap<String, MemorySet>,
    pub filter_rules: Vec<FilterRule>,
    pub routes: HashMap<(IpVersion, u32), RouteTarget>,
    pub rules: Vec<PolicyRule>,
    pub links: HashMap<String, LinkState>,
}

#[derive(Default)]
pub struct MemoryKernel {
    state: Mutex<KernelState>,
    failures: Mutex<Vec<String>>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_link(&self, name: &str, up: bool) {
        self.state().links.insert(
            name.to_string(),
            LinkState {
                admin_up: up,
                link_up: up,
            },
        );
    }

    /// Make every mutation whose object description contains `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pattern.to_string());
    }

    pub fn snapshot(&self) -> KernelState {
        self.state().clone()
    }

    /// No managed object left (links aside).
    pub fn is_clean(&self) -> bool {
        let s = self.state();
        s.sets.is_empty() && s.filter_rules.is_empty() && s.routes.is_empty() && s.rules.is_empty()
    }

    fn mutate(&self, tool: &str, object: String) -> Result<()> {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.iter().any(|p| object.contains(p.as_str())) {
            return Err(PbrError::tool(tool, object, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl KernelOps for MemoryKernel {
    async fn set_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().sets.contains_key(name))
    }

    async fn restore_set(&self, set: &SetSpec, entries: &[IpNet], flush: bool) -> Result<()> {
        self.mutate("ipset", set.to_string())?;
        let mut state = self.state();
        let slot = state.sets.entry(set.name.clone()).or_insert_with(|| MemorySet {
            ip_version: set.ip_version,
            members: BTreeSet::new(),
        });
        if slot.ip_version != set.ip_version {
            return Err(PbrError::tool(
                "ipset",
                set.to_string(),
                "The set with the given name already exists with different type",
            ));
        }
        if flush {
            slot.members.clear();
        }
        slot.members.extend(
            entries
                .iter()
                .filter(|n| set.ip_version.matches(n) && n.prefix_len() > 0)
                .copied(),
        );
        Ok(())
    }

    async fn destroy_set(&self, name: &str) -> Result<()> {
        let object = format!("set {}", name);
        self.mutate("ipset", object.clone())?;
        let mut state = self.state();
        if state
            .filter_rules
            .iter()
            .any(|r| r.spec.iter().any(|a| a == name))
        {
            return Err(PbrError::tool(
                "ipset",
                object,
                "Set cannot be destroyed: it is in use by a kernel component",
            ));
        }
        match state.sets.remove(name) {
            Some(_) => Ok(()),
            None => Err(PbrError::tool(
                "ipset",
                object,
                "The set with the given name does not exist",
            )),
        }
    }

    async fn set_contains(&self, name: &str, ip: IpAddr) -> Result<bool> {
        let state = self.state();
        let set = state.sets.get(name).ok_or_else(|| {
            PbrError::tool(
                "ipset",
                format!("set {}", name),
                "The set with the given name does not exist",
            )
        })?;
        Ok(set.members.iter().any(|net| net.contains(&ip)))
    }

    async fn filter_rule_exists(&self, rule: &FilterRule) -> Result<bool> {
        Ok(self.state().filter_rules.contains(rule))
    }

    async fn add_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        let tool = rule.ip_version.iptables();
        self.mutate(tool, rule.to_string())?;
        let mut state = self.state();
        let referenced = rule
            .spec
            .windows(2)
            .find(|w| w[0] == "--match-set")
            .map(|w| w[1].clone());
        if let Some(set) = referenced {
            if !state.sets.contains_key(&set) {
                return Err(PbrError::tool(
                    tool,
                    rule.to_string(),
                    format!("Set {} doesn't exist.", set),
                ));
            }
        }
        state.filter_rules.push(rule.clone());
        Ok(())
    }

    async fn delete_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        let tool = rule.ip_version.iptables();
        self.mutate(tool, rule.to_string())?;
        let mut state = self.state();
        match state.filter_rules.iter().position(|r| r == rule) {
            Some(idx) => {
                state.filter_rules.remove(idx);
                Ok(())
            }
            None => Err(PbrError::tool(
                tool,
                rule.to_string(),
                "Bad rule (does a matching rule exist in that chain?).",
            )),
        }
    }

    async fn table_route(&self, v: IpVersion, table: u32) -> Result<Option<RouteTarget>> {
        Ok(self.state().routes.get(&(v, table)).cloned())
    }

    async fn replace_table_route(&self, route: &TableRoute) -> Result<()> {
        self.mutate("ip", route.to_string())?;
        let mut state = self.state();
        if let RouteTarget::Dev(dev) = &route.target {
            match state.links.get(dev) {
                None => {
                    return Err(PbrError::tool(
                        "ip",
                        route.to_string(),
                        format!("Cannot find device \"{}\"", dev),
                    ))
                }
                Some(link) if !link.admin_up => {
                    return Err(PbrError::tool(
                        "ip",
                        route.to_string(),
                        "Error: Nexthop device is not up.",
                    ))
                }
                Some(_) => {}
            }
        }
        state
            .routes
            .insert((route.ip_version, route.table), route.target.clone());
        Ok(())
    }

    async fn flush_table(&self, v: IpVersion, table: u32) -> Result<()> {
        self.mutate("ip", format!("table {}", table))?;
        self.state().routes.remove(&(v, table));
        Ok(())
    }

    async fn policy_rule_exists(&self, rule: &PolicyRule) -> Result<bool> {
        Ok(self.state().rules.contains(rule))
    }

    async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        self.mutate("ip", rule.to_string())?;
        self.state().rules.push(*rule);
        Ok(())
    }

    async fn delete_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        self.mutate("ip", rule.to_string())?;
        let mut state = self.state();
        match state.rules.iter().position(|r| r == rule) {
            Some(idx) => {
                state.rules.remove(idx);
                Ok(())
            }
            None => Err(PbrError::tool(
                "ip",
                rule.to_string(),
                "RTNETLINK answers: No such file or directory",
            )),
        }
    }

    async fn link_state(&self, name: &str) -> Result<Option<LinkState>> {
        Ok(self.state().links.get(name).copied())
    }
}
