//! Network State Reconciler.
//!
//! Turns a policy into kernel state: an address set, packet-marking (or
//! transparent-proxy) rules, a default route in the policy table and a
//! `fwmark -> table` rule. Every step checks for the exact object first, so
//! applying twice changes nothing and teardown of absent objects is a no-op.
//!
//! Callers must not reconcile the same policy concurrently; [`Reconciler`]
//! serializes per policy name, independent policies run in parallel.

pub mod mock;
pub mod objects;
pub mod system;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::ParsedList;
use crate::config::{IpVersion, PolicyConfig};
use crate::error::{PbrError, Result};
use crate::interfaces::LinkState;
use crate::router_api::RouterStatusClient;

pub use mock::MemoryKernel;
pub use objects::{FilterRule, PolicyObjects, PolicyRule, RouteTarget, SetSpec, TableRoute};
pub use system::SystemKernel;

/// Primitive kernel operations. "Already exists" is never an error here;
/// callers check before they create or delete.
#[async_trait]
pub trait KernelOps: Send + Sync {
    async fn set_exists(&self, name: &str) -> Result<bool>;

    /// Create the set if missing, optionally flush it, then add `entries`.
    async fn restore_set(&self, set: &SetSpec, entries: &[IpNet], flush: bool) -> Result<()>;

    async fn destroy_set(&self, name: &str) -> Result<()>;

    async fn set_contains(&self, name: &str, ip: IpAddr) -> Result<bool>;

    async fn filter_rule_exists(&self, rule: &FilterRule) -> Result<bool>;

    async fn add_filter_rule(&self, rule: &FilterRule) -> Result<()>;

    async fn delete_filter_rule(&self, rule: &FilterRule) -> Result<()>;

    /// Current default route of a table.
    async fn table_route(&self, v: IpVersion, table: u32) -> Result<Option<RouteTarget>>;

    async fn replace_table_route(&self, route: &TableRoute) -> Result<()>;

    async fn flush_table(&self, v: IpVersion, table: u32) -> Result<()>;

    async fn policy_rule_exists(&self, rule: &PolicyRule) -> Result<bool>;

    async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<()>;

    async fn delete_policy_rule(&self, rule: &PolicyRule) -> Result<()>;

    /// `None` if the interface does not exist.
    async fn link_state(&self, name: &str) -> Result<Option<LinkState>>;
}

/// A kernel object a policy is expected to own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelObject {
    Set(SetSpec),
    FilterRule(FilterRule),
    Route(TableRoute),
    /// Kill-switch off and no eligible interface
    NoRoute { table: u32 },
    Rule(PolicyRule),
}

impl fmt::Display for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelObject::Set(s) => s.fmt(f),
            KernelObject::FilterRule(r) => r.fmt(f),
            KernelObject::Route(r) => r.fmt(f),
            KernelObject::NoRoute { table } => write!(f, "no default route in table {}", table),
            KernelObject::Rule(r) => r.fmt(f),
        }
    }
}

/// Whether one expected object is present in the kernel.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectCheck {
    pub object: String,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub policy: String,
    pub route: Option<RouteTarget>,
    pub entries: usize,
    /// IP entries not added (other family or zero-length prefix)
    pub skipped: usize,
}

/// Route rewritten by failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteChange {
    pub policy: String,
    pub from: Option<RouteTarget>,
    pub to: Option<RouteTarget>,
}

pub struct Reconciler {
    kernel: Arc<dyn KernelOps>,
    router: Option<Arc<RouterStatusClient>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PbrError::Cancelled)
    } else {
        Ok(())
    }
}

impl Reconciler {
    /// `router` enables connectivity checks during interface selection.
    pub fn new(kernel: Arc<dyn KernelOps>, router: Option<Arc<RouterStatusClient>>) -> Self {
        Self {
            kernel,
            router,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn kernel(&self) -> &Arc<dyn KernelOps> {
        &self.kernel
    }

    fn policy_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// First candidate that exists, is up with carrier and, with router
    /// status enabled, is reported connected. An unreachable router API
    /// degrades to local state.
    pub async fn select_interface(&self, policy: &PolicyConfig, fresh: bool) -> Option<String> {
        for iface in &policy.routing.interfaces {
            let local = match self.kernel.link_state(iface).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    debug!(policy = %policy.name, "Interface {} does not exist", iface);
                    continue;
                }
                Err(e) => {
                    warn!(policy = %policy.name, "Cannot read state of {}: {}", iface, e);
                    continue;
                }
            };
            if !local.admin_up || !local.link_up {
                debug!(policy = %policy.name, "Interface {} is down", iface);
                continue;
            }

            if let Some(router) = &self.router {
                let state = if fresh {
                    router.interface_state_fresh(iface).await
                } else {
                    router.interface_state(iface).await
                };
                match state {
                    Ok(s) if s.connected => {}
                    Ok(_) => {
                        debug!(policy = %policy.name, "Router reports {} not connected", iface);
                        continue;
                    }
                    Err(PbrError::NotFound(_)) => {
                        debug!(policy = %policy.name, "Router does not know {}, using local state", iface);
                    }
                    Err(e) => {
                        warn!(policy = %policy.name, "{}; using local interface state", e);
                    }
                }
            }
            return Some(iface.clone());
        }
        None
    }

    /// Route the policy table should carry right now.
    pub async fn desired_route(&self, policy: &PolicyConfig, fresh: bool) -> Option<RouteTarget> {
        if policy.routing.tproxy_port.is_some() {
            return Some(RouteTarget::Local);
        }
        match self.select_interface(policy, fresh).await {
            Some(iface) => Some(RouteTarget::Dev(iface)),
            None if policy.routing.kill_switch => Some(RouteTarget::Blackhole),
            None => None,
        }
    }

    /// Bring a policy's kernel state in line with its configuration.
    ///
    /// Cancellation is checked between objects, never inside one.
    pub async fn apply(
        &self,
        policy: &PolicyConfig,
        entries: &ParsedList,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let lock = self.policy_lock(&policy.name);
        let _guard = lock.lock().await;
        let objects = PolicyObjects::for_policy(policy)?;
        checkpoint(cancel)?;

        // Address set
        let nets: Vec<IpNet> = entries.networks().copied().collect();
        let existed = self.kernel.set_exists(&objects.set.name).await?;
        let flush = existed && policy.flush_before_applying;
        self.kernel.restore_set(&objects.set, &nets, flush).await?;
        let (_, skipped) = objects::restore_script(&objects.set, &nets, false);
        debug!(
            policy = %policy.name,
            "Set {} with {} entries",
            if existed { "refreshed" } else { "created" },
            nets.len() - skipped
        );
        checkpoint(cancel)?;

        // Marking / redirection rules
        for rule in &objects.filter_rules {
            if !self.kernel.filter_rule_exists(rule).await? {
                self.kernel.add_filter_rule(rule).await?;
                debug!(policy = %policy.name, "Added {}", rule);
            }
        }
        checkpoint(cancel)?;

        // Table default route
        let route = self.desired_route(policy, false).await;
        self.reconcile_route(&objects, route.clone()).await?;
        checkpoint(cancel)?;

        // fwmark -> table
        if !self.kernel.policy_rule_exists(&objects.rule).await? {
            self.kernel.add_policy_rule(&objects.rule).await?;
            debug!(policy = %policy.name, "Added {}", objects.rule);
        }

        info!(
            policy = %policy.name,
            "Applied: {} entries, route {}",
            nets.len() - skipped,
            route
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(ApplyReport {
            policy: policy.name.clone(),
            route,
            entries: nets.len() - skipped,
            skipped,
        })
    }

    async fn reconcile_route(
        &self,
        objects: &PolicyObjects,
        desired: Option<RouteTarget>,
    ) -> Result<Option<RouteTarget>> {
        let current = self
            .kernel
            .table_route(objects.ip_version, objects.table)
            .await?;
        if current == desired {
            return Ok(current);
        }
        match desired {
            Some(target) => {
                self.kernel
                    .replace_table_route(&objects.route(target))
                    .await?
            }
            None => {
                self.kernel
                    .flush_table(objects.ip_version, objects.table)
                    .await?
            }
        }
        Ok(current)
    }

    /// Re-evaluate interface selection and rewrite only the table route.
    /// Returns the change, if any.
    pub async fn failover(
        &self,
        policy: &PolicyConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<RouteChange>> {
        let lock = self.policy_lock(&policy.name);
        let _guard = lock.lock().await;
        checkpoint(cancel)?;

        let objects = PolicyObjects::for_policy(policy)?;
        let desired = self.desired_route(policy, true).await;
        let previous = self.reconcile_route(&objects, desired.clone()).await?;
        if previous == desired {
            return Ok(None);
        }

        info!(
            policy = %policy.name,
            "Failover: {:?} -> {:?}",
            previous, desired
        );
        Ok(Some(RouteChange {
            policy: policy.name.clone(),
            from: previous,
            to: desired,
        }))
    }

    /// Remove a policy's objects in reverse order of creation. Every step
    /// is attempted; failures are collected.
    pub async fn teardown(&self, policy: &PolicyConfig) -> Result<()> {
        let lock = self.policy_lock(&policy.name);
        let _guard = lock.lock().await;
        let objects = PolicyObjects::for_policy(policy)?;
        let mut errors = Vec::new();

        for rule in &objects.filter_rules {
            if let Err(e) = self.remove_filter_rule(rule).await {
                errors.push(e);
            }
        }

        let rule_result = match self.kernel.policy_rule_exists(&objects.rule).await {
            Ok(true) => self.kernel.delete_policy_rule(&objects.rule).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = rule_result {
            errors.push(e);
        }

        let route_result = match self.kernel.table_route(objects.ip_version, objects.table).await {
            Ok(Some(_)) => self.kernel.flush_table(objects.ip_version, objects.table).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = route_result {
            errors.push(e);
        }

        let set_result = match self.kernel.set_exists(&objects.set.name).await {
            Ok(true) => self.kernel.destroy_set(&objects.set.name).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = set_result {
            errors.push(e);
        }

        if errors.is_empty() {
            info!(policy = %policy.name, "Torn down");
            Ok(())
        } else {
            for e in &errors {
                warn!(policy = %policy.name, "Teardown step failed: {}", e);
            }
            Err(PbrError::Teardown(errors))
        }
    }

    async fn remove_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        if self.kernel.filter_rule_exists(rule).await? {
            self.kernel.delete_filter_rule(rule).await?;
        }
        Ok(())
    }

    /// Objects the policy should own right now, route included.
    pub async fn self_check_targets(&self, policy: &PolicyConfig) -> Result<Vec<KernelObject>> {
        let objects = PolicyObjects::for_policy(policy)?;
        let mut targets = vec![KernelObject::Set(objects.set.clone())];
        targets.extend(
            objects
                .filter_rules
                .iter()
                .cloned()
                .map(KernelObject::FilterRule),
        );
        targets.push(match self.desired_route(policy, true).await {
            Some(target) => KernelObject::Route(objects.route(target)),
            None => KernelObject::NoRoute {
                table: objects.table,
            },
        });
        targets.push(KernelObject::Rule(objects.rule));
        Ok(targets)
    }

    /// Compare expected objects with live kernel state.
    pub async fn inspect(&self, policy: &PolicyConfig) -> Result<Vec<ObjectCheck>> {
        let mut checks = Vec::new();
        for target in self.self_check_targets(policy).await? {
            let (present, detail) = match &target {
                KernelObject::Set(set) => (self.kernel.set_exists(&set.name).await?, None),
                KernelObject::FilterRule(rule) => {
                    (self.kernel.filter_rule_exists(rule).await?, None)
                }
                KernelObject::Rule(rule) => (self.kernel.policy_rule_exists(rule).await?, None),
                KernelObject::Route(route) => {
                    let actual = self.kernel.table_route(route.ip_version, route.table).await?;
                    let present = actual.as_ref() == Some(&route.target);
                    let detail = (!present).then(|| match actual {
                        Some(a) => format!("actual: {}", a),
                        None => "actual: no default route".to_string(),
                    });
                    (present, detail)
                }
                KernelObject::NoRoute { table } => {
                    let actual = self.kernel.table_route(policy.ip_version, *table).await?;
                    let detail = actual.as_ref().map(|a| format!("actual: {}", a));
                    (actual.is_none(), detail)
                }
            };
            checks.push(ObjectCheck {
                object: target.to_string(),
                present,
                detail,
            });
        }
        Ok(checks)
    }

    /// Live membership test against a policy's set.
    pub async fn present_in_set(&self, policy: &PolicyConfig, ip: IpAddr) -> Result<bool> {
        if !policy.ip_version.matches_addr(&ip) || !self.kernel.set_exists(&policy.name).await? {
            return Ok(false);
        }
        self.kernel.set_contains(&policy.name, ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::parse_entries;
    use crate::config::fixtures::policy;
    use crate::router_api::{MockRouterTransport, RouterInterface, InterfaceState};
    use std::time::Duration;

    fn entries() -> ParsedList {
        parse_entries("example.com\n10.0.0.0/8\n192.168.5.0/24\n", "#")
    }

    fn setup(links: &[(&str, bool)]) -> (Arc<MemoryKernel>, Reconciler) {
        let kernel = Arc::new(MemoryKernel::new());
        for (name, up) in links {
            kernel.set_link(name, *up);
        }
        let reconciler = Reconciler::new(kernel.clone(), None);
        (kernel, reconciler)
    }

    #[tokio::test]
    async fn test_apply_selects_first_up_interface() {
        let (kernel, r) = setup(&[("eth1", false), ("eth0", true)]);
        let p = policy("p1", 100, &["eth1", "eth0"], &["l1"]);
        let report = r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.route, Some(RouteTarget::Dev("eth0".to_string())));
        assert_eq!(report.entries, 2);
        let state = kernel.snapshot();
        assert_eq!(state.routes.get(&(IpVersion::V4, 100)), report.route.as_ref());
        assert_eq!(state.rules.len(), 1);
        assert_eq!(state.filter_rules.len(), 1);
        assert!(r.present_in_set(&p, "10.1.2.3".parse().unwrap()).await.unwrap());
        assert!(!r.present_in_set(&p, "8.8.8.8".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (kernel, r) = setup(&[("eth0", true)]);
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        let cancel = CancellationToken::new();
        r.apply(&p, &entries(), &cancel).await.unwrap();
        let once = kernel.snapshot();
        r.apply(&p, &entries(), &cancel).await.unwrap();
        assert_eq!(kernel.snapshot(), once);
    }

    async fn shrink_list(flush: bool) -> bool {
        let (_, r) = setup(&[("eth0", true)]);
        let mut p = policy("p1", 100, &["eth0"], &["l1"]);
        p.flush_before_applying = flush;
        let cancel = CancellationToken::new();
        r.apply(&p, &entries(), &cancel).await.unwrap();
        r.apply(&p, &parse_entries("10.0.0.0/8\n", "#"), &cancel)
            .await
            .unwrap();
        assert!(r.present_in_set(&p, "10.1.2.3".parse().unwrap()).await.unwrap());
        r.present_in_set(&p, "192.168.5.1".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_flush_drops_entries_gone_from_list() {
        assert!(!shrink_list(true).await);
    }

    #[tokio::test]
    async fn test_no_flush_keeps_previous_entries() {
        assert!(shrink_list(false).await);
    }

    #[tokio::test]
    async fn test_teardown_is_left_inverse() {
        let (kernel, r) = setup(&[("eth0", true)]);
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();
        r.teardown(&p).await.unwrap();
        assert!(kernel.is_clean());
        // already absent: no-op
        r.teardown(&p).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_switch_blackhole_and_off() {
        let (kernel, r) = setup(&[("eth0", false), ("eth1", false)]);
        let mut p = policy("p1", 100, &["eth0", "eth1"], &["l1"]);
        let report = r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.route, Some(RouteTarget::Blackhole));

        p.routing.kill_switch = false;
        let change = r.failover(&p, &CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(change.from, Some(RouteTarget::Blackhole));
        assert_eq!(change.to, None);
        assert!(kernel.snapshot().routes.is_empty());
    }

    #[tokio::test]
    async fn test_failover_rewrites_only_route() {
        let (kernel, r) = setup(&[("eth1", true), ("eth0", true)]);
        let p = policy("p1", 100, &["eth1", "eth0"], &["l1"]);
        let cancel = CancellationToken::new();
        r.apply(&p, &entries(), &cancel).await.unwrap();
        let before = kernel.snapshot();

        kernel.set_link("eth1", false);
        let change = r.failover(&p, &cancel).await.unwrap().unwrap();
        assert_eq!(change.to, Some(RouteTarget::Dev("eth0".to_string())));

        let after = kernel.snapshot();
        assert_eq!(after.rules, before.rules);
        assert_eq!(after.filter_rules, before.filter_rules);
        assert_eq!(after.sets, before.sets);

        assert!(r.failover(&p, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_teardown_collects_all_errors() {
        let (kernel, r) = setup(&[("eth0", true)]);
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();

        kernel.fail_on("rule fwmark");
        kernel.fail_on("table 100");
        let err = r.teardown(&p).await.unwrap_err();
        match err {
            PbrError::Teardown(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        // steps after a failure still ran
        let state = kernel.snapshot();
        assert!(state.filter_rules.is_empty());
        assert!(state.sets.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_apply_leaves_no_partial_object() {
        let (kernel, r) = setup(&[("eth0", true)]);
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            r.apply(&p, &entries(), &cancel).await,
            Err(PbrError::Cancelled)
        ));
        assert!(kernel.is_clean());
    }

    #[tokio::test]
    async fn test_tool_error_does_not_roll_back() {
        let (kernel, r) = setup(&[("eth0", true)]);
        kernel.fail_on("default route");
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        let err = r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), "external_tool");
        let state = kernel.snapshot();
        assert_eq!(state.sets.len(), 1);
        assert_eq!(state.filter_rules.len(), 1);
        assert!(state.rules.is_empty());
    }

    #[tokio::test]
    async fn test_tproxy_policy_routes_locally() {
        let (kernel, r) = setup(&[]);
        let mut p = policy("proxied", 200, &[], &["l1"]);
        p.routing.tproxy_port = Some(12345);
        let report = r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.route, Some(RouteTarget::Local));
        assert_eq!(kernel.snapshot().filter_rules.len(), 2);
    }

    #[tokio::test]
    async fn test_router_connectivity_required() {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.set_link("eth1", true);
        kernel.set_link("eth0", true);

        let mut transport = MockRouterTransport::new();
        transport.expect_fetch_interfaces().returning(|| {
            let state = |connected| InterfaceState {
                admin_up: true,
                link_up: true,
                connected,
            };
            Ok(vec![
                RouterInterface {
                    id: "ISP".to_string(),
                    name: "eth1".to_string(),
                    state: state(false),
                },
                RouterInterface {
                    id: "Backup".to_string(),
                    name: "eth0".to_string(),
                    state: state(true),
                },
            ])
        });
        let router = Arc::new(RouterStatusClient::new(
            Arc::new(transport),
            Duration::from_secs(3),
        ));
        let r = Reconciler::new(kernel, Some(router));
        let p = policy("p1", 100, &["eth1", "eth0"], &["l1"]);
        assert_eq!(r.select_interface(&p, false).await, Some("eth0".to_string()));
    }

    #[tokio::test]
    async fn test_router_unreachable_falls_back_to_local() {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.set_link("eth1", true);
        let mut transport = MockRouterTransport::new();
        transport
            .expect_fetch_interfaces()
            .returning(|| Err(anyhow::anyhow!("connection refused")));
        let router = Arc::new(RouterStatusClient::new(
            Arc::new(transport),
            Duration::from_secs(3),
        ));
        let r = Reconciler::new(kernel, Some(router));
        let p = policy("p1", 100, &["eth1"], &["l1"]);
        assert_eq!(r.select_interface(&p, true).await, Some("eth1".to_string()));
    }

    #[tokio::test]
    async fn test_inspect_reports_drift() {
        let (kernel, r) = setup(&[("eth0", true)]);
        let p = policy("p1", 100, &["eth0"], &["l1"]);
        r.apply(&p, &entries(), &CancellationToken::new()).await.unwrap();
        assert!(r.inspect(&p).await.unwrap().iter().all(|c| c.present));

        kernel.set_link("eth0", false);
        let checks = r.inspect(&p).await.unwrap();
        let route = checks.iter().find(|c| c.object.contains("table 100")).unwrap();
        assert!(!route.present);
        assert_eq!(route.detail.as_deref(), Some("actual: dev eth0"));
    }
}
