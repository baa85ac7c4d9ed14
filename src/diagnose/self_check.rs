//! Self-check: independent checks streamed as they complete.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::output::{CheckCategory, CheckResult, SelfCheckReport};
use super::Diagnostics;
use crate::config::{Config, PolicyConfig};
use crate::fetcher::format_count;

#[derive(Debug, Clone, Copy, Default)]
pub struct SelfCheckOptions {
    /// Re-apply policies whose kernel objects drifted
    pub repair: bool,
}

const STREAM_BUFFER: usize = 32;

type Check<'a> = BoxFuture<'a, CheckResult>;

async fn timed<F>(check: F) -> CheckResult
where
    F: std::future::Future<Output = CheckResult>,
{
    let start = Instant::now();
    let result = check.await;
    let elapsed = start.elapsed().as_millis() as u64;
    result.with_duration(elapsed)
}

impl Diagnostics {
    /// Start every check and yield results in completion order. The stream
    /// ends early if `cancel` fires or the receiver is dropped.
    pub fn self_check_stream(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<CheckResult> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let config = this.config.read().await.clone();
            let mut pending: FuturesUnordered<Check<'_>> = this.checks(&config).into_iter().collect();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    next = pending.next() => match next {
                        Some(result) => {
                            if tx.send(result).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        rx
    }

    /// Run all checks to completion and aggregate them. With `repair`,
    /// policies whose kernel check failed are re-applied and the outcome
    /// is appended as extra checks.
    pub async fn self_check(
        self: &Arc<Self>,
        options: SelfCheckOptions,
        cancel: &CancellationToken,
    ) -> crate::error::Result<SelfCheckReport> {
        let start = Instant::now();
        let mut rx = self.self_check_stream(cancel.clone());
        let mut checks = Vec::new();
        while let Some(check) = rx.recv().await {
            checks.push(check);
        }
        if cancel.is_cancelled() {
            return Err(crate::error::PbrError::Cancelled);
        }

        if options.repair {
            let drifted: Vec<String> = checks
                .iter()
                .filter(|c| c.category == CheckCategory::Kernel && !c.passed)
                .filter_map(|c| c.name.strip_prefix("kernel:").map(str::to_string))
                .collect();
            for name in drifted {
                checks.push(timed(self.repair(&name, cancel)).await);
            }
        }

        Ok(SelfCheckReport::new(checks, start.elapsed().as_millis() as u64))
    }

    fn checks<'a>(&'a self, config: &'a Config) -> Vec<Check<'a>> {
        let policies = config.policies();
        let mut checks: Vec<Check<'a>> = vec![timed(check_config(config)).boxed()];

        let interfaces: BTreeSet<String> = policies
            .iter()
            .flat_map(|p| p.routing.interfaces.iter().cloned())
            .collect();
        for iface in interfaces {
            checks.push(timed(self.check_interface(iface)).boxed());
        }

        checks.push(timed(self.check_router_api()).boxed());

        for list in &config.lists {
            checks.push(timed(self.check_list(&list.name)).boxed());
        }

        for policy in policies {
            checks.push(timed(self.check_kernel(policy)).boxed());
        }
        checks
    }

    async fn check_interface(&self, name: String) -> CheckResult {
        let check = format!("interface:{}", name);
        let cat = CheckCategory::Interfaces;
        match self.reconciler.kernel().link_state(&name).await {
            Ok(None) => CheckResult::fail(cat, check, "does not exist"),
            Ok(Some(state)) if !state.admin_up => {
                CheckResult::pass(cat, check, "administratively down, not eligible")
            }
            Ok(Some(state)) if !state.link_up => {
                CheckResult::pass(cat, check, "no carrier, not eligible")
            }
            Ok(Some(_)) => CheckResult::pass(cat, check, "up"),
            Err(e) => CheckResult::fail(cat, check, e.to_string()),
        }
    }

    async fn check_router_api(&self) -> CheckResult {
        let cat = CheckCategory::RouterApi;
        let Some(router) = &self.router else {
            return CheckResult::pass(cat, "router_api", "disabled");
        };
        match router.list_interfaces_fresh().await {
            Ok(names) => CheckResult::pass(
                cat,
                "router_api",
                format!("reachable, {} interfaces", names.len()),
            ),
            Err(e) => CheckResult::fail(cat, "router_api", e.to_string()),
        }
    }

    async fn check_list(&self, name: &str) -> CheckResult {
        let check = format!("list:{}", name);
        let cat = CheckCategory::Lists;
        match self.registry.stats(name).await {
            Ok(stats) => {
                let summary = format!(
                    "{} entries ({} domains, {} IPv4, {} IPv6), {} invalid lines",
                    format_count(stats.total),
                    stats.domains,
                    stats.ipv4,
                    stats.ipv6,
                    stats.invalid_lines
                );
                let context = serde_json::to_value(&stats).ok();
                let result = match &stats.last_error {
                    Some(e) => CheckResult::fail(cat, check, format!("{}; serving cached copy: {}", summary, e)),
                    None => CheckResult::pass(cat, check, summary),
                };
                match context {
                    Some(c) => result.with_context(c),
                    None => result,
                }
            }
            Err(e) => CheckResult::fail(cat, check, e.to_string()),
        }
    }

    async fn check_kernel(&self, policy: PolicyConfig) -> CheckResult {
        let check = format!("kernel:{}", policy.name);
        let cat = CheckCategory::Kernel;
        let objects = match self.reconciler.inspect(&policy).await {
            Ok(objects) => objects,
            Err(e) => return CheckResult::fail(cat, check, e.to_string()),
        };

        let missing: Vec<String> = objects
            .iter()
            .filter(|o| !o.present)
            .map(|o| match &o.detail {
                Some(d) => format!("{} ({})", o.object, d),
                None => o.object.clone(),
            })
            .collect();
        let result = if missing.is_empty() {
            CheckResult::pass(cat, check, format!("{} objects present", objects.len()))
        } else {
            CheckResult::fail(cat, check, format!("missing: {}", missing.join("; ")))
        };
        match serde_json::to_value(&objects) {
            Ok(context) => result.with_context(context),
            Err(_) => result,
        }
    }

    async fn repair(&self, name: &str, cancel: &CancellationToken) -> CheckResult {
        let check = format!("repair:{}", name);
        let cat = CheckCategory::Repair;
        let Some(policy) = self.config.read().await.find_policy(name) else {
            return CheckResult::fail(cat, check, "policy no longer configured");
        };
        let entries = match self.registry.resolve_all(&policy.lists, cancel).await {
            Ok(entries) => entries,
            Err(e) => return CheckResult::fail(cat, check, e.to_string()),
        };
        match self.reconciler.apply(&policy, &entries, cancel).await {
            Ok(report) => {
                info!(policy = %name, "Repaired kernel state");
                CheckResult::pass(cat, check, format!("re-applied, {} entries", report.entries))
            }
            Err(e) => {
                warn!(policy = %name, "Repair failed: {}", e);
                CheckResult::fail(cat, check, e.to_string())
            }
        }
    }
}

async fn check_config(config: &Config) -> CheckResult {
    let cat = CheckCategory::Config;
    match config.validate() {
        Ok(()) => CheckResult::pass(
            cat,
            "config",
            format!(
                "valid, {} policies, {} lists",
                config.policies().len(),
                config.lists.len()
            ),
        ),
        Err(e) => CheckResult::fail(cat, "config", e.to_string()),
    }
}
