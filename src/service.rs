//! Apply and teardown cycles, download pass and the interface monitor.
//!
//! Wires configuration, list registry, router status client and
//! reconciler together. Policies are reconciled concurrently; one failing
//! policy never blocks the others.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::ParsedList;
use crate::config::{PolicyConfig, SharedConfig};
use crate::diagnose::Diagnostics;
use crate::dnsmasq;
use crate::error::{PbrError, Result};
use crate::fetcher::Fetcher;
use crate::lists::{ListRegistry, ListStats};
use crate::reconciler::{ApplyReport, KernelOps, Reconciler, RouteChange};
use crate::router_api::{RciTransport, RouterStatusClient};
use crate::state::{self, AppliedState};

#[derive(Debug, Clone, Serialize)]
pub struct PolicyFailure {
    pub policy: String,
    pub code: &'static str,
    pub message: String,
}

impl PolicyFailure {
    fn new(policy: &str, err: &PbrError) -> Self {
        Self {
            policy: policy.to_string(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub applied: Vec<ApplyReport>,
    pub failed: Vec<PolicyFailure>,
    /// Previously applied policies whose objects were removed
    pub removed: Vec<String>,
    /// Resolver hook file was rewritten
    pub dnsmasq_updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dnsmasq_error: Option<String>,
    pub purged: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.dnsmasq_error.is_none()
            && self.purge_error.is_none()
            && self.state_error.is_none()
    }
}

pub struct Service {
    config: SharedConfig,
    registry: Arc<ListRegistry>,
    reconciler: Arc<Reconciler>,
    router: Option<Arc<RouterStatusClient>>,
    persist: bool,
}

impl Service {
    /// Build every component from the current configuration.
    pub async fn new(config: SharedConfig, kernel: Arc<dyn KernelOps>) -> Result<Self> {
        let general = config.read().await.general.clone();
        let fetcher = Fetcher::new(&general.cache_dir)?;
        let router = if general.use_router_api {
            let transport = RciTransport::new(&general.router_api_url)?;
            Some(Arc::new(RouterStatusClient::new(
                Arc::new(transport),
                Duration::from_secs(general.router_api_cache_ttl_secs),
            )))
        } else {
            None
        };
        let registry = ListRegistry::new(config.clone(), fetcher);
        let reconciler = Arc::new(Reconciler::new(kernel, router.clone()));
        Ok(Self::from_parts(config, registry, reconciler, router))
    }

    pub fn from_parts(
        config: SharedConfig,
        registry: Arc<ListRegistry>,
        reconciler: Arc<Reconciler>,
        router: Option<Arc<RouterStatusClient>>,
    ) -> Self {
        Self {
            config,
            registry,
            reconciler,
            router,
            persist: true,
        }
    }

    /// Render resolver hooks without writing them and leave the applied
    /// policy record untouched.
    pub fn without_writes(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn registry(&self) -> &Arc<ListRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn router(&self) -> Option<&Arc<RouterStatusClient>> {
        self.router.as_ref()
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Diagnostics::new(
            self.config.clone(),
            self.registry.clone(),
            self.reconciler.clone(),
            self.router.clone(),
        )
    }

    /// One apply cycle: remove objects of policies no longer configured,
    /// resolve lists, reconcile every policy, regenerate the resolver hooks,
    /// purge unreferenced caches.
    ///
    /// Invalid configuration is rejected before any kernel mutation.
    pub async fn apply_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let config = self.config.read().await.clone();
        config.validate()?;
        if cancel.is_cancelled() {
            return Err(PbrError::Cancelled);
        }
        let policies = config.policies();
        let state_path = config.general.state_path();
        let mut report = CycleReport::default();

        let recorded = self.load_state(&state_path);
        let mut retained = Vec::new();
        for old in state::stale(&recorded.policies, &policies) {
            match self.reconciler.teardown(old).await {
                Ok(()) => report.removed.push(old.name.clone()),
                Err(e) => {
                    error!(policy = %old.name, "Removing stale objects failed: {}", e);
                    report.failed.push(PolicyFailure::new(&old.name, &e));
                    retained.push(old.clone());
                }
            }
        }

        info!("Applying {} policies", policies.len());
        let outcomes = join_all(
            policies
                .iter()
                .map(|policy| self.apply_policy(policy, cancel)),
        )
        .await;

        // Recorded even when cancelled: partially applied policies must
        // stay known to later cycles and teardown.
        retained.extend(policies.iter().cloned());
        report.state_error = self.save_state(&state_path, retained);

        if cancel.is_cancelled() {
            info!("Apply cycle cancelled");
            return Err(PbrError::Cancelled);
        }

        let mut hooks: Vec<(&PolicyConfig, Arc<ParsedList>)> = Vec::new();
        for (policy, outcome) in policies.iter().zip(outcomes) {
            match outcome {
                Ok((applied, entries)) => {
                    report.applied.push(applied);
                    hooks.push((policy, entries));
                }
                Err((err, entries)) => {
                    error!(policy = %policy.name, "Apply failed: {}", err);
                    report.failed.push(PolicyFailure::new(&policy.name, &err));
                    if let Some(entries) = entries {
                        hooks.push((policy, entries));
                    }
                }
            }
        }

        let hook_refs: Vec<(&PolicyConfig, &ParsedList)> =
            hooks.iter().map(|(p, e)| (*p, e.as_ref())).collect();
        let hooks_path = &config.general.dnsmasq_config_path;
        match dnsmasq::render(&hook_refs) {
            Ok(content) if !self.persist => {
                report.dnsmasq_updated =
                    std::fs::read_to_string(hooks_path).ok().as_deref() != Some(content.as_str());
            }
            Ok(content) => {
                match dnsmasq::write_if_changed(hooks_path, &content) {
                    Ok(changed) => {
                        if changed {
                            info!("Updated resolver hooks in {}", hooks_path.display());
                        }
                        report.dnsmasq_updated = changed;
                    }
                    Err(e) => {
                        warn!("Failed to write resolver hooks: {:#}", e);
                        report.dnsmasq_error = Some(format!("{:#}", e));
                    }
                }
            }
            Err(e) => report.dnsmasq_error = Some(e.to_string()),
        }

        match self.registry.purge_unreferenced().await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                warn!("Cache purge failed: {}", e);
                report.purge_error = Some(e.to_string());
            }
        }
        info!(
            "Apply cycle done: {} applied, {} failed",
            report.applied.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Resolve and apply one policy. On failure the resolved entries, if
    /// any, are handed back so the policy keeps its resolver hooks.
    async fn apply_policy(
        &self,
        policy: &PolicyConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<(ApplyReport, Arc<ParsedList>), (PbrError, Option<Arc<ParsedList>>)>
    {
        let entries = self
            .registry
            .resolve_all(&policy.lists, cancel)
            .await
            .map(Arc::new)
            .map_err(|e| (e, None))?;
        match self.reconciler.apply(policy, &entries, cancel).await {
            Ok(report) => Ok((report, entries)),
            Err(e) => Err((e, Some(entries))),
        }
    }

    /// Tear down every configured policy and every recorded one. All
    /// policies are attempted; those that fail stay recorded.
    pub async fn teardown_all(&self) -> Result<()> {
        let (configured, state_path) = {
            let config = self.config.read().await;
            (config.policies(), config.general.state_path())
        };
        let recorded = self.load_state(&state_path);
        let mut policies: Vec<PolicyConfig> = state::stale(&recorded.policies, &configured)
            .into_iter()
            .cloned()
            .collect();
        policies.extend(configured);

        let results = join_all(policies.iter().map(|p| self.reconciler.teardown(p))).await;
        let mut errors = Vec::new();
        let mut retained = Vec::new();
        for (policy, result) in policies.into_iter().zip(results) {
            if let Err(e) = result {
                errors.push(e);
                retained.push(policy);
            }
        }
        if let Some(e) = self.save_state(&state_path, retained) {
            errors.push(PbrError::Internal(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PbrError::Teardown(errors))
        }
    }

    /// Unreadable records are logged and treated as empty.
    fn load_state(&self, path: &std::path::Path) -> AppliedState {
        match AppliedState::load(path) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring applied state: {:#}", e);
                AppliedState::default()
            }
        }
    }

    fn save_state(&self, path: &std::path::Path, policies: Vec<PolicyConfig>) -> Option<String> {
        if !self.persist {
            return None;
        }
        match AppliedState::new(policies).save(path) {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to record applied policies: {:#}", e);
                Some(format!("{:#}", e))
            }
        }
    }

    /// Refresh all remote lists, then purge unreferenced caches.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Result<ListStats>)>> {
        self.registry.download_all(cancel).await
    }

    /// One failover pass over every policy with fresh interface state.
    pub async fn monitor_once(&self, cancel: &CancellationToken) -> Result<Vec<RouteChange>> {
        let policies = self.config.read().await.policies();
        let mut changes = Vec::new();
        for policy in &policies {
            match self.reconciler.failover(policy, cancel).await {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(policy = %policy.name, "Failover failed: {}", e),
            }
        }
        Ok(changes)
    }

    /// Poll interface state until cancelled.
    pub async fn interface_monitor(&self, cancel: &CancellationToken) {
        let interval = {
            let config = self.config.read().await;
            Duration::from_secs(config.general.interface_monitor_interval_secs.max(1))
        };
        info!("Interface monitor started ({}s interval)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.monitor_once(cancel).await {
                Ok(changes) => {
                    for change in changes {
                        debug!(policy = %change.policy, "Route changed");
                    }
                }
                Err(_) => break,
            }
        }
        info!("Interface monitor stopped");
    }
}
