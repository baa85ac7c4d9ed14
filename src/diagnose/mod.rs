//! Diagnostic & Self-Check Engine.
//!
//! Reads from the list registry, the reconciler's query surface and the
//! router status client. Nothing here mutates kernel state except an
//! explicit self-check repair.

pub mod output;
pub mod probe;
pub mod routing;
pub mod self_check;

use std::sync::Arc;

use crate::config::SharedConfig;
use crate::dns::{HostResolver, SystemResolver};
use crate::lists::ListRegistry;
use crate::reconciler::Reconciler;
use crate::router_api::RouterStatusClient;

pub use output::{
    format_check, print_report, CheckCategory, CheckResult, PolicyMatch, RoutingCheck,
    SelfCheckReport,
};
pub use probe::{ProbeEvent, ProbeKind};
pub use self_check::SelfCheckOptions;

pub struct Diagnostics {
    config: SharedConfig,
    registry: Arc<ListRegistry>,
    reconciler: Arc<Reconciler>,
    router: Option<Arc<RouterStatusClient>>,
    resolver: Arc<dyn HostResolver>,
}

impl Diagnostics {
    pub fn new(
        config: SharedConfig,
        registry: Arc<ListRegistry>,
        reconciler: Arc<Reconciler>,
        router: Option<Arc<RouterStatusClient>>,
    ) -> Arc<Self> {
        Self::with_resolver(config, registry, reconciler, router, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: SharedConfig,
        registry: Arc<ListRegistry>,
        reconciler: Arc<Reconciler>,
        router: Option<Arc<RouterStatusClient>>,
        resolver: Arc<dyn HostResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            reconciler,
            router,
            resolver,
        })
    }
}
