//! CLI command implementations.

pub mod apply;
pub mod check_routing;
pub mod download;
pub mod interfaces;
pub mod lists;
pub mod probe;
pub mod self_check;
pub mod teardown;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::{self, Config, SharedConfig};
use crate::interfaces::Sysfs;
use crate::reconciler::{KernelOps, MemoryKernel, SystemKernel};
use crate::service::Service;

/// Load and validate the configuration file.
pub(crate) fn load_config(path: &Path) -> Result<SharedConfig> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(config::shared(config))
}

/// Build the service against the live kernel, or an in-memory one seeded
/// with local link state. Read-only commands use the latter.
pub(crate) async fn build_service(config: SharedConfig, dry_run: bool) -> Result<Service> {
    let kernel: Arc<dyn KernelOps> = if dry_run {
        let kernel = MemoryKernel::new();
        match Sysfs::default().list() {
            Ok(interfaces) => {
                for iface in interfaces {
                    kernel.set_link(&iface.name, iface.state.admin_up && iface.state.link_up);
                }
            }
            Err(e) => warn!("No local interface state: {:#}", e),
        }
        Arc::new(kernel)
    } else {
        Arc::new(SystemKernel::new(
            Arc::new(RealCommandExecutor::new()),
            Sysfs::default(),
        ))
    };
    Ok(Service::new(config, kernel).await?)
}

/// Kernel mutation needs root (CAP_NET_ADMIN in practice).
pub(crate) fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        anyhow::bail!("This operation modifies routing state and requires root privileges.");
    }
    Ok(())
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
