//! Apply command: one reconciliation cycle, optionally followed by the
//! interface monitor.

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lock::LockGuard;
use crate::service::CycleReport;

pub async fn run(
    config_path: &Path,
    dry_run: bool,
    watch: bool,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    if !dry_run {
        super::require_root()?;
    }
    let config = super::load_config(config_path)?;
    let _lock = if dry_run {
        None
    } else {
        Some(LockGuard::acquire(&config.read().await.general.lock_file)?)
    };
    let mut service = super::build_service(config, dry_run).await?;
    if dry_run {
        service = service.without_writes();
    }

    let report = service.apply_cycle(&cancel).await?;
    if json {
        super::print_json(&report)?;
    } else {
        print_report(&report, dry_run);
    }

    if watch && !dry_run {
        service.interface_monitor(&cancel).await;
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &CycleReport, dry_run: bool) {
    if dry_run {
        info!("[DRY-RUN] No kernel state was changed");
    }
    for applied in &report.applied {
        let route = applied
            .route
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "[OK]   {}: {} entries, route {}",
            applied.policy, applied.entries, route
        );
    }
    for removed in &report.removed {
        println!("[DEL]  {}: objects removed", removed);
    }
    for failed in &report.failed {
        println!("[FAIL] {}: {}", failed.policy, failed.message);
    }
    if let Some(e) = &report.dnsmasq_error {
        println!("[FAIL] resolver hooks: {}", e);
    } else if report.dnsmasq_updated && dry_run {
        println!("Resolver hooks would change.");
    } else if report.dnsmasq_updated {
        println!("Resolver hooks updated; reload dnsmasq to pick them up.");
    }
    if !report.purged.is_empty() {
        println!("Purged caches: {}", report.purged.join(", "));
    }
    if let Some(e) = &report.purge_error {
        println!("[FAIL] cache purge: {}", e);
    }
    if let Some(e) = &report.state_error {
        println!("[FAIL] applied state: {}", e);
    }
}
