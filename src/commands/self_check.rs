//! Self-check command. Human output streams results as they arrive.

use anyhow::Result;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::diagnose::{format_check, print_report, SelfCheckOptions, SelfCheckReport};
use crate::lock::LockGuard;

pub async fn run(config_path: &Path, repair: bool, json: bool, cancel: CancellationToken) -> Result<()> {
    if repair {
        super::require_root()?;
    }
    let config = super::load_config(config_path)?;
    let _lock = if repair {
        Some(LockGuard::acquire(&config.read().await.general.lock_file)?)
    } else {
        None
    };
    let service = super::build_service(config, false).await?;
    let diagnostics = service.diagnostics();

    let report = if json || repair {
        diagnostics
            .self_check(SelfCheckOptions { repair }, &cancel)
            .await?
    } else {
        let start = Instant::now();
        let mut rx = diagnostics.self_check_stream(cancel.clone());
        let mut checks = Vec::new();
        while let Some(check) = rx.recv().await {
            println!("{}", format_check(&check));
            checks.push(check);
        }
        println!();
        SelfCheckReport::new(checks, start.elapsed().as_millis() as u64)
    };

    if json {
        super::print_json(&report)?;
    } else {
        print_report(&report);
    }

    if !report.healthy {
        std::process::exit(1);
    }
    Ok(())
}
