//! Check-routing command.

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn run(config_path: &Path, host: &str, json: bool, cancel: CancellationToken) -> Result<()> {
    let config = super::load_config(config_path)?;
    let service = super::build_service(config, false).await?;
    let report = service.diagnostics().check_routing(host, &cancel).await?;

    if json {
        super::print_json(&report)?;
    } else {
        report.print();
    }
    if report.stale {
        std::process::exit(1);
    }
    Ok(())
}
