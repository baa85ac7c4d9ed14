//! Probe command: stream ping/traceroute output until done or interrupted.

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::diagnose::{ProbeEvent, ProbeKind};

pub async fn run(
    config_path: &Path,
    kind: ProbeKind,
    host: &str,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let service = super::build_service(config, true).await?;
    let mut rx = service.diagnostics().probe(kind, host, cancel).await?;

    let mut exit_code = None;
    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else if let ProbeEvent::Line { text } = &event {
            println!("{}", text);
        }
        if let ProbeEvent::Finished { code } = event {
            exit_code = code;
        }
    }

    match exit_code {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => std::process::exit(1),
    }
}
