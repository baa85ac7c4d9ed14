//! Interfaces command: local link state, plus router view when enabled.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::interfaces::{format_report, LocalInterface, Sysfs};
use crate::router_api::InterfaceState;

#[derive(Serialize)]
struct InterfaceView {
    #[serde(flatten)]
    local: LocalInterface,
    #[serde(skip_serializing_if = "Option::is_none")]
    router: Option<InterfaceState>,
}

pub async fn run(config_path: &Path, json: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let service = super::build_service(config, true).await?;
    let interfaces = Sysfs::default().list()?;

    let mut views = Vec::with_capacity(interfaces.len());
    for local in interfaces {
        let router = match service.router() {
            Some(router) => router.interface_state(&local.name).await.ok(),
            None => None,
        };
        views.push(InterfaceView { local, router });
    }

    if json {
        return super::print_json(&views);
    }
    let locals: Vec<LocalInterface> = views.iter().map(|v| v.local.clone()).collect();
    print!("{}", format_report(&locals));
    if service.router().is_some() {
        println!();
        println!("Router connectivity:");
        for view in &views {
            let state = match &view.router {
                Some(s) if s.connected => "connected",
                Some(_) => "not connected",
                None => "unknown to router",
            };
            println!("  {:<15} {}", view.local.name, state);
        }
    }
    Ok(())
}
