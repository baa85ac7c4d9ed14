//! Lists command: per-list statistics.

use anyhow::Result;
use std::path::Path;

use crate::fetcher::format_count;

pub async fn run(config_path: &Path, json: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let names: Vec<String> = config.read().await.lists.iter().map(|l| l.name.clone()).collect();
    let service = super::build_service(config, true).await?;

    let mut stats = Vec::with_capacity(names.len());
    for name in &names {
        stats.push(service.registry().stats(name).await?);
    }

    if json {
        return super::print_json(&stats);
    }
    println!(
        "{:<20} {:<7} {:>9} {:>8} {:>8} {:>8} {:>8}",
        "List", "Source", "Total", "Domains", "IPv4", "IPv6", "Invalid"
    );
    for s in &stats {
        println!(
            "{:<20} {:<7} {:>9} {:>8} {:>8} {:>8} {:>8}",
            s.name,
            s.source,
            format_count(s.total),
            s.domains,
            s.ipv4,
            s.ipv6,
            s.invalid_lines
        );
        if let Some(e) = &s.last_error {
            println!("    last error: {}", e);
        }
    }
    Ok(())
}
