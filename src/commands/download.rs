//! Download command: refresh remote lists.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::fetcher::format_count;
use crate::lists::ListStats;

#[derive(Serialize)]
struct DownloadOutcome {
    list: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<ListStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(config_path: &Path, json: bool, cancel: CancellationToken) -> Result<()> {
    let config = super::load_config(config_path)?;
    let service = super::build_service(config, true).await?;
    let mut results = service.download(&cancel).await?;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let failures = results.iter().filter(|(_, r)| r.is_err()).count();
    if json {
        let outcomes: Vec<DownloadOutcome> = results
            .into_iter()
            .map(|(list, result)| match result {
                Ok(stats) => DownloadOutcome {
                    list,
                    stats: Some(stats),
                    error: None,
                },
                Err(e) => DownloadOutcome {
                    list,
                    stats: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();
        super::print_json(&outcomes)?;
    } else {
        for (name, result) in &results {
            match result {
                Ok(stats) => match &stats.last_error {
                    Some(e) => println!("[STALE] {}: {} entries ({})", name, format_count(stats.total), e),
                    None => println!("[OK]    {}: {} entries", name, format_count(stats.total)),
                },
                Err(e) => println!("[FAIL]  {}: {}", name, e),
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} list(s) failed to download", failures);
    }
    Ok(())
}
