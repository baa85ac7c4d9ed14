//! Record of the policies whose kernel objects were last applied.
//!
//! An apply cycle compares it with the configured policies and tears down
//! objects of policies that were removed or changed fwmark, table,
//! priority or rules. Kept as JSON next to the list cache.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::PolicyConfig;
use crate::fetcher::write_atomic;
use crate::reconciler::PolicyObjects;

/// Dot-prefixed so the cache purge never treats it as a list.
pub const STATE_FILE: &str = ".applied-policies.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppliedState {
    pub updated_at: Option<DateTime<Utc>>,
    pub policies: Vec<PolicyConfig>,
}

impl AppliedState {
    pub fn new(policies: Vec<PolicyConfig>) -> Self {
        Self {
            updated_at: Some(Utc::now()),
            policies,
        }
    }

    /// Missing file means nothing applied yet.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse applied state {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read applied state {}", path.display()))
            }
        }
    }

    /// Write atomically; an empty record removes the file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.policies.is_empty() {
            return match fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("Failed to remove {}", path.display())),
                _ => Ok(()),
            };
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())
    }
}

/// Same kernel objects. Falls back to config equality when a policy's
/// objects cannot be rendered.
fn same_objects(a: &PolicyConfig, b: &PolicyConfig) -> bool {
    match (PolicyObjects::for_policy(a), PolicyObjects::for_policy(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// Recorded policies no configured policy reproduces.
pub fn stale<'a>(recorded: &'a [PolicyConfig], configured: &[PolicyConfig]) -> Vec<&'a PolicyConfig> {
    recorded
        .iter()
        .filter(|old| {
            !configured
                .iter()
                .any(|new| new.name == old.name && same_objects(old, new))
        })
        .collect()
}
