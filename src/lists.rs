//! List Registry: named lists, their classified entries and cached stats.
//!
//! Resolution is single-flight per list name: concurrent callers share one
//! fetch-and-parse future instead of downloading the same list twice.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{parse_entries, parse_lines, EntryKind, ParsedList};
use crate::config::{ListConfig, ListSource, SharedConfig};
use crate::error::{PbrError, Result};
use crate::fetcher::{self, Fetcher, RemoteStatus};

/// Lifetime of cached entries and stats.
pub const STATS_TTL: Duration = Duration::from_secs(300);

/// Maximum concurrent downloads in a download pass
const MAX_CONCURRENT_DOWNLOADS: usize = 6;

type SharedResolve = Shared<BoxFuture<'static, Result<Arc<ParsedList>>>>;

/// Derived view of one list.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListStats {
    pub name: String,
    pub source: &'static str,
    pub total: usize,
    pub domains: usize,
    pub ipv4: usize,
    pub ipv6: usize,
    pub invalid_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub computed_at: DateTime<Utc>,
}

impl ListStats {
    fn compute(list: &ListConfig, parsed: &ParsedList) -> Self {
        Self {
            name: list.name.clone(),
            source: list.source.kind(),
            total: parsed.entries.len(),
            domains: parsed.count(EntryKind::Domain),
            ipv4: parsed.count(EntryKind::Ipv4),
            ipv6: parsed.count(EntryKind::Ipv6),
            invalid_lines: parsed.invalid_lines,
            downloaded_at: None,
            last_error: None,
            computed_at: Utc::now(),
        }
    }
}

struct CachedList {
    source: ListSource,
    entries: Arc<ParsedList>,
    stats: ListStats,
    loaded_at: Instant,
    mtime: Option<SystemTime>,
}

impl CachedList {
    fn is_fresh(&self, source: &ListSource, ttl: Duration) -> bool {
        if self.loaded_at.elapsed() >= ttl || &self.source != source {
            return false;
        }
        match source {
            ListSource::File { path } => fetcher::file_mtime(path).ok() == self.mtime,
            _ => true,
        }
    }
}

pub struct ListRegistry {
    config: SharedConfig,
    fetcher: Fetcher,
    cache: RwLock<HashMap<String, CachedList>>,
    inflight: Mutex<HashMap<String, SharedResolve>>,
    ttl: Duration,
}

impl ListRegistry {
    pub fn new(config: SharedConfig, fetcher: Fetcher) -> Arc<Self> {
        Self::with_ttl(config, fetcher, STATS_TTL)
    }

    pub fn with_ttl(config: SharedConfig, fetcher: Fetcher, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            config,
            fetcher,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    async fn list_config(&self, name: &str) -> Result<(ListConfig, String)> {
        let config = self.config.read().await;
        let list = config
            .find_list(name)
            .cloned()
            .ok_or_else(|| PbrError::NotFound(format!("List '{}'", name)))?;
        Ok((list, config.general.comment_marker.clone()))
    }

    async fn cached(&self, list: &ListConfig) -> Option<(Arc<ParsedList>, ListStats)> {
        let cache = self.cache.read().await;
        cache
            .get(&list.name)
            .filter(|c| c.is_fresh(&list.source, self.ttl))
            .map(|c| (c.entries.clone(), c.stats.clone()))
    }

    /// Classified entries of a list, fetching first if the cache is stale.
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<Arc<ParsedList>> {
        let (list, marker) = self.list_config(name).await?;
        if let Some((entries, _)) = self.cached(&list).await {
            return Ok(entries);
        }

        let flight = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| PbrError::Conflict("list registry lock poisoned".to_string()))?;
            match inflight.get(name) {
                Some(existing) => {
                    debug!(list = %name, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(self);
                    let fut = async move {
                        let key = list.name.clone();
                        let result = registry.load(list, marker).await;
                        if let Ok(mut inflight) = registry.inflight.lock() {
                            inflight.remove(&key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(name.to_string(), fut.clone());
                    fut
                }
            }
        };

        flight.await
    }

    /// Like [`resolve`](Self::resolve) but gives up when `cancel` fires.
    /// The shared fetch keeps running for other waiters.
    pub async fn resolve_until(
        self: &Arc<Self>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ParsedList>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PbrError::Cancelled),
            result = self.resolve(name) => result,
        }
    }

    /// Union of several lists, deduplicated across lists.
    pub async fn resolve_all(
        self: &Arc<Self>,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<ParsedList> {
        let mut merged = ParsedList::default();
        for name in names {
            let parsed = self.resolve_until(name, cancel).await?;
            merged.extend_unique(&parsed);
        }
        Ok(merged)
    }

    async fn load(&self, list: ListConfig, marker: String) -> Result<Arc<ParsedList>> {
        let mut mtime = None;
        let mut downloaded_at = None;
        let mut last_error = None;

        let loaded = match &list.source {
            ListSource::Inline { entries } => {
                Ok(parse_lines(entries.iter().map(String::as_str), &marker))
            }
            ListSource::File { path } => fetcher::read_local(path).map(|(content, modified)| {
                mtime = Some(modified);
                parse_entries(&content, &marker)
            }),
            ListSource::Url { url } => {
                self.fetcher
                    .fetch_remote(&list.name, url)
                    .await
                    .map(|fetched| {
                        downloaded_at = fetched.meta.downloaded_at;
                        if let RemoteStatus::Stale(e) = fetched.status {
                            last_error = Some(e);
                        }
                        parse_entries(&fetched.content, &marker)
                    })
            }
        };

        let parsed = match loaded {
            Ok(parsed) => Arc::new(parsed),
            Err(e) => return self.fallback(&list, e).await,
        };

        let mut stats = ListStats::compute(&list, &parsed);
        stats.downloaded_at = downloaded_at;
        stats.last_error = last_error;
        info!(
            list = %list.name,
            "Resolved {} entries ({} invalid lines)",
            fetcher::format_count(stats.total),
            stats.invalid_lines
        );

        let mut cache = self.cache.write().await;
        cache.insert(
            list.name.clone(),
            CachedList {
                source: list.source,
                entries: parsed.clone(),
                stats,
                loaded_at: Instant::now(),
                mtime,
            },
        );
        Ok(parsed)
    }

    /// Serve the previous in-memory entries after a soft failure.
    async fn fallback(&self, list: &ListConfig, err: PbrError) -> Result<Arc<ParsedList>> {
        if !matches!(err, PbrError::TransientNetwork(_) | PbrError::Io(_)) {
            return Err(err);
        }
        let mut cache = self.cache.write().await;
        match cache.get_mut(&list.name) {
            Some(previous) => {
                warn!(list = %list.name, "Refresh failed, keeping previous entries: {}", err);
                previous.stats.last_error = Some(err.to_string());
                Ok(previous.entries.clone())
            }
            None => Err(err),
        }
    }

    /// Stats served from cache unless invalidated or expired.
    pub async fn stats(self: &Arc<Self>, name: &str) -> Result<ListStats> {
        let (list, _) = self.list_config(name).await?;
        if let Some((_, stats)) = self.cached(&list).await {
            return Ok(stats);
        }
        self.resolve(name).await?;
        let cache = self.cache.read().await;
        cache
            .get(name)
            .map(|c| c.stats.clone())
            .ok_or_else(|| PbrError::NotFound(format!("List '{}'", name)))
    }

    pub async fn invalidate(&self, name: &str) {
        if self.cache.write().await.remove(name).is_some() {
            debug!(list = %name, "Invalidated cached entries");
        }
    }

    pub async fn create(&self, list: ListConfig) -> Result<()> {
        let name = list.name.clone();
        self.config.write().await.add_list(list)?;
        self.invalidate(&name).await;
        info!(list = %name, "List created");
        Ok(())
    }

    pub async fn update(&self, list: ListConfig) -> Result<()> {
        let name = list.name.clone();
        self.config.write().await.update_list(list)?;
        self.invalidate(&name).await;
        info!(list = %name, "List updated");
        Ok(())
    }

    /// Delete a list and its cache files. Rejected while referenced.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.config.write().await.remove_list(name)?;
        self.invalidate(name).await;
        for path in [self.fetcher.cache_path(name), self.fetcher.meta_path(name)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(list = %name, "List deleted");
        Ok(())
    }

    /// Remove cache files and cached entries of lists no longer configured.
    pub async fn purge_unreferenced(&self) -> Result<Vec<String>> {
        let keep: HashSet<String> = {
            let config = self.config.read().await;
            config
                .lists
                .iter()
                .filter(|l| matches!(l.source, ListSource::Url { .. }))
                .map(|l| l.name.clone())
                .collect()
        };
        let configured: HashSet<String> = {
            let config = self.config.read().await;
            config.lists.iter().map(|l| l.name.clone()).collect()
        };

        self.cache
            .write()
            .await
            .retain(|name, _| configured.contains(name));

        let purged = fetcher::purge_cache(self.fetcher.cache_dir(), &keep)?;
        if !purged.is_empty() {
            info!("Purged cache for {} unreferenced list(s)", purged.len());
        }
        Ok(purged)
    }

    /// Refresh every remote list, then purge unreferenced cache files.
    /// Per-list failures are reported, not propagated.
    pub async fn download_all(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Result<ListStats>)>> {
        use futures::stream::{self, StreamExt};

        let names: Vec<String> = {
            let config = self.config.read().await;
            config
                .lists
                .iter()
                .filter(|l| matches!(l.source, ListSource::Url { .. }))
                .map(|l| l.name.clone())
                .collect()
        };

        let results = stream::iter(names.into_iter().map(|name| async move {
            self.invalidate(&name).await;
            let result = match self.resolve_until(&name, cancel).await {
                Ok(_) => self.stats(&name).await,
                Err(e) => Err(e),
            };
            (name, result)
        }))
        .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
        .collect::<Vec<_>>()
        .await;

        if cancel.is_cancelled() {
            return Err(PbrError::Cancelled);
        }
        self.purge_unreferenced().await?;
        Ok(results)
    }
}
