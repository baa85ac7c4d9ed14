//! List source fetchers: local files and remote URLs with an on-disk cache.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::PbrError;

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size of a single list (50 MB)
pub const MAX_LIST_SIZE: usize = 50 * 1024 * 1024;

const CACHE_EXT: &str = "lst";
const META_SUFFIX: &str = ".meta.json";

/// Validators and bookkeeping stored next to a cached list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// New content was downloaded and cached
    Downloaded,
    /// Server reported the cached copy is current
    NotModified,
    /// Download failed; the last good cached copy is served
    Stale(String),
}

#[derive(Debug)]
pub struct RemoteFetch {
    pub content: String,
    pub status: RemoteStatus,
    pub meta: CacheMeta,
}

/// HTTP client plus the cache directory it persists into
pub struct Fetcher {
    client: Client,
    cache_dir: PathBuf,
    retries: u32,
    retry_delay: Duration,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("pbr-keeper/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            retries: MAX_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Override the retry policy (attempt count and first backoff delay).
    pub fn with_retry_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        cache_path(&self.cache_dir, name)
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", name, META_SUFFIX))
    }

    pub fn load_meta(&self, name: &str) -> CacheMeta {
        std::fs::read_to_string(self.meta_path(name))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn save_meta(&self, name: &str, meta: &CacheMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta).context("Failed to serialize cache metadata")?;
        write_atomic(&self.meta_path(name), &json)
    }

    /// Conditionally download a remote list into the cache.
    ///
    /// A failed download falls back to the cached copy when one exists and
    /// only surfaces as an error when there is nothing to serve.
    pub async fn fetch_remote(
        &self,
        name: &str,
        url: &str,
    ) -> std::result::Result<RemoteFetch, PbrError> {
        let cache_file = self.cache_path(name);
        let has_cache = cache_file.exists();
        let mut meta = if has_cache {
            self.load_meta(name)
        } else {
            CacheMeta::default()
        };

        match self.download(url, &meta).await {
            Ok(Download::NotModified) => {
                let content = read_capped(&cache_file)?;
                debug!(list = %name, "Not modified");
                meta.checked_at = Some(Utc::now());
                meta.last_error = None;
                self.persist_meta(name, &meta);
                Ok(RemoteFetch {
                    content,
                    status: RemoteStatus::NotModified,
                    meta,
                })
            }
            Ok(Download::Body {
                content,
                etag,
                last_modified,
            }) => {
                std::fs::create_dir_all(&self.cache_dir)?;
                write_atomic(&cache_file, content.as_bytes())
                    .with_context(|| format!("Failed to cache list {}", name))
                    .map_err(|e| PbrError::Io(std::io::Error::other(format!("{:#}", e))))?;
                let now = Utc::now();
                meta = CacheMeta {
                    etag,
                    last_modified,
                    downloaded_at: Some(now),
                    checked_at: Some(now),
                    last_error: None,
                };
                self.persist_meta(name, &meta);
                info!(list = %name, "Downloaded {} bytes", format_count(content.len()));
                Ok(RemoteFetch {
                    content,
                    status: RemoteStatus::Downloaded,
                    meta,
                })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if !has_cache {
                    return Err(PbrError::TransientNetwork(format!(
                        "{}: {} (no cached copy)",
                        name, message
                    )));
                }
                warn!(list = %name, "Download failed, serving cached copy: {}", message);
                let content = read_capped(&cache_file)?;
                meta.last_error = Some(message.clone());
                self.persist_meta(name, &meta);
                Ok(RemoteFetch {
                    content,
                    status: RemoteStatus::Stale(message),
                    meta,
                })
            }
        }
    }

    fn persist_meta(&self, name: &str, meta: &CacheMeta) {
        if let Err(e) = self.save_meta(name, meta) {
            warn!(list = %name, "Failed to write cache metadata: {:#}", e);
        }
    }

    /// GET with validators, retrying transport errors and 5xx with backoff
    async fn download(&self, url: &str, meta: &CacheMeta) -> Result<Download> {
        let mut last_error = None;

        for attempt in 0..self.retries {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                debug!("Retry {} after {:?} for {}", attempt, delay, url);
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.get(url);
            if let Some(etag) = &meta.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(lm) = &meta.last_modified {
                request = request.header(IF_MODIFIED_SINCE, lm);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(anyhow::Error::from(e));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(Download::NotModified);
            }
            if status.is_server_error() {
                last_error = Some(anyhow::anyhow!("HTTP {}", status));
                continue;
            }
            if !status.is_success() {
                anyhow::bail!("HTTP {}", status);
            }

            let header = |name| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let etag = header(ETAG);
            let last_modified = header(LAST_MODIFIED);
            let content = read_body(response).await?;

            return Ok(Download::Body {
                content,
                etag,
                last_modified,
            });
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}

enum Download {
    NotModified,
    Body {
        content: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Read a response body, aborting once it exceeds MAX_LIST_SIZE
async fn read_body(mut response: reqwest::Response) -> Result<String> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_LIST_SIZE {
            anyhow::bail!(
                "Response too large: {} bytes (max: {} bytes)",
                len,
                MAX_LIST_SIZE
            );
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read response body")?
    {
        if body.len() + chunk.len() > MAX_LIST_SIZE {
            anyhow::bail!("Downloaded content exceeds {} bytes", MAX_LIST_SIZE);
        }
        body.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Deterministic cache file for a list name.
pub fn cache_path(cache_dir: &Path, name: &str) -> PathBuf {
    cache_dir.join(format!("{}.{}", name, CACHE_EXT))
}

/// Modification time of a local list file.
pub fn file_mtime(path: &Path) -> std::result::Result<SystemTime, PbrError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PbrError::NotFound(format!("List file {}", path.display()))
        } else {
            PbrError::Io(e)
        }
    })?;
    Ok(metadata.modified()?)
}

/// Read a local list file together with its modification time.
pub fn read_local(path: &Path) -> std::result::Result<(String, SystemTime), PbrError> {
    let mtime = file_mtime(path)?;
    let content = read_capped(path)?;
    Ok((content, mtime))
}

fn read_capped(path: &Path) -> std::result::Result<String, PbrError> {
    let len = std::fs::metadata(path)?.len();
    if len as usize > MAX_LIST_SIZE {
        return Err(PbrError::Validation(format!(
            "{} is too large: {} bytes (max: {} bytes)",
            path.display(),
            len,
            MAX_LIST_SIZE
        )));
    }
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write via temp file + rename so readers never observe a partial file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    use tempfile::NamedTempFile;

    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp_file =
        NamedTempFile::new_in(parent_dir).context("Failed to create temporary file")?;
    temp_file.write_all(content)?;
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(path)
        .with_context(|| format!("Failed to persist {:?}", path))?;
    Ok(())
}

/// Delete cache files (and metadata) of lists not in `keep`.
/// Returns the purged list names, sorted.
pub fn purge_cache(cache_dir: &Path, keep: &HashSet<String>) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", cache_dir)),
    };

    let mut purged = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let name = match file_name
            .strip_suffix(META_SUFFIX)
            .or_else(|| file_name.strip_suffix(".lst"))
        {
            Some(name) if !name.starts_with('.') => name,
            _ => continue,
        };
        if keep.contains(name) {
            continue;
        }
        std::fs::remove_file(entry.path())
            .with_context(|| format!("Failed to remove {:?}", entry.path()))?;
        debug!("Purged cache file {}", file_name);
        if !purged.iter().any(|p| p == name) {
            purged.push(name.to_string());
        }
    }

    purged.sort();
    Ok(purged)
}

/// Format a count with K/M suffix
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
