//! Router Status Client.
//!
//! Reads interface state from the router's management API (RCI, JSON over
//! HTTP) behind a short-TTL cache so interface selection and diagnostics
//! do not flood the router's control plane.

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{PbrError, Result};

const TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceState {
    pub admin_up: bool,
    pub link_up: bool,
    pub connected: bool,
}

/// One interface as reported by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterInterface {
    /// Router-side identifier (e.g. `Wireguard0`)
    pub id: String,
    /// Kernel interface name (e.g. `nwg0`)
    pub name: String,
    pub state: InterfaceState,
}

/// Read contract of the router management API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouterTransport: Send + Sync {
    async fn fetch_interfaces(&self) -> AnyResult<Vec<RouterInterface>>;
}

/// RCI transport: `GET <base>/show/interface`.
pub struct RciTransport {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RciInterface {
    id: Option<String>,
    #[serde(rename = "interface-name")]
    interface_name: Option<String>,
    state: Option<String>,
    link: Option<String>,
    connected: Option<String>,
}

impl RciTransport {
    pub fn new(base_url: &str) -> AnyResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("pbr-keeper/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Parse the `show/interface` response body.
pub fn parse_rci_interfaces(body: &str) -> AnyResult<Vec<RouterInterface>> {
    let raw: BTreeMap<String, RciInterface> =
        serde_json::from_str(body).context("Unexpected router API response")?;

    let yes = |v: &Option<String>| matches!(v.as_deref(), Some("up") | Some("yes"));
    Ok(raw
        .into_iter()
        .map(|(key, iface)| {
            let id = iface.id.clone().unwrap_or_else(|| key.clone());
            RouterInterface {
                name: iface.interface_name.clone().unwrap_or(key),
                id,
                state: InterfaceState {
                    admin_up: yes(&iface.state),
                    link_up: yes(&iface.link),
                    connected: yes(&iface.connected),
                },
            }
        })
        .collect())
}

#[async_trait]
impl RouterTransport for RciTransport {
    async fn fetch_interfaces(&self) -> AnyResult<Vec<RouterInterface>> {
        let url = format!("{}/show/interface", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Router API unreachable at {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("Router API returned HTTP {}", response.status());
        }
        let body = response.text().await.context("Failed to read router API response")?;
        parse_rci_interfaces(&body)
    }
}

struct Snapshot {
    taken_at: Instant,
    interfaces: Arc<Vec<RouterInterface>>,
}

pub struct RouterStatusClient {
    transport: Arc<dyn RouterTransport>,
    ttl: Duration,
    cache: RwLock<Option<Snapshot>>,
    refresh: Mutex<()>,
}

impl RouterStatusClient {
    pub fn new(transport: Arc<dyn RouterTransport>, ttl: Duration) -> Self {
        Self {
            transport,
            ttl,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    async fn snapshot(&self, force: bool) -> Result<Arc<Vec<RouterInterface>>> {
        if !force {
            if let Some(s) = self.cached().await {
                return Ok(s);
            }
        }

        // One request at a time; waiters reuse the refreshed snapshot.
        let _guard = self.refresh.lock().await;
        if !force {
            if let Some(s) = self.cached().await {
                return Ok(s);
            }
        }

        let interfaces = self
            .transport
            .fetch_interfaces()
            .await
            .map_err(|e| PbrError::TransientNetwork(format!("Router API: {:#}", e)))?;
        debug!("Router API reported {} interfaces", interfaces.len());

        let interfaces = Arc::new(interfaces);
        *self.cache.write().await = Some(Snapshot {
            taken_at: Instant::now(),
            interfaces: interfaces.clone(),
        });
        Ok(interfaces)
    }

    async fn cached(&self) -> Option<Arc<Vec<RouterInterface>>> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.ttl)
            .map(|s| s.interfaces.clone())
    }

    fn find(interfaces: &[RouterInterface], name: &str) -> Result<InterfaceState> {
        interfaces
            .iter()
            .find(|i| i.name == name || i.id == name)
            .map(|i| i.state)
            .ok_or_else(|| PbrError::NotFound(format!("Interface '{}' on router", name)))
    }

    /// State of one interface, matched by kernel name or router id.
    pub async fn interface_state(&self, name: &str) -> Result<InterfaceState> {
        Self::find(&self.snapshot(false).await?, name)
    }

    /// Bypasses the cache.
    pub async fn interface_state_fresh(&self, name: &str) -> Result<InterfaceState> {
        Self::find(&self.snapshot(true).await?, name)
    }

    pub async fn list_interfaces(&self) -> Result<Vec<String>> {
        Ok(self.snapshot(false).await?.iter().map(|i| i.name.clone()).collect())
    }

    pub async fn list_interfaces_fresh(&self) -> Result<Vec<String>> {
        Ok(self.snapshot(true).await?.iter().map(|i| i.name.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RCI_BODY: &str = r#"{
        "ISP": {"id": "GigabitEthernet1", "interface-name": "eth3", "state": "up", "link": "up", "connected": "yes"},
        "Wireguard0": {"id": "Wireguard0", "interface-name": "nwg0", "state": "up", "link": "down", "connected": "no"},
        "Bridge0": {"state": "down"}
    }"#;

    fn sample() -> Vec<RouterInterface> {
        parse_rci_interfaces(RCI_BODY).unwrap()
    }

    #[test]
    fn test_parse_rci_interfaces() {
        let ifaces = sample();
        assert_eq!(ifaces.len(), 3);
        let wg = ifaces.iter().find(|i| i.name == "nwg0").unwrap();
        assert_eq!(wg.id, "Wireguard0");
        assert!(wg.state.admin_up);
        assert!(!wg.state.link_up);
        assert!(!wg.state.connected);

        let bridge = ifaces.iter().find(|i| i.id == "Bridge0").unwrap();
        assert_eq!(bridge.name, "Bridge0");
        assert!(!bridge.state.admin_up);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_rci_interfaces("<html>").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_bounds_request_rate() {
        let mut transport = MockRouterTransport::new();
        transport
            .expect_fetch_interfaces()
            .times(2)
            .returning(|| Ok(sample()));
        let client = RouterStatusClient::new(Arc::new(transport), Duration::from_secs(3));

        assert!(client.interface_state("eth3").await.unwrap().connected);
        assert!(!client.interface_state("Wireguard0").await.unwrap().link_up);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(client.list_interfaces().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_forced_refresh_bypasses_cache() {
        let mut transport = MockRouterTransport::new();
        transport
            .expect_fetch_interfaces()
            .times(2)
            .returning(|| Ok(sample()));
        let client = RouterStatusClient::new(Arc::new(transport), Duration::from_secs(60));

        client.interface_state("eth3").await.unwrap();
        client.interface_state_fresh("eth3").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_vs_not_found() {
        let mut transport = MockRouterTransport::new();
        transport
            .expect_fetch_interfaces()
            .returning(|| Err(anyhow::anyhow!("connection refused")));
        let client = RouterStatusClient::new(Arc::new(transport), Duration::from_secs(3));
        assert!(matches!(
            client.interface_state("eth3").await,
            Err(PbrError::TransientNetwork(_))
        ));

        let mut transport = MockRouterTransport::new();
        transport.expect_fetch_interfaces().returning(|| Ok(sample()));
        let client = RouterStatusClient::new(Arc::new(transport), Duration::from_secs(3));
        assert!(matches!(
            client.interface_state("ppp9").await,
            Err(PbrError::NotFound(_))
        ));
    }
}
