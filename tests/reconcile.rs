//! End-to-end reconciliation through the public API, against the
//! in-memory kernel.

use pbr_keeper::config::{self, Config, SharedConfig};
use pbr_keeper::reconciler::{MemoryKernel, RouteTarget};
use pbr_keeper::service::Service;
use std::net::IpAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r##"
general:
  comment_marker: "#"
lists:
  - name: l1
    type: inline
    entries: [example.com, 10.0.0.0/8, "not a domain!!"]
ipsets:
  - name: p1
    ip_version: 4
    lists: [l1]
    routing:
      interfaces: [eth1, eth0]
      kill_switch: true
      fwmark: 100
      table: 100
      priority: 100
outbounds:
  - type: interface
    tag: backup
    interface: eth0
rules:
  - name: r1
    lists: [l1]
    outbound_table:
      type: static
      outbound: backup
"##;

struct Setup {
    dir: TempDir,
    config: SharedConfig,
    kernel: Arc<MemoryKernel>,
    service: Service,
}

async fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    let yaml = format!(
        "{}\n",
        CONFIG.replace(
            "general:\n",
            &format!(
                "general:\n  cache_dir: {}\n  dnsmasq_config_path: {}\n",
                dir.path().join("cache").display(),
                dir.path().join("pbr.conf").display()
            )
        )
    );
    std::fs::write(&path, yaml).unwrap();
    let config = config::shared(Config::load(&path).unwrap());

    let kernel = Arc::new(MemoryKernel::new());
    kernel.set_link("eth1", false);
    kernel.set_link("eth0", true);
    let service = Service::new(config.clone(), kernel.clone()).await.unwrap();
    Setup {
        dir,
        config,
        kernel,
        service,
    }
}

#[tokio::test]
async fn test_first_eligible_interface_and_routing_check() {
    let s = setup().await;
    let report = s.service.apply_cycle(&CancellationToken::new()).await.unwrap();
    assert!(report.is_success());

    let state = s.kernel.snapshot();
    assert_eq!(
        state.routes.get(&(pbr_keeper::config::IpVersion::V4, 100)),
        Some(&RouteTarget::Dev("eth0".to_string()))
    );

    let check = s
        .service
        .diagnostics()
        .check_routing("10.20.30.40", &CancellationToken::new())
        .await
        .unwrap();
    let p1 = check.matches.iter().find(|m| m.policy == "p1").unwrap();
    assert_eq!(p1.ip, "10.20.30.40".parse::<IpAddr>().unwrap());
    assert!(p1.present_in_ipset);
    assert!(p1.should_be_present);
    assert!(!p1.mismatch());
    assert!(!check.stale);
}

#[tokio::test]
async fn test_rule_representation_is_reconciled_too() {
    let s = setup().await;
    let report = s.service.apply_cycle(&CancellationToken::new()).await.unwrap();
    let r1 = report.applied.iter().find(|a| a.policy == "r1").unwrap();
    assert_eq!(r1.route, Some(RouteTarget::Dev("eth0".to_string())));
    assert_eq!(s.kernel.snapshot().rules.len(), 2);

    let hooks = std::fs::read_to_string(s.dir.path().join("pbr.conf")).unwrap();
    assert!(hooks.contains("ipset=/example.com/p1"));
    assert!(hooks.contains("ipset=/example.com/r1"));
}

#[tokio::test]
async fn test_apply_twice_then_teardown() {
    let s = setup().await;
    let cancel = CancellationToken::new();
    s.service.apply_cycle(&cancel).await.unwrap();
    let once = s.kernel.snapshot();
    s.service.apply_cycle(&cancel).await.unwrap();
    assert_eq!(s.kernel.snapshot(), once);

    s.service.teardown_all().await.unwrap();
    assert!(s.kernel.is_clean());
}

#[tokio::test]
async fn test_failover_and_kill_switch() {
    let s = setup().await;
    let cancel = CancellationToken::new();
    s.service.apply_cycle(&cancel).await.unwrap();

    s.kernel.set_link("eth0", false);
    let changes = s.service.monitor_once(&cancel).await.unwrap();
    assert!(changes
        .iter()
        .all(|c| c.to == Some(RouteTarget::Blackhole)));
    assert_eq!(changes.len(), 2);

    s.kernel.set_link("eth1", true);
    let changes = s.service.monitor_once(&cancel).await.unwrap();
    let p1 = changes.iter().find(|c| c.policy == "p1").unwrap();
    assert_eq!(p1.to, Some(RouteTarget::Dev("eth1".to_string())));
    // r1 only has eth0
    assert!(changes.iter().all(|c| c.policy != "r1"));
}

#[tokio::test]
async fn test_delete_referenced_list_conflicts() {
    let s = setup().await;
    let before = s.config.read().await.clone();
    let err = s.service.registry().delete("l1").await.unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert_eq!(*s.config.read().await, before);
}

#[tokio::test]
async fn test_classification_of_sample_list() {
    let s = setup().await;
    let stats = s.service.registry().stats("l1").await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.domains, 1);
    assert_eq!(stats.ipv4, 1);
    assert_eq!(stats.invalid_lines, 1);
}
