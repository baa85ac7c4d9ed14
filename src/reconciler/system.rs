//! Kernel access through `ipset`, `iptables`/`ip6tables` and `ip`.

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::objects::{restore_script, FilterRule, PolicyRule, RouteTarget, SetSpec, TableRoute};
use super::KernelOps;
use crate::cmd_abstraction::{CommandExecutor, CommandOutput};
use crate::config::IpVersion;
use crate::error::{PbrError, Result};
use crate::interfaces::{LinkState, Sysfs};

const IPSET: &str = "ipset";
const IP: &str = "ip";

/// Upper bound on a single tool invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);
/// Seconds iptables waits for the xtables lock before giving up.
const XTABLES_WAIT_SECS: u64 = 10;

pub struct SystemKernel {
    executor: Arc<dyn CommandExecutor>,
    sysfs: Sysfs,
    timeout: Duration,
}

impl SystemKernel {
    pub fn new(executor: Arc<dyn CommandExecutor>, sysfs: Sysfs) -> Self {
        Self {
            executor,
            sysfs,
            timeout: TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a tool off the async runtime. A non-zero exit is returned, not
    /// raised; failing to run the tool or missing the deadline is an error.
    /// A tool past its deadline is abandoned, not killed.
    async fn exec(
        &self,
        tool: &'static str,
        args: Vec<String>,
        stdin: Option<String>,
        object: &str,
    ) -> Result<CommandOutput> {
        debug!("{} {}", tool, args.join(" "));
        let executor = Arc::clone(&self.executor);
        let task = tokio::task::spawn_blocking(move || match stdin {
            Some(input) => executor.execute_with_stdin(tool, &args, &input),
            None => executor.execute(tool, &args),
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(PbrError::tool(tool, object, format!("{:#}", e))),
            Ok(Err(e)) => Err(PbrError::tool(tool, object, e.to_string())),
            Err(_) => {
                warn!("{} on {} timed out after {:?}", tool, object, self.timeout);
                Err(PbrError::tool(
                    tool,
                    object,
                    format!("timed out after {}s", self.timeout.as_secs_f32()),
                ))
            }
        }
    }

    fn iptables_args(rule: &FilterRule, action: &str) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            XTABLES_WAIT_SECS.to_string(),
            "-t".to_string(),
            rule.table.clone(),
            action.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.spec.iter().cloned());
        args
    }

    fn rule_args(rule: &PolicyRule, action: &str) -> Vec<String> {
        vec![
            rule.ip_version.ip_flag().to_string(),
            "rule".to_string(),
            action.to_string(),
            "fwmark".to_string(),
            rule.fwmark.to_string(),
            "table".to_string(),
            rule.table.to_string(),
            "priority".to_string(),
            rule.priority.to_string(),
        ]
    }
}

fn iptables_tool(v: IpVersion) -> &'static str {
    v.iptables()
}

#[async_trait]
impl KernelOps for SystemKernel {
    async fn set_exists(&self, name: &str) -> Result<bool> {
        let object = format!("set {}", name);
        let out = self
            .exec(IPSET, vec!["list".into(), "-n".into(), name.into()], None, &object)
            .await?;
        Ok(out.success)
    }

    async fn restore_set(&self, set: &SetSpec, entries: &[IpNet], flush: bool) -> Result<()> {
        let (script, _) = restore_script(set, entries, flush);
        self.exec(IPSET, vec!["restore".into()], Some(script), &set.to_string())
            .await?
            .check(IPSET, set.to_string())?;
        Ok(())
    }

    async fn destroy_set(&self, name: &str) -> Result<()> {
        let object = format!("set {}", name);
        self.exec(IPSET, vec!["destroy".into(), name.into()], None, &object)
            .await?
            .check(IPSET, object)?;
        Ok(())
    }

    async fn set_contains(&self, name: &str, ip: IpAddr) -> Result<bool> {
        let object = format!("set {}", name);
        let out = self
            .exec(
                IPSET,
                vec!["test".into(), name.into(), ip.to_string()],
                None,
                &object,
            )
            .await?;
        if out.success {
            return Ok(true);
        }
        if out.stderr.contains("is NOT in set") {
            return Ok(false);
        }
        Err(PbrError::tool(IPSET, object, out.diagnostic()))
    }

    async fn filter_rule_exists(&self, rule: &FilterRule) -> Result<bool> {
        let tool = iptables_tool(rule.ip_version);
        let out = self
            .exec(tool, Self::iptables_args(rule, "-C"), None, &rule.to_string())
            .await?;
        Ok(out.success)
    }

    async fn add_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        let tool = iptables_tool(rule.ip_version);
        self.exec(tool, Self::iptables_args(rule, "-A"), None, &rule.to_string())
            .await?
            .check(tool, rule.to_string())?;
        Ok(())
    }

    async fn delete_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        let tool = iptables_tool(rule.ip_version);
        self.exec(tool, Self::iptables_args(rule, "-D"), None, &rule.to_string())
            .await?
            .check(tool, rule.to_string())?;
        Ok(())
    }

    async fn table_route(&self, v: IpVersion, table: u32) -> Result<Option<RouteTarget>> {
        let object = format!("table {}", table);
        let out = self
            .exec(
                IP,
                vec![
                    v.ip_flag().into(),
                    "route".into(),
                    "show".into(),
                    "table".into(),
                    table.to_string(),
                ],
                None,
                &object,
            )
            .await?;
        if !out.success {
            if out.stderr.contains("does not exist") {
                return Ok(None);
            }
            return Err(PbrError::tool(IP, object, out.diagnostic()));
        }
        Ok(parse_default_route(&out.stdout))
    }

    async fn replace_table_route(&self, route: &TableRoute) -> Result<()> {
        let v = route.ip_version;
        let mut args: Vec<String> = vec![v.ip_flag().into(), "route".into(), "replace".into()];
        match &route.target {
            RouteTarget::Dev(dev) => {
                args.extend(["default".into(), "dev".into(), dev.clone()]);
            }
            RouteTarget::Blackhole => {
                args.extend(["blackhole".into(), "default".into()]);
            }
            RouteTarget::Local => {
                args.extend(["local".into(), "default".into(), "dev".into(), "lo".into()]);
            }
        }
        args.extend(["table".into(), route.table.to_string()]);

        self.exec(IP, args, None, &route.to_string())
            .await?
            .check(IP, route.to_string())?;
        Ok(())
    }

    async fn flush_table(&self, v: IpVersion, table: u32) -> Result<()> {
        let object = format!("table {}", table);
        self.exec(
            IP,
            vec![
                v.ip_flag().into(),
                "route".into(),
                "flush".into(),
                "table".into(),
                table.to_string(),
            ],
            None,
            &object,
        )
        .await?
        .check(IP, object)?;
        Ok(())
    }

    async fn policy_rule_exists(&self, rule: &PolicyRule) -> Result<bool> {
        let out = self
            .exec(
                IP,
                vec![
                    rule.ip_version.ip_flag().into(),
                    "-N".into(),
                    "rule".into(),
                    "show".into(),
                ],
                None,
                &rule.to_string(),
            )
            .await?
            .check(IP, rule.to_string())?;
        Ok(parse_rules(&out.stdout).contains(&(rule.priority, rule.fwmark, rule.table)))
    }

    async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        self.exec(IP, Self::rule_args(rule, "add"), None, &rule.to_string())
            .await?
            .check(IP, rule.to_string())?;
        Ok(())
    }

    async fn delete_policy_rule(&self, rule: &PolicyRule) -> Result<()> {
        self.exec(IP, Self::rule_args(rule, "del"), None, &rule.to_string())
            .await?
            .check(IP, rule.to_string())?;
        Ok(())
    }

    async fn link_state(&self, name: &str) -> Result<Option<LinkState>> {
        Ok(self.sysfs.link_state(name))
    }
}

/// Default route of `ip route show table N` output.
pub(crate) fn parse_default_route(output: &str) -> Option<RouteTarget> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["blackhole", "default", ..] => return Some(RouteTarget::Blackhole),
            ["local", "default", ..] => return Some(RouteTarget::Local),
            ["default", rest @ ..] => {
                let dev = rest
                    .windows(2)
                    .find(|w| w[0] == "dev")
                    .map(|w| w[1].to_string())?;
                return Some(RouteTarget::Dev(dev));
            }
            _ => {}
        }
    }
    None
}

/// `(priority, fwmark, table)` of fwmark rules in `ip rule show` output.
pub(crate) fn parse_rules(output: &str) -> Vec<(u32, u32, u32)> {
    let mut rules = Vec::new();
    for line in output.lines() {
        let Some((prio, rest)) = line.split_once(':') else {
            continue;
        };
        let Ok(priority) = prio.trim().parse::<u32>() else {
            continue;
        };
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let value_after = |key: &str| {
            tokens
                .windows(2)
                .find(|w| w[0] == key)
                .map(|w| w[1])
        };

        let fwmark = value_after("fwmark").and_then(|m| {
            let m = m.split('/').next().unwrap_or(m);
            match m.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => m.parse().ok(),
            }
        });
        let table = value_after("lookup")
            .or_else(|| value_after("table"))
            .and_then(table_id);

        if let (Some(fwmark), Some(table)) = (fwmark, table) {
            rules.push((priority, fwmark, table));
        }
    }
    rules
}

/// Numeric table id. Builtin names are mapped for tools that ignore `-N`.
fn table_id(token: &str) -> Option<u32> {
    match token {
        "default" => Some(253),
        "main" => Some(254),
        "local" => Some(255),
        _ => token.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::MockCommandExecutor;

    fn kernel(mock: MockCommandExecutor) -> SystemKernel {
        SystemKernel::new(Arc::new(mock), Sysfs::new("/nonexistent"))
    }

    #[test]
    fn test_parse_default_route() {
        assert_eq!(
            parse_default_route("default dev eth0 scope link \n"),
            Some(RouteTarget::Dev("eth0".to_string()))
        );
        assert_eq!(
            parse_default_route("10.0.0.0/8 dev eth1\ndefault via 192.168.1.1 dev ppp0 metric 5\n"),
            Some(RouteTarget::Dev("ppp0".to_string()))
        );
        assert_eq!(parse_default_route("blackhole default \n"), Some(RouteTarget::Blackhole));
        assert_eq!(
            parse_default_route("local default dev lo scope host \n"),
            Some(RouteTarget::Local)
        );
        assert_eq!(parse_default_route(""), None);
    }

    #[test]
    fn test_parse_rules() {
        let out = "0:\tfrom all lookup local\n\
                   100:\tfrom all fwmark 0x64 lookup 100\n\
                   1001:\tfrom all fwmark 0x3e9/0xffffffff lookup 1001\n\
                   32766:\tfrom all lookup main\n";
        assert_eq!(parse_rules(out), vec![(100, 100, 100), (1001, 1001, 1001)]);
    }

    #[test]
    fn test_parse_rules_named_tables() {
        let out = "200:\tfrom all fwmark 0xc8 lookup main\n\
                   201:\tfrom all fwmark 0xc9 lookup vpn\n";
        assert_eq!(parse_rules(out), vec![(200, 200, 254)]);
    }

    #[tokio::test]
    async fn test_rule_lookup_requests_numeric_tables() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "ip" && args == ["-4", "-N", "rule", "show"])
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("1000:\tfrom all fwmark 0x3e8 lookup 1000\n")));

        let rule = PolicyRule {
            ip_version: IpVersion::V4,
            fwmark: 1000,
            table: 1000,
            priority: 1000,
        };
        assert!(kernel(mock).policy_rule_exists(&rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_hung_tool_times_out() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(CommandOutput::ok(""))
        });

        let rule = super::super::objects::mark_rule(IpVersion::V4, "p1", 100);
        let k = kernel(mock).with_timeout(Duration::from_millis(50));
        let err = k.add_filter_rule(&rule).await.unwrap_err();
        assert_eq!(err.code(), "external_tool");
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains(&rule.to_string()));
    }

    #[tokio::test]
    async fn test_restore_set_pipes_script() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .withf(|cmd, args, stdin| {
                cmd == "ipset"
                    && args == ["restore".to_string()]
                    && stdin.starts_with("create p1 hash:net family inet -exist\nflush p1\n")
                    && stdin.contains("add p1 10.0.0.0/8 -exist")
            })
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("")));

        let set = SetSpec {
            name: "p1".to_string(),
            ip_version: IpVersion::V4,
        };
        let entries = vec!["10.0.0.0/8".parse().unwrap()];
        kernel(mock).restore_set(&set, &entries, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_rule_check_uses_dash_c() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "iptables" && args[..6] == ["-w", "10", "-t", "mangle", "-C", "PREROUTING"])
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(1, "iptables: Bad rule")));

        let rule = super::super::objects::mark_rule(IpVersion::V4, "p1", 100);
        assert!(!kernel(mock).filter_rule_exists(&rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_tool_failure_carries_object() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, _| Ok(CommandOutput::failed(2, "Error: Nexthop device is not up.")));

        let route = TableRoute {
            ip_version: IpVersion::V4,
            table: 100,
            target: RouteTarget::Dev("eth0".to_string()),
        };
        let err = kernel(mock).replace_table_route(&route).await.unwrap_err();
        assert_eq!(err.code(), "external_tool");
        let msg = err.to_string();
        assert!(msg.contains("dev eth0 table 100"));
        assert!(msg.contains("Nexthop device is not up"));
    }

    #[tokio::test]
    async fn test_set_contains() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, args| {
                if args[2] == "10.1.2.3" {
                    Ok(CommandOutput::ok("10.1.2.3 is in set p1."))
                } else {
                    Ok(CommandOutput::failed(1, "1.1.1.1 is NOT in set p1."))
                }
            });
        let k = kernel(mock);
        assert!(k.set_contains("p1", "10.1.2.3".parse().unwrap()).await.unwrap());
        assert!(!k.set_contains("p1", "1.1.1.1".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_has_no_route() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, _| Ok(CommandOutput::failed(2, "Error: ipv4: FIB table does not exist.")));
        assert_eq!(kernel(mock).table_route(IpVersion::V4, 100).await.unwrap(), None);
    }
}
