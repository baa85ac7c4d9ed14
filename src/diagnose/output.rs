//! Result structures for self-checks and routing checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Config,
    Interfaces,
    RouterApi,
    Lists,
    Kernel,
    Repair,
}

impl CheckCategory {
    pub const ALL: [CheckCategory; 6] = [
        CheckCategory::Config,
        CheckCategory::Interfaces,
        CheckCategory::RouterApi,
        CheckCategory::Lists,
        CheckCategory::Kernel,
        CheckCategory::Repair,
    ];
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckCategory::Config => write!(f, "Config"),
            CheckCategory::Interfaces => write!(f, "Interfaces"),
            CheckCategory::RouterApi => write!(f, "Router API"),
            CheckCategory::Lists => write!(f, "Lists"),
            CheckCategory::Kernel => write!(f, "Kernel"),
            CheckCategory::Repair => write!(f, "Repair"),
        }
    }
}

/// One self-check outcome
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub category: CheckCategory,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn pass(category: CheckCategory, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category,
            passed: true,
            message: message.into(),
            duration_ms: 0,
            context: None,
        }
    }

    pub fn fail(category: CheckCategory, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(category, name, message)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Aggregated self-check. `healthy` is true only if every check passed.
#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub duration_ms: u64,
    pub summary: Summary,
    pub checks: Vec<CheckResult>,
}

impl SelfCheckReport {
    pub fn new(checks: Vec<CheckResult>, duration_ms: u64) -> Self {
        let passed = checks.iter().filter(|c| c.passed).count();
        Self {
            timestamp: Utc::now(),
            healthy: passed == checks.len(),
            duration_ms,
            summary: Summary {
                total: checks.len(),
                passed,
                failed: checks.len() - passed,
            },
            checks,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// One line of a self-check, as streamed to the terminal
pub fn format_check(check: &CheckResult) -> String {
    let icon = if check.passed { "[OK]" } else { "[FAIL]" };
    format!("  {} {}: {}", icon, check.name, check.message)
}

pub fn print_report(report: &SelfCheckReport) {
    println!("=== pbr-keeper Self-Check ===");
    println!("Timestamp: {}", report.timestamp);
    println!("Duration: {}ms", report.duration_ms);
    println!(
        "  Total: {} | Passed: {} | Failed: {}",
        report.summary.total, report.summary.passed, report.summary.failed
    );
    println!();

    for category in CheckCategory::ALL {
        let checks: Vec<&CheckResult> = report
            .checks
            .iter()
            .filter(|c| c.category == category)
            .collect();
        if checks.is_empty() {
            continue;
        }
        println!("[{}]", category);
        for check in checks {
            println!("{}", format_check(check));
        }
        println!();
    }

    let status = if report.healthy {
        "HEALTHY - All checks passed"
    } else {
        "UNHEALTHY - Kernel state or environment needs attention"
    };
    println!("Overall Status: {}", status);
}

/// How one resolved address relates to one policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyMatch {
    pub policy: String,
    pub ip: IpAddr,
    /// Live kernel membership
    pub present_in_ipset: bool,
    /// Membership derived from the policy's lists
    pub should_be_present: bool,
    /// List entries that make the address belong to the policy
    pub matched_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PolicyMatch {
    pub fn mismatch(&self) -> bool {
        self.present_in_ipset != self.should_be_present
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingCheck {
    pub host: String,
    pub resolved: Vec<IpAddr>,
    pub matches: Vec<PolicyMatch>,
    /// Some policy's kernel set disagrees with its lists; re-apply needed
    pub stale: bool,
}

impl RoutingCheck {
    pub fn print(&self) {
        println!("Host: {}", self.host);
        let resolved: Vec<String> = self.resolved.iter().map(|ip| ip.to_string()).collect();
        println!("Resolved: {}", resolved.join(", "));
        if self.matches.is_empty() {
            println!("No policy matches; traffic uses the main routing table.");
            return;
        }
        for m in &self.matches {
            let flag = if m.mismatch() { " MISMATCH" } else { "" };
            println!(
                "  {} {}: in set={} expected={}{}",
                m.policy, m.ip, m.present_in_ipset, m.should_be_present, flag
            );
            if !m.matched_by.is_empty() {
                println!("      matched by: {}", m.matched_by.join(", "));
            }
            if let Some(e) = &m.error {
                println!("      error: {}", e);
            }
        }
        if self.stale {
            println!("Kernel state is stale; run `pbr-keeper apply`.");
        }
    }
}
