//! Live reachability probes (ping, traceroute) streamed line by line.
//!
//! Each invocation spawns one process. Cancelling, or dropping the
//! receiver, kills it.

use serde::Serialize;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Diagnostics;
use crate::classify::is_valid_domain;
use crate::error::{PbrError, Result};

const PROBE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Traceroute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProbeEvent {
    Line { text: String },
    /// Process exited; `code` is `None` when killed by a signal
    Finished { code: Option<i32> },
    Cancelled,
}

/// Arguments for a probe. The target must be an IP literal or a domain,
/// so it can never be read as an option.
pub fn probe_args(kind: ProbeKind, host: &str) -> Result<Vec<String>> {
    let host = host.trim();
    if host.parse::<IpAddr>().is_err() && !is_valid_domain(host) {
        return Err(PbrError::Validation(format!("Invalid probe target '{}'", host)));
    }
    let args: &[&str] = match kind {
        ProbeKind::Ping => &["-c", "4", "-W", "2"],
        ProbeKind::Traceroute => &["-n", "-w", "2", "-q", "1"],
    };
    let mut args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    args.push(host.to_string());
    Ok(args)
}

/// Spawn `program` and stream its stdout and stderr lines.
pub fn run_probe(
    program: &str,
    args: &[String],
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<ProbeEvent>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PbrError::tool(program, format!("probe {}", args.join(" ")), e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel(PROBE_BUFFER);
    let program = program.to_string();

    tokio::spawn(async move {
        let mut out = stdout.map(|s| BufReader::new(s).lines());
        let mut err = stderr.map(|s| BufReader::new(s).lines());

        while out.is_some() || err.is_some() {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    kill(&mut child, &program).await;
                    let _ = tx.send(ProbeEvent::Cancelled).await;
                    return;
                }
                _ = tx.closed() => {
                    kill(&mut child, &program).await;
                    return;
                }
                line = next_line(&mut out) => line,
                line = next_line(&mut err) => line,
            };
            if let Some(text) = line {
                if tx.send(ProbeEvent::Line { text }).await.is_err() {
                    kill(&mut child, &program).await;
                    return;
                }
            }
        }

        let code = tokio::select! {
            _ = cancel.cancelled() => {
                kill(&mut child, &program).await;
                let _ = tx.send(ProbeEvent::Cancelled).await;
                return;
            }
            status = child.wait() => match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Waiting for {}: {}", program, e);
                    None
                }
            },
        };
        debug!("{} exited with {:?}", program, code);
        let _ = tx.send(ProbeEvent::Finished { code }).await;
    });

    Ok(rx)
}

type Lines<R> = Option<tokio::io::Lines<BufReader<R>>>;

/// Next line of a stream; closes the slot at EOF. Pending forever once closed.
async fn next_line<R>(lines: &mut Lines<R>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = lines.as_mut() else {
        return std::future::pending().await;
    };
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(e) => {
            debug!("Probe output read failed: {}", e);
            *lines = None;
            None
        }
    }
}

async fn kill(child: &mut tokio::process::Child, program: &str) {
    if let Err(e) = child.kill().await {
        debug!("Killing {}: {}", program, e);
    } else {
        debug!("Killed {}", program);
    }
}

impl Diagnostics {
    /// Start a probe towards `host` with the configured tool.
    pub async fn probe(
        &self,
        kind: ProbeKind,
        host: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProbeEvent>> {
        let args = probe_args(kind, host)?;
        let program = {
            let config = self.config.read().await;
            match kind {
                ProbeKind::Ping => config.general.ping_command.clone(),
                ProbeKind::Traceroute => config.general.traceroute_command.clone(),
            }
        };
        run_probe(&program, &args, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect(mut rx: mpsc::Receiver<ProbeEvent>) -> Vec<ProbeEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_probe_args() {
        assert_eq!(
            probe_args(ProbeKind::Ping, "10.0.0.1").unwrap(),
            vec!["-c", "4", "-W", "2", "10.0.0.1"]
        );
        assert_eq!(
            probe_args(ProbeKind::Traceroute, "example.com").unwrap().last().unwrap(),
            "example.com"
        );
        assert!(probe_args(ProbeKind::Ping, "-f 10.0.0.1").is_err());
        assert!(probe_args(ProbeKind::Ping, "a;reboot").is_err());
    }

    #[tokio::test]
    async fn test_streams_both_outputs_then_exit_code() {
        let args = vec!["-c".to_string(), "echo a; echo b >&2; exit 3".to_string()];
        let events = collect(run_probe("sh", &args, CancellationToken::new()).unwrap()).await;

        let lines: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProbeEvent::Line { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&"a"));
        assert!(lines.contains(&"b"));
        assert_eq!(events.last(), Some(&ProbeEvent::Finished { code: Some(3) }));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let cancel = CancellationToken::new();
        let args = vec!["30".to_string()];
        let rx = run_probe("sleep", &args, cancel.clone()).unwrap();
        cancel.cancel();
        let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert_eq!(events, vec![ProbeEvent::Cancelled]);
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_error() {
        let err = run_probe("/nonexistent/ping", &[], CancellationToken::new()).unwrap_err();
        assert_eq!(err.code(), "external_tool");
    }
}
