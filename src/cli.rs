//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::diagnose::ProbeKind;

#[derive(Parser)]
#[command(name = "pbr-keeper")]
#[command(author, version, about = "Policy-based routing keeper for Linux routers")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "/etc/pbr-keeper/config.yaml", global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve lists and reconcile every policy
    Apply {
        /// Reconcile against an in-memory kernel and print the result
        #[arg(long)]
        dry_run: bool,

        /// Keep running and fail over routes when interfaces change
        #[arg(long)]
        watch: bool,
    },

    /// Remove every managed kernel object
    Teardown,

    /// Refresh remote lists and purge unreferenced caches
    Download,

    /// Show per-list statistics
    Lists,

    /// Check configuration, interfaces, router API and kernel state
    SelfCheck {
        /// Re-apply policies whose kernel state drifted
        #[arg(long)]
        repair: bool,
    },

    /// Show how a host would be routed
    CheckRouting {
        /// Host name or IP address
        host: String,
    },

    /// Run a reachability probe and stream its output
    Probe {
        #[arg(value_enum)]
        kind: ProbeKind,

        /// Host name or IP address
        host: String,
    },

    /// Show local interfaces and their link state
    Interfaces,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::try_parse_from(["pbr-keeper", "apply", "--dry-run", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Apply {
                dry_run: true,
                watch: false
            }
        ));
        assert_eq!(cli.config, PathBuf::from("/etc/pbr-keeper/config.yaml"));
    }

    #[test]
    fn test_parse_probe() {
        let cli = Cli::try_parse_from(["pbr-keeper", "--json", "probe", "traceroute", "1.1.1.1"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Probe { kind, host } => {
                assert_eq!(kind, ProbeKind::Traceroute);
                assert_eq!(host, "1.1.1.1");
            }
            _ => panic!("expected probe"),
        }
    }

    #[test]
    fn test_parse_check_routing_requires_host() {
        assert!(Cli::try_parse_from(["pbr-keeper", "check-routing"]).is_err());
        let cli = Cli::try_parse_from(["pbr-keeper", "check-routing", "example.com"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckRouting { .. }));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
