//! # pbr-keeper - policy-based routing for Linux routers
//!
//! Sends traffic for selected destinations (domains, IPs, CIDRs) out of
//! chosen interfaces, with failover between candidates and a kill switch.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap)                                                 │
//! │    └── apply, teardown, download, self-check, probe, ...   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── lists, ipsets, outbounds, rules                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  List Ingestion (reqwest + rustls)                          │
//! │    ├── inline / file / url sources, conditional GET         │
//! │    ├── classification into domains and IP networks          │
//! │    └── dnsmasq ipset/server hooks                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Router Status Client                                       │
//! │    └── short-TTL cache over the router management API       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Reconciler (KernelOps trait)                               │
//! │    ├── ipset, iptables mangle, ip route / ip rule           │
//! │    └── in-memory kernel for tests and dry runs              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Diagnostics                                                │
//! │    └── routing check, self-check, ping/traceroute probes    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`classify`] - List line classification
//! - [`fetcher`] - Local and remote list sources with on-disk cache
//! - [`lists`] - List registry with single-flight resolution
//! - [`dnsmasq`] - Resolver hook generation
//! - [`router_api`] - Router interface status client
//! - [`reconciler`] - Kernel state reconciliation
//! - [`diagnose`] - Routing check, self-check, probes
//! - [`service`] - Apply cycle and interface monitor
//! - [`state`] - Record of applied policies
//! - [`config`] - Configuration parsing and validation

pub mod classify;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod diagnose;
pub mod dns;
pub mod dnsmasq;
pub mod error;
pub mod fetcher;
pub mod interfaces;
pub mod lists;
pub mod lock;
pub mod reconciler;
pub mod router_api;
pub mod service;
pub mod signal;
pub mod state;
pub mod validation;

pub use config::Config;
pub use error::{PbrError, Result};
