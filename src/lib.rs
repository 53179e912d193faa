//! egress-warden: domain-based egress control for untrusted commands
//!
//! This crate runs a command inside a container whose only route out is a
//! filtering proxy, and admits traffic by destination domain (and, for
//! configured hosts, by HTTPS URL).
//!
//! # Security Model
//!
//! The security model is **fail-closed**: anything not explicitly allowed is
//! denied, block rules win over allow rules, and if any enforcement layer
//! fails to come up the command never starts.
//!
//! # Architecture
//!
//! - **Policy**: domain normalization, allow/block rules and URL patterns
//! - **Enforce**: proxy admission rules, container redirection rules and
//!   host rules derived from one policy and one network topology
//! - **Orchestrator**: network, proxy and execution container lifecycle
//! - **Proxy**: the L7 filtering proxy that runs in its own container
//! - **Sandbox**: session naming, workspaces, session CA, cleanup and the
//!   privilege-dropping entrypoint
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: syslog audit events and JSON access records

#![warn(clippy::all)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod enforce;
pub mod orchestrator;
pub mod policy;
pub mod proxy;
pub mod sandbox;
pub mod telemetry;
