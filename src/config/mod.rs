//! Configuration system for egress-warden.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//! Every flag of `egress-warden run` has a config counterpart, so a project
//! can keep its egress policy next to its code.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/egress-warden/config.toml`
//! 2. User config: `~/.config/egress-warden/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (allow, block, mounts, etc.) are **merged** (appended)
//! - **Scalars** (images, addresses, retries) are **overridden**
//! - **Maps** (`environment.set`) are **merged** (later values override)
//!
//! Merging lists means a later source can never remove a block rule an
//! earlier one added.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{Config, EnvironmentConfig, MountConfig, NetworkConfig, SessionConfig};
