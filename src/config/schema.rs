//! Configuration schema definitions.
//!
//! ```toml
//! [network]
//! allow = ["github.com", "*.githubusercontent.com"]
//! block = ["gist.github.com"]
//! allow_urls = ["https://api.example.com/v1/*"]
//! allow_files = ["/etc/egress-warden/allow.txt"]
//!
//! [session]
//! exec_image = "python:3.12-slim"
//! dns_servers = ["1.1.1.1"]
//! health_retries = 30
//! keep_workspace = false
//!
//! [environment]
//! passthrough = ["GITHUB_TOKEN"]
//! set = { PIP_INDEX_URL = "https://pypi.org/simple" }
//!
//! [[mounts]]
//! host = "/home/dev/project"
//! target = "/work"
//! ```

use super::error::ConfigError;
use crate::enforce::{Ipv4Cidr, NetworkTopology};
use crate::orchestrator::{MountMode, MountSpec};
use crate::policy::{PolicyBuilder, PolicyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Egress policy.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Containers, addresses and timeouts.
    #[serde(default)]
    pub session: SessionConfig,

    /// Environment of the execution environment.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Bind mounts into the execution environment.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are appended, scalars are overridden when set, and maps are
    /// merged with later keys winning.
    pub fn merge(&mut self, other: Config) {
        self.network.merge(other.network);
        self.session.merge(other.session);
        self.environment.merge(other.environment);
        self.mounts.extend(other.mounts);
    }

    /// Collect the policy specs. Domain files are read here.
    pub fn policy_builder(&self) -> Result<PolicyBuilder, PolicyError> {
        let mut builder = PolicyBuilder::new()
            .allow(&self.network.allow)
            .block(&self.network.block)
            .allow_urls(&self.network.allow_urls);
        for path in &self.network.allow_files {
            builder = builder.allow_file(path)?;
        }
        for path in &self.network.block_files {
            builder = builder.block_file(path)?;
        }
        Ok(builder)
    }

    /// Mounts in the orchestrator's form.
    pub fn mount_specs(&self) -> Vec<MountSpec> {
        self.mounts.iter().map(MountConfig::to_spec).collect()
    }
}

/// Network policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Domains to allow. `*.example.com` matches subdomains only.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Domains to block. Block rules win over allow rules.
    #[serde(default)]
    pub block: Vec<String>,

    /// HTTPS URL patterns, checked per request with TLS interception.
    #[serde(default)]
    pub allow_urls: Vec<String>,

    /// Files with one allowed domain per line.
    #[serde(default)]
    pub allow_files: Vec<PathBuf>,

    /// Files with one blocked domain per line.
    #[serde(default)]
    pub block_files: Vec<PathBuf>,
}

impl NetworkConfig {
    fn merge(&mut self, other: NetworkConfig) {
        self.allow.extend(other.allow);
        self.block.extend(other.block);
        self.allow_urls.extend(other.allow_urls);
        self.allow_files.extend(other.allow_files);
        self.block_files.extend(other.block_files);
    }
}

/// Session settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Image the proxy container runs.
    #[serde(default)]
    pub proxy_image: Option<String>,

    /// Image the user command runs in.
    #[serde(default)]
    pub exec_image: Option<String>,

    /// Subnet of the isolated network, e.g. `172.30.0.0/24`.
    #[serde(default)]
    pub subnet: Option<Ipv4Cidr>,

    #[serde(default)]
    pub proxy_ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub exec_ip: Option<Ipv4Addr>,

    /// Resolvers DNS may reach. Empty keeps the built-in pair.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,

    /// Proxy health checks before giving up.
    #[serde(default)]
    pub health_retries: Option<u32>,

    /// Delay between health checks in milliseconds.
    #[serde(default)]
    pub health_interval_ms: Option<u64>,

    /// Keep the workspace (access log, rendered rules) after the run.
    #[serde(default)]
    pub keep_workspace: Option<bool>,
}

impl SessionConfig {
    fn merge(&mut self, other: SessionConfig) {
        macro_rules! override_if_set {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        override_if_set!(
            proxy_image,
            exec_image,
            subnet,
            proxy_ip,
            exec_ip,
            health_retries,
            health_interval_ms,
            keep_workspace
        );
        self.dns_servers.extend(other.dns_servers);
    }

    /// The topology with configured overrides applied.
    ///
    /// Moving the subnet without naming addresses keeps the `.10`/`.20`
    /// host parts of the default layout.
    pub fn topology(&self) -> Result<NetworkTopology, ConfigError> {
        let mut topology = NetworkTopology::default();

        if let Some(subnet) = self.subnet {
            let base = u32::from(subnet.network());
            let host = |ip: Ipv4Addr| Ipv4Addr::from(base | (u32::from(ip) & 0xff));
            topology.proxy_ip = host(topology.proxy_ip);
            topology.exec_ip = host(topology.exec_ip);
            topology.subnet = subnet;
        }
        if let Some(ip) = self.proxy_ip {
            topology.proxy_ip = ip;
        }
        if let Some(ip) = self.exec_ip {
            topology.exec_ip = ip;
        }
        if !self.dns_servers.is_empty() {
            topology.dns_servers = self.dns_servers.clone();
        }

        topology.validate().map_err(|e| ConfigError::InvalidValue {
            field: "session".to_string(),
            message: e.to_string(),
        })?;
        Ok(topology)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        self.health_interval_ms.map(Duration::from_millis)
    }
}

/// Environment configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Host variables copied in when set.
    #[serde(default)]
    pub passthrough: Vec<String>,

    /// Fixed values. These win over passthrough.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    fn merge(&mut self, other: EnvironmentConfig) {
        self.passthrough.extend(other.passthrough);
        self.set.extend(other.set);
    }

    /// Resolve to `(name, value)` pairs, reading passthrough names with
    /// `lookup`. Missing host variables are skipped.
    pub fn resolve<F>(&self, lookup: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env: BTreeMap<String, String> = self
            .passthrough
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
            .collect();
        env.extend(self.set.clone());
        env.into_iter().collect()
    }
}

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MountConfig {
    pub host: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl MountConfig {
    fn to_spec(&self) -> MountSpec {
        MountSpec {
            host: self.host.clone(),
            target: self.target.clone(),
            mode: if self.read_only {
                MountMode::ReadOnly
            } else {
                MountMode::ReadWrite
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [network]
        allow = ["github.com", "*.npmjs.org"]
        block = ["gist.github.com"]
        allow_urls = ["https://api.example.com/v1/*"]

        [session]
        exec_image = "python:3.12-slim"
        subnet = "10.99.0.0/24"
        dns_servers = ["1.1.1.1"]
        health_interval_ms = 250

        [environment]
        passthrough = ["GITHUB_TOKEN", "MISSING"]
        set = { PIP_INDEX_URL = "https://pypi.org/simple" }

        [[mounts]]
        host = "/home/dev/project"
        target = "/work"

        [[mounts]]
        host = "/home/dev/.cache"
        target = "/root/.cache"
        read_only = true
    "#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.network.allow, vec!["github.com", "*.npmjs.org"]);
        assert_eq!(config.session.exec_image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(
            config.session.health_interval(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.mounts.len(), 2);

        let specs = config.mount_specs();
        assert_eq!(specs[0].mode, MountMode::ReadWrite);
        assert_eq!(specs[1].mode, MountMode::ReadOnly);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.session.topology().unwrap(), NetworkTopology::default());
    }

    #[test]
    fn test_unknown_subnet_is_rejected() {
        assert!(toml::from_str::<Config>("[session]\nsubnet = \"10.0.0.0/33\"").is_err());
    }

    #[test]
    fn test_topology_follows_subnet() {
        let config: Config = toml::from_str(FULL).unwrap();
        let topology = config.session.topology().unwrap();
        assert_eq!(topology.proxy_ip, Ipv4Addr::new(10, 99, 0, 10));
        assert_eq!(topology.exec_ip, Ipv4Addr::new(10, 99, 0, 20));
        assert_eq!(topology.dns_servers, vec![Ipv4Addr::new(1, 1, 1, 1)]);
    }

    #[test]
    fn test_topology_rejects_address_outside_subnet() {
        let session = SessionConfig {
            proxy_ip: Some(Ipv4Addr::new(192, 168, 1, 10)),
            ..Default::default()
        };
        assert!(matches!(
            session.topology(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_merge_appends_lists_and_overrides_scalars() {
        let mut base: Config = toml::from_str(FULL).unwrap();
        let other: Config = toml::from_str(
            r#"
            [network]
            allow = ["pypi.org"]

            [session]
            exec_image = "node:22"

            [environment]
            set = { PIP_INDEX_URL = "https://mirror.internal/simple" }
            "#,
        )
        .unwrap();
        base.merge(other);

        assert_eq!(base.network.allow.len(), 3);
        assert_eq!(base.session.exec_image.as_deref(), Some("node:22"));
        // Unset scalars keep the earlier value.
        assert_eq!(base.session.health_interval_ms, Some(250));
        assert_eq!(
            base.environment.set["PIP_INDEX_URL"],
            "https://mirror.internal/simple"
        );
    }

    #[test]
    fn test_environment_resolution() {
        let config: Config = toml::from_str(FULL).unwrap();
        let env = config.environment.resolve(|name| match name {
            "GITHUB_TOKEN" => Some("ghp_x".to_string()),
            _ => None,
        });
        assert_eq!(
            env,
            vec![
                ("GITHUB_TOKEN".to_string(), "ghp_x".to_string()),
                (
                    "PIP_INDEX_URL".to_string(),
                    "https://pypi.org/simple".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config: Config = toml::from_str(FULL).unwrap();
        let policy = config.policy_builder().unwrap().build().unwrap();
        assert!(policy.explain("github.com").is_allowed());
        assert!(!policy.explain("gist.github.com").is_allowed());
        assert!(policy.has_url_patterns());
    }
}
