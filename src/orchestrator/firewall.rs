//! Host firewall seam.
//!
//! A session's host rules are one unit: a chain plus the jumps that hook it
//! into `DOCKER-USER` and `INPUT`. [`HostFirewall::apply`] installs the unit
//! in a single `iptables-restore` transaction and [`HostFirewall::rollback`]
//! removes it again using only the names derived from the session id.
//!
//! The redirection rules are also loaded from the host, into the network
//! namespace of the execution environment via `nsenter`. The capability
//! needed for that stays on the host, and the user's image needs no
//! firewall tooling.

use super::error::{CommandError, EnforcementApplyError, FailedLayer, FirewallError};
use crate::enforce::{HostHook, HostRules, IptablesRenderer, RedirectionRules, RuleRenderer};
use crate::sandbox::naming::CHAIN_PREFIX;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Stderr fragments iptables uses for "no such rule or chain".
const ABSENT_MARKERS: &[&str] = &[
    "No chain/target/match by that name",
    "does a matching rule exist",
    "Couldn't find target",
];

/// Runs a command inside another process's network namespace.
const NSENTER: &str = "nsenter";

/// Installs and removes per-session host rule groups.
pub trait HostFirewall: Send + Sync {
    /// Install a rule group. On failure nothing of the group remains.
    fn apply(&self, rules: &HostRules) -> Result<(), EnforcementApplyError>;

    /// Remove a rule group. Removing an absent group is `Ok`.
    fn rollback(&self, hook: &HostHook) -> Result<(), FirewallError>;

    /// Load redirection rules into the network namespace of process `pid`
    /// in one transaction. The namespace goes away with its last process,
    /// so there is nothing to roll back.
    fn redirect(&self, pid: u32, rules: &RedirectionRules) -> Result<(), EnforcementApplyError>;

    /// Names of all per-session chains currently installed.
    fn list_chains(&self) -> Result<Vec<String>, FirewallError>;
}

/// [`HostFirewall`] backed by `iptables` and `iptables-restore`.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    iptables: String,
    restore: String,
    renderer: IptablesRenderer,
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new("iptables", "iptables-restore")
    }
}

impl IptablesFirewall {
    pub fn new(iptables: impl Into<String>, restore: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            restore: restore.into(),
            renderer: IptablesRenderer,
        }
    }

    fn iptables(&self, args: &[String]) -> Result<String, CommandError> {
        let mut full = vec!["-w".to_string()];
        full.extend_from_slice(args);
        let cmd_str = format!("{} {}", self.iptables, full.join(" "));
        debug!("Running: {}", cmd_str);

        let output = Command::new(&self.iptables)
            .args(&full)
            .output()
            .map_err(|source| CommandError::Spawn {
                cmd: cmd_str.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CommandError::Failed { cmd: cmd_str, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn restore(&self, input: &str) -> Result<(), CommandError> {
        let args = ["-w".to_string(), "--noflush".to_string()];
        self.feed(&self.restore, &args, input)
    }

    /// `iptables-restore` inside the network namespace of `pid`.
    fn restore_in(&self, pid: u32, input: &str) -> Result<(), CommandError> {
        self.feed(NSENTER, &nsenter_restore_args(pid, &self.restore), input)
    }

    /// Run `program`, feeding `input` on stdin.
    fn feed(&self, program: &str, args: &[String], input: &str) -> Result<(), CommandError> {
        let cmd_str = format!("{} {}", program, args.join(" "));
        debug!("Running: {}", cmd_str);

        let failed = |source| CommandError::Spawn {
            cmd: cmd_str.clone(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).map_err(failed)?;
        }

        let output = child.wait_with_output().map_err(failed)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CommandError::Failed { cmd: cmd_str, stderr });
        }
        Ok(())
    }
}

impl HostFirewall for IptablesFirewall {
    fn apply(&self, rules: &HostRules) -> Result<(), EnforcementApplyError> {
        let apply_error = |message: String| EnforcementApplyError {
            layer: FailedLayer::HostFirewall,
            message,
        };

        // Without the hook chain the jump has nowhere to go, and the
        // session's traffic would be forwarded unfiltered.
        let hook_chain = rules.hook().hook_chain.clone();
        self.iptables(&["-S".to_string(), hook_chain.clone()])
            .map_err(|e| apply_error(format!("{hook_chain} chain is not available: {e}")))?;

        let input = self.renderer.render_host(rules);
        if let Err(e) = self.restore(&input) {
            if let Err(rollback) = self.rollback(rules.hook()) {
                warn!("Rollback of {} failed: {}", rules.chain(), rollback);
            }
            return Err(apply_error(e.to_string()));
        }

        info!("Applied host rules for chain {}", rules.chain());
        Ok(())
    }

    fn rollback(&self, hook: &HostHook) -> Result<(), FirewallError> {
        for args in self.renderer.render_host_rollback(hook) {
            match self.iptables(&args) {
                Ok(_) => {}
                Err(e) if is_absent(&e) => debug!("Nothing to remove: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Removed host rules for chain {}", hook.chain);
        Ok(())
    }

    fn redirect(&self, pid: u32, rules: &RedirectionRules) -> Result<(), EnforcementApplyError> {
        let input = self.renderer.render_redirection(rules);
        self.restore_in(pid, &input).map_err(|e| EnforcementApplyError {
            layer: FailedLayer::Redirection,
            message: e.to_string(),
        })?;
        info!("Applied redirection rules in the namespace of PID {}", pid);
        Ok(())
    }

    fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        let stdout = self.iptables(&["-S".to_string()])?;
        Ok(parse_chains(&stdout))
    }
}

fn nsenter_restore_args(pid: u32, restore: &str) -> Vec<String> {
    [
        "--target",
        &pid.to_string(),
        "--net",
        "--",
        restore,
        "-w",
        "--noflush",
    ]
    .map(str::to_string)
    .to_vec()
}

fn is_absent(err: &CommandError) -> bool {
    ABSENT_MARKERS.iter().any(|m| err.stderr().contains(m))
}

/// Per-session chain names declared in `iptables -S` output.
fn parse_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.strip_prefix("-N "))
        .map(str::trim)
        .filter(|chain| chain.starts_with(CHAIN_PREFIX))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::NetworkTopology;
    use crate::sandbox::naming::SessionId;

    #[test]
    fn test_parse_chains() {
        let listing = "\
-P INPUT ACCEPT
-N DOCKER-USER
-N EW-0badcafe
-N EW-12345678
-A DOCKER-USER -i run-0badcafe-br -j EW-0badcafe
-A EW-0badcafe -j DROP
";
        assert_eq!(parse_chains(listing), vec!["EW-0badcafe", "EW-12345678"]);
    }

    #[test]
    fn test_is_absent() {
        let err = CommandError::Failed {
            cmd: "iptables -w -F EW-0badcafe".into(),
            stderr: "iptables: No chain/target/match by that name.".into(),
        };
        assert!(is_absent(&err));

        let err = CommandError::Failed {
            cmd: "iptables -w -F EW-0badcafe".into(),
            stderr: "Permission denied (you must be root)".into(),
        };
        assert!(!is_absent(&err));
    }

    #[test]
    fn test_apply_fails_closed_without_binaries() {
        let fw = IptablesFirewall::new("/nonexistent/iptables", "/nonexistent/iptables-restore");
        let id = SessionId::parse("0badcafe").unwrap();
        let rules = HostRules::build(&NetworkTopology::default(), &id);

        let err = fw.apply(&rules).unwrap_err();
        assert_eq!(err.layer, FailedLayer::HostFirewall);
        assert!(err.message.contains("DOCKER-USER"));
    }

    #[test]
    fn test_nsenter_restore_args() {
        assert_eq!(
            nsenter_restore_args(31337, "iptables-restore"),
            vec!["--target", "31337", "--net", "--", "iptables-restore", "-w", "--noflush"]
        );
    }

    #[test]
    fn test_redirect_fails_as_redirection_layer() {
        let fw = IptablesFirewall::new("/nonexistent/iptables", "/nonexistent/iptables-restore");
        let rules = RedirectionRules::build(&NetworkTopology::default());
        // Either nsenter or the restore binary is missing; both fail closed.
        let err = fw.redirect(std::process::id(), &rules).unwrap_err();
        assert_eq!(err.layer, FailedLayer::Redirection);
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN and a Docker host"]
    fn test_apply_and_rollback_roundtrip() {
        let fw = IptablesFirewall::default();
        let id = SessionId::generate();
        let rules = HostRules::build(&NetworkTopology::default(), &id);

        fw.apply(&rules).unwrap();
        assert!(fw.list_chains().unwrap().contains(&id.chain_name()));

        fw.rollback(rules.hook()).unwrap();
        fw.rollback(rules.hook()).unwrap();
        assert!(!fw.list_chains().unwrap().contains(&id.chain_name()));
    }
}
