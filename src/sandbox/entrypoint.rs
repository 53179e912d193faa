//! Entrypoint of the execution environment.
//!
//! Runs as PID 1 of the execution container. By the time it starts, the
//! host has already loaded the redirection rules into the network namespace
//! the container joins, and the container was created without
//! `CAP_NET_ADMIN`. The entrypoint still removes the network capabilities
//! from every set and sets `no_new_privs` before it `exec`s the user
//! command, so nothing the command runs (setuid binaries included) can
//! rewrite the rules that redirect it.
//!
//! The capability is modelled as a one-way typestate:
//!
//! ```text
//! HeldCapabilities ──drop_all()──► DroppedCapability ──exec()──► user command
//! ```
//!
//! `drop_all` consumes the held value, and nothing constructs a
//! `HeldCapabilities` from a `DroppedCapability`.
//!
//! # Example
//!
//! ```ignore
//! let held = HeldCapabilities::inspect()?;
//! let dropped = held.drop_all()?;
//! dropped.exec(&command);
//! ```

use super::error::EntrypointError;
use caps::{CapSet, Capability};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::{debug, info};

/// Capabilities removed before the user command runs.
pub const DROPPED_CAPABILITIES: [Capability; 2] =
    [Capability::CAP_NET_ADMIN, Capability::CAP_NET_RAW];

/// Sets a capability is removed from, bounding first.
///
/// The bounding set has to go first: dropping from it needs `CAP_SETPCAP`
/// in the effective set, and it stops the capability from coming back on
/// exec.
const CAP_SETS: [CapSet; 5] = [
    CapSet::Bounding,
    CapSet::Ambient,
    CapSet::Inheritable,
    CapSet::Effective,
    CapSet::Permitted,
];

fn capability_error(e: impl std::fmt::Display) -> EntrypointError {
    EntrypointError::Capability(e.to_string())
}

/// The network capabilities this process still holds, per set.
#[derive(Debug)]
pub struct HeldCapabilities {
    held: Vec<(Capability, CapSet)>,
}

/// Proof that the network capabilities are gone and cannot come back.
#[derive(Debug)]
pub struct DroppedCapability {
    _private: (),
}

impl HeldCapabilities {
    /// Read which of [`DROPPED_CAPABILITIES`] are present in which set.
    pub fn inspect() -> Result<Self, EntrypointError> {
        let mut held = Vec::new();
        for set in CAP_SETS {
            for cap in DROPPED_CAPABILITIES {
                if caps::has_cap(None, set, cap).map_err(capability_error)? {
                    held.push((cap, set));
                }
            }
        }
        Ok(Self { held })
    }

    /// Whether `cap` is in `set`.
    pub fn holds(&self, cap: Capability, set: CapSet) -> bool {
        // `CapSet` is a fieldless enum without `PartialEq`; compare discriminants.
        self.held.iter().any(|&(c, s)| {
            c == cap && std::mem::discriminant(&s) == std::mem::discriminant(&set)
        })
    }

    /// Drop the network capabilities from every set and set `no_new_privs`.
    ///
    /// Only capabilities actually present are touched, so a container
    /// started with `--cap-drop` and a non-root user both pass.
    pub fn drop_all(self) -> Result<DroppedCapability, EntrypointError> {
        for (cap, set) in &self.held {
            caps::drop(None, *set, *cap)
                .map_err(|e| EntrypointError::Capability(format!("{cap} from {set:?}: {e}")))?;
        }
        nix::sys::prctl::set_no_new_privs().map_err(EntrypointError::NoNewPrivs)?;

        for cap in DROPPED_CAPABILITIES {
            for set in [CapSet::Bounding, CapSet::Effective, CapSet::Permitted] {
                if caps::has_cap(None, set, cap).map_err(capability_error)? {
                    return Err(EntrypointError::StillHeld(format!("{cap} ({set:?})")));
                }
            }
        }

        info!("Dropped network capabilities ({} removed)", self.held.len());
        Ok(DroppedCapability { _private: () })
    }
}

impl DroppedCapability {
    /// Replace this process with the user command.
    ///
    /// Only returns on failure.
    pub fn exec(self, command: &[String]) -> EntrypointError {
        let Some((program, args)) = command.split_first() else {
            return EntrypointError::NoCommand;
        };
        debug!("Executing {} {:?}", program, args);
        let source = Command::new(program).args(args).exec();
        EntrypointError::Exec {
            program: program.clone(),
            source,
        }
    }
}

/// Run the entrypoint: drop capabilities, exec `command`.
///
/// Returns only if something failed before or during exec.
pub fn run(command: &[String]) -> EntrypointError {
    match prepare(command) {
        Ok(dropped) => dropped.exec(command),
        Err(e) => e,
    }
}

fn prepare(command: &[String]) -> Result<DroppedCapability, EntrypointError> {
    if command.is_empty() {
        return Err(EntrypointError::NoCommand);
    }
    HeldCapabilities::inspect()?.drop_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_is_rejected() {
        let err = run(&[]);
        assert!(matches!(err, EntrypointError::NoCommand));
    }

    #[test]
    fn test_inspect_matches_kernel_view() {
        let held = HeldCapabilities::inspect().unwrap();
        for cap in DROPPED_CAPABILITIES {
            let effective = caps::has_cap(None, CapSet::Effective, cap).unwrap();
            assert_eq!(held.holds(cap, CapSet::Effective), effective);
        }
    }

    #[test]
    #[ignore = "requires CAP_SETPCAP and drops network capabilities from the test process"]
    fn test_drop_all_is_irrevocable() {
        let dropped = HeldCapabilities::inspect().unwrap().drop_all().unwrap();
        let held = HeldCapabilities::inspect().unwrap();
        for cap in DROPPED_CAPABILITIES {
            assert!(!held.holds(cap, CapSet::Bounding));
            assert!(!held.holds(cap, CapSet::Effective));
        }
        drop(dropped);
    }
}
