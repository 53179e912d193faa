//! Per-run resources and their lifecycle.
//!
//! - [`naming`]: the `run-<id>-<role>` convention every resource follows
//! - [`workspace`]: the ephemeral `$TMPDIR/run-<id>-workspace/` directory
//! - [`ca`]: the session CA used for TLS interception
//! - [`entrypoint`]: the capability-dropping entrypoint of the execution
//!   environment
//! - [`cleanup`]: teardown and the sweeps that reap abandoned runs
//!
//! # Security Model
//!
//! The execution environment is **untrusted**. Code inside can:
//! - Try to rewrite its own firewall rules
//! - Start sibling network stacks on the session network
//! - Connect to IP literals to bypass name-based filtering
//!
//! The redirection rules are loaded from the host into a namespace the
//! execution container only joins, the container never holds
//! `CAP_NET_ADMIN`, and the entrypoint drops what network capabilities are
//! left irrevocably before the user command runs. The host rules bind every
//! stack on the session bridge, so none of these reach anything but the
//! proxy.
//!
//! # Resource Layout
//!
//! ```text
//! $TMPDIR/run-<id>-workspace/        0700
//! ├── owner.pid                      PID of the wrapper, for sweeps
//! ├── proxy-rules.json               0600
//! ├── redirect.rules                 0600
//! ├── host.rules                     0600
//! ├── ca/                            0700, only with URL patterns
//! │   ├── ca.crt
//! │   ├── ca.key                     0600
//! │   └── combined-ca-bundle.crt
//! └── logs/
//!     └── access.jsonl
//! ```

pub mod ca;
pub mod cleanup;
pub mod entrypoint;
pub mod error;
pub mod naming;
pub mod workspace;

pub use ca::{BUNDLE_FILE, DomainCertificate, HOST_CA_BUNDLES, SessionCa, find_host_ca_bundle};
pub use cleanup::{
    KeepPolicy, SessionInventory, SessionResources, SweepReport, SweepScope, TeardownReport,
    list_sessions, sweep, teardown,
};
pub use error::{CaError, EntrypointError, WorkspaceError};
pub use naming::{ResourceRole, SessionId};
pub use workspace::Workspace;
