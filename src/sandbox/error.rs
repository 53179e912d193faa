//! Error types for sandbox operations.
//!
//! - Workspace errors (directory creation, owner marker, artifact writes)
//! - CA certificate errors (generation, file operations)
//! - Entrypoint errors (redirection rules, capability drop, exec)

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to the per-run workspace directory.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The workspace directory could not be created.
    #[error("Failed to create workspace {path}: {source}")]
    Create {
        /// The directory that was being created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The workspace already exists (name collision with another run).
    #[error("Workspace {0} already exists")]
    Exists(PathBuf),

    /// Writing a file inside the workspace failed.
    #[error("Failed to write {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Removing the workspace failed.
    #[error("Failed to remove workspace {path}: {source}")]
    Remove {
        /// The directory being removed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to CA certificate operations.
///
/// These errors occur when generating the session CA, creating
/// domain certificates, or managing certificate files.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to create the CA directory.
    #[error("Failed to create CA directory: {0}")]
    CreateDir(#[source] std::io::Error),

    /// Failed to set file permissions.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Failed to generate key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to load an existing CA.
    #[error("Failed to load CA: {0}")]
    Load(String),

    /// Failed to write certificate or key file.
    #[error("Failed to write file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// No domains specified for certificate generation.
    #[error("No domains specified for certificate")]
    NoDomains,

    /// A domain is not a valid DNS name for a certificate.
    #[error("Invalid certificate name: {0}")]
    InvalidName(String),

    /// Failed to read CA files.
    #[error("Failed to read file: {0}")]
    ReadFile(#[source] std::io::Error),

    /// Failed to sign certificate.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),
}

/// Errors raised by the in-container entrypoint before the user command runs.
#[derive(Debug, Error)]
pub enum EntrypointError {
    /// No command was given after `--`.
    #[error("No command given")]
    NoCommand,

    /// Changing a capability set failed.
    #[error("Failed to drop capabilities: {0}")]
    Capability(String),

    /// Setting `no_new_privs` failed.
    #[error("Failed to set no_new_privs: {0}")]
    NoNewPrivs(#[source] nix::Error),

    /// A capability was still present after the drop.
    #[error("Capability {0} is still held after drop")]
    StillHeld(String),

    /// Replacing the process with the user command failed.
    #[error("Failed to exec {program}: {source}")]
    Exec {
        /// The program that was being executed.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
