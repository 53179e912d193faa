//! Error types for policy compilation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning raw domain and URL specs into a [`Policy`].
///
/// Every variant is raised before any enforcement artifact exists, so a
/// failure here never leaves partially applied state behind.
///
/// [`Policy`]: super::Policy
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The pattern was empty after normalization.
    #[error("Empty domain pattern (raw input: {raw:?})")]
    Empty {
        /// The raw input before normalization.
        raw: String,
    },

    /// The domain pattern contains characters or structure we refuse.
    #[error("Invalid domain pattern '{pattern}': {reason}")]
    InvalidDomain {
        /// The normalized pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A wildcard pattern with fewer than two concrete labels.
    #[error("Wildcard pattern '{0}' is too broad: at least two concrete labels are required")]
    OverbroadWildcard(String),

    /// The URL pattern is malformed or lacks a path.
    #[error("Invalid URL pattern '{pattern}': {reason}")]
    InvalidUrl {
        /// The raw URL pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A domain list file could not be read.
    #[error("Failed to read domain file {path}: {source}")]
    ReadFile {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A pattern failed to compile into a matcher.
    #[error("Failed to compile pattern '{pattern}': {source}")]
    Compile {
        /// The pattern that failed.
        pattern: String,
        /// The regex error.
        #[source]
        source: regex::Error,
    },
}
