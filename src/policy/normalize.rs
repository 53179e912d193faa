//! Domain spec normalization and validation.
//!
//! Everything here is pure: no I/O except [`parse_domain_file`], which only
//! reads the file and hands the contents to [`split_specs`].
//!
//! # Normal form
//!
//! A normalized domain is lowercase, has no surrounding whitespace, no
//! `http://` or `https://` prefix and no trailing dot. [`normalize`] reaches
//! that form by applying one cleanup step until nothing changes, so
//! `normalize(normalize(x)) == normalize(x)` holds for every input.

use super::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Scheme prefixes stripped from domain specs.
const SCHEMES: &[&str] = &["https://", "http://"];

/// Minimum number of concrete (non-`*`) labels a wildcard must keep.
pub const MIN_CONCRETE_LABELS: usize = 2;

/// Whether a rule admits or refuses matching domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Matching domains are admitted.
    Allow,
    /// Matching domains are refused, regardless of any allow rule.
    Block,
}

/// Shape of a domain pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// A plain domain. Also governs every subdomain.
    Exact,
    /// A pattern containing `*`. Governs exactly what the pattern expresses.
    Wildcard,
}

/// A single validated domain rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainRule {
    pattern: String,
    kind: RuleKind,
    disposition: Disposition,
}

impl DomainRule {
    /// Normalize and validate a raw spec.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Empty`] if nothing is left after normalization
    /// - [`PolicyError::InvalidDomain`] for paths, ports, whitespace, empty
    ///   labels or characters outside `[a-z0-9._*-]`
    /// - [`PolicyError::OverbroadWildcard`] if a wildcard keeps fewer than
    ///   two concrete labels (`*`, `*.*`, `*.com`, ...)
    pub fn parse(raw: &str, disposition: Disposition) -> Result<Self, PolicyError> {
        let pattern = normalize(raw);
        validate_host_pattern(raw, &pattern)?;

        let kind = if pattern.contains('*') {
            if concrete_labels(&pattern) < MIN_CONCRETE_LABELS {
                return Err(PolicyError::OverbroadWildcard(pattern));
            }
            RuleKind::Wildcard
        } else {
            RuleKind::Exact
        };

        Ok(Self {
            pattern,
            kind,
            disposition,
        })
    }

    /// The normalized pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Exact or wildcard.
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Allow or block.
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }
}

impl fmt::Display for DomainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Normalize a raw domain spec.
///
/// Lowercases, trims whitespace, strips scheme prefixes and trailing dots,
/// repeating until a fixed point is reached.
pub fn normalize(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = normalize_step(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_step(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut rest = lowered.trim();
    for scheme in SCHEMES {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
        }
    }
    rest.trim_end_matches('.').to_string()
}

/// Split a list of specs as given on the command line or in a file.
///
/// Entries are separated by commas or newlines. `#` starts a comment that
/// runs to the end of the line. Blank entries are dropped. The returned
/// entries are trimmed but otherwise untouched.
pub fn split_specs(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a line-delimited domain file.
///
/// # Errors
///
/// Returns [`PolicyError::ReadFile`] if the file cannot be read.
pub fn parse_domain_file(path: &Path) -> Result<Vec<String>, PolicyError> {
    let contents = fs::read_to_string(path).map_err(|source| PolicyError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(split_specs(&contents))
}

/// Count labels that are not made only of `*`.
pub(crate) fn concrete_labels(pattern: &str) -> usize {
    pattern
        .split('.')
        .filter(|label| !label.chars().all(|c| c == '*'))
        .count()
}

/// Shared validation for normalized host patterns (domain rules and the
/// host part of URL patterns).
pub(crate) fn validate_host_pattern(raw: &str, pattern: &str) -> Result<(), PolicyError> {
    if pattern.is_empty() {
        return Err(PolicyError::Empty {
            raw: raw.to_string(),
        });
    }

    let invalid = |reason: &str| PolicyError::InvalidDomain {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if pattern.contains('/') {
        return Err(invalid("domain rules cannot carry a path; use a URL pattern"));
    }
    if pattern.contains(':') {
        return Err(invalid("ports are not allowed in domain rules"));
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(invalid("embedded whitespace"));
    }
    if let Some(bad) = pattern
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*')))
    {
        return Err(invalid(&format!("unexpected character {bad:?}")));
    }
    if pattern.split('.').any(str::is_empty) {
        return Err(invalid("empty label"));
    }

    Ok(())
}
