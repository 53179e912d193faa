//! HTTPS URL patterns.
//!
//! A URL pattern admits specific paths on a host instead of the whole host.
//! Enforcing one requires seeing the request path, which for HTTPS means the
//! proxy has to terminate TLS with the session CA.
//!
//! Patterns look like `https://api.github.com/repos/acme/*`. The host part is
//! validated like a domain rule and matched case-insensitively. The path
//! part is case-sensitive. `*` matches any run of characters in both.

use super::error::PolicyError;
use super::normalize::{RuleKind, concrete_labels, normalize, validate_host_pattern, MIN_CONCRETE_LABELS};
use regex::Regex;
use std::fmt;

const HTTPS: &str = "https://";

/// A compiled HTTPS URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    host: String,
    host_kind: RuleKind,
    path_glob: String,
    host_regex: Regex,
    url_regex: Regex,
}

impl UrlPattern {
    /// Parse and compile a URL pattern.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidUrl`] if the scheme is not `https://` or
    /// the path is missing or just `/`. Host validation errors are the same
    /// as for domain rules.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| PolicyError::InvalidUrl {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let rest = match trimmed.get(..HTTPS.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(HTTPS) => &trimmed[HTTPS.len()..],
            _ => return Err(invalid("only https:// URL patterns are supported")),
        };

        let Some(slash) = rest.find('/') else {
            return Err(invalid(
                "a URL pattern needs a path; use a domain rule to admit the whole host",
            ));
        };
        let (host_part, path_glob) = rest.split_at(slash);
        if path_glob == "/" {
            return Err(invalid(
                "a URL pattern needs a path; use a domain rule to admit the whole host",
            ));
        }
        if path_glob.chars().any(char::is_whitespace) {
            return Err(invalid("embedded whitespace in path"));
        }

        let host = normalize(host_part);
        validate_host_pattern(host_part, &host)?;
        let host_kind = if host.contains('*') {
            if concrete_labels(&host) < MIN_CONCRETE_LABELS {
                return Err(PolicyError::OverbroadWildcard(host));
            }
            RuleKind::Wildcard
        } else {
            RuleKind::Exact
        };

        let host_source = format!("(?i:{})", glob_to_regex(&host));
        let host_regex = compile(raw, &format!("^{host_source}$"))?;
        let url_regex = compile(
            raw,
            &format!("^(?i:https://){host_source}{}$", glob_to_regex(path_glob)),
        )?;

        Ok(Self {
            raw: trimmed.to_string(),
            host,
            host_kind,
            path_glob: path_glob.to_string(),
            host_regex,
            url_regex,
        })
    }

    /// The pattern as written (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The normalized host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path glob, always starting with `/`.
    pub fn path_glob(&self) -> &str {
        &self.path_glob
    }

    /// Whether `host` is one this pattern speaks for.
    ///
    /// URL patterns cover their host exactly; there is no subdomain closure.
    pub fn covers_host(&self, host: &str) -> bool {
        match self.host_kind {
            RuleKind::Exact => self.host == host,
            RuleKind::Wildcard => self.host_regex.is_match(host),
        }
    }

    /// Whether a full `https://host/path` URL matches this pattern.
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_regex.is_match(url)
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for UrlPattern {}

/// Escape a glob and turn each `*` into `.*`.
pub(crate) fn glob_to_regex(glob: &str) -> String {
    regex::escape(glob).replace(r"\*", ".*")
}

fn compile(pattern: &str, source: &str) -> Result<Regex, PolicyError> {
    Regex::new(source).map_err(|source| PolicyError::Compile {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let pattern = UrlPattern::parse("https://API.GitHub.com/repos/acme/*").unwrap();
        assert_eq!(pattern.host(), "api.github.com");
        assert_eq!(pattern.path_glob(), "/repos/acme/*");
    }

    #[test]
    fn test_requires_https() {
        for raw in ["http://github.com/path", "github.com/path", "ftp://x.y/z"] {
            assert!(matches!(
                UrlPattern::parse(raw),
                Err(PolicyError::InvalidUrl { .. })
            ));
        }
    }

    #[test]
    fn test_requires_path() {
        for raw in ["https://github.com", "https://github.com/"] {
            let err = UrlPattern::parse(raw).unwrap_err();
            assert!(err.to_string().contains("needs a path"), "{raw}: {err}");
        }
    }

    #[test]
    fn test_overbroad_host_rejected() {
        assert!(matches!(
            UrlPattern::parse("https://*.com/path"),
            Err(PolicyError::OverbroadWildcard(_))
        ));
    }

    #[test]
    fn test_matches_url() {
        let pattern = UrlPattern::parse("https://api.github.com/repos/acme/*").unwrap();
        assert!(pattern.matches_url("https://api.github.com/repos/acme/widgets"));
        assert!(pattern.matches_url("HTTPS://API.GITHUB.COM/repos/acme/x?page=2"));
        assert!(!pattern.matches_url("https://api.github.com/repos/other/widgets"));
        // Paths are case-sensitive.
        assert!(!pattern.matches_url("https://api.github.com/REPOS/acme/widgets"));
        // Host must match exactly.
        assert!(!pattern.matches_url("https://evil.api.github.com/repos/acme/x"));
    }

    #[test]
    fn test_covers_host() {
        let exact = UrlPattern::parse("https://api.github.com/repos/*").unwrap();
        assert!(exact.covers_host("api.github.com"));
        assert!(!exact.covers_host("github.com"));
        assert!(!exact.covers_host("x.api.github.com"));

        let wildcard = UrlPattern::parse("https://*.example.com/v1/*").unwrap();
        assert!(wildcard.covers_host("api.example.com"));
        assert!(!wildcard.covers_host("example.com"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = UrlPattern::parse("https://example.com/a+b/(c)").unwrap();
        assert!(pattern.matches_url("https://example.com/a+b/(c)"));
        assert!(!pattern.matches_url("https://example.com/aab/c"));
    }
}
