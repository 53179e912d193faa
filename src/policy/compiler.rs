//! Policy compilation and the decision function.
//!
//! # Evaluation order
//!
//! 1. Block rules. Any match denies, whatever the allow rules say.
//! 2. Allow rules.
//! 3. Default deny.
//!
//! # Matching
//!
//! - Exact: `github.com` matches `github.com` and every subdomain of it
//!   (`api.github.com`), but not `notgithub.com`.
//! - Wildcard: `*.github.com` is compiled to `^.*\.github\.com$`. It matches
//!   what the pattern says and nothing more: `api.github.com` yes,
//!   `github.com` no. `*` is not label-aware, so `a.b.github.com` matches too.
//!
//! Rules are kept in sorted sets, so the compiled policy and every decision
//! are independent of the order the rules were given in.

use super::error::PolicyError;
use super::normalize::{DomainRule, Disposition, RuleKind, normalize, parse_domain_file, split_specs};
use super::url::{UrlPattern, glob_to_regex};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Outcome of evaluating a domain or URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Traffic is admitted.
    Allow,
    /// Traffic is refused.
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Matched a block rule.
    Blocklist(String),
    /// Matched an allow rule.
    Allowlist(String),
    /// Matched a URL pattern.
    UrlPattern(String),
    /// The host is only reachable through URL patterns, so the connection
    /// is admitted for per-request inspection.
    UrlHost(String),
    /// The host has URL patterns but none matched this request.
    UrlNotMatched,
    /// Nothing matched.
    DefaultDeny,
    /// The host is fine but the destination port is not admitted.
    PortNotAllowed(u16),
    /// A TLS connection carried no server name to decide on.
    NoServerName,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Blocklist(p) => write!(f, "blocklist:{p}"),
            Reason::Allowlist(p) => write!(f, "allowlist:{p}"),
            Reason::UrlPattern(p) => write!(f, "url:{p}"),
            Reason::UrlHost(p) => write!(f, "url-host:{p}"),
            Reason::UrlNotMatched => f.write_str("url-not-matched"),
            Reason::DefaultDeny => f.write_str("default-deny"),
            Reason::PortNotAllowed(port) => write!(f, "port-not-allowed:{port}"),
            Reason::NoServerName => f.write_str("no-server-name"),
        }
    }
}

/// A decision together with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Allow or deny.
    pub decision: Decision,
    /// The matching rule.
    pub reason: Reason,
}

impl Verdict {
    pub(crate) fn allow(reason: Reason) -> Self {
        Self {
            decision: Decision::Allow,
            reason,
        }
    }

    pub(crate) fn deny(reason: Reason) -> Self {
        Self {
            decision: Decision::Deny,
            reason,
        }
    }

    /// Shorthand for `decision == Decision::Allow`.
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Collects raw specs and compiles them into a [`Policy`].
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    allow: Vec<String>,
    block: Vec<String>,
    urls: Vec<String>,
}

impl PolicyBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add allow specs. Each item may itself be a comma-separated list.
    pub fn allow<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow
            .extend(specs.into_iter().flat_map(|s| split_specs(s.as_ref())));
        self
    }

    /// Add block specs. Each item may itself be a comma-separated list.
    pub fn block<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.block
            .extend(specs.into_iter().flat_map(|s| split_specs(s.as_ref())));
        self
    }

    /// Add HTTPS URL pattern specs.
    pub fn allow_urls<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.urls
            .extend(specs.into_iter().flat_map(|s| split_specs(s.as_ref())));
        self
    }

    /// Add allow specs from a line-delimited file.
    pub fn allow_file(mut self, path: &Path) -> Result<Self, PolicyError> {
        self.allow.extend(parse_domain_file(path)?);
        Ok(self)
    }

    /// Add block specs from a line-delimited file.
    pub fn block_file(mut self, path: &Path) -> Result<Self, PolicyError> {
        self.block.extend(parse_domain_file(path)?);
        Ok(self)
    }

    /// Validate every spec and compile the policy.
    ///
    /// # Errors
    ///
    /// The first invalid spec aborts compilation.
    pub fn build(self) -> Result<Policy, PolicyError> {
        let mut block = RuleSet::default();
        for raw in &self.block {
            block.insert(DomainRule::parse(raw, Disposition::Block)?)?;
        }

        let mut allow = RuleSet::default();
        for raw in &self.allow {
            allow.insert(DomainRule::parse(raw, Disposition::Allow)?)?;
        }

        let mut urls = Vec::with_capacity(self.urls.len());
        for raw in &self.urls {
            let pattern = UrlPattern::parse(raw)?;
            if !urls.contains(&pattern) {
                urls.push(pattern);
            }
        }
        urls.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        debug!(
            "Compiled policy: {} block rules, {} allow rules, {} URL patterns",
            block.len(),
            allow.len(),
            urls.len()
        );

        Ok(Policy { block, allow, urls })
    }
}

/// A compiled egress policy.
///
/// This is the single decision function every enforcement layer is derived
/// from. It never changes after [`PolicyBuilder::build`].
#[derive(Debug, Clone)]
pub struct Policy {
    block: RuleSet,
    allow: RuleSet,
    urls: Vec<UrlPattern>,
}

impl Policy {
    /// Decide a domain: block rules first, then allow rules, else deny.
    pub fn decide(&self, domain: &str) -> Decision {
        self.explain(domain).decision
    }

    /// Like [`decide`](Self::decide), but also names the deciding rule.
    pub fn explain(&self, domain: &str) -> Verdict {
        let domain = normalize(domain);
        if let Some(rule) = self.block.find(&domain) {
            return Verdict::deny(Reason::Blocklist(rule.to_string()));
        }
        if let Some(rule) = self.allow.find(&domain) {
            return Verdict::allow(Reason::Allowlist(rule.to_string()));
        }
        Verdict::deny(Reason::DefaultDeny)
    }

    /// Connection-level admission, for CONNECT targets and SNI names.
    ///
    /// A host covered by a URL pattern is admitted even without a domain
    /// rule, since individual requests are checked later with
    /// [`decide_url`](Self::decide_url). Block rules still win.
    pub fn admits_host(&self, host: &str) -> Verdict {
        let verdict = self.explain(host);
        if verdict.is_allowed() || matches!(verdict.reason, Reason::Blocklist(_)) {
            return verdict;
        }
        let host = normalize(host);
        match self.urls.iter().find(|p| p.covers_host(&host)) {
            Some(pattern) => Verdict::allow(Reason::UrlHost(pattern.to_string())),
            None => verdict,
        }
    }

    /// Whether traffic to `host` must be decrypted so paths can be checked.
    pub fn requires_path_visibility(&self, host: &str) -> bool {
        let host = normalize(host);
        self.block.find(&host).is_none() && self.urls.iter().any(|p| p.covers_host(&host))
    }

    /// Decide a full URL.
    ///
    /// A blocked host is denied. If URL patterns cover the host, the URL must
    /// match one of them. Otherwise the host's domain decision applies.
    pub fn decide_url(&self, url: &str) -> Verdict {
        let Some(parts) = UrlParts::parse(url) else {
            return Verdict::deny(Reason::DefaultDeny);
        };
        let host = normalize(&parts.host);

        if let Some(rule) = self.block.find(&host) {
            return Verdict::deny(Reason::Blocklist(rule.to_string()));
        }

        let mut covering = self.urls.iter().filter(|p| p.covers_host(&host)).peekable();
        if covering.peek().is_some() {
            let candidate = format!("{}://{}{}", parts.scheme, host, parts.path);
            return match covering.find(|p| p.matches_url(&candidate)) {
                Some(pattern) => Verdict::allow(Reason::UrlPattern(pattern.to_string())),
                None => Verdict::deny(Reason::UrlNotMatched),
            };
        }

        self.explain(&host)
    }

    /// Whether any URL patterns are configured.
    pub fn has_url_patterns(&self) -> bool {
        !self.urls.is_empty()
    }

    /// Block rules in canonical order.
    pub fn block_rules(&self) -> &[DomainRule] {
        &self.block.rules
    }

    /// Allow rules in canonical order.
    pub fn allow_rules(&self) -> &[DomainRule] {
        &self.allow.rules
    }

    /// URL patterns in canonical order.
    pub fn url_patterns(&self) -> &[UrlPattern] {
        &self.urls
    }
}

/// One disposition's rules, compiled.
#[derive(Debug, Clone, Default)]
struct RuleSet {
    /// All rules, sorted and deduplicated.
    rules: Vec<DomainRule>,
    exact: BTreeSet<String>,
    wildcards: Vec<(String, Regex)>,
}

impl RuleSet {
    fn insert(&mut self, rule: DomainRule) -> Result<(), PolicyError> {
        let position = match self.rules.binary_search(&rule) {
            Ok(_) => return Ok(()),
            Err(position) => position,
        };

        match rule.kind() {
            RuleKind::Exact => {
                self.exact.insert(rule.pattern().to_string());
            }
            RuleKind::Wildcard => {
                let source = format!("(?i)^{}$", glob_to_regex(rule.pattern()));
                let regex = Regex::new(&source).map_err(|source| PolicyError::Compile {
                    pattern: rule.pattern().to_string(),
                    source,
                })?;
                let slot = self
                    .wildcards
                    .partition_point(|(pattern, _)| pattern.as_str() < rule.pattern());
                self.wildcards
                    .insert(slot, (rule.pattern().to_string(), regex));
            }
        }

        self.rules.insert(position, rule);
        Ok(())
    }

    /// Find the rule governing `domain`, most specific exact rule first.
    fn find(&self, domain: &str) -> Option<&str> {
        let mut candidate = domain;
        loop {
            if let Some(rule) = self.exact.get(candidate) {
                return Some(rule.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => break,
            }
        }

        self.wildcards
            .iter()
            .find(|(_, regex)| regex.is_match(domain))
            .map(|(pattern, _)| pattern.as_str())
    }

    fn len(&self) -> usize {
        self.rules.len()
    }
}

/// Minimal split of an absolute URL into scheme, host and path.
struct UrlParts {
    scheme: String,
    host: String,
    path: String,
}

impl UrlParts {
    fn parse(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(authority_end);

        let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        let host = match host_port.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => host_port,
        };
        if host.is_empty() {
            return None;
        }

        let path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('?') {
            format!("/{path}")
        } else {
            path.to_string()
        };

        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str], block: &[&str]) -> Policy {
        PolicyBuilder::new()
            .allow(allow)
            .block(block)
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_deny() {
        let policy = policy(&[], &[]);
        assert_eq!(policy.decide("example.com"), Decision::Deny);
        assert_eq!(policy.explain("example.com").reason, Reason::DefaultDeny);
    }

    #[test]
    fn test_exact_match_and_subdomain_closure() {
        let policy = policy(&["github.com"], &[]);
        assert_eq!(policy.decide("github.com"), Decision::Allow);
        assert_eq!(policy.decide("api.github.com"), Decision::Allow);
        assert_eq!(policy.decide("a.b.github.com"), Decision::Allow);
        assert_eq!(policy.decide("notgithub.com"), Decision::Deny);
        assert_eq!(policy.decide("github.com.evil.io"), Decision::Deny);
    }

    #[test]
    fn test_decide_normalizes_input() {
        let policy = policy(&["github.com"], &[]);
        assert_eq!(policy.decide("HTTPS://API.GitHub.com."), Decision::Allow);
    }

    #[test]
    fn test_block_wins_over_allow() {
        let policy = policy(&["example.com"], &["internal.example.com"]);
        assert_eq!(policy.decide("example.com"), Decision::Allow);
        assert_eq!(policy.decide("api.example.com"), Decision::Allow);
        assert_eq!(policy.decide("internal.example.com"), Decision::Deny);
        assert_eq!(policy.decide("db.internal.example.com"), Decision::Deny);

        match policy.explain("db.internal.example.com").reason {
            Reason::Blocklist(rule) => assert_eq!(rule, "internal.example.com"),
            other => panic!("Expected Blocklist, got {other:?}"),
        }
    }

    #[test]
    fn test_block_wins_regardless_of_specificity() {
        // Broad block, narrow allow: the block still wins.
        let policy = policy(&["api.example.com"], &["example.com"]);
        assert_eq!(policy.decide("api.example.com"), Decision::Deny);
    }

    #[test]
    fn test_wildcard_scope() {
        let policy = policy(&["*.github.com"], &[]);
        assert_eq!(policy.decide("api.github.com"), Decision::Allow);
        assert_eq!(policy.decide("a.b.github.com"), Decision::Allow);
        assert_eq!(policy.decide("github.com"), Decision::Deny);
        assert_eq!(policy.decide("evilgithub.com"), Decision::Deny);
    }

    #[test]
    fn test_wildcard_block() {
        let policy = policy(&["example.com"], &["*.ads.example.com"]);
        assert_eq!(policy.decide("x.ads.example.com"), Decision::Deny);
        assert_eq!(policy.decide("ads.example.com"), Decision::Allow);
    }

    #[test]
    fn test_build_rejects_invalid_specs() {
        let result = PolicyBuilder::new().allow(["github.com", "*.com"]).build();
        assert!(matches!(result, Err(PolicyError::OverbroadWildcard(_))));

        let result = PolicyBuilder::new().block(["*"]).build();
        assert!(matches!(result, Err(PolicyError::OverbroadWildcard(_))));
    }

    #[test]
    fn test_comma_separated_specs() {
        let policy = PolicyBuilder::new()
            .allow(["github.com, pypi.org"])
            .build()
            .unwrap();
        assert_eq!(policy.allow_rules().len(), 2);
        assert_eq!(policy.decide("pypi.org"), Decision::Allow);
    }

    #[test]
    fn test_duplicates_collapse() {
        let policy = policy(&["GitHub.com", "github.com", "github.com."], &[]);
        assert_eq!(policy.allow_rules().len(), 1);
    }

    #[test]
    fn test_url_patterns() {
        let policy = PolicyBuilder::new()
            .allow(["pypi.org"])
            .allow_urls(["https://api.github.com/repos/acme/*"])
            .build()
            .unwrap();

        assert!(policy.has_url_patterns());
        assert!(policy.requires_path_visibility("api.github.com"));
        assert!(!policy.requires_path_visibility("pypi.org"));

        // Connection-level: admitted for inspection, not by a domain rule.
        let verdict = policy.admits_host("api.github.com");
        assert!(verdict.is_allowed());
        assert!(matches!(verdict.reason, Reason::UrlHost(_)));
        assert_eq!(policy.decide("api.github.com"), Decision::Deny);

        assert!(policy
            .decide_url("https://api.github.com/repos/acme/widgets")
            .is_allowed());
        assert_eq!(
            policy.decide_url("https://api.github.com/repos/other/x").reason,
            Reason::UrlNotMatched
        );
        assert!(!policy.decide_url("http://api.github.com/repos/acme/x").is_allowed());

        // Hosts without URL patterns fall back to domain rules.
        assert!(policy.decide_url("https://pypi.org/simple/").is_allowed());
        assert!(!policy.decide_url("https://example.com/").is_allowed());
    }

    #[test]
    fn test_url_patterns_narrow_allowed_host() {
        let policy = PolicyBuilder::new()
            .allow(["github.com"])
            .allow_urls(["https://api.github.com/repos/acme/*"])
            .build()
            .unwrap();

        assert!(policy.decide_url("https://github.com/acme").is_allowed());
        assert!(!policy.decide_url("https://api.github.com/users").is_allowed());
    }

    #[test]
    fn test_block_beats_url_pattern() {
        let policy = PolicyBuilder::new()
            .block(["github.com"])
            .allow_urls(["https://api.github.com/repos/*"])
            .build()
            .unwrap();

        assert!(!policy.admits_host("api.github.com").is_allowed());
        assert!(!policy.requires_path_visibility("api.github.com"));
        assert!(!policy.decide_url("https://api.github.com/repos/x").is_allowed());
    }

    #[test]
    fn test_url_parts() {
        let parts = UrlParts::parse("https://user@Example.com:8443?q=1").unwrap();
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.host, "Example.com");
        assert_eq!(parts.path, "/?q=1");

        assert!(UrlParts::parse("not a url").is_none());
        assert!(UrlParts::parse("https:///path").is_none());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(Reason::Blocklist("a.com".into()).to_string(), "blocklist:a.com");
        assert_eq!(Reason::DefaultDeny.to_string(), "default-deny");
    }

    mod prop_tests {
        use super::super::*;
        use proptest::prelude::*;

        const POOL: &[(&str, bool)] = &[
            ("github.com", true),
            ("api.github.com", false),
            ("*.npmjs.org", true),
            ("registry.npmjs.org", false),
            ("example.com", true),
            ("internal.example.com", false),
            ("*.cdn.example.com", false),
            ("pypi.org", true),
        ];

        const SAMPLES: &[&str] = &[
            "github.com",
            "api.github.com",
            "x.api.github.com",
            "registry.npmjs.org",
            "www.npmjs.org",
            "npmjs.org",
            "example.com",
            "internal.example.com",
            "a.cdn.example.com",
            "pypi.org",
            "unknown.net",
        ];

        fn build(rules: &[(&str, bool)]) -> Policy {
            let allow: Vec<&str> = rules.iter().filter(|(_, a)| *a).map(|(r, _)| *r).collect();
            let block: Vec<&str> = rules.iter().filter(|(_, a)| !*a).map(|(r, _)| *r).collect();
            PolicyBuilder::new().allow(allow).block(block).build().unwrap()
        }

        proptest! {
            #[test]
            fn decisions_ignore_rule_order(
                shuffled in Just(POOL.to_vec()).prop_shuffle(),
                subset in prop::collection::vec(any::<bool>(), POOL.len()),
            ) {
                let chosen: Vec<(&str, bool)> = POOL
                    .iter()
                    .zip(&subset)
                    .filter(|(_, keep)| **keep)
                    .map(|(rule, _)| *rule)
                    .collect();
                let reordered: Vec<(&str, bool)> = shuffled
                    .into_iter()
                    .filter(|rule| chosen.contains(rule))
                    .collect();

                let a = build(&chosen);
                let b = build(&reordered);
                for sample in SAMPLES {
                    prop_assert_eq!(a.explain(sample), b.explain(sample));
                }
            }

            #[test]
            fn decide_is_deterministic(domain in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}") {
                let policy = build(POOL);
                prop_assert_eq!(policy.decide(&domain), policy.decide(&domain));
            }

            #[test]
            fn blocked_subdomains_stay_blocked(label in "[a-z0-9]{1,12}") {
                let policy = build(POOL);
                let domain = format!("{label}.internal.example.com");
                prop_assert_eq!(policy.decide(&domain), Decision::Deny);
            }
        }
    }
}
