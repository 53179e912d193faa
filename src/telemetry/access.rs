//! Per-connection access records.
//!
//! The proxy writes one JSON line per connection attempt (or per request,
//! once TLS is terminated) to `<workspace>/logs/access.jsonl`. The `logs`
//! command reads them back and summarizes them per domain.
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","source":"172.30.0.20:51234","listener":"tls","host":"evil.io","decision":"deny","reason":"default-deny"}
//! ```

use super::error::TelemetryError;
use crate::policy::{Decision, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Access log file name inside the workspace `logs/` directory.
pub const ACCESS_LOG_FILE: &str = "access.jsonl";

/// Which proxy listener saw the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Listener {
    /// Explicit forward proxy (`HTTP_PROXY`).
    Forward,
    /// Intercepted plain HTTP.
    Http,
    /// Intercepted TLS.
    Tls,
}

/// One access decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub ts: DateTime<Utc>,
    /// Client address.
    pub source: String,
    pub listener: Listener,
    /// Requested host (normalized by the policy before matching).
    pub host: String,
    /// Full URL, when the request line was visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub decision: Decision,
    /// Rule that produced the decision, e.g. `allowlist:github.com`.
    pub reason: String,
}

impl AccessRecord {
    pub fn new(source: SocketAddr, listener: Listener, host: &str, verdict: &Verdict) -> Self {
        Self {
            ts: Utc::now(),
            source: source.to_string(),
            listener,
            host: host.to_string(),
            url: None,
            decision: verdict.decision,
            reason: verdict.reason.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }
}

/// Appends access records to a JSON-lines file.
#[derive(Debug)]
pub struct AccessLog {
    /// None indicates a null log (for testing).
    file: Option<Mutex<File>>,
}

impl AccessLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, TelemetryError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            // The proxy writes as root inside its container; the wrapper's
            // user reads the file back with `logs`.
            .mode(0o644)
            .open(path)
            .map_err(|source| TelemetryError::AccessLog {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Writing access records to {:?}", path);
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    /// A log that discards every record.
    pub fn new_null() -> Self {
        Self { file: None }
    }

    /// Append one record. Failures are logged, never returned: a full disk
    /// must not turn into an admission decision.
    pub fn record(&self, record: &AccessRecord) {
        let Some(file) = &self.file else {
            return;
        };

        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize access record: {}", e);
                return;
            }
        };
        line.push('\n');

        match file.lock() {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    error!("Failed to write access record: {}", e);
                }
            }
            Err(e) => error!("Failed to acquire access log lock: {}", e),
        }
    }
}

/// Read every well-formed record from `path`.
pub fn read_records(path: &Path) -> Result<Vec<AccessRecord>, TelemetryError> {
    let contents = fs::read_to_string(path).map_err(|source| TelemetryError::AccessLog {
        path: path.to_path_buf(),
        source,
    })?;

    let mut skipped = 0usize;
    let records: Vec<AccessRecord> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();

    if skipped > 0 {
        warn!("Skipped {} malformed lines in {:?}", skipped, path);
    }
    Ok(records)
}

/// Which records a summary covers.
#[derive(Debug, Clone, Default)]
pub struct SummaryFilter {
    /// Only denied records.
    pub blocked_only: bool,
    /// Only hosts containing this substring (case-insensitive).
    pub domain: Option<String>,
    /// Keep only the N busiest domains.
    pub top: Option<usize>,
}

impl SummaryFilter {
    fn admits(&self, record: &AccessRecord) -> bool {
        if self.blocked_only && !record.is_denied() {
            return false;
        }
        match &self.domain {
            Some(needle) => record.host.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Counts for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub allowed: u64,
    pub denied: u64,
    pub last_seen: DateTime<Utc>,
}

impl DomainStats {
    pub fn total(&self) -> u64 {
        self.allowed + self.denied
    }
}

/// Per-domain statistics over a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessSummary {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Busiest first, ties by name.
    pub domains: Vec<DomainStats>,
}

impl AccessSummary {
    pub fn build(records: &[AccessRecord], filter: &SummaryFilter) -> Self {
        let mut by_domain: BTreeMap<&str, DomainStats> = BTreeMap::new();
        let (mut allowed, mut denied) = (0, 0);

        for record in records.iter().filter(|r| filter.admits(r)) {
            let stats = by_domain.entry(record.host.as_str()).or_insert_with(|| DomainStats {
                domain: record.host.clone(),
                allowed: 0,
                denied: 0,
                last_seen: record.ts,
            });
            if record.is_denied() {
                stats.denied += 1;
                denied += 1;
            } else {
                stats.allowed += 1;
                allowed += 1;
            }
            stats.last_seen = stats.last_seen.max(record.ts);
        }

        let mut domains: Vec<DomainStats> = by_domain.into_values().collect();
        domains.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.domain.cmp(&b.domain)));
        if let Some(top) = filter.top {
            domains.truncate(top);
        }

        Self {
            total: allowed + denied,
            allowed,
            denied,
            domains,
        }
    }

    /// Plain-text table for a terminal.
    pub fn render_table(&self) -> String {
        let width = self
            .domains
            .iter()
            .map(|d| d.domain.len())
            .max()
            .unwrap_or(0)
            .max("DOMAIN".len());

        let mut out = format!(
            "{:<width$}  {:>7}  {:>6}  LAST SEEN\n",
            "DOMAIN", "ALLOWED", "DENIED"
        );
        for d in &self.domains {
            out.push_str(&format!(
                "{:<width$}  {:>7}  {:>6}  {}\n",
                d.domain,
                d.allowed,
                d.denied,
                d.last_seen.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        out.push_str(&format!(
            "\n{} requests: {} allowed, {} denied\n",
            self.total, self.allowed, self.denied
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Reason;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(host: &str, decision: Decision, minute: u32) -> AccessRecord {
        let reason = match decision {
            Decision::Allow => Reason::Allowlist(host.to_string()),
            Decision::Deny => Reason::DefaultDeny,
        };
        AccessRecord {
            ts: Utc.with_ymd_and_hms(2026, 1, 7, 14, minute, 0).unwrap(),
            ..AccessRecord::new(
                "172.30.0.20:40000".parse().unwrap(),
                Listener::Tls,
                host,
                &Verdict { decision, reason },
            )
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(ACCESS_LOG_FILE);
        let log = AccessLog::open(&path).unwrap();

        let allowed = record("github.com", Decision::Allow, 1);
        let denied = record("evil.io", Decision::Deny, 2).with_url("http://evil.io/x");
        log.record(&allowed);
        log.record(&denied);

        // A torn line from a crashed writer is skipped.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"ts\":\n").unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records, vec![allowed, denied]);
        assert!(records[1].is_denied());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_string(&record("evil.io", Decision::Deny, 2)).unwrap();
        assert!(json.contains("\"listener\":\"tls\""));
        assert!(json.contains("\"decision\":\"deny\""));
        assert!(json.contains("\"reason\":\"default-deny\""));
        assert!(!json.contains("\"url\""));
    }

    #[test]
    fn test_null_log() {
        AccessLog::new_null().record(&record("github.com", Decision::Allow, 1));
    }

    #[test]
    fn test_summary_counts_and_order() {
        let records = vec![
            record("github.com", Decision::Allow, 1),
            record("evil.io", Decision::Deny, 2),
            record("github.com", Decision::Allow, 3),
            record("pypi.org", Decision::Allow, 4),
            record("evil.io", Decision::Deny, 5),
            record("github.com", Decision::Allow, 6),
        ];

        let summary = AccessSummary::build(&records, &SummaryFilter::default());
        assert_eq!((summary.total, summary.allowed, summary.denied), (6, 4, 2));
        let names: Vec<_> = summary.domains.iter().map(|d| d.domain.as_str()).collect();
        assert_eq!(names, vec!["github.com", "evil.io", "pypi.org"]);
        assert_eq!(summary.domains[0].last_seen.format("%M").to_string(), "06");

        let blocked = AccessSummary::build(
            &records,
            &SummaryFilter {
                blocked_only: true,
                ..Default::default()
            },
        );
        assert_eq!(blocked.total, 2);
        assert_eq!(blocked.domains.len(), 1);

        let filtered = AccessSummary::build(
            &records,
            &SummaryFilter {
                domain: Some("GIT".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(filtered.domains.len(), 1);

        let top = AccessSummary::build(
            &records,
            &SummaryFilter {
                top: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(top.domains.len(), 1);
        assert_eq!(top.total, 6);
    }

    #[test]
    fn test_render_table() {
        let records = vec![
            record("github.com", Decision::Allow, 1),
            record("evil.io", Decision::Deny, 2),
        ];
        let table = AccessSummary::build(&records, &SummaryFilter::default()).render_table();
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("DOMAIN"));
        assert!(lines[1].starts_with("evil.io") || lines[1].starts_with("github.com"));
        assert!(table.contains("2 requests: 1 allowed, 1 denied"));
    }
}
