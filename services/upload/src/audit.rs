use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::{info, warn};

/// Result of one upload attempt as written to the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Fail,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => f.write_str("SUCCESS"),
            AuditOutcome::Fail => f.write_str("FAIL"),
        }
    }
}

/// One audit line
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    /// Declared filename, or the stored object name on success
    pub name: String,
    pub outcome: AuditOutcome,
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.client,
            self.name,
            self.outcome
        )
    }
}

/// Append-only record of upload outcomes
///
/// Every record goes to the `audit` tracing target. When a file sink is
/// configured the line is also appended there; write failures are logged and
/// otherwise ignored so they never fail an upload.
pub struct AuditLog {
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    /// Audit log that only emits tracing events
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Audit log appending to `path`, created if missing
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            sink: Some(Mutex::new(file)),
        })
    }

    pub fn record(&self, client: &str, name: &str, outcome: AuditOutcome) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            client: client.to_string(),
            name: name.to_string(),
            outcome,
        };
        let line = record.to_string();

        info!(target: "audit", client = %client, name = %name, outcome = %outcome, "{}", line);

        if let Some(sink) = &self.sink {
            let mut file = sink.lock();
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "Failed to append audit record");
            }
        }
    }
}
