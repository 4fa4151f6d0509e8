//! Run store: immutable append of events and artifacts per run
//!
//! Exclusive writer for `strix_runs/<run>/`. Agent events append to per-agent
//! JSONL streams, finding reports live in status-named subdirectories, and
//! the pending -> verified/rejected move is an atomic rename.

mod events;

pub use events::{AgentEvent, EventRecord};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::gateway::UsageSnapshot;
use crate::verify::report::{FindingReport, ReportStatus};
use crate::{Error, Result};

const PENDING_DIR: &str = "pending_verification";
const VERIFIED_DIR: &str = "vulnerability_reports";
const REJECTED_DIR: &str = "rejected_false_positives";

/// Scan metadata written to `scan.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    #[serde(flatten)]
    pub config: ScanConfig,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Rolling statistics snapshot written to `stats.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub timestamp: Option<DateTime<Utc>>,
    pub agents_total: usize,
    pub agents_running: usize,
    pub agents_waiting: usize,
    pub agents_finished: usize,
    pub agents_failed: usize,
    pub reports_pending: usize,
    pub reports_verified: usize,
    pub reports_rejected: usize,
    pub usage: UsageSnapshot,
}

/// Where a report currently lives in the run directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLocation {
    Pending,
    Verified,
    Rejected,
}

type VerifiedCallback = Box<dyn Fn(&FindingReport) + Send + Sync>;

/// Append-only writer for one run directory
pub struct RunStore {
    run_dir: PathBuf,
    verified_callback: Mutex<Option<VerifiedCallback>>,
}

impl RunStore {
    /// Create the run directory tree under `base/strix_runs/<run>/`.
    pub fn create(base: impl AsRef<Path>, run_name: &str) -> Result<Self> {
        let run_dir = base.as_ref().join("strix_runs").join(run_name);
        fs::create_dir_all(run_dir.join("agents"))?;
        fs::create_dir_all(run_dir.join(PENDING_DIR))?;
        fs::create_dir_all(run_dir.join(VERIFIED_DIR))?;
        fs::create_dir_all(run_dir.join(REJECTED_DIR))?;
        info!(run_dir = %run_dir.display(), "Run directory initialised");

        Ok(Self {
            run_dir,
            verified_callback: Mutex::new(None),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Register the hook fired for each verified finding.
    pub fn on_verified(&self, callback: impl Fn(&FindingReport) + Send + Sync + 'static) {
        *self
            .verified_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    pub fn write_scan(&self, record: &ScanRecord) -> Result<()> {
        self.write_json_atomic(&self.run_dir.join("scan.json"), record)
    }

    /// Append one event to `agents/<id>/events.jsonl`.
    pub fn append_event(&self, agent_id: &str, event: AgentEvent) -> Result<()> {
        let agent_dir = self.run_dir.join("agents").join(agent_id);
        fs::create_dir_all(&agent_dir)?;

        let record = EventRecord::new(agent_id, event);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(agent_dir.join("events.jsonl"))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn write_stats(&self, stats: &ScanStats) -> Result<()> {
        self.write_json_atomic(&self.run_dir.join("stats.json"), stats)
    }

    /// Persist a newly submitted report into the pending directory.
    pub fn write_pending(&self, report: &FindingReport) -> Result<()> {
        let path = self.report_path(PENDING_DIR, &report.id);
        self.write_json_atomic(&path, report)
    }

    /// Move a report from pending to its adjudicated directory.
    ///
    /// The updated report is first written in place, then the move itself is
    /// a single `rename`, so a report is never visible in two directories.
    pub fn move_adjudicated(&self, report: &FindingReport) -> Result<()> {
        let target_dir = match report.status {
            ReportStatus::Verified => VERIFIED_DIR,
            ReportStatus::Rejected => REJECTED_DIR,
            ReportStatus::Pending => {
                return Err(Error::Report(format!(
                    "Report {} is still pending, nothing to move",
                    report.id
                )))
            }
        };

        let pending = self.report_path(PENDING_DIR, &report.id);
        if !pending.exists() {
            return Err(Error::Report(format!(
                "Report {} not found in {PENDING_DIR}",
                report.id
            )));
        }

        self.write_json_atomic(&pending, report)?;
        fs::rename(&pending, self.report_path(target_dir, &report.id))?;
        debug!(report_id = %report.id, target_dir, "Report adjudicated");

        if report.status == ReportStatus::Verified {
            let callback = self
                .verified_callback
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(callback) = callback.as_ref() {
                callback(report);
            }
        }
        Ok(())
    }

    /// Locate a report by id; None if it was never persisted.
    pub fn report_location(&self, report_id: &str) -> Option<ReportLocation> {
        if self.report_path(PENDING_DIR, report_id).exists() {
            Some(ReportLocation::Pending)
        } else if self.report_path(VERIFIED_DIR, report_id).exists() {
            Some(ReportLocation::Verified)
        } else if self.report_path(REJECTED_DIR, report_id).exists() {
            Some(ReportLocation::Rejected)
        } else {
            None
        }
    }

    pub fn count_reports(&self, location: ReportLocation) -> usize {
        let dir = match location {
            ReportLocation::Pending => PENDING_DIR,
            ReportLocation::Verified => VERIFIED_DIR,
            ReportLocation::Rejected => REJECTED_DIR,
        };
        fs::read_dir(self.run_dir.join(dir))
            .map(|entries| entries.filter_map(std::result::Result::ok).count())
            .unwrap_or(0)
    }

    fn report_path(&self, dir: &str, report_id: &str) -> PathBuf {
        self.run_dir.join(dir).join(format!("{report_id}.json"))
    }

    /// Write JSON through a temp file and rename so readers never observe a
    /// partial document.
    fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use crate::verify::report::tests::sample_report;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::create(dir.path(), "test-run").unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_layout() {
        let (_dir, store) = store();
        assert!(store.run_dir().join("agents").is_dir());
        assert!(store.run_dir().join(PENDING_DIR).is_dir());
        assert!(store.run_dir().join(VERIFIED_DIR).is_dir());
        assert!(store.run_dir().join(REJECTED_DIR).is_dir());
    }

    #[test]
    fn test_scan_record_round_trip() {
        let (_dir, store) = store();
        let record = ScanRecord {
            config: ScanConfig::new("https://target.test", ScanMode::Standard),
            started_at: Utc::now(),
            ended_at: None,
        };
        store.write_scan(&record).unwrap();

        let raw = fs::read_to_string(store.run_dir().join("scan.json")).unwrap();
        let parsed: ScanRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.config.target, "https://target.test");
    }

    #[test]
    fn test_events_append_as_jsonl() {
        let (_dir, store) = store();
        store
            .append_event(
                "agent_1",
                AgentEvent::ChatMessage {
                    role: "assistant".to_string(),
                    content: "thinking".to_string(),
                },
            )
            .unwrap();
        store
            .append_event(
                "agent_1",
                AgentEvent::StateTransition {
                    status: crate::agents::state::AgentStatus::Finished,
                    failure: None,
                },
            )
            .unwrap();

        let raw = fs::read_to_string(
            store
                .run_dir()
                .join("agents")
                .join("agent_1")
                .join("events.jsonl"),
        )
        .unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _: EventRecord = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn test_report_moves_exactly_once() {
        let (_dir, store) = store();
        let mut report = sample_report("vuln-0001");
        store.write_pending(&report).unwrap();
        assert_eq!(
            store.report_location("vuln-0001"),
            Some(ReportLocation::Pending)
        );

        report.status = ReportStatus::Verified;
        store.move_adjudicated(&report).unwrap();

        // Exactly one of the adjudicated directories holds the report
        assert_eq!(
            store.report_location("vuln-0001"),
            Some(ReportLocation::Verified)
        );
        assert_eq!(store.count_reports(ReportLocation::Pending), 0);
        assert_eq!(store.count_reports(ReportLocation::Verified), 1);
        assert_eq!(store.count_reports(ReportLocation::Rejected), 0);

        // A second move has nothing in pending to act on
        assert!(store.move_adjudicated(&report).is_err());
    }

    #[test]
    fn test_rejected_report_lands_in_rejected_dir() {
        let (_dir, store) = store();
        let mut report = sample_report("vuln-0002");
        store.write_pending(&report).unwrap();

        report.status = ReportStatus::Rejected;
        store.move_adjudicated(&report).unwrap();
        assert_eq!(
            store.report_location("vuln-0002"),
            Some(ReportLocation::Rejected)
        );
    }

    #[test]
    fn test_verified_callback_fires() {
        let (_dir, store) = store();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        store.on_verified(move |report| {
            assert_eq!(report.id, "vuln-0003");
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let mut report = sample_report("vuln-0003");
        store.write_pending(&report).unwrap();

        report.status = ReportStatus::Verified;
        store.move_adjudicated(&report).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Rejected reports do not fire the hook
        let mut rejected = sample_report("vuln-0004");
        store.write_pending(&rejected).unwrap();
        rejected.status = ReportStatus::Rejected;
        store.move_adjudicated(&rejected).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_snapshot_written() {
        let (_dir, store) = store();
        let stats = ScanStats {
            timestamp: Some(Utc::now()),
            agents_total: 3,
            agents_running: 1,
            ..Default::default()
        };
        store.write_stats(&stats).unwrap();
        let raw = fs::read_to_string(store.run_dir().join("stats.json")).unwrap();
        let parsed: ScanStats = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.agents_total, 3);
    }
}
