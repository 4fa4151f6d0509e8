//! Queue of finding reports and their adjudication
//!
//! The two-phase protocol is a state machine on the report, not a property
//! of any verifier agent: a crashed or exhausted verifier just means the
//! still-pending report gets a fresh one, and after the respawn budget the
//! report is rejected rather than left dangling.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::RunStore;
use crate::{Error, Result};

use super::report::{
    validate_two_phase, Adjudication, FindingEvidence, FindingReport, RejectionReason,
    ReportStatus, Severity, VerificationEvidence,
};

/// How many verifier agents may be spent on one report before it is
/// rejected as unverifiable
const MAX_VERIFIER_ATTEMPTS: u32 = 3;

/// Launches verification agents; implemented by the scan supervisor.
#[async_trait]
pub trait VerifierSpawner: Send + Sync {
    /// Spawn a verifier seeded with the report's evidence. Returns the new
    /// agent's id.
    async fn spawn_verifier(&self, report: &FindingReport) -> Result<String>;
}

/// A new finding as submitted by a reporting agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingSubmission {
    pub title: String,
    pub vulnerability_type: String,
    pub severity: Severity,
    pub claim_assertion: String,
    pub evidence: FindingEvidence,
    pub reporter_agent_id: String,
}

/// Decision reported by a verifier via the `verify_finding` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationDecision {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_evidence: Option<VerificationEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Result of an adjudication call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjudicationOutcome {
    Verified,
    Rejected(RejectionReason),
    /// The report was adjudicated earlier; retry is a no-op
    AlreadyAdjudicated,
}

/// Pending-report view for the `list_pending_verifications` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub verification_attempts: u32,
}

/// The scan's verification pipeline
pub struct VerificationPipeline {
    store: Arc<RunStore>,
    pending: Mutex<HashMap<String, FindingReport>>,
    /// Content fingerprint -> report id, kept across adjudication so a
    /// retried submission maps back to the same report
    fingerprints: Mutex<HashMap<u64, String>>,
    next_id: AtomicU32,
    spawner: Mutex<Option<Arc<dyn VerifierSpawner>>>,
}

impl VerificationPipeline {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            spawner: Mutex::new(None),
        }
    }

    pub fn set_spawner(&self, spawner: Arc<dyn VerifierSpawner>) {
        *self.spawner.lock().unwrap_or_else(|e| e.into_inner()) = Some(spawner);
    }

    fn spawner(&self) -> Option<Arc<dyn VerifierSpawner>> {
        self.spawner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn pending_summaries(&self) -> Vec<PendingSummary> {
        let mut summaries: Vec<PendingSummary> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|report| PendingSummary {
                id: report.id.clone(),
                title: report.title.clone(),
                severity: report.severity,
                verification_attempts: report.verification_attempts,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn pending_report(&self, report_id: &str) -> Option<FindingReport> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(report_id)
            .cloned()
    }

    /// Accept a finding, validate its evidence, persist it as pending, and
    /// spawn a verifier. Submitting content that was already submitted (or
    /// already adjudicated) returns the existing id without side effects.
    pub async fn submit(&self, submission: FindingSubmission) -> Result<String> {
        let fingerprint = submission_fingerprint(&submission);
        {
            let fingerprints = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = fingerprints.get(&fingerprint) {
                info!(report_id = %existing, "Duplicate finding submission ignored");
                return Ok(existing.clone());
            }
        }

        let id = format!("vuln-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let report = FindingReport {
            id: id.clone(),
            title: submission.title,
            vulnerability_type: submission.vulnerability_type,
            severity: submission.severity,
            claim_assertion: submission.claim_assertion,
            evidence: submission.evidence,
            status: ReportStatus::Pending,
            reporter_agent_id: submission.reporter_agent_id,
            verifier_agent_id: None,
            submitted_at: Utc::now(),
            adjudicated_at: None,
            verification_attempts: 0,
            adjudication: None,
        };
        report
            .validate()
            .map_err(Error::Report)?;

        self.store.write_pending(&report)?;
        self.fingerprints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint, id.clone());
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), report.clone());

        info!(report_id = %id, title = %report.title, "Finding queued for verification");
        self.launch_verifier(&id).await;
        Ok(id)
    }

    /// Spawn (or re-spawn) a verifier for a pending report. After the
    /// attempt budget the report is rejected as unverifiable.
    pub async fn launch_verifier(&self, report_id: &str) {
        let Some(spawner) = self.spawner() else {
            return;
        };

        let report = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let Some(report) = pending.get_mut(report_id) else {
                return;
            };
            if report.verification_attempts >= MAX_VERIFIER_ATTEMPTS {
                None
            } else {
                report.verification_attempts += 1;
                Some(report.clone())
            }
        };

        match report {
            Some(report) => match spawner.spawn_verifier(&report).await {
                Ok(verifier_id) => {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(report) = pending.get_mut(report_id) {
                        report.verifier_agent_id = Some(verifier_id);
                    }
                }
                Err(error) => {
                    warn!(report_id, %error, "Failed to spawn verifier");
                }
            },
            None => {
                warn!(report_id, "Verifier attempt budget exhausted, rejecting");
                let _ = self.reject_unverifiable(report_id);
            }
        }
    }

    /// Called when a verifier terminates without recording a decision; the
    /// still-pending report gets a fresh verifier.
    pub async fn handle_verifier_exit(&self, report_id: &str) {
        if self.pending_report(report_id).is_some() {
            warn!(report_id, "Verifier exited without a decision, re-spawning");
            self.launch_verifier(report_id).await;
        }
    }

    /// Record a verifier's decision.
    ///
    /// A verified decision must carry evidence satisfying both phases,
    /// otherwise the call errors back to the verifier so it can correct
    /// itself. Rejections require a reason. Adjudicating a report that has
    /// already been adjudicated is a no-op.
    pub fn adjudicate(
        &self,
        report_id: &str,
        decision: VerificationDecision,
        verifier_agent_id: &str,
    ) -> Result<AdjudicationOutcome> {
        let mut report = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(report_id) {
                Some(report) => report.clone(),
                None => return Ok(AdjudicationOutcome::AlreadyAdjudicated),
            }
        };

        let outcome = if decision.verified {
            let evidence = decision.verification_evidence.clone().ok_or_else(|| {
                Error::Report(
                    "verification_evidence is required when verified=true".to_string(),
                )
            })?;
            if let Err((reason, message)) = validate_two_phase(&evidence) {
                return Err(Error::Report(format!(
                    "Two-phase verification incomplete ({reason:?}): {message}. \
                     Record verified=false with a rejection_reason if the finding \
                     cannot be proven."
                )));
            }
            report.status = ReportStatus::Verified;
            report.adjudication = Some(Adjudication {
                verified: true,
                rejection_reason: None,
                notes: decision.notes,
                verification_evidence: Some(evidence),
            });
            AdjudicationOutcome::Verified
        } else {
            let reason_text = decision.rejection_reason.clone().ok_or_else(|| {
                Error::Report("rejection_reason is required when verified=false".to_string())
            })?;
            let reason = parse_rejection_reason(&reason_text);
            report.status = ReportStatus::Rejected;
            report.adjudication = Some(Adjudication {
                verified: false,
                rejection_reason: Some(reason),
                notes: once_nonempty(reason_text, decision.notes),
                verification_evidence: decision.verification_evidence,
            });
            AdjudicationOutcome::Rejected(reason)
        };

        report.verifier_agent_id = Some(verifier_agent_id.to_string());
        report.adjudicated_at = Some(Utc::now());

        self.store.move_adjudicated(&report)?;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(report_id);

        info!(report_id, ?outcome, "Report adjudicated");
        Ok(outcome)
    }

    fn reject_unverifiable(&self, report_id: &str) -> Result<()> {
        let mut report = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.remove(report_id) {
                Some(report) => report,
                None => return Ok(()),
            }
        };
        report.status = ReportStatus::Rejected;
        report.adjudicated_at = Some(Utc::now());
        report.adjudication = Some(Adjudication {
            verified: false,
            rejection_reason: Some(RejectionReason::VerifierUnavailable),
            notes: vec![format!(
                "No verifier reached a decision within {MAX_VERIFIER_ATTEMPTS} attempts"
            )],
            verification_evidence: None,
        });
        self.store.move_adjudicated(&report)
    }
}

fn parse_rejection_reason(text: &str) -> RejectionReason {
    let lower = text.to_lowercase();
    if lower.contains("non_reproducible") || lower.contains("not reproduc") {
        RejectionReason::NonReproducible
    } else {
        RejectionReason::InvalidInference
    }
}

fn once_nonempty(first: String, mut rest: Vec<String>) -> Vec<String> {
    let mut notes = vec![first];
    notes.append(&mut rest);
    notes
}

fn submission_fingerprint(submission: &FindingSubmission) -> u64 {
    let mut hasher = DefaultHasher::new();
    submission.title.hash(&mut hasher);
    submission.vulnerability_type.hash(&mut hasher);
    submission.claim_assertion.hash(&mut hasher);
    submission.evidence.poc_payload.hash(&mut hasher);
    submission.evidence.target_url.hash(&mut hasher);
    hasher.finish()
}
