//! Finding reports and structured evidence
//!
//! Reports carry concrete proof of exploitation and are validated at the
//! boundary: a submission without HTTP evidence, ordered reproduction steps,
//! and a PoC payload never enters the verification queue. Evidence fields are
//! immutable after submission; only status and adjudication change, and only
//! through the verification pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels in reporting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().trim() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" => Ok(Self::Info),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

const VALID_HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE",
];

/// HTTP request/response pair proving the vulnerability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEvidence {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_body: String,
    pub response_status: u16,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_body_snippet: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl HttpEvidence {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let method = self.method.to_uppercase();
        if !VALID_HTTP_METHODS.contains(&method.as_str()) {
            return Err(format!("Invalid HTTP method: {}", self.method));
        }
        if self.url.trim().is_empty() {
            return Err("Evidence URL must not be empty".to_string());
        }
        Ok(())
    }
}

/// One step in the reproduction procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproductionStep {
    pub step_number: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    pub expected_result: String,
    pub actual_result: String,
}

impl ReproductionStep {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.description.trim().len() < 10 {
            return Err(format!(
                "Step {} description is too short to be actionable",
                self.step_number
            ));
        }
        if self.expected_result.trim().len() < 5 || self.actual_result.trim().len() < 5 {
            return Err(format!(
                "Step {} must state expected and actual results",
                self.step_number
            ));
        }
        Ok(())
    }
}

/// A control request that should NOT exhibit the vulnerability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTest {
    pub test_name: String,
    pub description: String,
    /// What a non-vulnerable system would do
    pub expectation: String,
    pub observed: String,
    pub passed: bool,
}

/// Complete evidence package attached to a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingEvidence {
    pub primary_evidence: Vec<HttpEvidence>,
    pub reproduction_steps: Vec<ReproductionStep>,
    pub poc_payload: String,
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_parameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploited_state: Option<String>,
    #[serde(default)]
    pub reporter_control_tests: Vec<ControlTest>,
}

impl FindingEvidence {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.primary_evidence.is_empty() {
            return Err(
                "At least one HTTP request/response pair is required as evidence".to_string(),
            );
        }
        for evidence in &self.primary_evidence {
            evidence.validate()?;
        }

        if self.reproduction_steps.is_empty() {
            return Err("At least one reproduction step is required".to_string());
        }
        let expected: Vec<u32> = (1..=self.reproduction_steps.len() as u32).collect();
        let actual: Vec<u32> = self.reproduction_steps.iter().map(|s| s.step_number).collect();
        if expected != actual {
            return Err(format!(
                "Reproduction steps must be sequentially numbered 1 to {}",
                self.reproduction_steps.len()
            ));
        }
        for step in &self.reproduction_steps {
            step.validate()?;
        }

        if self.poc_payload.trim().is_empty() {
            return Err("PoC payload must not be empty".to_string());
        }
        if self.target_url.trim().is_empty() {
            return Err("Target URL must not be empty".to_string());
        }
        Ok(())
    }
}

/// Report lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Verified,
    Rejected,
}

/// Why a report was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NonReproducible,
    InvalidInference,
    VerifierUnavailable,
}

/// Phase 1 outcome: independent reproduction of the reported behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Evidence {
    pub reproduction_count: u32,
    #[serde(default)]
    pub attempt_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploit_response: Option<String>,
}

/// Phase 2 outcome: validity of the claim given independent control tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Evidence {
    pub independent_control_tests: Vec<ControlTest>,
    pub validity_confirmed: bool,
    #[serde(default)]
    pub validity_reasoning: String,
}

/// Evidence assembled by the verifier across both phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationEvidence {
    pub phase1_reproduction: Phase1Evidence,
    pub phase2_validity: Phase2Evidence,
}

/// Minimum successful reproductions for phase 1
pub const MIN_REPRODUCTIONS: u32 = 3;

/// Check that verification evidence satisfies both phases.
///
/// Reproducibility alone is never sufficient; the verifier must also have
/// run its own control tests and confirmed the inference.
pub fn validate_two_phase(
    evidence: &VerificationEvidence,
) -> std::result::Result<(), (RejectionReason, String)> {
    let phase1 = &evidence.phase1_reproduction;
    if phase1.reproduction_count < MIN_REPRODUCTIONS {
        return Err((
            RejectionReason::NonReproducible,
            format!(
                "Phase 1 requires at least {MIN_REPRODUCTIONS} reproductions, got {}",
                phase1.reproduction_count
            ),
        ));
    }

    let phase2 = &evidence.phase2_validity;
    if phase2.independent_control_tests.is_empty() {
        return Err((
            RejectionReason::InvalidInference,
            "Phase 2 requires at least one independent control test".to_string(),
        ));
    }
    if !phase2.validity_confirmed {
        return Err((
            RejectionReason::InvalidInference,
            "Phase 2 validity was not confirmed by the control tests".to_string(),
        ));
    }
    if phase2.validity_reasoning.trim().is_empty() {
        return Err((
            RejectionReason::InvalidInference,
            "Phase 2 requires reasoning for why the system is genuinely vulnerable".to_string(),
        ));
    }
    Ok(())
}

/// Verification outcome attached to an adjudicated report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjudication {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_evidence: Option<VerificationEvidence>,
}

/// A suspected vulnerability travelling pending -> verified/rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingReport {
    pub id: String,
    pub title: String,
    pub vulnerability_type: String,
    pub severity: Severity,
    pub claim_assertion: String,
    pub evidence: FindingEvidence,
    pub status: ReportStatus,
    pub reporter_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_agent_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjudicated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verification_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjudication: Option<Adjudication>,
}

impl FindingReport {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Report title must not be empty".to_string());
        }
        if self.claim_assertion.trim().is_empty() {
            return Err("Report must state the specific security claim".to_string());
        }
        self.evidence.validate()
    }
}
