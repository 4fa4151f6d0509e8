//! Two-phase vulnerability verification

mod pipeline;
pub mod report;

pub use pipeline::{
    AdjudicationOutcome, FindingSubmission, PendingSummary, VerificationDecision,
    VerificationPipeline, VerifierSpawner,
};
pub use report::{
    Adjudication, ControlTest, FindingEvidence, FindingReport, HttpEvidence, Phase1Evidence,
    Phase2Evidence, RejectionReason, ReportStatus, ReproductionStep, Severity,
    VerificationEvidence,
};
