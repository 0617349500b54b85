//! SBOM, vulnerability, signature, and provenance attestations.
//!
//! One attestation set accompanies every bundle: a CycloneDX SBOM, a
//! normalized vulnerability report, a detached signature over the
//! archive bytes, and an in-toto provenance statement. Generation
//! drives the external tools through the adapter; verification is the
//! exact inverse and runs in a fixed order (provenance subject,
//! signature, SBOM coverage, scan freshness).

pub mod provenance;
pub mod sbom;
pub mod scan;
pub mod signature;
pub mod verify;

use chiron_tools::ToolError;
use chiron_types::{AttestationKind, ErrorCategory};

/// Attestation failures, one variant per surfaced kind.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("required attestation `{kind}` is missing: {detail}")]
    Missing { kind: AttestationKind, detail: String },
    #[error("SBOM does not cover the locked set; missing: {}", .missing.join(", "))]
    SbomIncomplete { missing: Vec<String> },
    #[error("SBOM is not valid CycloneDX: {0}")]
    SbomMalformed(String),
    #[error("vulnerability report is malformed: {0}")]
    ScanMalformed(String),
    #[error("vulnerability scan is {age_days} days old; freshness threshold is {threshold_days}")]
    ScanStale { age_days: i64, threshold_days: i64 },
    #[error("signature does not verify over the bundle bytes")]
    SignatureInvalid,
    #[error("signature verifies but the signer identity does not match the configured policy")]
    SignatureIdentityMismatch,
    #[error("signing certificate has expired")]
    SignatureExpired,
    #[error("provenance subject digest {subject} does not match bundle digest {bundle}")]
    ProvenanceSubjectMismatch { subject: String, bundle: String },
    #[error("provenance statement is malformed: {0}")]
    ProvenanceMalformed(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl AttestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AttestError::Missing { .. } => ErrorCategory::AttestationMissing,
            AttestError::Tool(err) => err.category(),
            _ => ErrorCategory::AttestationInvalid,
        }
    }

    /// Deterministic remediation hint, when one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            AttestError::ScanStale { .. } => Some("rerun vulnerability scan"),
            AttestError::SbomIncomplete { .. } => Some("regenerate the SBOM over the locked set"),
            AttestError::SignatureIdentityMismatch => {
                Some("check the configured signer identity patterns")
            }
            _ => None,
        }
    }
}
