//! The attestation verification protocol.
//!
//! Fixed order, first failure aborts:
//! 1. provenance subject digest matches the bundle;
//! 2. the detached signature verifies with the configured identity;
//! 3. the SBOM covers the bundle's locked set;
//! 4. the vulnerability report is fresh relative to `created_at`.

use std::collections::BTreeSet;
use std::path::Path;

use chiron_tools::ToolAdapter;
use chiron_types::{AttestationKind, BundleManifest, LockRecord, VulnerabilityReport};

use crate::sbom::{self, CycloneDxBom};
use crate::scan;
use crate::signature::{self, IdentityPolicy, SignatureArtifact};
use crate::{AttestError, provenance};

/// Default freshness horizon for the vulnerability report, days.
pub const DEFAULT_FRESHNESS_DAYS: i64 = 7;

/// Everything the verification protocol needs, assembled by the
/// coordinator from a bundle directory.
#[derive(Debug)]
pub struct VerifyInputs<'a> {
    pub bundle_dir: &'a Path,
    pub archive_path: &'a Path,
    pub manifest: &'a BundleManifest,
    pub lock: &'a LockRecord,
    pub identity: &'a IdentityPolicy,
    pub freshness_days: i64,
}

/// Outcome of a full verification pass.
#[derive(Debug)]
pub struct VerifiedAttestations {
    pub sbom: CycloneDxBom,
    pub vulnerabilities: VulnerabilityReport,
    pub present: BTreeSet<AttestationKind>,
}

/// Run the full protocol over an on-disk bundle.
pub fn verify_bundle(
    adapter: &ToolAdapter,
    inputs: &VerifyInputs<'_>,
) -> Result<VerifiedAttestations, AttestError> {
    // 1. Provenance subject.
    let provenance_ref = inputs
        .manifest
        .metadata_refs
        .provenance
        .as_deref()
        .ok_or_else(|| AttestError::Missing {
            kind: AttestationKind::Provenance,
            detail: "manifest has no provenance reference".to_string(),
        })?;
    let statement = provenance::read_from_dir(inputs.bundle_dir, provenance_ref)?;
    statement.verify_subject(inputs.manifest)?;

    // 2. Signature over the archive bytes.
    let signature_ref = inputs
        .manifest
        .metadata_refs
        .signature
        .as_deref()
        .ok_or_else(|| AttestError::Missing {
            kind: AttestationKind::Signature,
            detail: "manifest has no signature reference".to_string(),
        })?;
    let artifact = SignatureArtifact {
        signature_path: inputs.bundle_dir.join(signature_ref),
        certificate_path: inputs.bundle_dir.join("signature.pem"),
    };
    if !artifact.signature_path.is_file() {
        return Err(AttestError::Missing {
            kind: AttestationKind::Signature,
            detail: format!("{} not present", artifact.signature_path.display()),
        });
    }
    signature::verify_archive(adapter, inputs.archive_path, &artifact, inputs.identity)?;

    // 3. SBOM coverage of the locked set.
    let sbom_ref = inputs
        .manifest
        .metadata_refs
        .sbom
        .as_deref()
        .ok_or_else(|| AttestError::Missing {
            kind: AttestationKind::Sbom,
            detail: "manifest has no SBOM reference".to_string(),
        })?;
    let sbom_path = inputs.bundle_dir.join(sbom_ref);
    let sbom_text = std::fs::read_to_string(&sbom_path).map_err(|e| AttestError::Missing {
        kind: AttestationKind::Sbom,
        detail: format!("{}: {e}", sbom_path.display()),
    })?;
    let bom = CycloneDxBom::parse(&sbom_text)?;
    sbom::validate_coverage(&bom, inputs.lock)?;

    // 4. Scan freshness relative to the bundle's creation time.
    let osv_ref = inputs.manifest.metadata_refs.osv.as_deref().ok_or_else(|| {
        AttestError::Missing {
            kind: AttestationKind::Sbom,
            detail: "manifest has no vulnerability report reference".to_string(),
        }
    })?;
    let osv_path = inputs.bundle_dir.join(osv_ref);
    let osv_text = std::fs::read_to_string(&osv_path).map_err(|e| AttestError::Missing {
        kind: AttestationKind::Sbom,
        detail: format!("{}: {e}", osv_path.display()),
    })?;
    let vulnerabilities = scan::parse_report(&osv_text)?;
    scan::check_freshness(
        &vulnerabilities,
        inputs.manifest.created_at,
        inputs.freshness_days,
    )?;

    Ok(VerifiedAttestations {
        sbom: bom,
        vulnerabilities,
        present: BTreeSet::from([
            AttestationKind::Provenance,
            AttestationKind::Signature,
            AttestationKind::Sbom,
        ]),
    })
}
