//! Verify-then-install protocol for air-gapped hosts.
//!
//! Fixed sequence over a local bundle, no network anywhere:
//! 1. bundle integrity (manifest self-digest + per-file checksums);
//! 2. TUF metadata chain plus per-wheel target checks;
//! 3. attestation verification (provenance, signature, SBOM, scan);
//! 4. policy re-evaluation with the bundled report;
//! 5. the installer in no-network mode with hash enforcement.
//!
//! Every step yields an audit record; the first failure aborts with a
//! composite error naming the step. Steps never mutate the bundle.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chiron_attest::signature::IdentityPolicy;
use chiron_attest::verify::{VerifyInputs, verify_bundle};
use chiron_bundle::{CHECKSUMS_FILE, MANIFEST_FILE, REQUIREMENTS_FILE, TUF_DIR, WHEELS_DIR};
use chiron_canonical::sha256_hex;
use chiron_lockfile::parse_constraints;
use chiron_policy::{PolicyInput, evaluate};
use chiron_tools::{ToolAdapter, ToolInvocation, ToolTag};
use chiron_types::{
    AuditRecord, Coordinate, ConstraintSource, ErrorCategory, LOCK_VERSION, LockRecord,
    LockedConstraint, PolicyDocument, StepOutcome,
};

/// The five protocol steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineStep {
    BundleIntegrity,
    TufChain,
    Attestations,
    Policy,
    Install,
}

impl OfflineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineStep::BundleIntegrity => "bundle_integrity",
            OfflineStep::TufChain => "tuf_chain",
            OfflineStep::Attestations => "attestations",
            OfflineStep::Policy => "policy",
            OfflineStep::Install => "install",
        }
    }
}

impl std::fmt::Display for OfflineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Composite failure naming the step that aborted the sequence.
#[derive(Debug, thiserror::Error)]
#[error("offline install failed at step `{step}`: {message}")]
pub struct OfflineFailure {
    pub step: OfflineStep,
    pub category: ErrorCategory,
    pub message: String,
}

/// Configuration for one offline run, frozen at start.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub identity: IdentityPolicy,
    pub freshness_days: i64,
    /// Skip the final installer invocation (verification-only mode,
    /// used by `verify-bundle`).
    pub verify_only: bool,
}

/// Everything one run produced: the audit trail plus the outcome.
#[derive(Debug)]
pub struct OfflineRun {
    pub records: Vec<AuditRecord>,
    pub outcome: Result<(), OfflineFailure>,
}

impl OfflineRun {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

fn record(
    step: OfflineStep,
    started_at: DateTime<Utc>,
    inputs_digest: &str,
    outcome: StepOutcome,
    details: String,
) -> AuditRecord {
    AuditRecord {
        step_id: step.as_str().to_string(),
        started_at,
        ended_at: Utc::now(),
        inputs_digest: inputs_digest.to_string(),
        outputs_digest: sha256_hex(details.as_bytes()),
        outcome,
        details,
    }
}

/// Reconstruct the locked set from the bundled constraints file.
fn lock_from_bundle(bundle_dir: &Path) -> Result<LockRecord, String> {
    let path = bundle_dir.join(REQUIREMENTS_FILE);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let lines = parse_constraints(&text).map_err(|e| e.to_string())?;

    Ok(LockRecord {
        lock_version: LOCK_VERSION.to_string(),
        resolver_version: "bundled".to_string(),
        platform_scope: vec![],
        python_scope: vec![],
        constraints: lines
            .into_iter()
            .map(|line| LockedConstraint {
                coordinate: Coordinate::new(&line.name, line.version),
                hashes: line.hashes,
                source: ConstraintSource::Index {
                    url: "bundled".to_string(),
                },
            })
            .collect(),
        dependencies: BTreeMap::new(),
    })
}

/// Run the verify-then-install sequence over a local bundle.
pub fn run(
    adapter: &ToolAdapter,
    bundle_dir: &Path,
    archive_path: &Path,
    policy: &PolicyDocument,
    config: &OfflineConfig,
    now: DateTime<Utc>,
) -> OfflineRun {
    let mut records = Vec::new();
    let bundle_ref = bundle_dir.display().to_string();

    macro_rules! fail {
        ($step:expr, $started:expr, $category:expr, $message:expr) => {{
            let message: String = $message;
            records.push(record(
                $step,
                $started,
                &sha256_hex(bundle_ref.as_bytes()),
                StepOutcome::Failed,
                message.clone(),
            ));
            return OfflineRun {
                records,
                outcome: Err(OfflineFailure {
                    step: $step,
                    category: $category,
                    message,
                }),
            };
        }};
    }

    // 1. Bundle integrity.
    let started = Utc::now();
    let manifest = match chiron_bundle::verify_dir(bundle_dir) {
        Ok(manifest) => manifest,
        Err(e) => fail!(
            OfflineStep::BundleIntegrity,
            started,
            e.category(),
            e.to_string()
        ),
    };
    let bundle_sha256 = manifest
        .bundle_sha256
        .clone()
        .unwrap_or_default();
    records.push(record(
        OfflineStep::BundleIntegrity,
        started,
        &bundle_sha256,
        StepOutcome::Ok,
        format!("{} files verified", manifest.checksums.len()),
    ));

    // 2. TUF chain, then per-wheel targets.
    let started = Utc::now();
    let tuf_dir = bundle_dir.join(
        manifest
            .metadata_refs
            .tuf
            .as_deref()
            .unwrap_or(TUF_DIR),
    );
    let repo = match chiron_tuf::read_from_dir(&tuf_dir) {
        Ok(repo) => repo,
        Err(e) => fail!(OfflineStep::TufChain, started, e.category(), e.to_string()),
    };
    if let Err(e) = chiron_tuf::verify_chain(&repo, now) {
        fail!(OfflineStep::TufChain, started, e.category(), e.to_string());
    }
    for wheel in &manifest.wheels {
        let rel = format!("{WHEELS_DIR}/{}", wheel.filename());
        let bytes = match std::fs::read(bundle_dir.join(&rel)) {
            Ok(bytes) => bytes,
            Err(e) => fail!(
                OfflineStep::TufChain,
                started,
                ErrorCategory::BundleIntegrity,
                format!("cannot read {rel}: {e}")
            ),
        };
        if let Err(e) = chiron_tuf::verify_target(&repo, &rel, &bytes) {
            fail!(OfflineStep::TufChain, started, e.category(), e.to_string());
        }
    }
    records.push(record(
        OfflineStep::TufChain,
        started,
        &bundle_sha256,
        StepOutcome::Ok,
        format!("metadata chain and {} targets verified", manifest.wheels.len()),
    ));

    // 3. Attestations.
    let started = Utc::now();
    let lock = match lock_from_bundle(bundle_dir) {
        Ok(lock) => lock,
        Err(message) => fail!(
            OfflineStep::Attestations,
            started,
            ErrorCategory::InputInvalid,
            message
        ),
    };
    let inputs = VerifyInputs {
        bundle_dir,
        archive_path,
        manifest: &manifest,
        lock: &lock,
        identity: &config.identity,
        freshness_days: config.freshness_days,
    };
    let attestations = match verify_bundle(adapter, &inputs) {
        Ok(attestations) => attestations,
        Err(e) => fail!(
            OfflineStep::Attestations,
            started,
            e.category(),
            e.to_string()
        ),
    };
    records.push(record(
        OfflineStep::Attestations,
        started,
        &bundle_sha256,
        StepOutcome::Ok,
        format!(
            "provenance, signature, SBOM ({} components), scan verified",
            attestations.sbom.components.len()
        ),
    ));

    // 4. Policy re-evaluation with the bundled vulnerability report.
    let started = Utc::now();
    let present: BTreeSet<_> = attestations.present.iter().copied().collect();
    let input = PolicyInput::new(&lock, now)
        .with_vulnerabilities(&attestations.vulnerabilities)
        .with_attestations(present);
    let verdict = evaluate(policy, &input);
    if !verdict.allowed {
        let summary = verdict
            .violations
            .iter()
            .map(|v| format!("[{}] {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ");
        fail!(
            OfflineStep::Policy,
            started,
            ErrorCategory::PolicyViolation,
            summary
        );
    }
    records.push(record(
        OfflineStep::Policy,
        started,
        &bundle_sha256,
        StepOutcome::Ok,
        format!("allowed with {} caution(s)", verdict.violations.len()),
    ));

    // 5. Install, hash-enforced, no network.
    let started = Utc::now();
    if config.verify_only {
        records.push(record(
            OfflineStep::Install,
            started,
            &bundle_sha256,
            StepOutcome::Skipped,
            "verification-only run".to_string(),
        ));
        return OfflineRun {
            records,
            outcome: Ok(()),
        };
    }

    // The installer is the resolver binary in install mode; `resolve`
    // is the tag that maps onto it.
    let install = adapter.run(
        ToolInvocation::new(ToolTag::Resolve)
            .working_dir(bundle_dir)
            .args([
                "pip",
                "install",
                "--no-index",
                "--require-hashes",
                "--find-links",
                WHEELS_DIR,
                "--requirement",
                REQUIREMENTS_FILE,
            ]),
    );
    match install {
        Ok(outcome) => {
            records.push(record(
                OfflineStep::Install,
                started,
                &bundle_sha256,
                StepOutcome::Ok,
                format!("installer finished in {} ms", outcome.duration.as_millis()),
            ));
            OfflineRun {
                records,
                outcome: Ok(()),
            }
        }
        Err(e) => {
            let category = e.category();
            let message = e.to_string();
            records.push(record(
                OfflineStep::Install,
                started,
                &bundle_sha256,
                StepOutcome::Failed,
                message.clone(),
            ));
            OfflineRun {
                records,
                outcome: Err(OfflineFailure {
                    step: OfflineStep::Install,
                    category,
                    message,
                }),
            }
        }
    }
}

/// Presence summary used by `verify-bundle` output: which canonical
/// files exist in a bundle directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleStatus {
    pub wheels: usize,
    pub has_manifest: bool,
    pub has_checksums: bool,
    pub has_sbom: bool,
    pub has_osv: bool,
    pub has_signature: bool,
    pub has_provenance: bool,
    pub has_tuf: bool,
}

/// Inspect a bundle directory without verifying anything.
pub fn status(bundle_dir: &Path) -> BundleStatus {
    let wheels = std::fs::read_dir(bundle_dir.join(WHEELS_DIR))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .extension()
                        .is_some_and(|ext| ext == "whl")
                })
                .count()
        })
        .unwrap_or(0);

    BundleStatus {
        wheels,
        has_manifest: bundle_dir.join(MANIFEST_FILE).is_file(),
        has_checksums: bundle_dir.join(CHECKSUMS_FILE).is_file(),
        has_sbom: bundle_dir.join(chiron_bundle::SBOM_FILE).is_file(),
        has_osv: bundle_dir.join(chiron_bundle::OSV_FILE).is_file(),
        has_signature: bundle_dir.join(chiron_bundle::SIGNATURE_FILE).is_file(),
        has_provenance: bundle_dir.join(chiron_bundle::PROVENANCE_FILE).is_file(),
        has_tuf: bundle_dir.join(TUF_DIR).join("root.json").is_file(),
    }
}
