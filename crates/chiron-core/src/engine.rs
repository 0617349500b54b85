//! The pipeline engine: build, consume, upgrade preview, and
//! reproducibility audit.
//!
//! The engine is single-threaded at the outer level; each pipeline is
//! a fixed sequence of stages, each stage recorded in the run's audit
//! chain before the next may start. Parallelism lives inside the
//! wheel-build stage only, and its results are reassembled in
//! canonical order before staging. No partial artifact is ever
//! promoted into the artifact store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use chiron_attest::provenance::{Material, ProvenanceStatement, SubjectDigest};
use chiron_attest::{sbom, scan, signature};
use chiron_bundle::{
    BundleSpec, PROVENANCE_FILE, REQUIREMENTS_FILE, TUF_DIR, WHEELS_DIR, refresh_checksums,
};
use chiron_canonical::{canonical_bytes, file_sha256, sha256_hex};
use chiron_lockfile::{LockGenerator, ProjectManifest, render_constraints};
use chiron_offline::{OfflineConfig, OfflineStep};
use chiron_policy::{PolicyInput, evaluate};
use chiron_repro::{NormalizeConfig, ReproReport, bundle_passes, rebuild_and_compare};
use chiron_store::ArtifactStore;
use chiron_tools::{CancelFlag, ToolAdapter, ToolInvocation, ToolTag};
use chiron_types::{
    AuditRecord, EnvironmentFingerprint, ErrorCategory, LockRecord, PolicyDocument, StepOutcome,
    SurfacedError, UpgradePlan,
};

use crate::audit::AuditChain;
use crate::config::RuntimeConfig;

/// Progress sink for user-facing output; the engine never prints.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that swallows everything (headless runs, tests).
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// The named pipelines the coordinator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Build,
    Consume,
    UpgradePreview,
    ReproAudit,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Build => "build",
            PipelineKind::Consume => "consume",
            PipelineKind::UpgradePreview => "upgrade_preview",
            PipelineKind::ReproAudit => "repro_audit",
        }
    }
}

/// Run state machine. `Failed` and `Cancelled` are terminal; a
/// resumption creates a new run referencing the prior audit root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { step: String },
    Succeeded,
    Failed { step: String, category: ErrorCategory },
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running { step } => write!(f, "running({step})"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed { step, category } => {
                write!(f, "failed({step}, {})", category.identifier())
            }
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Receipt of a completed build pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReceipt {
    pub run_id: String,
    pub bundle_dir: PathBuf,
    pub archive_path: PathBuf,
    pub bundle_sha256: String,
    pub wheel_count: usize,
    pub audit_root: String,
    pub audit_path: PathBuf,
    /// `(label, digest)` of each blob promoted into the store.
    pub stored: Vec<(String, String)>,
    pub environment: EnvironmentFingerprint,
}

/// Receipt of a consumption (offline install) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeReceipt {
    pub run_id: String,
    pub audit_root: String,
    pub audit_path: PathBuf,
    pub installed: bool,
}

/// Receipt of a reproducibility audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproReceipt {
    pub run_id: String,
    pub reports: Vec<ReproReport>,
    pub reproducible_fraction: f64,
    pub passed: bool,
    pub audit_root: String,
}

/// One pipeline run's bookkeeping: state + audit chain.
struct RunContext {
    run_id: String,
    state: RunState,
    chain: AuditChain,
}

impl RunContext {
    fn new(kind: PipelineKind, state_dir: &Path) -> Result<Self, SurfacedError> {
        let run_id = new_run_id(kind);
        let chain = AuditChain::create(state_dir.join(format!("{run_id}.audit.jsonl")))
            .map_err(|e| {
                SurfacedError::new(ErrorCategory::InternalError, e.to_string())
            })?;
        Ok(Self {
            run_id,
            state: RunState::Pending,
            chain,
        })
    }

    fn record_transition(&mut self, to: &RunState) -> Result<(), SurfacedError> {
        let now = Utc::now();
        let details = format!("{} -> {}", self.state, to);
        let record = AuditRecord {
            step_id: "run_state".to_string(),
            started_at: now,
            ended_at: now,
            inputs_digest: sha256_hex(self.state.to_string().as_bytes()),
            outputs_digest: sha256_hex(to.to_string().as_bytes()),
            outcome: StepOutcome::Ok,
            details,
        };
        self.chain
            .append(record)
            .map_err(|e| SurfacedError::new(ErrorCategory::InternalError, e.to_string()))?;
        self.state = to.clone();
        Ok(())
    }

    fn enter(&mut self, step: &str) -> Result<DateTime<Utc>, SurfacedError> {
        self.record_transition(&RunState::Running {
            step: step.to_string(),
        })?;
        Ok(Utc::now())
    }

    fn step_ok(
        &mut self,
        step: &str,
        started_at: DateTime<Utc>,
        inputs_digest: &str,
        details: String,
    ) -> Result<(), SurfacedError> {
        let record = AuditRecord {
            step_id: step.to_string(),
            started_at,
            ended_at: Utc::now(),
            inputs_digest: inputs_digest.to_string(),
            outputs_digest: sha256_hex(details.as_bytes()),
            outcome: StepOutcome::Ok,
            details,
        };
        self.chain
            .append(record)
            .map_err(|e| SurfacedError::new(ErrorCategory::InternalError, e.to_string()))?;
        Ok(())
    }

    fn fail(
        &mut self,
        step: &str,
        started_at: DateTime<Utc>,
        category: ErrorCategory,
        message: String,
    ) -> SurfacedError {
        let record = AuditRecord {
            step_id: step.to_string(),
            started_at,
            ended_at: Utc::now(),
            inputs_digest: String::new(),
            outputs_digest: sha256_hex(message.as_bytes()),
            outcome: StepOutcome::Failed,
            details: message.clone(),
        };
        let _ = self.chain.append(record);
        let _ = self.record_transition(&RunState::Failed {
            step: step.to_string(),
            category,
        });
        SurfacedError::new(category, message)
            .with_reference(step)
            .with_run_id(self.run_id.clone())
    }

    fn cancelled(&mut self, step: &str) -> SurfacedError {
        let _ = self.record_transition(&RunState::Cancelled);
        SurfacedError::new(ErrorCategory::InternalError, format!("run cancelled at {step}"))
            .with_run_id(self.run_id.clone())
    }

    fn succeed(&mut self) -> Result<(), SurfacedError> {
        self.record_transition(&RunState::Succeeded)
    }
}

fn new_run_id(kind: PipelineKind) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seed = format!("{}-{}-{}", kind.as_str(), nanos, std::process::id());
    format!("{}-{}", kind.as_str(), &sha256_hex(seed.as_bytes())[..12])
}

/// The coordinator. Owns the store, the adapter, and the cancel flag;
/// everything else is passed explicitly per run.
pub struct Engine {
    config: RuntimeConfig,
    adapter: ToolAdapter,
    store: ArtifactStore,
    cancel: CancelFlag,
}

impl Engine {
    /// Build an engine over an explicit adapter (tests inject stub
    /// tool binaries through it).
    pub fn new(config: RuntimeConfig, adapter: ToolAdapter) -> Result<Self, SurfacedError> {
        let cancel = CancelFlag::new();
        let store = ArtifactStore::open(&config.store_dir)
            .map_err(|e| SurfacedError::new(e.category(), e.to_string()))?;
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            SurfacedError::new(
                ErrorCategory::InternalError,
                format!("cannot create state dir: {e}"),
            )
        })?;
        Ok(Self {
            config,
            adapter: adapter.with_cancel(cancel.clone()),
            store,
            cancel,
        })
    }

    /// Handle used to cancel the current run cooperatively.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Cancellation checkpoint. Scratch directories are preserved for
    /// forensics unless clean-on-cancel is set.
    fn check_cancel_scratch(
        &self,
        run: &mut RunContext,
        step: &str,
        scratch: Option<&Path>,
    ) -> Result<(), SurfacedError> {
        if self.cancel.is_cancelled() {
            if self.config.clean_on_cancel
                && let Some(scratch) = scratch
            {
                let _ = std::fs::remove_dir_all(scratch);
            }
            return Err(run.cancelled(step));
        }
        Ok(())
    }

    /// The build pipeline: lock, policy pre-check, wheel build loop,
    /// SBOM + scan, stage, provenance, TUF, archive, sign, store.
    pub fn build_bundle(
        &self,
        pyproject: &Path,
        policy: &PolicyDocument,
        bundle_dir: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<BuildReceipt, SurfacedError> {
        let span = info_span!("build_bundle", pyproject = %pyproject.display());
        let _guard = span.enter();

        let mut run = RunContext::new(PipelineKind::Build, &self.config.state_dir)?;
        let scratch = self.config.state_dir.join("scratch").join(&run.run_id);
        std::fs::create_dir_all(&scratch).map_err(|e| {
            SurfacedError::new(
                ErrorCategory::InternalError,
                format!("cannot create scratch dir: {e}"),
            )
        })?;

        // 1. Lock.
        self.check_cancel_scratch(&mut run, "lock", Some(&scratch))?;
        let started = run.enter("lock")?;
        reporter.info("resolving and hash-pinning the dependency closure...");
        let manifest_digest = file_sha256(pyproject)
            .map_err(|e| run.fail("lock", started, ErrorCategory::InputInvalid, e.to_string()))?;
        let project = ProjectManifest::from_pyproject(pyproject)
            .map_err(|e| run.fail("lock", started, e.category(), e.to_string()))?;
        let mut generator = LockGenerator::new(&self.adapter)
            .with_extra_index_urls(self.config.extra_index_urls.clone());
        if let Some(index) = &self.config.index_url {
            generator = generator.with_index_url(index.clone());
        }
        let (lock, constraints_text) = generator
            .generate(&project, &scratch)
            .map_err(|e| run.fail("lock", started, e.category(), e.to_string()))?;
        run.step_ok(
            "lock",
            started,
            &manifest_digest,
            format!(
                "{} constraints pinned by {}",
                lock.constraints.len(),
                lock.resolver_version
            ),
        )?;

        // 2. Policy pre-check over the locked set.
        self.check_cancel_scratch(&mut run, "policy", Some(&scratch))?;
        let started = run.enter("policy")?;
        let verdict = evaluate(policy, &PolicyInput::new(&lock, Utc::now()));
        for violation in &verdict.violations {
            reporter.warn(&format!(
                "policy {}: {} ({})",
                violation.rule, violation.message, violation.coordinate
            ));
        }
        if !verdict.allowed {
            let summary = format!("{} blocking violation(s)", verdict.blocked_count());
            return Err(run.fail("policy", started, ErrorCategory::PolicyViolation, summary));
        }
        run.step_ok(
            "policy",
            started,
            &sha256_hex(&canonical_bytes(policy).unwrap_or_default()),
            format!("allowed with {} caution(s)", verdict.violations.len()),
        )?;

        // 3. Wheel build loop (bounded worker pool).
        self.check_cancel_scratch(&mut run, "build_wheels", Some(&scratch))?;
        let started = run.enter("build_wheels")?;
        reporter.info(&format!(
            "building {} wheel(s) with {} worker(s)...",
            lock.constraints.len(),
            self.config.workers
        ));
        let wheel_paths = self
            .build_wheels(&lock, &scratch)
            .map_err(|(category, message)| run.fail("build_wheels", started, category, message))?;
        run.step_ok(
            "build_wheels",
            started,
            &sha256_hex(constraints_text.as_bytes()),
            format!("{} wheel(s) built", wheel_paths.len()),
        )?;

        // 4. SBOM and vulnerability scan over the staged set.
        self.check_cancel_scratch(&mut run, "attest_generate", Some(&scratch))?;
        let started = run.enter("attest_generate")?;
        let bom = sbom::generate(&self.adapter, &scratch)
            .map_err(|e| run.fail("attest_generate", started, e.category(), e.to_string()))?;
        sbom::validate_coverage(&bom, &lock)
            .map_err(|e| run.fail("attest_generate", started, e.category(), e.to_string()))?;
        let vulnerabilities = scan::generate(&self.adapter, &scratch, Utc::now())
            .map_err(|e| run.fail("attest_generate", started, e.category(), e.to_string()))?;

        let sbom_path = scratch.join("sbom.cdx.json");
        std::fs::write(
            &sbom_path,
            serde_json::to_vec_pretty(&bom).unwrap_or_default(),
        )
        .map_err(|e| {
            run.fail("attest_generate", started, ErrorCategory::InternalError, e.to_string())
        })?;
        let osv_path = scratch.join("osv.json");
        std::fs::write(
            &osv_path,
            serde_json::to_vec_pretty(&vulnerabilities).unwrap_or_default(),
        )
        .map_err(|e| {
            run.fail("attest_generate", started, ErrorCategory::InternalError, e.to_string())
        })?;
        let requirements_path = scratch.join(REQUIREMENTS_FILE);
        std::fs::write(&requirements_path, render_constraints(&lock)).map_err(|e| {
            run.fail("attest_generate", started, ErrorCategory::InternalError, e.to_string())
        })?;
        run.step_ok(
            "attest_generate",
            started,
            &sha256_hex(constraints_text.as_bytes()),
            format!(
                "SBOM with {} component(s), {} finding(s)",
                bom.components.len(),
                vulnerabilities.records.len()
            ),
        )?;

        // 5. Stage the bundle directory.
        self.check_cancel_scratch(&mut run, "stage", Some(&scratch))?;
        let started = run.enter("stage")?;
        let created_at = Utc::now();
        let spec = BundleSpec {
            wheel_paths,
            sbom_path: Some(sbom_path),
            osv_path: Some(osv_path),
            requirements_path: Some(requirements_path),
            commit_ref: read_commit_ref(pyproject),
            created_at,
            platform_scope: lock.platform_scope.iter().cloned().collect(),
            python_scope: lock.python_scope.iter().cloned().collect(),
            attach_attestation_refs: true,
        };
        let manifest = chiron_bundle::stage(&spec, bundle_dir)
            .map_err(|e| run.fail("stage", started, e.category(), e.to_string()))?;
        let bundle_sha256 = manifest.bundle_sha256.clone().unwrap_or_default();
        run.step_ok(
            "stage",
            started,
            &bundle_sha256,
            format!("{} file(s) staged", manifest.checksums.len()),
        )?;

        // 6. Provenance bound to the audit root so far.
        self.check_cancel_scratch(&mut run, "provenance", Some(&scratch))?;
        let started = run.enter("provenance")?;
        let materials: Vec<Material> = manifest
            .checksums
            .iter()
            .map(|(path, digest)| Material {
                uri: path.clone(),
                digest: SubjectDigest {
                    sha256: digest.clone(),
                },
            })
            .collect();
        let statement = ProvenanceStatement::for_bundle(
            &project.name,
            &manifest,
            "chiron/build-pipeline",
            &sha256_hex(&canonical_bytes(policy).unwrap_or_default()),
            materials,
            &run.chain.root(),
        )
        .map_err(|e| run.fail("provenance", started, e.category(), e.to_string()))?;
        let jsonl = statement
            .to_jsonl()
            .map_err(|e| run.fail("provenance", started, e.category(), e.to_string()))?;
        std::fs::write(bundle_dir.join(PROVENANCE_FILE), jsonl).map_err(|e| {
            run.fail("provenance", started, ErrorCategory::InternalError, e.to_string())
        })?;
        run.step_ok("provenance", started, &bundle_sha256, "statement written".to_string())?;

        // 7. TUF metadata sealing the bundle files.
        self.check_cancel_scratch(&mut run, "tuf", Some(&scratch))?;
        let started = run.enter("tuf")?;
        let provider = self.config.key_backend.load().map_err(|e| {
            run.fail("tuf", started, ErrorCategory::TufError, e.to_string())
        })?;
        let mut targets: BTreeMap<String, chiron_tuf::TargetMeta> = BTreeMap::new();
        for rel in manifest
            .checksums
            .keys()
            .cloned()
            .chain([
                chiron_bundle::MANIFEST_FILE.to_string(),
                PROVENANCE_FILE.to_string(),
            ])
        {
            let bytes = std::fs::read(bundle_dir.join(&rel)).map_err(|e| {
                run.fail("tuf", started, ErrorCategory::InternalError, e.to_string())
            })?;
            targets.insert(rel, chiron_tuf::TargetMeta::for_bytes(&bytes));
        }
        let repo = chiron_tuf::generate(
            &provider,
            targets,
            &chiron_tuf::Expiries::conventional(created_at),
            1,
        )
        .map_err(|e| run.fail("tuf", started, e.category(), e.to_string()))?;
        chiron_tuf::write_to_dir(&repo, &bundle_dir.join(TUF_DIR))
            .map_err(|e| run.fail("tuf", started, e.category(), e.to_string()))?;
        refresh_checksums(bundle_dir)
            .map_err(|e| run.fail("tuf", started, e.category(), e.to_string()))?;
        run.step_ok("tuf", started, &bundle_sha256, "four roles written".to_string())?;

        // 8. Deterministic archive.
        self.check_cancel_scratch(&mut run, "archive", Some(&scratch))?;
        let started = run.enter("archive")?;
        let archive_path = bundle_dir
            .parent()
            .unwrap_or(Path::new("."))
            .join("wheelhouse.tar.gz");
        chiron_bundle::archive(bundle_dir, &archive_path)
            .map_err(|e| run.fail("archive", started, e.category(), e.to_string()))?;
        let archive_digest = file_sha256(&archive_path).map_err(|e| {
            run.fail("archive", started, ErrorCategory::InternalError, e.to_string())
        })?;
        run.step_ok("archive", started, &bundle_sha256, archive_digest.clone())?;

        // 9. Detached signature over the archive bytes.
        self.check_cancel_scratch(&mut run, "sign", Some(&scratch))?;
        let started = run.enter("sign")?;
        signature::sign_archive(&self.adapter, &archive_path, bundle_dir)
            .map_err(|e| run.fail("sign", started, e.category(), e.to_string()))?;
        run.step_ok("sign", started, &archive_digest, "detached signature written".to_string())?;

        // 10. Promote into the artifact store. Nothing earlier touched
        // the store, so a failed run leaves it in its pre-run state.
        self.check_cancel_scratch(&mut run, "store", Some(&scratch))?;
        let started = run.enter("store")?;
        let mut stored = Vec::new();
        let archive_bytes = std::fs::read(&archive_path).map_err(|e| {
            run.fail("store", started, ErrorCategory::InternalError, e.to_string())
        })?;
        let digest = self
            .store
            .put(&archive_bytes)
            .map_err(|e| run.fail("store", started, e.category(), e.to_string()))?;
        stored.push(("wheelhouse.tar.gz".to_string(), digest));
        let manifest_bytes = canonical_bytes(&manifest).map_err(|e| {
            run.fail("store", started, ErrorCategory::InternalError, e.to_string())
        })?;
        let digest = self
            .store
            .put(&manifest_bytes)
            .map_err(|e| run.fail("store", started, e.category(), e.to_string()))?;
        stored.push(("manifest.json".to_string(), digest));
        run.step_ok(
            "store",
            started,
            &bundle_sha256,
            format!("{} blob(s) promoted", stored.len()),
        )?;

        run.succeed()?;
        reporter.info(&format!("bundle sealed: {bundle_sha256}"));
        debug!(run_id = %run.run_id, "build pipeline finished");

        Ok(BuildReceipt {
            run_id: run.run_id.clone(),
            bundle_dir: bundle_dir.to_path_buf(),
            archive_path,
            bundle_sha256,
            wheel_count: manifest.wheels.len(),
            audit_root: run.chain.root(),
            audit_path: run.chain.path().to_path_buf(),
            stored,
            environment: EnvironmentFingerprint {
                resolver_version: Some(lock.resolver_version.clone()),
                ..EnvironmentFingerprint::collect()
            },
        })
    }

    /// Wheel-build worker pool. Tasks write only into their own
    /// scratch subdirectory and report through an ordered channel;
    /// results are reassembled in constraint order.
    fn build_wheels(
        &self,
        lock: &LockRecord,
        scratch: &Path,
    ) -> Result<Vec<PathBuf>, (ErrorCategory, String)> {
        let tasks: Vec<(usize, String, String)> = lock
            .constraints
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                (
                    idx,
                    c.coordinate.name.clone(),
                    c.coordinate.version.to_string(),
                )
            })
            .collect();
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, Result<PathBuf, String>)>();
        let workers = self.config.workers.min(tasks.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let tasks = &tasks;
                let next = &next;
                scope.spawn(move || {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some((task_idx, name, version)) = tasks.get(idx) else {
                            break;
                        };
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let result = self.build_one_wheel(*task_idx, name, version, scratch);
                        if tx.send((*task_idx, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
        });

        let mut results: Vec<Option<Result<PathBuf, String>>> = vec![None; tasks.len()];
        for (idx, result) in rx {
            results[idx] = Some(result);
        }

        let mut wheels = Vec::with_capacity(tasks.len());
        let mut failures: Vec<String> = Vec::new();
        for (idx, slot) in results.into_iter().enumerate() {
            match slot {
                Some(Ok(path)) => wheels.push(path),
                Some(Err(message)) => failures.push(message),
                None => failures.push(format!(
                    "{}: build skipped (cancelled or worker died)",
                    tasks[idx].1
                )),
            }
        }

        if failures.len() > self.config.build_failure_tolerance {
            return Err((
                ErrorCategory::ToolFailed,
                format!(
                    "{} wheel build(s) failed (tolerance {}): {}",
                    failures.len(),
                    self.config.build_failure_tolerance,
                    failures.join("; ")
                ),
            ));
        }

        Ok(wheels)
    }

    fn build_one_wheel(
        &self,
        idx: usize,
        name: &str,
        version: &str,
        scratch: &Path,
    ) -> Result<PathBuf, String> {
        let task_dir = scratch.join(format!("wheel-{idx}"));
        std::fs::create_dir_all(&task_dir).map_err(|e| format!("{name}: {e}"))?;

        let spec = format!("{name}=={version}");
        self.adapter
            .run(
                ToolInvocation::new(ToolTag::BuildWheel)
                    .working_dir(&task_dir)
                    .args(["pip", "wheel", spec.as_str(), "--wheel-dir", ".", "--no-deps"]),
            )
            .map_err(|e| format!("{name}: {e}"))?;

        let mut produced: Vec<PathBuf> = std::fs::read_dir(&task_dir)
            .map_err(|e| format!("{name}: {e}"))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "whl"))
            .collect();
        produced.sort();
        produced
            .into_iter()
            .next()
            .ok_or_else(|| format!("{name}: build driver produced no wheel"))
    }

    /// The consumption pipeline: the offline verify-then-install
    /// sequence, with every step's record appended to this run's
    /// audit chain.
    pub fn consume(
        &self,
        bundle_dir: &Path,
        archive_path: &Path,
        policy: &PolicyDocument,
        verify_only: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<ConsumeReceipt, SurfacedError> {
        let mut run = RunContext::new(PipelineKind::Consume, &self.config.state_dir)?;
        run.record_transition(&RunState::Running {
            step: OfflineStep::BundleIntegrity.as_str().to_string(),
        })?;

        let config = OfflineConfig {
            identity: self.config.identity.clone(),
            freshness_days: self.config.sbom_freshness_days,
            verify_only,
        };
        let outcome = chiron_offline::run(
            &self.adapter,
            bundle_dir,
            archive_path,
            policy,
            &config,
            Utc::now(),
        );

        for record in &outcome.records {
            reporter.info(&format!("{}: {:?}", record.step_id, record.outcome));
            run.chain
                .append(record.clone())
                .map_err(|e| SurfacedError::new(ErrorCategory::InternalError, e.to_string()))?;
        }

        match outcome.outcome {
            Ok(()) => {
                run.succeed()?;
                Ok(ConsumeReceipt {
                    run_id: run.run_id.clone(),
                    audit_root: run.chain.root(),
                    audit_path: run.chain.path().to_path_buf(),
                    installed: !verify_only,
                })
            }
            Err(failure) => {
                let step = failure.step.as_str().to_string();
                let category = failure.category;
                let message = failure.to_string();
                let _ = run.record_transition(&RunState::Failed {
                    step: step.clone(),
                    category,
                });
                Err(SurfacedError::new(category, message)
                    .with_reference(step)
                    .with_run_id(run.run_id.clone()))
            }
        }
    }

    /// Read-only upgrade preview: drift + risk classification.
    pub fn upgrade_preview(
        &self,
        lock: &LockRecord,
        snapshot: &chiron_upgrade::UpstreamSnapshot,
        policy: &PolicyDocument,
    ) -> Result<UpgradePlan, SurfacedError> {
        let mut run = RunContext::new(PipelineKind::UpgradePreview, &self.config.state_dir)?;
        let started = run.enter("plan")?;
        let plan = chiron_upgrade::plan_upgrades(lock, snapshot, policy, Utc::now())
            .map_err(|e| run.fail("plan", started, e.category(), e.to_string()))?;
        run.step_ok(
            "plan",
            started,
            &sha256_hex(&canonical_bytes(lock).unwrap_or_default()),
            format!("{} step(s) planned", plan.steps.len()),
        )?;
        run.succeed()?;
        Ok(plan)
    }

    /// Reproducibility audit over an existing bundle. Never mutates
    /// the bundle; rebuilds happen in run-scoped scratch space.
    pub fn repro_audit(
        &self,
        bundle_dir: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<ReproReceipt, SurfacedError> {
        let mut run = RunContext::new(PipelineKind::ReproAudit, &self.config.state_dir)?;
        let scratch = self.config.state_dir.join("scratch").join(&run.run_id);

        let started = run.enter("rebuild")?;
        let manifest = chiron_bundle::read_manifest(bundle_dir)
            .map_err(|e| run.fail("rebuild", started, e.category(), e.to_string()))?;

        let normalize = NormalizeConfig::default();
        let mut reports = Vec::with_capacity(manifest.wheels.len());
        for (idx, wheel) in manifest.wheels.iter().enumerate() {
            self.check_cancel_scratch(&mut run, "rebuild", Some(&scratch))?;
            let original = bundle_dir.join(WHEELS_DIR).join(wheel.filename());
            let wheel_scratch = scratch.join(format!("repro-{idx}"));
            std::fs::create_dir_all(&wheel_scratch).map_err(|e| {
                run.fail("rebuild", started, ErrorCategory::InternalError, e.to_string())
            })?;

            match rebuild_and_compare(&self.adapter, wheel, &original, &wheel_scratch, &normalize) {
                Ok(report) => {
                    if !report.normalized_match {
                        reporter.warn(&format!("{}: rebuild diverged", wheel.filename()));
                    }
                    reports.push(report);
                }
                Err(e) => {
                    return Err(run.fail("rebuild", started, e.category(), e.to_string()));
                }
            }
        }

        let matched = reports.iter().filter(|r| r.normalized_match).count();
        let fraction = if reports.is_empty() {
            1.0
        } else {
            matched as f64 / reports.len() as f64
        };
        let passed = bundle_passes(&reports, self.config.rebuild_tolerance);
        run.step_ok(
            "rebuild",
            started,
            manifest.bundle_sha256.as_deref().unwrap_or(""),
            format!("{matched}/{} wheel(s) reproducible", reports.len()),
        )?;

        if !passed {
            let message = format!(
                "{}/{} wheel(s) diverged beyond tolerance {}",
                reports.len() - matched,
                reports.len(),
                self.config.rebuild_tolerance
            );
            return Err(run.fail(
                "verdict",
                started,
                ErrorCategory::ReproducibilityFailure,
                message,
            ));
        }

        run.succeed()?;
        Ok(ReproReceipt {
            run_id: run.run_id.clone(),
            reports,
            reproducible_fraction: fraction,
            passed,
            audit_root: run.chain.root(),
        })
    }
}

/// Best-effort commit reference for the manifest: `GIT_COMMIT` env or
/// the repository HEAD next to the project manifest.
fn read_commit_ref(pyproject: &Path) -> String {
    if let Ok(commit) = std::env::var("GIT_COMMIT")
        && !commit.is_empty()
    {
        return commit;
    }
    let root = pyproject.parent().unwrap_or(Path::new("."));
    let head = root.join(".git").join("HEAD");
    if let Ok(text) = std::fs::read_to_string(head) {
        return text.trim().to_string();
    }
    "unknown".to_string()
}
