use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use chiron_core::engine::Reporter;
use chiron_core::{Engine, RuntimeConfig};
use chiron_lockfile::parse_constraints;
use chiron_policy::{PolicyInput, evaluate, parse_policy};
use chiron_tools::{ToolAdapter, probe_all};
use chiron_types::{
    Coordinate, ConstraintSource, ErrorCategory, LOCK_VERSION, LockRecord, LockedConstraint,
    PolicyDocument, SurfacedError, Verdict,
};
use chiron_upgrade::UpstreamSnapshot;

#[derive(Parser, Debug)]
#[command(name = "chiron", version)]
#[command(about = "Supply-chain governance for Python wheelhouse bundles")]
struct Cli {
    /// Content-addressed artifact store directory.
    #[arg(long, default_value = ".chiron/store")]
    store_dir: PathBuf,

    /// Audit logs and run state directory.
    #[arg(long, default_value = ".chiron/state")]
    state_dir: PathBuf,

    /// Emit the structured verdict object as JSON on stdout.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve, build, attest, seal, and store a wheelhouse bundle.
    BuildBundle {
        /// Project manifest (pyproject.toml).
        #[arg(long, default_value = "pyproject.toml")]
        manifest: PathBuf,
        /// Policy document (JSON). Defaults to allow-everything.
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Bundle output directory.
        #[arg(long, default_value = "wheelhouse")]
        out: PathBuf,
        /// Wheel-build worker pool size (default: CPU count).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Verify a bundle without installing anything.
    VerifyBundle {
        #[arg(long, default_value = "wheelhouse")]
        bundle: PathBuf,
        /// Bundle archive; defaults to `wheelhouse.tar.gz` next to the
        /// bundle directory.
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Preview drift against an upstream snapshot as an ordered plan.
    PlanUpgrade {
        /// Current lock: a lock record (JSON) or constraints file.
        #[arg(long)]
        lock: PathBuf,
        /// Upstream snapshot (JSON catalog of versions + CVE joins).
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Evaluate a policy over a locked dependency set.
    CheckPolicy {
        #[arg(long)]
        lock: PathBuf,
        #[arg(long)]
        policy: PathBuf,
        /// Baseline lock for upgrade-window rules.
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Normalized vulnerability report (osv.json).
        #[arg(long)]
        osv: Option<PathBuf>,
    },
    /// Rebuild every wheel in a bundle and classify divergences.
    ReproducibilityCheck {
        #[arg(long, default_value = "wheelhouse")]
        bundle: PathBuf,
    },
    /// Run the verify-then-install sequence on an air-gapped host.
    InstallOffline {
        #[arg(long, default_value = "wheelhouse")]
        bundle: PathBuf,
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Probe external tools and the key backend.
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("[error] {err}");
            if let Some(run_id) = &err.run_id {
                eprintln!("[error] run id: {run_id}");
            }
            err.category.exit_code()
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<(), SurfacedError> {
    match &cli.cmd {
        Commands::BuildBundle {
            manifest,
            policy,
            out,
            workers,
        } => {
            let policy = load_policy(policy.as_deref())?;
            let mut config = runtime_config(cli)?;
            if let Some(workers) = workers {
                config = config.with_workers(*workers);
            }
            let engine = Engine::new(config, ToolAdapter::from_env())?;
            let receipt = engine.build_bundle(manifest, &policy, out, &mut CliReporter)?;
            if cli.json {
                print_json(&receipt)?;
            } else {
                println!("run_id: {}", receipt.run_id);
                println!("bundle_sha256: {}", receipt.bundle_sha256);
                println!("wheels: {}", receipt.wheel_count);
                println!("archive: {}", receipt.archive_path.display());
                println!("audit: {}", receipt.audit_path.display());
            }
            Ok(())
        }
        Commands::VerifyBundle {
            bundle,
            archive,
            policy,
        } => {
            let policy = load_policy(policy.as_deref())?;
            let archive = archive_path(bundle, archive.as_deref());
            let engine = Engine::new(runtime_config(cli)?, ToolAdapter::from_env())?;
            let receipt = engine.consume(bundle, &archive, &policy, true, &mut CliReporter)?;
            if cli.json {
                print_json(&receipt)?;
            } else {
                println!("run_id: {}", receipt.run_id);
                println!("verdict: verified");
                print_status(bundle);
            }
            Ok(())
        }
        Commands::PlanUpgrade {
            lock,
            snapshot,
            policy,
        } => {
            let policy = load_policy(policy.as_deref())?;
            let lock = load_lock(lock)?;
            let snapshot = load_snapshot(snapshot)?;
            let engine = Engine::new(runtime_config(cli)?, ToolAdapter::from_env())?;
            let plan = engine.upgrade_preview(&lock, &snapshot, &policy)?;
            if cli.json {
                print_json(&plan)?;
            } else if plan.steps.is_empty() {
                println!("no drift: every coordinate is at its latest admissible version");
            } else {
                for step in &plan.steps {
                    println!(
                        "{:<9} {}: {} -> {} ({})",
                        format!("[{:?}]", step.risk).to_lowercase(),
                        step.name,
                        step.from_version,
                        step.to_version,
                        step.rationale
                    );
                }
            }
            Ok(())
        }
        Commands::CheckPolicy {
            lock,
            policy,
            baseline,
            osv,
        } => {
            let policy = load_policy(Some(policy))?;
            let lock = load_lock(lock)?;
            let baseline = match baseline {
                Some(path) => Some(load_lock(path)?),
                None => None,
            };
            let osv = match osv {
                Some(path) => Some(load_osv(path)?),
                None => None,
            };

            let mut input = PolicyInput::new(&lock, chrono::Utc::now());
            if let Some(baseline) = &baseline {
                input = input.with_baseline(baseline);
            }
            if let Some(osv) = &osv {
                input = input.with_vulnerabilities(osv);
            }
            let verdict = evaluate(&policy, &input);
            print_verdict(&verdict, cli.json)?;
            if verdict.allowed {
                Ok(())
            } else {
                Err(SurfacedError::new(
                    ErrorCategory::PolicyViolation,
                    format!("{} blocking violation(s)", verdict.blocked_count()),
                ))
            }
        }
        Commands::ReproducibilityCheck { bundle } => {
            let engine = Engine::new(runtime_config(cli)?, ToolAdapter::from_env())?;
            let receipt = engine.repro_audit(bundle, &mut CliReporter)?;
            if cli.json {
                print_json(&receipt)?;
            } else {
                println!("run_id: {}", receipt.run_id);
                println!(
                    "reproducible: {}/{} wheel(s)",
                    receipt
                        .reports
                        .iter()
                        .filter(|r| r.normalized_match)
                        .count(),
                    receipt.reports.len()
                );
                for report in receipt.reports.iter().filter(|r| !r.exact_match) {
                    for diff in &report.differences {
                        println!("  {}: {} ({:?})", report.wheel.filename(), diff.path, diff.kind);
                    }
                }
            }
            Ok(())
        }
        Commands::InstallOffline {
            bundle,
            archive,
            policy,
        } => {
            let policy = load_policy(policy.as_deref())?;
            let archive = archive_path(bundle, archive.as_deref());
            let engine = Engine::new(runtime_config(cli)?, ToolAdapter::from_env())?;
            let receipt = engine.consume(bundle, &archive, &policy, false, &mut CliReporter)?;
            if cli.json {
                print_json(&receipt)?;
            } else {
                println!("run_id: {}", receipt.run_id);
                println!("installed: {}", receipt.installed);
            }
            Ok(())
        }
        Commands::Doctor => {
            run_doctor(cli);
            Ok(())
        }
    }
}

fn runtime_config(cli: &Cli) -> Result<RuntimeConfig, SurfacedError> {
    RuntimeConfig::from_env(&cli.store_dir, &cli.state_dir)
        .map_err(|e| SurfacedError::new(ErrorCategory::InputInvalid, e.to_string()))
}

fn archive_path(bundle: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => bundle
            .parent()
            .unwrap_or(Path::new("."))
            .join("wheelhouse.tar.gz"),
    }
}

fn load_policy(path: Option<&Path>) -> Result<PolicyDocument, SurfacedError> {
    let Some(path) = path else {
        return Ok(PolicyDocument::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| {
        SurfacedError::new(
            ErrorCategory::InputInvalid,
            format!("cannot read policy {}: {e}", path.display()),
        )
        .with_reference(path.display().to_string())
    })?;
    parse_policy(&text).map_err(|e| {
        SurfacedError::new(e.category(), e.to_string())
            .with_reference(path.display().to_string())
    })
}

/// Accept either a structured lock record (`.json`) or a constraints
/// file; both normalize into a [`LockRecord`].
fn load_lock(path: &Path) -> Result<LockRecord, SurfacedError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SurfacedError::new(
            ErrorCategory::InputInvalid,
            format!("cannot read lock {}: {e}", path.display()),
        )
        .with_reference(path.display().to_string())
    })?;

    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(&text).map_err(|e| {
            SurfacedError::new(
                ErrorCategory::InputInvalid,
                format!("lock record is malformed: {e}"),
            )
            .with_reference(path.display().to_string())
        });
    }

    let lines = parse_constraints(&text).map_err(|e| {
        SurfacedError::new(e.category(), e.to_string())
            .with_reference(path.display().to_string())
    })?;
    Ok(LockRecord {
        lock_version: LOCK_VERSION.to_string(),
        resolver_version: "constraints-file".to_string(),
        platform_scope: vec![],
        python_scope: vec![],
        constraints: lines
            .into_iter()
            .map(|line| LockedConstraint {
                coordinate: Coordinate::new(&line.name, line.version),
                hashes: line.hashes,
                source: ConstraintSource::Index {
                    url: "constraints-file".to_string(),
                },
            })
            .collect(),
        dependencies: BTreeMap::new(),
    })
}

fn load_snapshot(path: &Path) -> Result<UpstreamSnapshot, SurfacedError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SurfacedError::new(
            ErrorCategory::InputInvalid,
            format!("cannot read snapshot {}: {e}", path.display()),
        )
    })?;
    UpstreamSnapshot::parse(&text)
        .map_err(|e| SurfacedError::new(e.category(), e.to_string()))
}

fn load_osv(path: &Path) -> Result<chiron_types::VulnerabilityReport, SurfacedError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SurfacedError::new(
            ErrorCategory::InputInvalid,
            format!("cannot read report {}: {e}", path.display()),
        )
    })?;
    chiron_attest::scan::parse_report(&text)
        .map_err(|e| SurfacedError::new(e.category(), e.to_string()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), SurfacedError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| SurfacedError::new(ErrorCategory::InternalError, e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn print_verdict(verdict: &Verdict, json: bool) -> Result<(), SurfacedError> {
    if json {
        return print_json(verdict);
    }
    println!("allowed: {}", verdict.allowed);
    for violation in &verdict.violations {
        println!(
            "  [{:?}] {} ({}): {}",
            violation.severity, violation.rule, violation.coordinate, violation.message
        );
        if let Some(suggestion) = &violation.suggestion {
            println!("      hint: {suggestion}");
        }
    }
    Ok(())
}

fn print_status(bundle: &Path) {
    let status = chiron_offline::status(bundle);
    println!("wheels: {}", status.wheels);
    println!(
        "attestations: sbom={} signature={} provenance={} tuf={}",
        status.has_sbom, status.has_signature, status.has_provenance, status.has_tuf
    );
}

fn run_doctor(cli: &Cli) {
    let adapter = ToolAdapter::from_env();
    println!("external tools:");
    for (tag, outcome) in probe_all(&adapter) {
        match outcome {
            Ok(path) => println!("  {tag:<17} ok ({})", path.display()),
            Err(message) => println!("  {tag:<17} MISSING ({message})"),
        }
    }

    match runtime_config(cli) {
        Ok(config) => {
            println!("key backend: {:?}", config.key_backend);
            match config.key_backend.load() {
                Ok(_) => println!("  signing keys load cleanly"),
                Err(e) => println!("  signing keys FAILED to load: {e}"),
            }
            println!("store: {}", config.store_dir.display());
            println!("state: {}", config.state_dir.display());
        }
        Err(e) => println!("configuration error: {e}"),
    }
}
