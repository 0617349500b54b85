//! Runtime configuration for pipeline runs.
//!
//! Read once at pipeline start and frozen for the run; mid-run
//! environment mutation is ignored by construction. The fixed knob set
//! is `CHIRON_INDEX_URL`, `CHIRON_EXTRA_INDEX_URL`,
//! `CHIRON_SBOM_FRESHNESS_DAYS`, `CHIRON_REBUILD_TOLERANCE`, and
//! `CHIRON_KEY_BACKEND` (tool timeouts are read by the adapter).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use chiron_attest::signature::IdentityPolicy;
use chiron_tuf::{Ed25519KeyProvider, Role};

pub const ENV_INDEX_URL: &str = "CHIRON_INDEX_URL";
pub const ENV_EXTRA_INDEX_URL: &str = "CHIRON_EXTRA_INDEX_URL";
pub const ENV_SBOM_FRESHNESS_DAYS: &str = "CHIRON_SBOM_FRESHNESS_DAYS";
pub const ENV_REBUILD_TOLERANCE: &str = "CHIRON_REBUILD_TOLERANCE";
pub const ENV_KEY_BACKEND: &str = "CHIRON_KEY_BACKEND";

/// Which `KeyProvider` backend signs TUF metadata for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBackend {
    /// Fresh in-memory keys; suitable for tests and throwaway runs.
    Ephemeral,
    /// Base64 Ed25519 seeds per role, loaded from a JSON file.
    SeedFile(PathBuf),
}

impl KeyBackend {
    /// Parse the `CHIRON_KEY_BACKEND` value: `ephemeral` (default) or
    /// `file:<path>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "ephemeral" {
            return Ok(KeyBackend::Ephemeral);
        }
        if let Some(path) = raw.strip_prefix("file:") {
            if path.is_empty() {
                bail!("key backend `file:` is missing a path");
            }
            return Ok(KeyBackend::SeedFile(PathBuf::from(path)));
        }
        bail!("unknown key backend `{raw}` (expected `ephemeral` or `file:<path>`)");
    }

    /// Materialize the provider. Seed files hold
    /// `{"root": "<b64>", "targets": ..., "snapshot": ..., "timestamp": ...}`.
    pub fn load(&self) -> Result<Ed25519KeyProvider> {
        match self {
            KeyBackend::Ephemeral => Ok(Ed25519KeyProvider::generate()),
            KeyBackend::SeedFile(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read key seeds {}", path.display()))?;
                let raw: BTreeMap<String, String> =
                    serde_json::from_str(&text).context("key seed file is not a JSON object")?;

                let mut seeds = BTreeMap::new();
                for role in Role::ALL {
                    let seed = raw.get(role.as_str()).with_context(|| {
                        format!("key seed file is missing role `{role}`")
                    })?;
                    seeds.insert(role, seed.clone());
                }
                Ed25519KeyProvider::from_seeds(&seeds)
                    .map_err(|e| anyhow::anyhow!(e.to_string()))
            }
        }
    }
}

/// Frozen per-run configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub index_url: Option<String>,
    pub extra_index_urls: Vec<String>,
    /// Maximum scan age at verification, days.
    pub sbom_freshness_days: i64,
    /// Fraction of wheels allowed to be irreproducible.
    pub rebuild_tolerance: f64,
    pub key_backend: KeyBackend,
    /// Wheel-build worker pool size.
    pub workers: usize,
    /// Wheel-build failures tolerated before the build stage aborts.
    pub build_failure_tolerance: usize,
    /// Signer identity enforced at verification.
    pub identity: IdentityPolicy,
    /// Content-addressed store location.
    pub store_dir: PathBuf,
    /// Audit logs and run state.
    pub state_dir: PathBuf,
    /// Remove scratch directories when a run is cancelled.
    pub clean_on_cancel: bool,
}

impl RuntimeConfig {
    /// Defaults plus the environment knob overlay.
    pub fn from_env(store_dir: &Path, state_dir: &Path) -> Result<Self> {
        let index_url = std::env::var(ENV_INDEX_URL).ok().filter(|s| !s.is_empty());
        let extra_index_urls = std::env::var(ENV_EXTRA_INDEX_URL)
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let sbom_freshness_days = match std::env::var(ENV_SBOM_FRESHNESS_DAYS) {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("{ENV_SBOM_FRESHNESS_DAYS} must be an integer"))?,
            Err(_) => 7,
        };

        let rebuild_tolerance = match std::env::var(ENV_REBUILD_TOLERANCE) {
            Ok(raw) => {
                let value = raw
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("{ENV_REBUILD_TOLERANCE} must be a number"))?;
                if !(0.0..=1.0).contains(&value) {
                    bail!("{ENV_REBUILD_TOLERANCE} must be within 0.0..=1.0");
                }
                value
            }
            Err(_) => 0.0,
        };

        let key_backend = match std::env::var(ENV_KEY_BACKEND) {
            Ok(raw) => KeyBackend::parse(&raw)?,
            Err(_) => KeyBackend::Ephemeral,
        };

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            index_url,
            extra_index_urls,
            sbom_freshness_days,
            rebuild_tolerance,
            key_backend,
            workers,
            build_failure_tolerance: 0,
            identity: IdentityPolicy::new(".*", ".*"),
            store_dir: store_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            clean_on_cancel: false,
        })
    }

    pub fn with_identity(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
