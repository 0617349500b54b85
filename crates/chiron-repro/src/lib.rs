//! Two-build wheel comparison with normalization.
//!
//! Given an original wheel and a rebuild, both are extracted into
//! ordered `path -> entry` maps and compared twice: byte-exact, then
//! under a fixed normalization pipeline (zeroed entry mtimes, stripped
//! build-path prefixes, canonical line endings for the dist-info text
//! files, `RECORD` rows re-sorted by path). The pipeline is a fixed
//! point: applying it twice changes nothing. Original artifacts are
//! never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use chiron_tools::{ToolAdapter, ToolError, ToolInvocation, ToolTag};
use chiron_types::{ErrorCategory, WheelIdentity};

/// Dist-info files whose line endings are canonicalized and which
/// classify as `metadata` differences.
const TEXT_ALLOWLIST: &[&str] = &["METADATA", "RECORD", "WHEEL"];

/// Reproducibility check failures.
#[derive(Debug, thiserror::Error)]
pub enum ReproError {
    #[error("wheel archive is unreadable: {0}")]
    BadWheel(String),
    #[error("rebuild of {wheel} failed")]
    RebuildFailed {
        wheel: String,
        #[source]
        source: ToolError,
    },
    #[error("rebuild of {wheel} produced no wheel file")]
    RebuildProducedNothing { wheel: String },
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReproError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReproError::BadWheel(_) => ErrorCategory::InputInvalid,
            ReproError::RebuildFailed { source, .. } => source.category(),
            ReproError::RebuildProducedNothing { .. } => ErrorCategory::ReproducibilityFailure,
            ReproError::Io { .. } => ErrorCategory::InternalError,
        }
    }
}

/// Archive entry timestamp as stored in the zip header.
pub type EntryMtime = (u16, u8, u8, u8, u8, u8);

/// One extracted archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelEntry {
    pub bytes: Vec<u8>,
    pub mtime: Option<EntryMtime>,
}

/// Ordered extraction of a wheel: archive path -> entry.
pub type WheelMap = BTreeMap<String, WheelEntry>;

/// Extract a wheel (zip) into memory.
pub fn extract_wheel(bytes: &[u8]) -> Result<WheelMap, ReproError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ReproError::BadWheel(e.to_string()))?;
    let mut map = WheelMap::new();

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| ReproError::BadWheel(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| ReproError::BadWheel(e.to_string()))?;
        let mtime = file.last_modified().map(|dt| {
            (
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second(),
            )
        });
        map.insert(
            file.name().to_string(),
            WheelEntry {
                bytes: contents,
                mtime,
            },
        );
    }

    Ok(map)
}

/// Configuration for the normalization pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Build-path prefixes stripped from entry paths before comparing
    /// (e.g. `tmp/build-env-`). Matched literally, longest first.
    #[serde(default)]
    pub strip_path_prefixes: Vec<String>,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_text_allowlisted(path: &str) -> bool {
    TEXT_ALLOWLIST.contains(&basename(path))
}

/// Apply the fixed normalization pipeline. Idempotent.
pub fn normalize(map: &WheelMap, config: &NormalizeConfig) -> WheelMap {
    let mut prefixes = config.strip_path_prefixes.clone();
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));

    let mut out = WheelMap::new();
    for (path, entry) in map {
        let mut path = path.clone();
        for prefix in &prefixes {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                path = rest.to_string();
                break;
            }
        }

        let mut bytes = entry.bytes.clone();
        if is_text_allowlisted(&path) {
            let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
            let text = if basename(&path) == "RECORD" {
                sort_record_rows(&text)
            } else {
                text
            };
            bytes = text.into_bytes();
        }

        out.insert(
            path,
            WheelEntry {
                bytes,
                // Timestamps are masked wholesale.
                mtime: None,
            },
        );
    }
    out
}

/// Re-sort RECORD rows by path; the row set is what matters, not the
/// order the build wrote it in.
fn sort_record_rows(text: &str) -> String {
    let had_trailing_newline = text.ends_with('\n');
    let mut rows: Vec<&str> = text.lines().collect();
    rows.sort();
    let mut out = rows.join("\n");
    if had_trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Kind of a single classified difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Added,
    Removed,
    Content,
    Metadata,
    Timestamp,
}

/// One classified difference between original and rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelDiff {
    pub path: String,
    pub kind: DiffKind,
}

/// Result of comparing one original/rebuild pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub exact_match: bool,
    pub normalized_match: bool,
    /// Differences on the raw pair, ordered by path.
    pub differences: Vec<WheelDiff>,
}

/// Compare two extracted wheels.
pub fn compare(original: &WheelMap, rebuilt: &WheelMap, config: &NormalizeConfig) -> Comparison {
    let exact_match = original == rebuilt;

    let normalized_original = normalize(original, config);
    let normalized_rebuilt = normalize(rebuilt, config);
    let normalized_match = normalized_original == normalized_rebuilt;

    let mut differences = Vec::new();
    let paths: BTreeSet<&String> = original.keys().chain(rebuilt.keys()).collect();
    for path in paths {
        match (original.get(path), rebuilt.get(path)) {
            (Some(_), None) => differences.push(WheelDiff {
                path: path.clone(),
                kind: DiffKind::Removed,
            }),
            (None, Some(_)) => differences.push(WheelDiff {
                path: path.clone(),
                kind: DiffKind::Added,
            }),
            (Some(a), Some(b)) => {
                if a.bytes != b.bytes {
                    let kind = if is_text_allowlisted(path) && basename(path) != "RECORD" {
                        DiffKind::Metadata
                    } else {
                        DiffKind::Content
                    };
                    differences.push(WheelDiff {
                        path: path.clone(),
                        kind,
                    });
                } else if a.mtime != b.mtime {
                    differences.push(WheelDiff {
                        path: path.clone(),
                        kind: DiffKind::Timestamp,
                    });
                }
            }
            (None, None) => unreachable!("path came from one of the maps"),
        }
    }

    Comparison {
        exact_match,
        normalized_match,
        differences,
    }
}

/// Full report for one wheel, in the shape the audit trail records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproReport {
    pub wheel: WheelIdentity,
    pub rebuild_sha256: String,
    pub exact_match: bool,
    pub normalized_match: bool,
    pub differences: Vec<WheelDiff>,
}

/// Rebuild one wheel through the build driver and compare it with the
/// original. The rebuild happens in `scratch_dir`; the original file
/// is only ever read.
pub fn rebuild_and_compare(
    adapter: &ToolAdapter,
    wheel: &WheelIdentity,
    original_path: &Path,
    scratch_dir: &Path,
    config: &NormalizeConfig,
) -> Result<ReproReport, ReproError> {
    let original_bytes = std::fs::read(original_path).map_err(|e| ReproError::Io {
        path: original_path.to_path_buf(),
        source: e,
    })?;

    let out_dir = scratch_dir.join("rebuild");
    std::fs::create_dir_all(&out_dir).map_err(|e| ReproError::Io {
        path: out_dir.clone(),
        source: e,
    })?;

    let out_arg = out_dir.display().to_string();
    let spec = format!("{}=={}", wheel.coordinate.name, wheel.coordinate.version);
    adapter
        .run(
            ToolInvocation::new(ToolTag::BuildWheel)
                .working_dir(scratch_dir)
                .args(["build", "--wheel", "--out-dir", out_arg.as_str(), spec.as_str()]),
        )
        .map_err(|source| ReproError::RebuildFailed {
            wheel: wheel.filename(),
            source,
        })?;

    let rebuilt_path = out_dir.join(wheel.filename());
    let rebuilt_bytes = if rebuilt_path.is_file() {
        std::fs::read(&rebuilt_path).map_err(|e| ReproError::Io {
            path: rebuilt_path.clone(),
            source: e,
        })?
    } else {
        // Some drivers name the wheel with a different build tag; take
        // the single .whl produced, if any.
        let mut candidates: Vec<std::path::PathBuf> = std::fs::read_dir(&out_dir)
            .map_err(|e| ReproError::Io {
                path: out_dir.clone(),
                source: e,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "whl"))
            .collect();
        candidates.sort();
        let Some(first) = candidates.first() else {
            return Err(ReproError::RebuildProducedNothing {
                wheel: wheel.filename(),
            });
        };
        std::fs::read(first).map_err(|e| ReproError::Io {
            path: first.clone(),
            source: e,
        })?
    };

    let rebuild_sha256 = hex::encode(Sha256::digest(&rebuilt_bytes));
    let original_map = extract_wheel(&original_bytes)?;
    let rebuilt_map = extract_wheel(&rebuilt_bytes)?;
    let comparison = compare(&original_map, &rebuilt_map, config);

    Ok(ReproReport {
        wheel: wheel.clone(),
        rebuild_sha256,
        exact_match: comparison.exact_match,
        normalized_match: comparison.normalized_match,
        differences: comparison.differences,
    })
}

/// Bundle-level verdict: the irreproducible fraction must not exceed
/// the tolerance.
pub fn bundle_passes(reports: &[ReproReport], tolerance: f64) -> bool {
    if reports.is_empty() {
        return true;
    }
    let failed = reports.iter().filter(|r| !r.normalized_match).count();
    let fraction = failed as f64 / reports.len() as f64;
    fraction <= tolerance
}
