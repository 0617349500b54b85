//! Wheelhouse staging, manifests, and deterministic archives.
//!
//! The bundler assembles built wheels plus auxiliary metadata into the
//! canonical bundle directory, records every file in the manifest's
//! checksum table, and seals the directory into a byte-reproducible
//! `wheelhouse.tar.gz` (entries sorted lexicographically, zeroed
//! mtimes, zeroed uid/gid, fixed modes). Identical inputs always
//! produce identical archives.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use chiron_canonical::{canonical_bytes, file_sha256, parse_checksums, render_checksums, self_digest};
use chiron_types::{
    BundleManifest, Coordinate, ErrorCategory, MANIFEST_VERSION, MetadataRefs, WheelIdentity,
};
use chiron_version::normalize_name;

/// Canonical file names inside a bundle directory.
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHECKSUMS_FILE: &str = "checksums.sha256";
pub const WHEELS_DIR: &str = "wheels";
pub const SBOM_FILE: &str = "sbom.cdx.json";
pub const OSV_FILE: &str = "osv.json";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const SIGNATURE_FILE: &str = "signature.sig";
pub const SIGNATURE_CERT_FILE: &str = "signature.pem";
pub const PROVENANCE_FILE: &str = "provenance.intoto.jsonl";
pub const TUF_DIR: &str = "tuf";
/// Archive entry prefix, so extraction recreates `wheelhouse/`.
pub const ARCHIVE_ROOT: &str = "wheelhouse";

/// The detached signature covers the archive, so the signature pair
/// can never live inside it and is excluded from checksum tables
/// written before signing.
const SIGNATURE_EXCLUDED: &[&str] = &[SIGNATURE_FILE, SIGNATURE_CERT_FILE];

/// Bundling failures.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("staged wheel not found: {path}")]
    MissingWheel { path: PathBuf },
    #[error("wheel filename does not follow the wheel naming convention: {filename}")]
    BadWheelFilename { filename: String },
    #[error("duplicate wheel identity: {filename} repeats sha256 {sha256}")]
    DuplicateWheelIdentity { filename: String, sha256: String },
    #[error("checksum mismatch for {path}: recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        path: String,
        recorded: String,
        computed: String,
    },
    #[error("bundle manifest self-digest mismatch: stored {stored}, computed {computed}")]
    ManifestDigestMismatch { stored: String, computed: String },
    #[error("bundle at {path} is malformed: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("bundle I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BundleError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BundleError::MissingWheel { .. } | BundleError::BadWheelFilename { .. } => {
                ErrorCategory::InputInvalid
            }
            BundleError::DuplicateWheelIdentity { .. }
            | BundleError::ChecksumMismatch { .. }
            | BundleError::ManifestDigestMismatch { .. }
            | BundleError::Malformed { .. } => ErrorCategory::BundleIntegrity,
            BundleError::Io { .. } => ErrorCategory::InternalError,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        BundleError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Inputs for staging one bundle.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub wheel_paths: Vec<PathBuf>,
    pub sbom_path: Option<PathBuf>,
    pub osv_path: Option<PathBuf>,
    pub requirements_path: Option<PathBuf>,
    pub commit_ref: String,
    pub created_at: DateTime<Utc>,
    pub platform_scope: BTreeSet<String>,
    pub python_scope: BTreeSet<String>,
    /// Pre-declare signature/provenance/TUF references in the sealed
    /// manifest. Their contents derive from the sealed digest, so the
    /// refs must exist before sealing while their checksums cannot.
    pub attach_attestation_refs: bool,
}

impl BundleSpec {
    pub fn new(commit_ref: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            wheel_paths: Vec::new(),
            sbom_path: None,
            osv_path: None,
            requirements_path: None,
            commit_ref: commit_ref.into(),
            created_at,
            platform_scope: BTreeSet::new(),
            python_scope: BTreeSet::new(),
            attach_attestation_refs: false,
        }
    }
}

/// Parse a PEP 427 filename into a wheel identity (sans hash).
///
/// `{distribution}-{version}(-{build})?-{python}-{abi}-{platform}.whl`
pub fn parse_wheel_filename(filename: &str) -> Result<(Coordinate, String, String, String), BundleError> {
    let bad = || BundleError::BadWheelFilename {
        filename: filename.to_string(),
    };

    let stem = filename.strip_suffix(".whl").ok_or_else(bad)?;
    let parts: Vec<&str> = stem.split('-').collect();
    let (name_raw, version_raw, python, abi, platform) = match parts.len() {
        5 => (parts[0], parts[1], parts[2], parts[3], parts[4]),
        // A build tag between version and python tag is tolerated and
        // dropped; the sha256 remains the authoritative identity.
        6 => (parts[0], parts[1], parts[3], parts[4], parts[5]),
        _ => return Err(bad()),
    };

    let version = version_raw.parse().map_err(|_| bad())?;
    let coordinate = Coordinate::new(&normalize_name(&name_raw.replace('_', "-")), version);
    Ok((
        coordinate,
        python.to_string(),
        abi.to_string(),
        platform.to_string(),
    ))
}

/// Stage wheels and metadata into `out_dir`, write the canonical
/// manifest and checksum file, and return the manifest.
///
/// The manifest's checksum table covers every bundle file except the
/// manifest itself and `checksums.sha256`; the checksum file covers
/// everything except itself (including the manifest), so offline
/// verification can start from either.
pub fn stage(spec: &BundleSpec, out_dir: &Path) -> Result<BundleManifest, BundleError> {
    let wheels_dir = out_dir.join(WHEELS_DIR);
    fs::create_dir_all(&wheels_dir).map_err(|e| BundleError::io(&wheels_dir, e))?;

    let mut wheels: Vec<WheelIdentity> = Vec::with_capacity(spec.wheel_paths.len());
    let mut seen_digests: BTreeMap<String, String> = BTreeMap::new();
    let mut checksums: BTreeMap<String, String> = BTreeMap::new();

    for path in &spec.wheel_paths {
        if !path.is_file() {
            return Err(BundleError::MissingWheel { path: path.clone() });
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BundleError::BadWheelFilename {
                filename: path.display().to_string(),
            })?
            .to_string();

        let (coordinate, python_tag, abi_tag, platform_tag) = parse_wheel_filename(&filename)?;
        let sha256 = file_sha256(path).map_err(|e| BundleError::Malformed {
            path: path.clone(),
            message: e.to_string(),
        })?;

        if let Some(previous) = seen_digests.insert(sha256.clone(), filename.clone()) {
            return Err(BundleError::DuplicateWheelIdentity {
                filename: format!("{previous} / {filename}"),
                sha256,
            });
        }

        let staged = wheels_dir.join(&filename);
        fs::copy(path, &staged).map_err(|e| BundleError::io(&staged, e))?;

        checksums.insert(format!("{WHEELS_DIR}/{filename}"), sha256.clone());
        wheels.push(WheelIdentity {
            coordinate,
            python_tag,
            abi_tag,
            platform_tag,
            sha256,
        });
    }

    wheels.sort_by_key(|w| w.sort_key());

    let mut metadata_refs = MetadataRefs::default();
    let mut copy_metadata = |source: &Option<PathBuf>,
                             target_name: &str|
     -> Result<Option<String>, BundleError> {
        let Some(source) = source else {
            return Ok(None);
        };
        if !source.is_file() {
            return Err(BundleError::Malformed {
                path: source.clone(),
                message: "metadata file does not exist".to_string(),
            });
        }
        let target = out_dir.join(target_name);
        fs::copy(source, &target).map_err(|e| BundleError::io(&target, e))?;
        let digest = file_sha256(&target).map_err(|e| BundleError::Malformed {
            path: target.clone(),
            message: e.to_string(),
        })?;
        checksums.insert(target_name.to_string(), digest);
        Ok(Some(target_name.to_string()))
    };

    metadata_refs.sbom = copy_metadata(&spec.sbom_path, SBOM_FILE)?;
    metadata_refs.osv = copy_metadata(&spec.osv_path, OSV_FILE)?;
    metadata_refs.requirements = copy_metadata(&spec.requirements_path, REQUIREMENTS_FILE)?;
    if spec.attach_attestation_refs {
        metadata_refs.signature = Some(SIGNATURE_FILE.to_string());
        metadata_refs.provenance = Some(PROVENANCE_FILE.to_string());
        metadata_refs.tuf = Some(TUF_DIR.to_string());
    }

    let mut manifest = BundleManifest {
        manifest_version: MANIFEST_VERSION.to_string(),
        created_at: spec.created_at,
        commit_ref: spec.commit_ref.clone(),
        platform_scope: spec.platform_scope.clone(),
        python_scope: spec.python_scope.clone(),
        wheels,
        checksums,
        metadata_refs,
        bundle_sha256: None,
    };
    seal_manifest(&mut manifest)?;
    write_manifest(&manifest, out_dir)?;
    refresh_checksums(out_dir)?;

    Ok(manifest)
}

/// Compute and store the manifest self-digest.
pub fn seal_manifest(manifest: &mut BundleManifest) -> Result<(), BundleError> {
    let digest = self_digest(manifest, "bundle_sha256").map_err(|e| BundleError::Malformed {
        path: PathBuf::from(MANIFEST_FILE),
        message: e.to_string(),
    })?;
    manifest.bundle_sha256 = Some(digest);
    Ok(())
}

/// Write the manifest as canonical JSON plus trailing newline.
pub fn write_manifest(manifest: &BundleManifest, out_dir: &Path) -> Result<(), BundleError> {
    let path = out_dir.join(MANIFEST_FILE);
    let mut bytes = canonical_bytes(manifest).map_err(|e| BundleError::Malformed {
        path: path.clone(),
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    fs::write(&path, bytes).map_err(|e| BundleError::io(&path, e))
}

/// (Re)write `checksums.sha256` covering every file except itself and
/// the signature pair. The build pipeline calls this again after
/// provenance and TUF metadata land in the directory.
pub fn refresh_checksums(out_dir: &Path) -> Result<(), BundleError> {
    let mut entries = BTreeMap::new();
    for rel in list_files(out_dir)? {
        if rel == CHECKSUMS_FILE || SIGNATURE_EXCLUDED.contains(&rel.as_str()) {
            continue;
        }
        let digest = file_sha256(&out_dir.join(&rel)).map_err(|e| BundleError::Malformed {
            path: out_dir.join(&rel),
            message: e.to_string(),
        })?;
        entries.insert(rel, digest);
    }
    let path = out_dir.join(CHECKSUMS_FILE);
    fs::write(&path, render_checksums(&entries)).map_err(|e| BundleError::io(&path, e))
}

/// Relative paths of every file under `dir`, sorted, `/`-separated.
fn list_files(dir: &Path) -> Result<Vec<String>, BundleError> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| BundleError::Malformed {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir stays under its root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(rel);
    }
    out.sort();
    Ok(out)
}

/// Read a bundle directory's manifest without verification.
pub fn read_manifest(bundle_dir: &Path) -> Result<BundleManifest, BundleError> {
    let path = bundle_dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(BundleError::Malformed {
            path,
            message: "no manifest.json; not a bundle directory".to_string(),
        });
    }
    let text = fs::read_to_string(&path).map_err(|e| BundleError::io(&path, e))?;
    serde_json::from_str(&text).map_err(|e| BundleError::Malformed {
        path,
        message: e.to_string(),
    })
}

/// Verify a bundle directory: manifest self-digest, every checksum in
/// the manifest, and consistency of `checksums.sha256`.
pub fn verify_dir(bundle_dir: &Path) -> Result<BundleManifest, BundleError> {
    let manifest = read_manifest(bundle_dir)?;

    let stored = manifest
        .bundle_sha256
        .clone()
        .ok_or_else(|| BundleError::Malformed {
            path: bundle_dir.join(MANIFEST_FILE),
            message: "manifest has no bundle_sha256".to_string(),
        })?;
    let computed = self_digest(&manifest, "bundle_sha256").map_err(|e| BundleError::Malformed {
        path: bundle_dir.join(MANIFEST_FILE),
        message: e.to_string(),
    })?;
    if stored != computed {
        return Err(BundleError::ManifestDigestMismatch { stored, computed });
    }

    for (rel, recorded) in &manifest.checksums {
        let path = bundle_dir.join(rel);
        if !path.is_file() {
            return Err(BundleError::MissingWheel { path });
        }
        let actual = file_sha256(&path).map_err(|e| BundleError::Malformed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if &actual != recorded {
            return Err(BundleError::ChecksumMismatch {
                path: rel.clone(),
                recorded: recorded.clone(),
                computed: actual,
            });
        }
    }

    let checksum_path = bundle_dir.join(CHECKSUMS_FILE);
    if checksum_path.is_file() {
        let text =
            fs::read_to_string(&checksum_path).map_err(|e| BundleError::io(&checksum_path, e))?;
        let recorded = parse_checksums(&text).map_err(|e| BundleError::Malformed {
            path: checksum_path.clone(),
            message: e.to_string(),
        })?;
        for (rel, digest) in &recorded {
            let path = bundle_dir.join(rel);
            let actual = file_sha256(&path).map_err(|e| BundleError::Malformed {
                path: path.clone(),
                message: e.to_string(),
            })?;
            if &actual != digest {
                return Err(BundleError::ChecksumMismatch {
                    path: rel.clone(),
                    recorded: digest.clone(),
                    computed: actual,
                });
            }
        }
    }

    Ok(manifest)
}

/// Archive a bundle directory into a deterministic `tar.gz`.
///
/// Entries are added in lexicographic path order under the
/// `wheelhouse/` root with mtime 0, uid/gid 0, mode 644.
pub fn archive(bundle_dir: &Path, archive_path: &Path) -> Result<(), BundleError> {
    let file = fs::File::create(archive_path).map_err(|e| BundleError::io(archive_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for rel in list_files(bundle_dir)? {
        if SIGNATURE_EXCLUDED.contains(&rel.as_str()) {
            continue;
        }
        let full = bundle_dir.join(&rel);
        let bytes = fs::read(&full).map_err(|e| BundleError::io(&full, e))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        let entry_path = format!("{ARCHIVE_ROOT}/{rel}");
        builder
            .append_data(&mut header, &entry_path, bytes.as_slice())
            .map_err(|e| BundleError::io(archive_path, e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BundleError::io(archive_path, e))?;
    encoder
        .finish()
        .map_err(|e| BundleError::io(archive_path, e))?
        .sync_all()
        .map_err(|e| BundleError::io(archive_path, e))?;
    Ok(())
}

/// Extract a bundle archive; returns the extracted bundle directory
/// (`dest/wheelhouse`).
pub fn unarchive(archive_path: &Path, dest: &Path) -> Result<PathBuf, BundleError> {
    let file = fs::File::open(archive_path).map_err(|e| BundleError::io(archive_path, e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest).map_err(|e| BundleError::io(dest, e))?;
    Ok(dest.join(ARCHIVE_ROOT))
}
