//! Content-addressed artifact store for chiron bundles.
//!
//! Blobs are keyed by their hex sha256. `put` is idempotent and
//! crash-safe (temp file, fsync, rename); concurrent writers of the
//! same digest converge on one blob. A digest that already exists with
//! different bytes is a collision and halts the pipeline.
//!
//! The on-disk layout (`objects/<aa>/<rest>`) is private to this crate;
//! callers only ever see digests and logical paths.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest as _, Sha256};

use chiron_types::ErrorCategory;

/// Store failures. `Collision` is an invariant breach: same sha256,
/// different bytes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob {digest} not found in store")]
    NotFound { digest: String },
    #[error("digest collision for {digest}: stored bytes differ from incoming bytes")]
    Collision { digest: String },
    #[error("malformed digest `{digest}`: expected 64 hex characters")]
    MalformedDigest { digest: String },
    #[error("store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::NotFound { .. } => ErrorCategory::BundleIntegrity,
            StoreError::Collision { .. } => ErrorCategory::InternalError,
            StoreError::MalformedDigest { .. } => ErrorCategory::InputInvalid,
            StoreError::Io { .. } => ErrorCategory::InternalError,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed content-addressed store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let objects = root.join("objects");
        fs::create_dir_all(&objects).map_err(|e| StoreError::io(&objects, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a blob, returning its hex sha256. Idempotent: a second put
    /// of identical bytes is a no-op; identical digest with different
    /// bytes is fatal.
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let digest = hex::encode(Sha256::digest(bytes));
        let path = self.blob_path(&digest)?;

        if path.exists() {
            // Idempotent fast path; verify to catch corruption.
            let existing = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            if existing == bytes {
                return Ok(digest);
            }
            return Err(StoreError::Collision { digest });
        }

        let parent = path.parent().expect("blob path has a parent");
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

        // Unique temp name per writer; rename-after-fsync publishes the
        // blob, and the last rename of identical content wins safely.
        let nonce = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(".tmp-{}-{}-{}", digest, std::process::id(), nonce));
        {
            let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;

        Ok(digest)
    }

    /// Fetch a blob by digest.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(digest)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                digest: digest.to_string(),
            });
        }
        fs::read(&path).map_err(|e| StoreError::io(&path, e))
    }

    /// Whether a digest is present.
    pub fn contains(&self, digest: &str) -> Result<bool, StoreError> {
        Ok(self.blob_path(digest)?.exists())
    }

    /// Materialize a blob at a logical path outside the store (hard
    /// link when the filesystem allows it, copy otherwise).
    pub fn link(&self, digest: &str, logical_path: &Path) -> Result<(), StoreError> {
        let blob = self.blob_path(digest)?;
        if !blob.exists() {
            return Err(StoreError::NotFound {
                digest: digest.to_string(),
            });
        }
        if let Some(parent) = logical_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        if logical_path.exists() {
            fs::remove_file(logical_path).map_err(|e| StoreError::io(logical_path, e))?;
        }
        if fs::hard_link(&blob, logical_path).is_err() {
            fs::copy(&blob, logical_path).map_err(|e| StoreError::io(logical_path, e))?;
        }
        Ok(())
    }

    /// Digests in the store matching a hex prefix, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.root.join("objects");
        let mut out = Vec::new();

        let shards = fs::read_dir(&objects).map_err(|e| StoreError::io(&objects, e))?;
        for shard in shards {
            let shard = shard.map_err(|e| StoreError::io(&objects, e))?;
            let shard_name = shard.file_name().to_string_lossy().to_string();
            if !shard.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(shard.path()).map_err(|e| StoreError::io(&shard.path(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(&shard.path(), e))?;
                let rest = entry.file_name().to_string_lossy().to_string();
                if rest.starts_with(".tmp-") {
                    continue;
                }
                let digest = format!("{shard_name}{rest}");
                if digest.starts_with(prefix) {
                    out.push(digest);
                }
            }
        }

        out.sort();
        Ok(out)
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(StoreError::MalformedDigest {
                digest: digest.to_string(),
            });
        }
        let (shard, rest) = digest.split_at(2);
        Ok(self.root.join("objects").join(shard).join(rest))
    }
}
