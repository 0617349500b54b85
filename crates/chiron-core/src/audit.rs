//! Append-only, hash-chained audit log.
//!
//! One chain per pipeline run, one JSONL line per entry. Each entry
//! digests its record's canonical bytes concatenated with the previous
//! entry's digest, so the final digest is a root commitment over the
//! whole run; that root is bound into the bundle's provenance. The
//! coordinator is the only writer; components hand records back and
//! never touch the file themselves.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use chiron_canonical::{canonical_bytes, sha256_hex};
use chiron_types::AuditRecord;

/// Digest seeding the chain before any entry exists.
pub fn genesis() -> String {
    sha256_hex(b"chiron.audit.genesis.v1")
}

/// One link of the chain as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub seq: u64,
    pub prev: String,
    pub digest: String,
    pub record: AuditRecord,
}

fn entry_digest(record: &AuditRecord, prev: &str) -> Result<String> {
    let mut bytes = canonical_bytes(record)?;
    bytes.extend_from_slice(prev.as_bytes());
    Ok(sha256_hex(&bytes))
}

/// An audit chain bound to one file.
#[derive(Debug)]
pub struct AuditChain {
    path: PathBuf,
    entries: Vec<ChainEntry>,
}

impl AuditChain {
    /// Start a fresh chain at `path` (truncating any previous file).
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit dir {}", parent.display()))?;
        }
        std::fs::write(&path, b"")
            .with_context(|| format!("failed to create audit log {}", path.display()))?;
        Ok(Self {
            path,
            entries: Vec::new(),
        })
    }

    /// Load and integrity-check an existing chain.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read audit log {}", path.display()))?;

        let mut entries: Vec<ChainEntry> = Vec::new();
        let mut prev = genesis();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: ChainEntry = serde_json::from_str(line)
                .with_context(|| format!("audit line {} is malformed", lineno + 1))?;
            if entry.seq != entries.len() as u64 {
                bail!("audit line {} has sequence {}", lineno + 1, entry.seq);
            }
            if entry.prev != prev {
                bail!("audit line {} breaks the chain", lineno + 1);
            }
            let expected = entry_digest(&entry.record, &entry.prev)?;
            if entry.digest != expected {
                bail!("audit line {} has a forged digest", lineno + 1);
            }
            prev = entry.digest.clone();
            entries.push(entry);
        }

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; flushes the line to disk before returning.
    pub fn append(&mut self, record: AuditRecord) -> Result<&ChainEntry> {
        let prev = self.root();
        let digest = entry_digest(&record, &prev)?;
        let entry = ChainEntry {
            seq: self.entries.len() as u64,
            prev,
            digest,
            record,
        };

        let line = serde_json::to_string(&entry).context("failed to serialize audit entry")?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        writeln!(file, "{line}").context("failed to append audit entry")?;
        file.flush().context("failed to flush audit log")?;

        self.entries.push(entry);
        Ok(self.entries.last().expect("just pushed"))
    }

    /// Current root digest: the last entry's digest, or the genesis
    /// value for an empty chain.
    pub fn root(&self) -> String {
        self.entries
            .last()
            .map(|e| e.digest.clone())
            .unwrap_or_else(genesis)
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    /// The recorded step outcomes in order, for state-machine replay.
    pub fn replay(&self) -> Vec<&AuditRecord> {
        self.entries.iter().map(|e| &e.record).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
