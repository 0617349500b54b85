//! Root/targets/snapshot/timestamp update metadata for chiron bundles.
//!
//! Four roles, each `{signed, signatures}` with canonical-JSON signing
//! bytes. Root carries the key set and per-role thresholds; targets
//! lists every downloadable file with length and hashes; snapshot pins
//! the targets version; timestamp pins the snapshot version with a
//! short expiry. Client verification runs in that fixed order and
//! aborts on the first failure.
//!
//! The manager holds no secrets: signing goes through a pluggable
//! [`KeyProvider`]. An Ed25519 file/memory-backed provider ships for
//! tests and air-gapped use.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use chiron_canonical::canonical_bytes;
use chiron_types::ErrorCategory;

pub const SPEC_VERSION: &str = "1.0.0";

/// The four metadata roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }

    pub fn filename(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// TUF verification and lifecycle failures. All surface as `tuf_error`.
#[derive(Debug, thiserror::Error)]
pub enum TufError {
    #[error("{role} metadata expired at {expired_at}")]
    Expired {
        role: Role,
        expired_at: DateTime<Utc>,
    },
    #[error("{role} signature threshold unmet: {valid} of {threshold} required signatures")]
    ThresholdUnmet {
        role: Role,
        valid: usize,
        threshold: u32,
    },
    #[error("{role} metadata version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        role: Role,
        expected: u32,
        found: u32,
    },
    #[error("target {path} is not listed in targets metadata")]
    UnknownTarget { path: String },
    #[error("target {path} length mismatch: listed {listed}, actual {actual}")]
    TargetLengthMismatch {
        path: String,
        listed: u64,
        actual: u64,
    },
    #[error("target {path} hash mismatch")]
    TargetHashMismatch { path: String },
    #[error("{role} metadata is malformed: {message}")]
    Malformed { role: Role, message: String },
    #[error("root rotation invalid: {0}")]
    RotationInvalid(String),
    #[error("key provider failure: {0}")]
    KeyProvider(String),
}

impl TufError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::TufError
    }
}

/// One public key entry in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: String,
    /// Base64 of the 32-byte Ed25519 public key.
    pub public: String,
}

/// Key ids plus threshold for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// `signed` payload of root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPayload {
    pub spec_version: String,
    pub version: u32,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, PublicKey>,
    pub roles: BTreeMap<String, RoleKeys>,
}

/// Length + hashes for one downloadable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMeta {
    pub length: u64,
    /// algorithm -> hex digest; sha256 is always present.
    pub hashes: BTreeMap<String, String>,
}

impl TargetMeta {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), hex::encode(Sha256::digest(bytes)));
        Self {
            length: bytes.len() as u64,
            hashes,
        }
    }
}

/// `signed` payload of targets metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsPayload {
    pub spec_version: String,
    pub version: u32,
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, TargetMeta>,
}

/// `signed` payload of snapshot metadata: pins the targets version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub spec_version: String,
    pub version: u32,
    pub expires: DateTime<Utc>,
    pub targets_version: u32,
}

/// `signed` payload of timestamp metadata: pins the snapshot version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPayload {
    pub spec_version: String,
    pub version: u32,
    pub expires: DateTime<Utc>,
    pub snapshot_version: u32,
}

/// Detached signature over a payload's canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSignature {
    pub keyid: String,
    /// Base64 of the 64-byte Ed25519 signature.
    pub sig: String,
}

/// On-disk shape of every role file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub signed: T,
    pub signatures: Vec<RoleSignature>,
}

/// Pluggable signing backend. The manager's correctness is agnostic to
/// whether this is an in-memory key, a keyring, or an HSM.
pub trait KeyProvider {
    /// Sign canonical payload bytes for a role.
    fn sign(&self, role: Role, bytes: &[u8]) -> Result<Vec<RoleSignature>, TufError>;
    /// Public keys for a role, `(keyid, key)` pairs.
    fn public_set(&self, role: Role) -> Vec<(String, PublicKey)>;
}

/// Key id: hex sha256 of the raw public key bytes.
pub fn key_id(public_b64: &str) -> Result<String, TufError> {
    let bytes = B64
        .decode(public_b64)
        .map_err(|e| TufError::KeyProvider(format!("bad public key encoding: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// In-memory Ed25519 provider with one keypair per role.
pub struct Ed25519KeyProvider {
    keys: BTreeMap<Role, SigningKey>,
}

impl Ed25519KeyProvider {
    /// Generate a fresh keypair per role from OS randomness.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let keys = Role::ALL
            .iter()
            .map(|role| (*role, SigningKey::generate(&mut csprng)))
            .collect();
        Self { keys }
    }

    /// Load from base64-encoded 32-byte seeds, one per role.
    /// Intermediate seed bytes are zeroized after use.
    pub fn from_seeds(seeds: &BTreeMap<Role, String>) -> Result<Self, TufError> {
        let mut keys = BTreeMap::new();
        for (role, seed_b64) in seeds {
            let mut seed = B64
                .decode(seed_b64)
                .map_err(|e| TufError::KeyProvider(format!("{role}: bad seed encoding: {e}")))?;
            if seed.len() != 32 {
                let len = seed.len();
                seed.zeroize();
                return Err(TufError::KeyProvider(format!(
                    "{role}: seed must be 32 bytes, was {len}"
                )));
            }
            let mut array = [0u8; 32];
            array.copy_from_slice(&seed);
            seed.zeroize();
            keys.insert(*role, SigningKey::from_bytes(&array));
            array.zeroize();
        }
        Ok(Self { keys })
    }

    fn key_for(&self, role: Role) -> Result<&SigningKey, TufError> {
        self.keys
            .get(&role)
            .ok_or_else(|| TufError::KeyProvider(format!("no key configured for role {role}")))
    }
}

impl KeyProvider for Ed25519KeyProvider {
    fn sign(&self, role: Role, bytes: &[u8]) -> Result<Vec<RoleSignature>, TufError> {
        let key = self.key_for(role)?;
        let public_b64 = B64.encode(key.verifying_key().to_bytes());
        Ok(vec![RoleSignature {
            keyid: key_id(&public_b64)?,
            sig: B64.encode(key.sign(bytes).to_bytes()),
        }])
    }

    fn public_set(&self, role: Role) -> Vec<(String, PublicKey)> {
        match self.keys.get(&role) {
            Some(key) => {
                let public_b64 = B64.encode(key.verifying_key().to_bytes());
                let keyid = key_id(&public_b64).expect("freshly encoded key is decodable");
                vec![(
                    keyid,
                    PublicKey {
                        keytype: "ed25519".to_string(),
                        public: public_b64,
                    },
                )]
            }
            None => Vec::new(),
        }
    }
}

/// Expiry horizons for one generation pass.
#[derive(Debug, Clone)]
pub struct Expiries {
    pub root: DateTime<Utc>,
    pub targets: DateTime<Utc>,
    pub snapshot: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl Expiries {
    /// Conventional horizons relative to `now`: root months out,
    /// targets/snapshot days, timestamp hours.
    pub fn conventional(now: DateTime<Utc>) -> Self {
        Self {
            root: now + chrono::Duration::days(365),
            targets: now + chrono::Duration::days(30),
            snapshot: now + chrono::Duration::days(7),
            timestamp: now + chrono::Duration::days(1),
        }
    }
}

/// A complete four-role metadata set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TufRepo {
    pub root: Envelope<RootPayload>,
    pub targets: Envelope<TargetsPayload>,
    pub snapshot: Envelope<SnapshotPayload>,
    pub timestamp: Envelope<TimestampPayload>,
}

fn sign_payload<T: Serialize>(
    provider: &dyn KeyProvider,
    role: Role,
    payload: &T,
) -> Result<Vec<RoleSignature>, TufError> {
    let bytes = canonical_bytes(payload).map_err(|e| TufError::Malformed {
        role,
        message: e.to_string(),
    })?;
    let signatures = provider.sign(role, &bytes)?;
    if signatures.is_empty() {
        return Err(TufError::KeyProvider(format!(
            "provider returned no signatures for {role}"
        )));
    }
    Ok(signatures)
}

/// Generate a fresh metadata set at version 1 (or `base_version`).
pub fn generate(
    provider: &dyn KeyProvider,
    targets: BTreeMap<String, TargetMeta>,
    expiries: &Expiries,
    base_version: u32,
) -> Result<TufRepo, TufError> {
    let mut keys = BTreeMap::new();
    let mut roles = BTreeMap::new();
    for role in Role::ALL {
        let mut keyids = Vec::new();
        for (keyid, public) in provider.public_set(role) {
            keyids.push(keyid.clone());
            keys.insert(keyid, public);
        }
        if keyids.is_empty() {
            return Err(TufError::KeyProvider(format!(
                "provider exposes no public keys for {role}"
            )));
        }
        roles.insert(
            role.as_str().to_string(),
            RoleKeys {
                keyids,
                threshold: 1,
            },
        );
    }

    let root_payload = RootPayload {
        spec_version: SPEC_VERSION.to_string(),
        version: base_version,
        expires: expiries.root,
        keys,
        roles,
    };
    let targets_payload = TargetsPayload {
        spec_version: SPEC_VERSION.to_string(),
        version: base_version,
        expires: expiries.targets,
        targets,
    };
    let snapshot_payload = SnapshotPayload {
        spec_version: SPEC_VERSION.to_string(),
        version: base_version,
        expires: expiries.snapshot,
        targets_version: targets_payload.version,
    };
    let timestamp_payload = TimestampPayload {
        spec_version: SPEC_VERSION.to_string(),
        version: base_version,
        expires: expiries.timestamp,
        snapshot_version: snapshot_payload.version,
    };

    Ok(TufRepo {
        root: Envelope {
            signatures: sign_payload(provider, Role::Root, &root_payload)?,
            signed: root_payload,
        },
        targets: Envelope {
            signatures: sign_payload(provider, Role::Targets, &targets_payload)?,
            signed: targets_payload,
        },
        snapshot: Envelope {
            signatures: sign_payload(provider, Role::Snapshot, &snapshot_payload)?,
            signed: snapshot_payload,
        },
        timestamp: Envelope {
            signatures: sign_payload(provider, Role::Timestamp, &timestamp_payload)?,
            signed: timestamp_payload,
        },
    })
}

fn verify_signatures<T: Serialize>(
    root: &RootPayload,
    role: Role,
    envelope: &Envelope<T>,
) -> Result<(), TufError> {
    let role_keys = root
        .roles
        .get(role.as_str())
        .ok_or_else(|| TufError::Malformed {
            role,
            message: "root does not declare this role".to_string(),
        })?;

    let bytes = canonical_bytes(&envelope.signed).map_err(|e| TufError::Malformed {
        role,
        message: e.to_string(),
    })?;

    let mut valid = 0usize;
    let mut seen = std::collections::BTreeSet::new();
    for signature in &envelope.signatures {
        if !role_keys.keyids.contains(&signature.keyid) {
            continue;
        }
        // One vote per key, however many signatures it emitted.
        if !seen.insert(&signature.keyid) {
            continue;
        }
        let Some(public) = root.keys.get(&signature.keyid) else {
            continue;
        };
        if verify_one(public, &bytes, &signature.sig) {
            valid += 1;
        }
    }

    if valid < role_keys.threshold as usize {
        return Err(TufError::ThresholdUnmet {
            role,
            valid,
            threshold: role_keys.threshold,
        });
    }
    Ok(())
}

fn verify_one(public: &PublicKey, bytes: &[u8], sig_b64: &str) -> bool {
    if public.keytype != "ed25519" {
        return false;
    }
    let Ok(pk_bytes) = B64.decode(&public.public) else {
        return false;
    };
    let pk_array: [u8; 32] = match pk_bytes.try_into() {
        Ok(array) => array,
        Err(_) => return false,
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&pk_array) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(sig_b64) else {
        return false;
    };
    let sig_array: [u8; 64] = match sig_bytes.try_into() {
        Ok(array) => array,
        Err(_) => return false,
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);
    verifying.verify(bytes, &signature).is_ok()
}

fn check_expiry(role: Role, expires: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), TufError> {
    if now >= expires {
        return Err(TufError::Expired {
            role,
            expired_at: expires,
        });
    }
    Ok(())
}

/// Client verification sequence. Fixed order, first failure aborts:
/// timestamp (signature, threshold, expiry), snapshot at the version
/// the timestamp names, targets at the version the snapshot names.
pub fn verify_chain(repo: &TufRepo, now: DateTime<Utc>) -> Result<(), TufError> {
    let root = &repo.root.signed;

    // Root itself must be live and self-consistent before anything
    // else is trusted.
    check_expiry(Role::Root, root.expires, now)?;
    verify_signatures(root, Role::Root, &repo.root)?;

    // 1. Timestamp.
    verify_signatures(root, Role::Timestamp, &repo.timestamp)?;
    check_expiry(Role::Timestamp, repo.timestamp.signed.expires, now)?;

    // 2. Snapshot, at the version the timestamp names.
    if repo.snapshot.signed.version != repo.timestamp.signed.snapshot_version {
        return Err(TufError::VersionMismatch {
            role: Role::Snapshot,
            expected: repo.timestamp.signed.snapshot_version,
            found: repo.snapshot.signed.version,
        });
    }
    verify_signatures(root, Role::Snapshot, &repo.snapshot)?;
    check_expiry(Role::Snapshot, repo.snapshot.signed.expires, now)?;

    // 3. Targets, at the version the snapshot names.
    if repo.targets.signed.version != repo.snapshot.signed.targets_version {
        return Err(TufError::VersionMismatch {
            role: Role::Targets,
            expected: repo.snapshot.signed.targets_version,
            found: repo.targets.signed.version,
        });
    }
    verify_signatures(root, Role::Targets, &repo.targets)?;
    check_expiry(Role::Targets, repo.targets.signed.expires, now)?;

    Ok(())
}

/// Step 4 of the client sequence: length + hash for one target.
pub fn verify_target(repo: &TufRepo, path: &str, bytes: &[u8]) -> Result<(), TufError> {
    let meta = repo
        .targets
        .signed
        .targets
        .get(path)
        .ok_or_else(|| TufError::UnknownTarget {
            path: path.to_string(),
        })?;

    if meta.length != bytes.len() as u64 {
        return Err(TufError::TargetLengthMismatch {
            path: path.to_string(),
            listed: meta.length,
            actual: bytes.len() as u64,
        });
    }
    let expected = meta
        .hashes
        .get("sha256")
        .ok_or_else(|| TufError::Malformed {
            role: Role::Targets,
            message: format!("target {path} lists no sha256"),
        })?;
    if hex::encode(Sha256::digest(bytes)) != *expected {
        return Err(TufError::TargetHashMismatch {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Rotate root: produce version N+1 with the new provider's keys,
/// signed by BOTH the previous and the new root keys so old clients
/// can walk the chain.
pub fn rotate_root(
    previous: &Envelope<RootPayload>,
    old_provider: &dyn KeyProvider,
    new_provider: &dyn KeyProvider,
    expires: DateTime<Utc>,
) -> Result<Envelope<RootPayload>, TufError> {
    let mut keys = BTreeMap::new();
    let mut roles = BTreeMap::new();
    for role in Role::ALL {
        let mut keyids = Vec::new();
        for (keyid, public) in new_provider.public_set(role) {
            keyids.push(keyid.clone());
            keys.insert(keyid, public);
        }
        if keyids.is_empty() {
            return Err(TufError::KeyProvider(format!(
                "new provider exposes no public keys for {role}"
            )));
        }
        roles.insert(
            role.as_str().to_string(),
            RoleKeys {
                keyids,
                threshold: 1,
            },
        );
    }

    let payload = RootPayload {
        spec_version: SPEC_VERSION.to_string(),
        version: previous.signed.version + 1,
        expires,
        keys,
        roles,
    };

    let bytes = canonical_bytes(&payload).map_err(|e| TufError::Malformed {
        role: Role::Root,
        message: e.to_string(),
    })?;
    let mut signatures = old_provider.sign(Role::Root, &bytes)?;
    signatures.extend(new_provider.sign(Role::Root, &bytes)?);

    Ok(Envelope {
        signed: payload,
        signatures,
    })
}

/// Verify a rotation: the new root must be version N+1 and satisfy the
/// PREVIOUS root's root-role threshold.
pub fn verify_root_rotation(
    previous: &Envelope<RootPayload>,
    next: &Envelope<RootPayload>,
) -> Result<(), TufError> {
    if next.signed.version != previous.signed.version + 1 {
        return Err(TufError::RotationInvalid(format!(
            "expected version {}, found {}",
            previous.signed.version + 1,
            next.signed.version
        )));
    }
    verify_signatures(&previous.signed, Role::Root, next)
        .map_err(|e| TufError::RotationInvalid(e.to_string()))
}

/// Write the four role files into `dir` (`tuf/` inside a bundle).
pub fn write_to_dir(repo: &TufRepo, dir: &Path) -> Result<(), TufError> {
    std::fs::create_dir_all(dir).map_err(|e| TufError::Malformed {
        role: Role::Root,
        message: format!("{}: {e}", dir.display()),
    })?;
    write_role(dir, Role::Root, &repo.root)?;
    write_role(dir, Role::Targets, &repo.targets)?;
    write_role(dir, Role::Snapshot, &repo.snapshot)?;
    write_role(dir, Role::Timestamp, &repo.timestamp)?;
    Ok(())
}

fn write_role<T: Serialize>(dir: &Path, role: Role, envelope: &Envelope<T>) -> Result<(), TufError> {
    let path = dir.join(role.filename());
    let mut bytes = canonical_bytes(envelope).map_err(|e| TufError::Malformed {
        role,
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    std::fs::write(&path, bytes).map_err(|e| TufError::Malformed {
        role,
        message: format!("{}: {e}", path.display()),
    })
}

/// Read a four-role set back from `dir`.
pub fn read_from_dir(dir: &Path) -> Result<TufRepo, TufError> {
    Ok(TufRepo {
        root: read_role(dir, Role::Root)?,
        targets: read_role(dir, Role::Targets)?,
        snapshot: read_role(dir, Role::Snapshot)?,
        timestamp: read_role(dir, Role::Timestamp)?,
    })
}

fn read_role<T: DeserializeOwned>(dir: &Path, role: Role) -> Result<Envelope<T>, TufError> {
    let path = dir.join(role.filename());
    let text = std::fs::read_to_string(&path).map_err(|e| TufError::Malformed {
        role,
        message: format!("{}: {e}", path.display()),
    })?;
    serde_json::from_str(&text).map_err(|e| TufError::Malformed {
        role,
        message: e.to_string(),
    })
}
