//! In-toto provenance statements for bundles.
//!
//! The statement's subject is the bundle name plus its manifest
//! self-digest; the predicate binds builder identity, source commit,
//! build configuration digest, input materials, and the audit-chain
//! root. Provenance is signed with the same identity as the bundle
//! signature and shipped as one JSON line per statement.

use std::path::Path;

use serde::{Deserialize, Serialize};

use chiron_canonical::canonical_bytes;
use chiron_types::BundleManifest;

use crate::AttestError;

pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";
pub const PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: SubjectDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDigest {
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub uri: String,
    pub digest: SubjectDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub builder_id: String,
    pub source_commit: String,
    pub build_config_digest: String,
    /// Every input blob that flowed into the bundle, sorted by uri.
    pub materials: Vec<Material>,
    /// Root digest of the pipeline run's audit chain.
    pub audit_chain_root: String,
}

/// One in-toto statement, serialized as a single JSONL line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceStatement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub subject: Vec<Subject>,
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    pub predicate: Predicate,
}

impl ProvenanceStatement {
    /// Build a statement for a sealed manifest.
    pub fn for_bundle(
        bundle_name: &str,
        manifest: &BundleManifest,
        builder_id: &str,
        build_config_digest: &str,
        mut materials: Vec<Material>,
        audit_chain_root: &str,
    ) -> Result<Self, AttestError> {
        let bundle_sha256 = manifest
            .bundle_sha256
            .clone()
            .ok_or_else(|| AttestError::ProvenanceMalformed("manifest is unsealed".to_string()))?;
        materials.sort_by(|a, b| a.uri.cmp(&b.uri));

        Ok(Self {
            statement_type: STATEMENT_TYPE.to_string(),
            subject: vec![Subject {
                name: bundle_name.to_string(),
                digest: SubjectDigest {
                    sha256: bundle_sha256,
                },
            }],
            predicate_type: PREDICATE_TYPE.to_string(),
            predicate: Predicate {
                builder_id: builder_id.to_string(),
                source_commit: manifest.commit_ref.clone(),
                build_config_digest: build_config_digest.to_string(),
                materials,
                audit_chain_root: audit_chain_root.to_string(),
            },
        })
    }

    /// Canonical bytes of the statement; this is what gets signed.
    pub fn canonical(&self) -> Result<Vec<u8>, AttestError> {
        canonical_bytes(self).map_err(|e| AttestError::ProvenanceMalformed(e.to_string()))
    }

    /// Render as one JSONL line (canonical JSON plus `\n`).
    pub fn to_jsonl(&self) -> Result<String, AttestError> {
        let mut line = String::from_utf8(self.canonical()?)
            .map_err(|e| AttestError::ProvenanceMalformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse the first statement of a `provenance.intoto.jsonl` file.
    pub fn from_jsonl(text: &str) -> Result<Self, AttestError> {
        let line = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| AttestError::ProvenanceMalformed("empty provenance file".to_string()))?;
        let statement: ProvenanceStatement = serde_json::from_str(line)
            .map_err(|e| AttestError::ProvenanceMalformed(e.to_string()))?;
        if statement.statement_type != STATEMENT_TYPE {
            return Err(AttestError::ProvenanceMalformed(format!(
                "unexpected statement type `{}`",
                statement.statement_type
            )));
        }
        Ok(statement)
    }

    /// Confirm the statement's subject digest names this bundle.
    pub fn verify_subject(&self, manifest: &BundleManifest) -> Result<(), AttestError> {
        let bundle = manifest
            .bundle_sha256
            .clone()
            .ok_or_else(|| AttestError::ProvenanceMalformed("manifest is unsealed".to_string()))?;
        let matched = self.subject.iter().any(|s| s.digest.sha256 == bundle);
        if matched {
            Ok(())
        } else {
            let subject = self
                .subject
                .first()
                .map(|s| s.digest.sha256.clone())
                .unwrap_or_else(|| "<none>".to_string());
            Err(AttestError::ProvenanceSubjectMismatch { subject, bundle })
        }
    }
}

/// Load provenance from a bundle directory.
pub fn read_from_dir(bundle_dir: &Path, filename: &str) -> Result<ProvenanceStatement, AttestError> {
    let path = bundle_dir.join(filename);
    let text = std::fs::read_to_string(&path).map_err(|e| AttestError::Missing {
        kind: chiron_types::AttestationKind::Provenance,
        detail: format!("{}: {e}", path.display()),
    })?;
    ProvenanceStatement::from_jsonl(&text)
}
