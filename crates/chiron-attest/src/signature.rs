//! Detached bundle signatures via the signing tool.
//!
//! Signing covers the canonical archive bytes, never the directory.
//! Verification re-checks the same bytes and enforces the configured
//! signer identity (issuer and subject patterns). Failure kinds map
//! onto `signature_invalid`, `signature_identity_mismatch`, and
//! `signature_expired`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use chiron_tools::{ToolAdapter, ToolError, ToolInvocation, ToolTag};

use crate::AttestError;

/// Signer identity constraints checked at verification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPolicy {
    /// Regular expression the OIDC issuer must match.
    pub issuer_pattern: String,
    /// Regular expression the certificate subject must match.
    pub subject_pattern: String,
}

impl IdentityPolicy {
    pub fn new(issuer_pattern: impl Into<String>, subject_pattern: impl Into<String>) -> Self {
        Self {
            issuer_pattern: issuer_pattern.into(),
            subject_pattern: subject_pattern.into(),
        }
    }
}

/// Paths produced by a signing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureArtifact {
    pub signature_path: PathBuf,
    pub certificate_path: PathBuf,
}

/// Sign the archive bytes, producing a detached signature plus the
/// signer certificate next to it. Never retried.
pub fn sign_archive(
    adapter: &ToolAdapter,
    archive_path: &Path,
    out_dir: &Path,
) -> Result<SignatureArtifact, AttestError> {
    let signature_path = out_dir.join("signature.sig");
    let certificate_path = out_dir.join("signature.pem");

    let signature_arg = signature_path.display().to_string();
    let certificate_arg = certificate_path.display().to_string();
    let archive_arg = archive_path.display().to_string();
    adapter.run(ToolInvocation::new(ToolTag::Sign).args([
        "sign-blob",
        "--yes",
        "--output-signature",
        signature_arg.as_str(),
        "--output-certificate",
        certificate_arg.as_str(),
        archive_arg.as_str(),
    ]))?;

    Ok(SignatureArtifact {
        signature_path,
        certificate_path,
    })
}

/// Verify a detached signature over the archive bytes and enforce the
/// identity policy.
pub fn verify_archive(
    adapter: &ToolAdapter,
    archive_path: &Path,
    artifact: &SignatureArtifact,
    identity: &IdentityPolicy,
) -> Result<(), AttestError> {
    let signature_arg = artifact.signature_path.display().to_string();
    let certificate_arg = artifact.certificate_path.display().to_string();
    let archive_arg = archive_path.display().to_string();
    let outcome = adapter.run(ToolInvocation::new(ToolTag::VerifySignature).args([
        "verify-blob",
        "--signature",
        signature_arg.as_str(),
        "--certificate",
        certificate_arg.as_str(),
        "--certificate-oidc-issuer-regexp",
        identity.issuer_pattern.as_str(),
        "--certificate-identity-regexp",
        identity.subject_pattern.as_str(),
        archive_arg.as_str(),
    ]));

    match outcome {
        Ok(_) => Ok(()),
        Err(ToolError::NonZeroExit { record, .. }) => Err(classify_failure(&record.stderr)),
        Err(other) => Err(AttestError::Tool(other)),
    }
}

/// Map the verifier's stderr onto the three signature failure kinds.
/// Identity and expiry problems are cryptographic successes with a
/// policy failure, so the text is the only discriminator the tool
/// offers.
fn classify_failure(stderr: &str) -> AttestError {
    let haystack = stderr.to_ascii_lowercase();
    if haystack.contains("certificate identity") || haystack.contains("issuer") {
        AttestError::SignatureIdentityMismatch
    } else if haystack.contains("expired") {
        AttestError::SignatureExpired
    } else {
        AttestError::SignatureInvalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chiron_types::ErrorCategory;

    #[test]
    fn classify_identity_mismatch() {
        let err = classify_failure(
            "Error: none of the expected identities matched: certificate identity mismatch",
        );
        assert!(matches!(err, AttestError::SignatureIdentityMismatch));
        assert_eq!(err.category(), ErrorCategory::AttestationInvalid);
    }

    #[test]
    fn classify_expired_certificate() {
        let err = classify_failure("Error: certificate has expired");
        assert!(matches!(err, AttestError::SignatureExpired));
    }

    #[test]
    fn classify_plain_bad_signature() {
        let err = classify_failure("Error: invalid signature when validating ASN.1 encoded blob");
        assert!(matches!(err, AttestError::SignatureInvalid));
    }

    #[test]
    fn identity_policy_roundtrips() {
        let policy = IdentityPolicy::new(
            "^https://accounts\\.google\\.com$",
            "^release@chiron\\.example$",
        );
        let json = serde_json::to_string(&policy).expect("serialize");
        let back: IdentityPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, policy);
    }

    // The sign/verify tool paths are exercised end-to-end in the
    // coordinator tests with a stub signer; here a failing stub checks
    // that verify failures classify rather than surface as tool errors.
    #[test]
    fn verify_with_failing_tool_classifies() {
        let adapter = ToolAdapter::new().with_override(ToolTag::VerifySignature, "/bin/sh");
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("wheelhouse.tar.gz");
        std::fs::write(&archive, b"archive").expect("write");

        // /bin/sh with cosign-style args exits non-zero on the
        // unrecognized flag, which classifies as an invalid signature.
        let artifact = SignatureArtifact {
            signature_path: dir.path().join("signature.sig"),
            certificate_path: dir.path().join("signature.pem"),
        };
        let identity = IdentityPolicy::new(".*", ".*");
        let err = verify_archive(&adapter, &archive, &artifact, &identity)
            .expect_err("stub verifier fails");
        assert!(matches!(
            err,
            AttestError::SignatureInvalid
                | AttestError::SignatureIdentityMismatch
                | AttestError::SignatureExpired
        ));
    }
}
