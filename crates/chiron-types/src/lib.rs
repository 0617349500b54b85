//! Core types for chiron.
//!
//! The shared vocabulary of the engine: package coordinates, wheel
//! identities, locked constraints, bundle manifests, policy documents,
//! verdicts, vulnerability records, audit records, and the error
//! taxonomy every component maps its failures onto.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chiron_version::{Version, normalize_name};

/// Schema tag written into every lock record.
pub const LOCK_VERSION: &str = "chiron.lock.v1";
/// Schema tag written into every bundle manifest.
pub const MANIFEST_VERSION: &str = "chiron.manifest.v1";

/// A `(name, version, extras)` triple identifying a distribution.
///
/// The name is PEP 503 normalized and extras are normalized and sorted,
/// so equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

impl Coordinate {
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: normalize_name(name),
            version,
            extras: Vec::new(),
        }
    }

    pub fn with_extras(name: &str, version: Version, extras: &[&str]) -> Self {
        let mut extras: Vec<String> = extras.iter().map(|e| normalize_name(e)).collect();
        extras.sort();
        extras.dedup();
        Self {
            name: normalize_name(name),
            version,
            extras,
        }
    }

    /// `name@version` label used in audit records and progress output.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extras.is_empty() {
            write!(f, "{}=={}", self.name, self.version)
        } else {
            write!(f, "{}[{}]=={}", self.name, self.extras.join(","), self.version)
        }
    }
}

/// A single `algorithm:hex` digest as carried in lock files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashDigest {
    pub algorithm: String,
    pub digest: String,
}

/// Digest algorithms accepted in locked constraints.
pub const RECOGNIZED_ALGORITHMS: &[&str] = &["sha256", "sha384", "sha512"];

impl HashDigest {
    pub fn sha256(digest: impl Into<String>) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            digest: digest.into(),
        }
    }

    /// Whether the algorithm is recognized and the digest is plausible hex.
    pub fn is_well_formed(&self) -> bool {
        RECOGNIZED_ALGORITHMS.contains(&self.algorithm.as_str())
            && !self.digest.is_empty()
            && self.digest.chars().all(|c| c.is_ascii_hexdigit())
            && self.digest.chars().all(|c| !c.is_ascii_uppercase())
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl FromStr for HashDigest {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once(':') {
            Some((algorithm, digest)) if !algorithm.is_empty() && !digest.is_empty() => {
                Ok(Self {
                    algorithm: algorithm.to_string(),
                    digest: digest.to_string(),
                })
            }
            _ => Err(format!("malformed hash token: {raw}")),
        }
    }
}

/// Identity of one built wheel inside a bundle.
///
/// The filename follows PEP 427; the sha256 is the authoritative identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelIdentity {
    pub coordinate: Coordinate,
    pub python_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub sha256: String,
}

impl WheelIdentity {
    /// PEP 427 filename: `{name}-{version}-{python}-{abi}-{platform}.whl`
    /// with the name's runs of separators replaced by underscores.
    pub fn filename(&self) -> String {
        let escaped = self.coordinate.name.replace('-', "_");
        format!(
            "{}-{}-{}-{}-{}.whl",
            escaped, self.coordinate.version, self.python_tag, self.abi_tag, self.platform_tag
        )
    }

    /// Stable sort key: coordinate name, version, then platform tag.
    pub fn sort_key(&self) -> (String, Version, String) {
        (
            self.coordinate.name.clone(),
            self.coordinate.version.clone(),
            self.platform_tag.clone(),
        )
    }
}

/// Where a locked constraint was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintSource {
    Index { url: String },
    Vcs { spec: String },
}

/// One hash-pinned entry of a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedConstraint {
    pub coordinate: Coordinate,
    /// Every `algorithm:digest` known for the artifact set of this
    /// version across platform/ABI variants. Never empty in a valid lock.
    pub hashes: Vec<HashDigest>,
    pub source: ConstraintSource,
}

/// The structured output of the lock generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_version: String,
    /// Resolver binary version string, recorded for audit.
    ///
    /// No wall-clock timestamp lives here: two runs over identical
    /// inputs must produce byte-identical lock records.
    pub resolver_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform_scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub python_scope: Vec<String>,
    /// Entries sorted by normalized name.
    pub constraints: Vec<LockedConstraint>,
    /// Name -> names it depends on, restricted to locked entries.
    /// Drives topological ordering in the upgrade planner.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl LockRecord {
    pub fn constraint(&self, name: &str) -> Option<&LockedConstraint> {
        let name = normalize_name(name);
        self.constraints.iter().find(|c| c.coordinate.name == name)
    }
}

/// Paths (relative to the bundle root) of the attached metadata files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sbom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
}

/// Root record of a wheelhouse bundle.
///
/// `bundle_sha256` is the sha256 of the canonical-JSON serialization of
/// the manifest with that field removed; recomputation must reproduce
/// the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub manifest_version: String,
    pub created_at: DateTime<Utc>,
    pub commit_ref: String,
    pub platform_scope: BTreeSet<String>,
    pub python_scope: BTreeSet<String>,
    /// Wheels in stable order (name, version, platform tag).
    pub wheels: Vec<WheelIdentity>,
    /// Relative path -> sha256 for every file in the bundle.
    pub checksums: BTreeMap<String, String>,
    pub metadata_refs: MetadataRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_sha256: Option<String>,
}

/// Severity scale for vulnerability findings. Ordering is by impact,
/// so `Critical > High > Medium > Low > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Fixed CVSS score mapping: >=9.0 critical, >=7.0 high, >=4.0
    /// medium, >0 low, otherwise none.
    pub fn from_cvss(score: f64) -> Self {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else if score > 0.0 {
            Severity::Low
        } else {
            Severity::None
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Severity::None => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// One normalized vulnerability finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub name: String,
    pub version: String,
    pub cve_id: String,
    pub severity: Severity,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// A normalized vulnerability report for a dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub generated_at: DateTime<Utc>,
    /// Records ordered by (name, cve_id); one record per cve_id.
    pub records: Vec<VulnerabilityRecord>,
}

impl VulnerabilityReport {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            records: Vec::new(),
        }
    }

    pub fn findings_for(&self, name: &str) -> Vec<&VulnerabilityRecord> {
        let name = normalize_name(name);
        self.records.iter().filter(|r| r.name == name).collect()
    }
}

/// Attestation kinds a policy may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationKind {
    Sbom,
    Signature,
    Provenance,
}

impl fmt::Display for AttestationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttestationKind::Sbom => write!(f, "sbom"),
            AttestationKind::Signature => write!(f, "signature"),
            AttestationKind::Provenance => write!(f, "provenance"),
        }
    }
}

/// Version ceiling rule for one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CeilingRule {
    /// Specifier the locked version must satisfy (`<2.0`, `<=1.4.*`).
    pub specifier: String,
    /// Severity when the ceiling is exceeded.
    #[serde(default = "default_ceiling_severity")]
    pub severity: ViolationSeverity,
}

fn default_ceiling_severity() -> ViolationSeverity {
    ViolationSeverity::Caution
}

/// Upgrade window rule for one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeWindow {
    /// Minimum days a release must have been public before adoption.
    #[serde(default)]
    pub min_stable_days: u32,
    /// Whether major-version crossings are permitted at all.
    #[serde(default = "default_true")]
    pub allow_major: bool,
}

fn default_true() -> bool {
    true
}

/// CVE gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CveGate {
    /// Findings at or above this severity trip the gate (inclusive).
    pub max_severity: Severity,
    /// Findings younger than this many days downgrade to caution.
    #[serde(default)]
    pub grace_period_days: u32,
}

/// Declarative policy evaluated over a dependency set.
///
/// Unknown fields are rejected at load time to prevent silent drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default = "default_true")]
    pub default_allow: bool,
    #[serde(default)]
    pub allowlist: BTreeSet<String>,
    #[serde(default)]
    pub denylist: BTreeSet<String>,
    #[serde(default)]
    pub version_ceilings: BTreeMap<String, CeilingRule>,
    #[serde(default)]
    pub upgrade_windows: BTreeMap<String, UpgradeWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cve_gates: Option<CveGate>,
    #[serde(default)]
    pub required_attestations: BTreeSet<AttestationKind>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            default_allow: true,
            allowlist: BTreeSet::new(),
            denylist: BTreeSet::new(),
            version_ceilings: BTreeMap::new(),
            upgrade_windows: BTreeMap::new(),
            cve_gates: None,
            required_attestations: BTreeSet::new(),
        }
    }
}

/// Severity of a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Caution,
    Blocked,
}

/// Which rule family produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Denylist,
    Allowlist,
    VersionCeiling,
    UpgradeWindow,
    CveGate,
    RequiredAttestation,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::Denylist => "denylist",
            RuleKind::Allowlist => "allowlist",
            RuleKind::VersionCeiling => "version_ceiling",
            RuleKind::UpgradeWindow => "upgrade_window",
            RuleKind::CveGate => "cve_gate",
            RuleKind::RequiredAttestation => "required_attestation",
        };
        write!(f, "{s}")
    }
}

/// One policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Offending coordinate name, or `bundle` for bundle-level rules.
    pub coordinate: String,
    pub rule: RuleKind,
    pub severity: ViolationSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// The structured result of policy or verification evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl Verdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
        }
    }

    /// Build a verdict from violations; allowed iff nothing is blocked.
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let allowed = !violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Blocked);
        Self {
            allowed,
            violations,
        }
    }

    pub fn blocked_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Blocked)
            .count()
    }
}

/// Risk classification of an upgrade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Caution,
    Blocked,
}

/// One entry of an upgrade plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStep {
    pub name: String,
    pub from_version: String,
    pub to_version: String,
    pub risk: RiskLevel,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tests: Vec<String>,
}

/// An ordered upgrade plan; ordering respects the dependency DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub generated_at: DateTime<Utc>,
    pub steps: Vec<UpgradeStep>,
}

/// Outcome of one audited pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
}

/// One link of the append-only audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub step_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub inputs_digest: String,
    pub outputs_digest: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub details: String,
}

/// Engine/host fingerprint recorded alongside the audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub chiron_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_version: Option<String>,
    pub os: String,
    pub arch: String,
}

impl EnvironmentFingerprint {
    pub fn collect() -> Self {
        Self {
            chiron_version: env!("CARGO_PKG_VERSION").to_string(),
            resolver_version: None,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Surface error categories with stable identifiers (one per row of the
/// operator-facing taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InputInvalid,
    ResolverError,
    ToolMissing,
    ToolTimeout,
    ToolFailed,
    BundleIntegrity,
    AttestationMissing,
    AttestationInvalid,
    PolicyViolation,
    ReproducibilityFailure,
    TufError,
    InternalError,
}

impl ErrorCategory {
    pub fn identifier(&self) -> &'static str {
        match self {
            ErrorCategory::InputInvalid => "input_invalid",
            ErrorCategory::ResolverError => "resolver_error",
            ErrorCategory::ToolMissing => "tool_missing",
            ErrorCategory::ToolTimeout => "tool_timeout",
            ErrorCategory::ToolFailed => "tool_failed",
            ErrorCategory::BundleIntegrity => "bundle_integrity",
            ErrorCategory::AttestationMissing => "attestation_missing",
            ErrorCategory::AttestationInvalid => "attestation_invalid",
            ErrorCategory::PolicyViolation => "policy_violation",
            ErrorCategory::ReproducibilityFailure => "reproducibility_failure",
            ErrorCategory::TufError => "tuf_error",
            ErrorCategory::InternalError => "internal_error",
        }
    }

    /// Process exit code for the CLI boundary: 0 success, 2
    /// policy/verification failure, 3 tool missing, 4 bad input, 1
    /// anything unexpected.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::InputInvalid => 4,
            ErrorCategory::ToolMissing => 3,
            ErrorCategory::PolicyViolation
            | ErrorCategory::BundleIntegrity
            | ErrorCategory::AttestationMissing
            | ErrorCategory::AttestationInvalid
            | ErrorCategory::ReproducibilityFailure
            | ErrorCategory::TufError => 2,
            ErrorCategory::ResolverError
            | ErrorCategory::ToolTimeout
            | ErrorCategory::ToolFailed
            | ErrorCategory::InternalError => 1,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

/// Operator-facing error shape: category, one-line summary, offending
/// reference, optional remediation, and the run id for audit lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfacedError {
    pub category: ErrorCategory,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl SurfacedError {
    pub fn new(category: ErrorCategory, summary: impl Into<String>) -> Self {
        Self {
            category,
            summary: summary.into(),
            reference: None,
            remediation: None,
            run_id: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

impl fmt::Display for SurfacedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category.identifier(), self.summary)?;
        if let Some(reference) = &self.reference {
            write!(f, " ({reference})")?;
        }
        if let Some(remediation) = &self.remediation {
            write!(f, "; {remediation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SurfacedError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(s: &str) -> Version {
        s.parse().expect("version")
    }

    #[test]
    fn coordinate_normalizes_on_construction() {
        let coord = Coordinate::with_extras("Demo_Lib", ver("1.2.3"), &["Crypto", "crypto"]);
        assert_eq!(coord.name, "demo-lib");
        assert_eq!(coord.extras, vec!["crypto".to_string()]);
        assert_eq!(coord.to_string(), "demo-lib[crypto]==1.2.3");
    }

    #[test]
    fn coordinate_label_uses_at_separator() {
        let coord = Coordinate::new("demo-lib", ver("1.2.3"));
        assert_eq!(coord.label(), "demo-lib@1.2.3");
    }

    #[test]
    fn hash_digest_parses_and_displays() {
        let parsed: HashDigest = "sha256:abcd".parse().expect("hash");
        assert_eq!(parsed.algorithm, "sha256");
        assert_eq!(parsed.digest, "abcd");
        assert_eq!(parsed.to_string(), "sha256:abcd");
    }

    #[test]
    fn hash_digest_rejects_missing_parts() {
        assert!("sha256".parse::<HashDigest>().is_err());
        assert!(":abcd".parse::<HashDigest>().is_err());
        assert!("sha256:".parse::<HashDigest>().is_err());
    }

    #[test]
    fn hash_digest_well_formedness() {
        assert!(HashDigest::sha256("00ff".repeat(16)).is_well_formed());
        assert!(
            !HashDigest {
                algorithm: "md5".to_string(),
                digest: "abcd".to_string(),
            }
            .is_well_formed()
        );
        assert!(!HashDigest::sha256("XYZ").is_well_formed());
    }

    #[test]
    fn wheel_filename_follows_pep427() {
        let wheel = WheelIdentity {
            coordinate: Coordinate::new("demo-lib", ver("1.2.3")),
            python_tag: "py3".to_string(),
            abi_tag: "none".to_string(),
            platform_tag: "any".to_string(),
            sha256: "aa".repeat(32),
        };
        assert_eq!(wheel.filename(), "demo_lib-1.2.3-py3-none-any.whl");
    }

    #[test]
    fn severity_ordering_is_by_impact() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::None);
    }

    #[test]
    fn severity_cvss_mapping_boundaries() {
        assert_eq!(Severity::from_cvss(9.0), Severity::Critical);
        assert_eq!(Severity::from_cvss(8.9), Severity::High);
        assert_eq!(Severity::from_cvss(7.0), Severity::High);
        assert_eq!(Severity::from_cvss(4.0), Severity::Medium);
        assert_eq!(Severity::from_cvss(0.1), Severity::Low);
        assert_eq!(Severity::from_cvss(0.0), Severity::None);
    }

    #[test]
    fn policy_document_rejects_unknown_fields() {
        let json = r#"{"default_allow": true, "surprise": 1}"#;
        let parsed: Result<PolicyDocument, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn policy_document_defaults() {
        let parsed: PolicyDocument = serde_json::from_str("{}").expect("parse");
        assert!(parsed.default_allow);
        assert!(parsed.denylist.is_empty());
        assert!(parsed.cve_gates.is_none());
    }

    #[test]
    fn verdict_from_violations_blocks_on_blocked() {
        let verdict = Verdict::from_violations(vec![Violation {
            coordinate: "demo-lib".to_string(),
            rule: RuleKind::Denylist,
            severity: ViolationSeverity::Blocked,
            message: "denied".to_string(),
            suggestion: None,
        }]);
        assert!(!verdict.allowed);
        assert_eq!(verdict.blocked_count(), 1);
    }

    #[test]
    fn verdict_caution_only_is_allowed() {
        let verdict = Verdict::from_violations(vec![Violation {
            coordinate: "demo-lib".to_string(),
            rule: RuleKind::UpgradeWindow,
            severity: ViolationSeverity::Caution,
            message: "too fresh".to_string(),
            suggestion: Some("wait 3 days".to_string()),
        }]);
        assert!(verdict.allowed);
        assert_eq!(verdict.blocked_count(), 0);
    }

    #[test]
    fn error_category_identifiers_are_stable() {
        assert_eq!(ErrorCategory::InputInvalid.identifier(), "input_invalid");
        assert_eq!(ErrorCategory::TufError.identifier(), "tuf_error");
        assert_eq!(
            ErrorCategory::ReproducibilityFailure.identifier(),
            "reproducibility_failure"
        );
    }

    #[test]
    fn error_category_exit_codes() {
        assert_eq!(ErrorCategory::InputInvalid.exit_code(), 4);
        assert_eq!(ErrorCategory::ToolMissing.exit_code(), 3);
        assert_eq!(ErrorCategory::PolicyViolation.exit_code(), 2);
        assert_eq!(ErrorCategory::TufError.exit_code(), 2);
        assert_eq!(ErrorCategory::InternalError.exit_code(), 1);
    }

    #[test]
    fn surfaced_error_display_includes_parts() {
        let err = SurfacedError::new(ErrorCategory::ToolMissing, "uv not found")
            .with_reference("resolve")
            .with_remediation("install uv (https://docs.astral.sh/uv/)");
        let rendered = err.to_string();
        assert!(rendered.contains("[tool_missing]"));
        assert!(rendered.contains("uv not found"));
        assert!(rendered.contains("install uv"));
    }

    #[test]
    fn lock_record_lookup_normalizes_names() {
        let record = LockRecord {
            lock_version: LOCK_VERSION.to_string(),
            resolver_version: "uv 0.5.1".to_string(),
            platform_scope: vec![],
            python_scope: vec![],
            constraints: vec![LockedConstraint {
                coordinate: Coordinate::new("demo-lib", ver("1.2.3")),
                hashes: vec![HashDigest::sha256("aa".repeat(32))],
                source: ConstraintSource::Index {
                    url: "https://pypi.org/simple".to_string(),
                },
            }],
            dependencies: BTreeMap::new(),
        };
        assert!(record.constraint("Demo_Lib").is_some());
        assert!(record.constraint("missing").is_none());
    }

    #[test]
    fn bundle_manifest_roundtrips_json() {
        let manifest = BundleManifest {
            manifest_version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            commit_ref: "deadbeef".to_string(),
            platform_scope: BTreeSet::from(["manylinux_2_28_x86_64".to_string()]),
            python_scope: BTreeSet::from(["cp312".to_string()]),
            wheels: vec![],
            checksums: BTreeMap::new(),
            metadata_refs: MetadataRefs::default(),
            bundle_sha256: Some("ab".repeat(32)),
        };
        let json = serde_json::to_string(&manifest).expect("serialize");
        let back: BundleManifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, manifest);
    }

    #[test]
    fn audit_record_serializes_snake_case_outcome() {
        let record = AuditRecord {
            step_id: "lock".to_string(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            inputs_digest: "aa".repeat(32),
            outputs_digest: "bb".repeat(32),
            outcome: StepOutcome::Ok,
            details: String::new(),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"outcome\":\"ok\""));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hash_digest_roundtrip(algo in "sha(256|384|512)", digest in "[0-9a-f]{16,64}") {
                let token = format!("{algo}:{digest}");
                let parsed: HashDigest = token.parse().expect("parse");
                prop_assert_eq!(parsed.to_string(), token);
                prop_assert!(parsed.is_well_formed());
            }

            #[test]
            fn policy_document_roundtrip(
                default_allow in any::<bool>(),
                deny in proptest::collection::btree_set("[a-z][a-z0-9-]{1,12}", 0..4),
                grace in 0u32..60,
            ) {
                let doc = PolicyDocument {
                    default_allow,
                    denylist: deny,
                    cve_gates: Some(CveGate {
                        max_severity: Severity::High,
                        grace_period_days: grace,
                    }),
                    ..PolicyDocument::default()
                };
                let json = serde_json::to_string(&doc).expect("serialize");
                let back: PolicyDocument = serde_json::from_str(&json).expect("deserialize");
                prop_assert_eq!(back, doc);
            }

            #[test]
            fn verdict_allowed_iff_no_blocked(
                blocked_count in 0usize..3,
                caution_count in 0usize..3,
            ) {
                let mut violations = Vec::new();
                for i in 0..blocked_count {
                    violations.push(Violation {
                        coordinate: format!("pkg-{i}"),
                        rule: RuleKind::Denylist,
                        severity: ViolationSeverity::Blocked,
                        message: "blocked".to_string(),
                        suggestion: None,
                    });
                }
                for i in 0..caution_count {
                    violations.push(Violation {
                        coordinate: format!("soft-{i}"),
                        rule: RuleKind::UpgradeWindow,
                        severity: ViolationSeverity::Caution,
                        message: "caution".to_string(),
                        suggestion: None,
                    });
                }
                let verdict = Verdict::from_violations(violations);
                prop_assert_eq!(verdict.allowed, blocked_count == 0);
            }
        }
    }
}
