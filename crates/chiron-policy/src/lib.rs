//! Declarative dependency policy evaluation for chiron.
//!
//! `evaluate` is a pure function from a policy document and a
//! dependency set to a verdict. Rule families run in a fixed order
//! (denylist, allowlist, version ceilings, upgrade windows, CVE gate,
//! required attestations) and the first match decides within a family,
//! so two evaluations over identical inputs always produce identical
//! verdicts. The engine performs no I/O.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use chiron_types::{
    AttestationKind, ErrorCategory, LockRecord, PolicyDocument, RuleKind, Verdict, Violation,
    ViolationSeverity, VulnerabilityReport,
};
use chiron_version::{BumpKind, SpecifierSet, classify_bump, normalize_name};

/// Policy loading failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy document is malformed: {0}")]
    Malformed(String),
}

impl PolicyError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::InputInvalid
    }
}

/// Parse and schema-validate a policy document. Unknown fields are
/// rejected, as are specifiers that do not parse.
pub fn parse_policy(json: &str) -> Result<PolicyDocument, PolicyError> {
    let policy: PolicyDocument =
        serde_json::from_str(json).map_err(|e| PolicyError::Malformed(e.to_string()))?;
    validate_policy(&policy)?;
    Ok(policy)
}

/// Structural checks beyond serde: every ceiling specifier must parse.
pub fn validate_policy(policy: &PolicyDocument) -> Result<(), PolicyError> {
    for (name, ceiling) in &policy.version_ceilings {
        if ceiling.specifier.parse::<SpecifierSet>().is_err() {
            return Err(PolicyError::Malformed(format!(
                "version ceiling for {name} has unparseable specifier `{}`",
                ceiling.specifier
            )));
        }
    }
    Ok(())
}

/// Everything the engine may consult, assembled by the caller. The
/// engine itself never reads the clock or the filesystem.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    /// The dependency set under evaluation.
    pub lock: &'a LockRecord,
    /// Previous lock for upgrade-window comparisons; `None` disables
    /// the window family.
    pub baseline: Option<&'a LockRecord>,
    /// Days each adopted release has been public, keyed by normalized
    /// name. Missing entries count as unknown age.
    pub release_age_days: BTreeMap<String, u32>,
    /// Attached vulnerability report, if a scan ran.
    pub vulnerabilities: Option<&'a VulnerabilityReport>,
    /// Attestation kinds present on the bundle.
    pub present_attestations: BTreeSet<AttestationKind>,
    /// Evaluation instant, used only for CVE disclosure ages.
    pub evaluated_at: DateTime<Utc>,
}

impl<'a> PolicyInput<'a> {
    pub fn new(lock: &'a LockRecord, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            lock,
            baseline: None,
            release_age_days: BTreeMap::new(),
            vulnerabilities: None,
            present_attestations: BTreeSet::new(),
            evaluated_at,
        }
    }

    pub fn with_baseline(mut self, baseline: &'a LockRecord) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn with_vulnerabilities(mut self, report: &'a VulnerabilityReport) -> Self {
        self.vulnerabilities = Some(report);
        self
    }

    pub fn with_attestations(mut self, present: BTreeSet<AttestationKind>) -> Self {
        self.present_attestations = present;
        self
    }

    pub fn with_release_ages(mut self, ages: BTreeMap<String, u32>) -> Self {
        self.release_age_days = ages;
        self
    }
}

/// Evaluate a policy over a dependency set.
pub fn evaluate(policy: &PolicyDocument, input: &PolicyInput<'_>) -> Verdict {
    let mut violations = Vec::new();

    apply_denylist(policy, input, &mut violations);
    apply_allowlist(policy, input, &mut violations);
    apply_ceilings(policy, input, &mut violations);
    apply_upgrade_windows(policy, input, &mut violations);
    apply_cve_gate(policy, input, &mut violations);
    apply_required_attestations(policy, input, &mut violations);

    Verdict::from_violations(violations)
}

fn apply_denylist(policy: &PolicyDocument, input: &PolicyInput<'_>, out: &mut Vec<Violation>) {
    let denied: BTreeSet<String> = policy.denylist.iter().map(|n| normalize_name(n)).collect();
    for constraint in &input.lock.constraints {
        let name = &constraint.coordinate.name;
        if denied.contains(name) {
            out.push(Violation {
                coordinate: name.clone(),
                rule: RuleKind::Denylist,
                severity: ViolationSeverity::Blocked,
                message: format!("{name} is on the denylist"),
                suggestion: Some(format!("remove {name} or amend the policy denylist")),
            });
        }
    }
}

fn apply_allowlist(policy: &PolicyDocument, input: &PolicyInput<'_>, out: &mut Vec<Violation>) {
    if policy.default_allow {
        return;
    }
    let allowed: BTreeSet<String> = policy.allowlist.iter().map(|n| normalize_name(n)).collect();
    for constraint in &input.lock.constraints {
        let name = &constraint.coordinate.name;
        if !allowed.contains(name) {
            out.push(Violation {
                coordinate: name.clone(),
                rule: RuleKind::Allowlist,
                severity: ViolationSeverity::Blocked,
                message: format!("{name} is not on the allowlist and default_allow is false"),
                suggestion: Some(format!("add {name} to the policy allowlist")),
            });
        }
    }
}

fn apply_ceilings(policy: &PolicyDocument, input: &PolicyInput<'_>, out: &mut Vec<Violation>) {
    for constraint in &input.lock.constraints {
        let name = &constraint.coordinate.name;
        let Some(ceiling) = policy.version_ceilings.get(name) else {
            continue;
        };
        let Ok(spec) = ceiling.specifier.parse::<SpecifierSet>() else {
            // validate_policy rejects this earlier; skip defensively at
            // evaluation time rather than inventing a verdict.
            continue;
        };
        if !spec.matches(&constraint.coordinate.version) {
            out.push(Violation {
                coordinate: name.clone(),
                rule: RuleKind::VersionCeiling,
                severity: ceiling.severity,
                message: format!(
                    "{name} {} exceeds the version ceiling `{}`",
                    constraint.coordinate.version, ceiling.specifier
                ),
                suggestion: Some(format!(
                    "pin {name} within `{}` or raise the ceiling",
                    ceiling.specifier
                )),
            });
        }
    }
}

fn apply_upgrade_windows(
    policy: &PolicyDocument,
    input: &PolicyInput<'_>,
    out: &mut Vec<Violation>,
) {
    let Some(baseline) = input.baseline else {
        return;
    };

    for constraint in &input.lock.constraints {
        let name = &constraint.coordinate.name;
        let Some(window) = policy.upgrade_windows.get(name) else {
            continue;
        };
        let Some(previous) = baseline.constraint(name) else {
            continue;
        };
        let from = &previous.coordinate.version;
        let to = &constraint.coordinate.version;
        if from == to {
            continue;
        }

        let bump = classify_bump(from, to);
        if bump == BumpKind::Major && !window.allow_major {
            out.push(Violation {
                coordinate: name.clone(),
                rule: RuleKind::UpgradeWindow,
                severity: ViolationSeverity::Blocked,
                message: format!(
                    "{name} {from} -> {to} crosses a major version and allow_major is false"
                ),
                suggestion: Some(format!("hold {name} below {}", to.major())),
            });
            continue;
        }

        if window.min_stable_days > 0 {
            match input.release_age_days.get(name) {
                Some(age) if *age >= window.min_stable_days => {}
                Some(age) => out.push(Violation {
                    coordinate: name.clone(),
                    rule: RuleKind::UpgradeWindow,
                    severity: ViolationSeverity::Caution,
                    message: format!(
                        "{name} {to} has been public {age} days; window requires {}",
                        window.min_stable_days
                    ),
                    suggestion: None,
                }),
                None => out.push(Violation {
                    coordinate: name.clone(),
                    rule: RuleKind::UpgradeWindow,
                    severity: ViolationSeverity::Caution,
                    message: format!("{name} {to} release age is unknown"),
                    suggestion: Some("supply an upstream snapshot with release dates".to_string()),
                }),
            }
        }
    }
}

fn apply_cve_gate(policy: &PolicyDocument, input: &PolicyInput<'_>, out: &mut Vec<Violation>) {
    let Some(gate) = &policy.cve_gates else {
        return;
    };
    let Some(report) = input.vulnerabilities else {
        return;
    };

    for record in &report.records {
        // Inclusive comparison: a finding exactly at max_severity trips
        // the gate.
        if record.severity < gate.max_severity {
            continue;
        }
        let within_grace = match record.published_at {
            Some(published) => {
                let age_days = (input.evaluated_at - published).num_days();
                age_days <= i64::from(gate.grace_period_days)
            }
            // Unknown disclosure date never earns grace.
            None => false,
        };
        let severity = if within_grace {
            ViolationSeverity::Caution
        } else {
            ViolationSeverity::Blocked
        };
        out.push(Violation {
            coordinate: record.name.clone(),
            rule: RuleKind::CveGate,
            severity,
            message: format!(
                "{} {} is affected by {} (severity {:?})",
                record.name, record.version, record.cve_id, record.severity
            ),
            suggestion: Some(format!("upgrade {} past the advisory fix", record.name)),
        });
    }
}

fn apply_required_attestations(
    policy: &PolicyDocument,
    input: &PolicyInput<'_>,
    out: &mut Vec<Violation>,
) {
    for kind in &policy.required_attestations {
        if !input.present_attestations.contains(kind) {
            out.push(Violation {
                coordinate: "bundle".to_string(),
                rule: RuleKind::RequiredAttestation,
                severity: ViolationSeverity::Blocked,
                message: format!("required attestation `{kind}` is missing"),
                suggestion: Some(format!("attach a {kind} before release")),
            });
        }
    }
}
