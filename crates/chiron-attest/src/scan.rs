//! Vulnerability scan normalization.
//!
//! The `scan` tool emits a findings document; this module collapses it
//! into the normalized, ordered report the policy engine and the
//! verification protocol consume. Severity mapping from CVSS scores is
//! fixed, and duplicate findings across sources collapse by CVE id
//! with alphabetical source precedence.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chiron_tools::{ToolAdapter, ToolInvocation, ToolTag};
use chiron_types::{Severity, VulnerabilityRecord, VulnerabilityReport};
use chiron_version::normalize_name;

use crate::AttestError;

/// One raw finding as produced by the scan tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFinding {
    pub package: String,
    pub version: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

/// The scan tool's output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScanOutput {
    #[serde(default)]
    pub findings: Vec<RawFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

/// Run the scan tool over a bundle directory and normalize its output.
pub fn generate(
    adapter: &ToolAdapter,
    bundle_dir: &Path,
    fallback_now: DateTime<Utc>,
) -> Result<VulnerabilityReport, AttestError> {
    let record = adapter.run(
        ToolInvocation::new(ToolTag::Scan)
            .working_dir(bundle_dir)
            .args(["dir:.", "--output", "json"]),
    )?;
    let raw: RawScanOutput = serde_json::from_str(&record.stdout)
        .map_err(|e| AttestError::ScanMalformed(e.to_string()))?;
    Ok(normalize(&raw, fallback_now))
}

/// Parse an already-written scan artifact (`osv.json`).
pub fn parse_report(json: &str) -> Result<VulnerabilityReport, AttestError> {
    serde_json::from_str(json).map_err(|e| AttestError::ScanMalformed(e.to_string()))
}

/// Collapse raw findings into the normalized report.
///
/// - severity: fixed CVSS mapping when a score is present, otherwise
///   the tool's severity word, otherwise `none`;
/// - duplicates collapse by CVE id, alphabetically-first source wins;
/// - records ordered by `(name, cve_id)`.
pub fn normalize(raw: &RawScanOutput, fallback_now: DateTime<Utc>) -> VulnerabilityReport {
    let mut by_cve: BTreeMap<String, VulnerabilityRecord> = BTreeMap::new();

    for finding in &raw.findings {
        let severity = match (finding.cvss_score, finding.severity.as_deref()) {
            (Some(score), _) => Severity::from_cvss(score),
            (None, Some(word)) => parse_severity_word(word),
            (None, None) => Severity::None,
        };
        let record = VulnerabilityRecord {
            name: normalize_name(&finding.package),
            version: finding.version.clone(),
            cve_id: finding.id.clone(),
            severity,
            source: finding.source.clone(),
            published_at: finding.published,
        };

        match by_cve.get(&finding.id) {
            // Alphabetical source order decides between duplicates.
            Some(existing) if existing.source <= record.source => {}
            _ => {
                by_cve.insert(finding.id.clone(), record);
            }
        }
    }

    let mut records: Vec<VulnerabilityRecord> = by_cve.into_values().collect();
    records.sort_by(|a, b| (&a.name, &a.cve_id).cmp(&(&b.name, &b.cve_id)));

    VulnerabilityReport {
        generated_at: raw.generated_at.unwrap_or(fallback_now),
        records,
    }
}

fn parse_severity_word(word: &str) -> Severity {
    match word.to_ascii_lowercase().as_str() {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" | "moderate" => Severity::Medium,
        "low" => Severity::Low,
        _ => Severity::None,
    }
}

/// Age check used by the verification protocol: the scan must not be
/// older than `threshold_days` relative to the bundle's `created_at`.
pub fn check_freshness(
    report: &VulnerabilityReport,
    bundle_created_at: DateTime<Utc>,
    threshold_days: i64,
) -> Result<(), AttestError> {
    let age_days = (bundle_created_at - report.generated_at).num_days();
    if age_days > threshold_days {
        return Err(AttestError::ScanStale {
            age_days,
            threshold_days,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str) -> DateTime<Utc> {
        format!("{date}T00:00:00Z").parse().expect("timestamp")
    }

    fn finding(package: &str, id: &str, source: &str, score: Option<f64>) -> RawFinding {
        RawFinding {
            package: package.to_string(),
            version: "1.0.0".to_string(),
            id: id.to_string(),
            cvss_score: score,
            severity: None,
            source: source.to_string(),
            published: Some(at("2025-01-15")),
        }
    }

    #[test]
    fn severity_mapping_follows_cvss_bands() {
        let raw = RawScanOutput {
            findings: vec![
                finding("a", "CVE-1", "osv", Some(9.8)),
                finding("b", "CVE-2", "osv", Some(7.5)),
                finding("c", "CVE-3", "osv", Some(5.0)),
                finding("d", "CVE-4", "osv", Some(0.5)),
            ],
            generated_at: Some(at("2025-01-20")),
        };
        let report = normalize(&raw, at("2025-01-20"));
        let severities: Vec<Severity> = report.records.iter().map(|r| r.severity).collect();
        assert_eq!(
            severities,
            vec![
                Severity::Critical,
                Severity::High,
                Severity::Medium,
                Severity::Low
            ]
        );
    }

    #[test]
    fn severity_word_is_fallback_only() {
        let mut f = finding("a", "CVE-1", "osv", None);
        f.severity = Some("HIGH".to_string());
        let report = normalize(
            &RawScanOutput {
                findings: vec![f],
                generated_at: None,
            },
            at("2025-01-20"),
        );
        assert_eq!(report.records[0].severity, Severity::High);
    }

    #[test]
    fn duplicates_collapse_by_cve_with_alphabetical_source() {
        let raw = RawScanOutput {
            findings: vec![
                finding("demo-lib", "CVE-2025-0001", "osv", Some(8.0)),
                finding("demo-lib", "CVE-2025-0001", "grype", Some(9.9)),
            ],
            generated_at: Some(at("2025-01-20")),
        };
        let report = normalize(&raw, at("2025-01-20"));
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].source, "grype");
        assert_eq!(report.records[0].severity, Severity::Critical);
    }

    #[test]
    fn records_are_ordered_by_name_then_cve() {
        let raw = RawScanOutput {
            findings: vec![
                finding("zeta", "CVE-2", "osv", Some(5.0)),
                finding("alpha", "CVE-9", "osv", Some(5.0)),
                finding("alpha", "CVE-1", "osv", Some(5.0)),
            ],
            generated_at: Some(at("2025-01-20")),
        };
        let report = normalize(&raw, at("2025-01-20"));
        let keys: Vec<(String, String)> = report
            .records
            .iter()
            .map(|r| (r.name.clone(), r.cve_id.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn package_names_are_normalized() {
        let raw = RawScanOutput {
            findings: vec![finding("Demo_Lib", "CVE-1", "osv", Some(5.0))],
            generated_at: None,
        };
        let report = normalize(&raw, at("2025-01-20"));
        assert_eq!(report.records[0].name, "demo-lib");
    }

    #[test]
    fn stale_scan_is_rejected() {
        // Scan from 2024-12-20 against a bundle created 2025-01-01
        // with a 7-day threshold: 12 days old, stale.
        let report = VulnerabilityReport {
            generated_at: at("2024-12-20"),
            records: vec![],
        };
        let err = check_freshness(&report, at("2025-01-01"), 7).expect_err("stale");
        match &err {
            AttestError::ScanStale {
                age_days,
                threshold_days,
            } => {
                assert_eq!(*age_days, 12);
                assert_eq!(*threshold_days, 7);
            }
            other => panic!("expected ScanStale, got {other:?}"),
        }
        assert_eq!(err.remediation(), Some("rerun vulnerability scan"));
    }

    #[test]
    fn fresh_scan_passes_at_boundary() {
        let report = VulnerabilityReport {
            generated_at: at("2024-12-25"),
            records: vec![],
        };
        check_freshness(&report, at("2025-01-01"), 7).expect("exactly at threshold");
    }

    #[test]
    fn scan_newer_than_bundle_is_fresh() {
        let report = VulnerabilityReport {
            generated_at: at("2025-01-05"),
            records: vec![],
        };
        check_freshness(&report, at("2025-01-01"), 7).expect("negative age is fresh");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn normalize_is_deterministic_and_deduped(
                ids in proptest::collection::vec("CVE-2025-[0-9]{4}", 1..8),
                sources in proptest::collection::vec("[a-z]{3,6}", 1..8),
            ) {
                let findings: Vec<RawFinding> = ids
                    .iter()
                    .zip(sources.iter().cycle())
                    .map(|(id, source)| RawFinding {
                        package: "demo-lib".to_string(),
                        version: "1.0.0".to_string(),
                        id: id.clone(),
                        cvss_score: Some(5.0),
                        severity: None,
                        source: source.clone(),
                        published: None,
                    })
                    .collect();
                let raw = RawScanOutput { findings, generated_at: None };
                let now = Utc::now();
                let a = normalize(&raw, now);
                let b = normalize(&raw, now);
                prop_assert_eq!(&a, &b);

                let unique: std::collections::BTreeSet<&String> =
                    a.records.iter().map(|r| &r.cve_id).collect();
                prop_assert_eq!(unique.len(), a.records.len());
            }
        }
    }
}
