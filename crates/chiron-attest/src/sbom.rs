//! CycloneDX SBOM generation and coverage validation.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use chiron_tools::{ToolAdapter, ToolInvocation, ToolTag};
use chiron_types::LockRecord;
use chiron_version::normalize_name;

use crate::AttestError;

/// The slice of a CycloneDX 1.x document the engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycloneDxBom {
    pub bom_format: String,
    pub spec_version: String,
    #[serde(default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purl: Option<String>,
    #[serde(default)]
    pub hashes: Vec<ComponentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHash {
    pub alg: String,
    pub content: String,
}

impl CycloneDxBom {
    pub fn parse(json: &str) -> Result<Self, AttestError> {
        let bom: CycloneDxBom =
            serde_json::from_str(json).map_err(|e| AttestError::SbomMalformed(e.to_string()))?;
        if bom.bom_format != "CycloneDX" {
            return Err(AttestError::SbomMalformed(format!(
                "bomFormat is `{}`, expected CycloneDX",
                bom.bom_format
            )));
        }
        if !bom.spec_version.starts_with("1.") {
            return Err(AttestError::SbomMalformed(format!(
                "specVersion `{}` is not CycloneDX 1.x",
                bom.spec_version
            )));
        }
        Ok(bom)
    }
}

/// Generate a CycloneDX SBOM for a bundle directory via the `sbom`
/// tool and parse/validate the output shape.
pub fn generate(adapter: &ToolAdapter, bundle_dir: &Path) -> Result<CycloneDxBom, AttestError> {
    let record = adapter.run(
        ToolInvocation::new(ToolTag::Sbom)
            .working_dir(bundle_dir)
            .args(["scan", "dir:.", "--output", "cyclonedx-json"]),
    )?;
    CycloneDxBom::parse(&record.stdout)
}

/// Validate that every locked coordinate appears in the SBOM as a
/// component carrying a pypi purl, the locked version, and at least
/// one hash. Missing or under-specified coordinates are reported
/// together, sorted, as `sbom_incomplete`.
pub fn validate_coverage(bom: &CycloneDxBom, lock: &LockRecord) -> Result<(), AttestError> {
    let mut missing = Vec::new();

    for constraint in &lock.constraints {
        let name = &constraint.coordinate.name;
        let version = constraint.coordinate.version.to_string();

        let component = bom.components.iter().find(|c| {
            normalize_name(&c.name) == *name && c.version == version
        });

        let Some(component) = component else {
            missing.push(format!("{name}=={version} (absent)"));
            continue;
        };
        if component.hashes.is_empty() {
            missing.push(format!("{name}=={version} (no hashes)"));
            continue;
        }
        match &component.purl {
            None => missing.push(format!("{name}=={version} (no purl)")),
            Some(purl) => match packageurl::PackageUrl::from_str(purl) {
                Ok(parsed) => {
                    if parsed.ty() != "pypi" || normalize_name(parsed.name()) != *name {
                        missing.push(format!("{name}=={version} (purl mismatch: {purl})"));
                    }
                }
                Err(_) => missing.push(format!("{name}=={version} (unparseable purl)")),
            },
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort();
        Err(AttestError::SbomIncomplete { missing })
    }
}
