//! Hash-pinned lock and constraints generation for chiron.
//!
//! The generator drives the external resolver (tool tag `resolve`),
//! validates the resolution (hash completeness, acyclicity, specifier
//! satisfaction), canonicalizes the result into a [`LockRecord`], and
//! emits the textual constraints file. Emit and parse round-trip
//! losslessly, modulo comments.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use chiron_tools::{ToolAdapter, ToolError, ToolInvocation, ToolTag};
use chiron_types::{
    Coordinate, ConstraintSource, ErrorCategory, HashDigest, LOCK_VERSION, LockRecord,
    LockedConstraint,
};
use chiron_version::{SpecifierSet, Version, normalize_name};

/// Lock generation failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("project manifest at {path} is invalid: {message}")]
    ManifestInvalid { path: String, message: String },
    #[error("constraint for {name} resolved with an empty hash set")]
    IncompleteResolution { name: String },
    #[error("resolver produced a dependency cycle involving: {}", .cycle.join(" -> "))]
    ResolverProducedCycle { cycle: Vec<String> },
    #[error(
        "resolver inconsistency: {from} requires {to}{requirement} but {to} resolved to {chosen}"
    )]
    ResolverInconsistency {
        from: String,
        to: String,
        requirement: String,
        chosen: String,
    },
    #[error("resolver report is malformed: {0}")]
    MalformedReport(String),
    #[error("constraints line {line}: {message}")]
    ConstraintsParse { line: usize, message: String },
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl LockError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LockError::ManifestInvalid { .. } | LockError::ConstraintsParse { .. } => {
                ErrorCategory::InputInvalid
            }
            LockError::IncompleteResolution { .. }
            | LockError::ResolverProducedCycle { .. }
            | LockError::ResolverInconsistency { .. }
            | LockError::MalformedReport(_) => ErrorCategory::ResolverError,
            LockError::Tool(err) => err.category(),
        }
    }
}

/// The `[project]` slice of a pyproject manifest the resolver needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub name: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub platform_scope: Vec<String>,
}

impl ProjectManifest {
    /// Load the `[project]` table from a pyproject.toml.
    pub fn from_pyproject(path: &Path) -> Result<Self, LockError> {
        let text = std::fs::read_to_string(path).map_err(|e| LockError::ManifestInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_pyproject_str(&text).map_err(|message| LockError::ManifestInvalid {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_pyproject_str(text: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct PyProject {
            project: ProjectTable,
        }
        #[derive(Deserialize)]
        struct ProjectTable {
            name: String,
            #[serde(default)]
            dependencies: Vec<String>,
            #[serde(rename = "requires-python")]
            requires_python: Option<String>,
        }

        let parsed: PyProject = toml::from_str(text).map_err(|e| e.to_string())?;
        if parsed.project.name.trim().is_empty() {
            return Err("project.name is empty".to_string());
        }
        Ok(Self {
            name: normalize_name(&parsed.project.name),
            requirements: parsed.project.dependencies,
            requires_python: parsed.project.requires_python,
            platform_scope: Vec::new(),
        })
    }
}

/// One resolved distribution in the resolver report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionNode {
    pub name: String,
    pub version: String,
    /// `algorithm:hex` tokens across every artifact variant on the index.
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcs_spec: Option<String>,
}

/// One requirement edge in the resolver report. `from` is absent for
/// the project's direct requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionEdge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    /// Specifier portion of the requirement (`>=0.4,<0.5`; may be empty).
    #[serde(default)]
    pub requirement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

/// The JSON document the `resolve` tool prints on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionReport {
    pub resolver_version: String,
    pub nodes: Vec<ResolutionNode>,
    #[serde(default)]
    pub edges: Vec<ResolutionEdge>,
}

impl ResolutionReport {
    pub fn parse(json: &str) -> Result<Self, LockError> {
        serde_json::from_str(json).map_err(|e| LockError::MalformedReport(e.to_string()))
    }
}

/// Validate a resolution and canonicalize it into a lock record.
///
/// Validation order is fixed: hash completeness, acyclicity, then
/// specifier satisfaction; the first failure wins so errors are stable
/// across runs.
pub fn lock_from_report(
    report: &ResolutionReport,
    platform_scope: &[String],
    python_scope: &[String],
) -> Result<LockRecord, LockError> {
    let mut by_name: BTreeMap<String, (&ResolutionNode, Version)> = BTreeMap::new();
    for node in &report.nodes {
        let name = normalize_name(&node.name);
        let version: Version = node
            .version
            .parse()
            .map_err(|_| LockError::MalformedReport(format!("bad version for {name}")))?;
        if by_name.insert(name.clone(), (node, version)).is_some() {
            return Err(LockError::MalformedReport(format!(
                "node {name} appears more than once"
            )));
        }
    }

    // Hash completeness before anything else; a constraint without
    // hashes can never be installed with enforcement on.
    for (name, (node, _)) in &by_name {
        if node.hashes.is_empty() {
            return Err(LockError::IncompleteResolution { name: name.clone() });
        }
    }

    let edges = normalized_edges(report, &by_name)?;
    detect_cycle(&by_name, &edges)?;
    check_satisfiability(&by_name, &edges)?;

    let mut constraints = Vec::with_capacity(by_name.len());
    for (name, (node, version)) in &by_name {
        let mut hashes = Vec::with_capacity(node.hashes.len());
        for token in &node.hashes {
            let parsed: HashDigest = token
                .parse()
                .map_err(|e: String| LockError::MalformedReport(e))?;
            if !parsed.is_well_formed() {
                return Err(LockError::MalformedReport(format!(
                    "unrecognized hash for {name}: {token}"
                )));
            }
            hashes.push(parsed);
        }
        hashes.sort();
        hashes.dedup();

        let source = match (&node.index_url, &node.vcs_spec) {
            (_, Some(spec)) => ConstraintSource::Vcs { spec: spec.clone() },
            (Some(url), None) => ConstraintSource::Index { url: url.clone() },
            (None, None) => ConstraintSource::Index {
                url: "https://pypi.org/simple".to_string(),
            },
        };

        constraints.push(LockedConstraint {
            coordinate: Coordinate::new(name, version.clone()),
            hashes,
            source,
        });
    }

    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in by_name.keys() {
        dependencies.insert(name.clone(), Vec::new());
    }
    for (from, to, _) in &edges {
        if let Some(from) = from {
            let deps = dependencies.entry(from.clone()).or_default();
            if !deps.contains(to) {
                deps.push(to.clone());
            }
        }
    }
    for deps in dependencies.values_mut() {
        deps.sort();
    }

    Ok(LockRecord {
        lock_version: LOCK_VERSION.to_string(),
        resolver_version: report.resolver_version.clone(),
        platform_scope: platform_scope.to_vec(),
        python_scope: python_scope.to_vec(),
        constraints,
        dependencies,
    })
}

type NormalizedEdge = (Option<String>, String, String);

fn normalized_edges(
    report: &ResolutionReport,
    by_name: &BTreeMap<String, (&ResolutionNode, Version)>,
) -> Result<Vec<NormalizedEdge>, LockError> {
    let mut edges = Vec::with_capacity(report.edges.len());
    for edge in &report.edges {
        let to = normalize_name(&edge.to);
        if !by_name.contains_key(&to) {
            return Err(LockError::MalformedReport(format!(
                "edge targets unknown node {to}"
            )));
        }
        let from = match &edge.from {
            Some(from) => {
                let from = normalize_name(from);
                if !by_name.contains_key(&from) {
                    return Err(LockError::MalformedReport(format!(
                        "edge originates from unknown node {from}"
                    )));
                }
                Some(from)
            }
            None => None,
        };
        edges.push((from, to, edge.requirement.clone()));
    }
    Ok(edges)
}

/// Kahn's algorithm; any leftover node set is reported as the cycle,
/// sorted for stable error text. Cycles are never silently broken.
fn detect_cycle(
    by_name: &BTreeMap<String, (&ResolutionNode, Version)>,
    edges: &[NormalizedEdge],
) -> Result<(), LockError> {
    let mut indegree: BTreeMap<&str, usize> = by_name.keys().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (from, to, _) in edges {
        if let Some(from) = from {
            *indegree.get_mut(to.as_str()).expect("known node") += 1;
            dependents.entry(from.as_str()).or_default().push(to);
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut seen = 0usize;

    while let Some(name) = ready.iter().next().copied() {
        ready.remove(name);
        seen += 1;
        if let Some(next) = dependents.get(name) {
            for to in next {
                let deg = indegree.get_mut(to).expect("known node");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(to);
                }
            }
        }
    }

    if seen == by_name.len() {
        return Ok(());
    }

    let cycle: Vec<String> = indegree
        .iter()
        .filter(|(_, deg)| **deg > 0)
        .map(|(n, _)| n.to_string())
        .collect();
    Err(LockError::ResolverProducedCycle { cycle })
}

fn check_satisfiability(
    by_name: &BTreeMap<String, (&ResolutionNode, Version)>,
    edges: &[NormalizedEdge],
) -> Result<(), LockError> {
    for (from, to, requirement) in edges {
        let (_, chosen) = by_name.get(to).expect("validated above");
        let spec: SpecifierSet = requirement.parse().map_err(|_| {
            LockError::MalformedReport(format!("bad requirement `{requirement}` for {to}"))
        })?;
        if !spec.matches(chosen) {
            return Err(LockError::ResolverInconsistency {
                from: from.clone().unwrap_or_else(|| "<project>".to_string()),
                to: to.clone(),
                requirement: requirement.clone(),
                chosen: chosen.to_string(),
            });
        }
    }
    Ok(())
}

/// Render the textual constraints file: one `name==version` per line
/// followed by ` --hash=algo:hex` tokens, sorted by normalized name,
/// LF-terminated with a trailing newline.
pub fn render_constraints(record: &LockRecord) -> String {
    let mut out = String::new();
    for constraint in &record.constraints {
        out.push_str(&constraint.coordinate.name);
        out.push_str("==");
        out.push_str(&constraint.coordinate.version.to_string());
        for hash in &constraint.hashes {
            out.push_str(" --hash=");
            out.push_str(&hash.to_string());
        }
        out.push('\n');
    }
    out
}

/// One parsed line of a constraints file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintLine {
    pub name: String,
    pub version: Version,
    pub hashes: Vec<HashDigest>,
}

/// Parse a constraints file. Comments (`#` to end of line) are
/// stripped, backslash continuations are joined, and entries are
/// returned in file order.
pub fn parse_constraints(text: &str) -> Result<Vec<ConstraintLine>, LockError> {
    let mut entries = Vec::new();
    let mut pending = String::new();
    let mut pending_start = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let without_comment = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let trimmed = without_comment.trim();
        if trimmed.is_empty() && pending.is_empty() {
            continue;
        }

        if pending.is_empty() {
            pending_start = lineno;
        }

        if let Some(stripped) = trimmed.strip_suffix('\\') {
            pending.push_str(stripped);
            pending.push(' ');
            continue;
        }

        pending.push_str(trimmed);
        let line = std::mem::take(&mut pending);
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_constraint_line(&line, pending_start)?);
    }

    if !pending.trim().is_empty() {
        return Err(LockError::ConstraintsParse {
            line: pending_start,
            message: "dangling line continuation".to_string(),
        });
    }

    Ok(entries)
}

fn parse_constraint_line(line: &str, lineno: usize) -> Result<ConstraintLine, LockError> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or_else(|| LockError::ConstraintsParse {
        line: lineno,
        message: "empty requirement".to_string(),
    })?;

    let (name_part, version_part) =
        head.split_once("==").ok_or_else(|| LockError::ConstraintsParse {
            line: lineno,
            message: format!("expected name==version, got `{head}`"),
        })?;

    // Extras in brackets are tolerated and normalized away; hashes pin
    // the artifact set regardless of extras.
    let name_only = match name_part.split_once('[') {
        Some((base, _)) => base,
        None => name_part,
    };
    let name = normalize_name(name_only);
    if name.is_empty() {
        return Err(LockError::ConstraintsParse {
            line: lineno,
            message: "empty distribution name".to_string(),
        });
    }

    let version: Version = version_part.parse().map_err(|_| LockError::ConstraintsParse {
        line: lineno,
        message: format!("bad version `{version_part}`"),
    })?;

    let mut hashes = Vec::new();
    for token in tokens {
        let Some(value) = token.strip_prefix("--hash=") else {
            return Err(LockError::ConstraintsParse {
                line: lineno,
                message: format!("unexpected token `{token}`"),
            });
        };
        let digest: HashDigest = value.parse().map_err(|e: String| LockError::ConstraintsParse {
            line: lineno,
            message: e,
        })?;
        if !digest.is_well_formed() {
            return Err(LockError::ConstraintsParse {
                line: lineno,
                message: format!("unrecognized hash `{value}`"),
            });
        }
        hashes.push(digest);
    }

    if hashes.is_empty() {
        return Err(LockError::ConstraintsParse {
            line: lineno,
            message: format!("{name} has no --hash tokens"),
        });
    }

    Ok(ConstraintLine {
        name,
        version,
        hashes,
    })
}

/// Structural diff between two lock records, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// `(name, from_version, to_version)`.
    pub changed: Vec<(String, String, String)>,
}

impl LockDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare a baseline lock to a proposed lock.
pub fn diff_locks(baseline: &LockRecord, proposed: &LockRecord) -> LockDiff {
    let old: BTreeMap<&str, &Version> = baseline
        .constraints
        .iter()
        .map(|c| (c.coordinate.name.as_str(), &c.coordinate.version))
        .collect();
    let new: BTreeMap<&str, &Version> = proposed
        .constraints
        .iter()
        .map(|c| (c.coordinate.name.as_str(), &c.coordinate.version))
        .collect();

    let mut diff = LockDiff::default();
    for (name, version) in &new {
        match old.get(name) {
            None => diff.added.push(name.to_string()),
            Some(previous) if previous != version => diff.changed.push((
                name.to_string(),
                previous.to_string(),
                version.to_string(),
            )),
            Some(_) => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            diff.removed.push(name.to_string());
        }
    }
    diff
}

/// Drives the external resolver and produces the lock artifacts.
#[derive(Debug)]
pub struct LockGenerator<'a> {
    adapter: &'a ToolAdapter,
    index_url: Option<String>,
    extra_index_urls: Vec<String>,
}

impl<'a> LockGenerator<'a> {
    pub fn new(adapter: &'a ToolAdapter) -> Self {
        Self {
            adapter,
            index_url: None,
            extra_index_urls: Vec::new(),
        }
    }

    pub fn with_index_url(mut self, url: impl Into<String>) -> Self {
        self.index_url = Some(url.into());
        self
    }

    pub fn with_extra_index_urls(mut self, urls: Vec<String>) -> Self {
        self.extra_index_urls = urls;
        self
    }

    /// Resolve the manifest's closure and return the canonical lock
    /// record plus the rendered constraints text.
    pub fn generate(
        &self,
        manifest: &ProjectManifest,
        working_dir: &Path,
    ) -> Result<(LockRecord, String), LockError> {
        let requirements_path = working_dir.join("requirements.in");
        let mut requirements = manifest.requirements.join("\n");
        requirements.push('\n');
        std::fs::write(&requirements_path, requirements).map_err(|e| {
            LockError::ManifestInvalid {
                path: requirements_path.display().to_string(),
                message: e.to_string(),
            }
        })?;

        let mut invocation = ToolInvocation::new(ToolTag::Resolve)
            .working_dir(working_dir)
            .args([
                "pip",
                "compile",
                "requirements.in",
                "--universal",
                "--generate-hashes",
                "--output-format",
                "graph-json",
                "--quiet",
            ]);
        if let Some(python) = &manifest.requires_python {
            invocation = invocation.args(["--python-version-range", python.as_str()]);
        }
        if let Some(index) = &self.index_url {
            invocation = invocation.args(["--index-url", index.as_str()]);
        }
        for extra in &self.extra_index_urls {
            invocation = invocation.args(["--extra-index-url", extra.as_str()]);
        }

        let record = self.adapter.run(invocation)?;
        let report = ResolutionReport::parse(&record.stdout)?;
        let lock = lock_from_report(&report, &manifest.platform_scope, &[])?;
        let constraints = render_constraints(&lock);
        Ok((lock, constraints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, version: &str, hashes: &[String]) -> ResolutionNode {
        ResolutionNode {
            name: name.to_string(),
            version: version.to_string(),
            hashes: hashes.to_vec(),
            index_url: Some("https://pypi.org/simple".to_string()),
            vcs_spec: None,
        }
    }

    fn edge(from: Option<&str>, to: &str, requirement: &str) -> ResolutionEdge {
        ResolutionEdge {
            from: from.map(|s| s.to_string()),
            to: to.to_string(),
            requirement: requirement.to_string(),
            marker: None,
        }
    }

    fn report(nodes: Vec<ResolutionNode>, edges: Vec<ResolutionEdge>) -> ResolutionReport {
        ResolutionReport {
            resolver_version: "uv 0.5.1".to_string(),
            nodes,
            edges,
        }
    }

    fn sha(prefix: &str) -> String {
        format!("sha256:{}", prefix.repeat(64 / prefix.len()))
    }

    #[test]
    fn happy_path_lock_lines_are_sorted_and_pinned() {
        // Scenario: two direct requirements resolving cleanly.
        let rep = report(
            vec![
                node("demo-util", "0.4.7", &[sha("b")]),
                node("demo-lib", "1.2.3", &[sha("a")]),
            ],
            vec![
                edge(None, "demo-lib", "==1.2.3"),
                edge(None, "demo-util", ">=0.4,<0.5"),
            ],
        );

        let lock = lock_from_report(&rep, &[], &[]).expect("lock");
        assert_eq!(lock.lock_version, LOCK_VERSION);
        assert_eq!(lock.resolver_version, "uv 0.5.1");

        let text = render_constraints(&lock);
        let expected = format!(
            "demo-lib==1.2.3 --hash={}\ndemo-util==0.4.7 --hash={}\n",
            sha("a"),
            sha("b")
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn empty_dependency_set_is_still_canonical() {
        let rep = report(vec![], vec![]);
        let lock = lock_from_report(&rep, &[], &[]).expect("lock");
        assert!(lock.constraints.is_empty());
        assert_eq!(render_constraints(&lock), "");
    }

    #[test]
    fn missing_hashes_are_incomplete_resolution() {
        let rep = report(vec![node("demo-lib", "1.2.3", &[])], vec![]);
        let err = lock_from_report(&rep, &[], &[]).expect_err("must fail");
        assert!(matches!(err, LockError::IncompleteResolution { .. }));
        assert_eq!(err.category(), ErrorCategory::ResolverError);
    }

    #[test]
    fn cycles_are_fatal_and_named() {
        let rep = report(
            vec![
                node("pkg-a", "1.0", &[sha("a")]),
                node("pkg-b", "1.0", &[sha("b")]),
            ],
            vec![
                edge(Some("pkg-a"), "pkg-b", ""),
                edge(Some("pkg-b"), "pkg-a", ""),
            ],
        );
        let err = lock_from_report(&rep, &[], &[]).expect_err("cycle");
        match err {
            LockError::ResolverProducedCycle { cycle } => {
                assert_eq!(cycle, vec!["pkg-a".to_string(), "pkg-b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unsatisfied_specifier_is_inconsistency() {
        let rep = report(
            vec![
                node("pkg-a", "1.0", &[sha("a")]),
                node("pkg-b", "2.0", &[sha("b")]),
            ],
            vec![edge(Some("pkg-a"), "pkg-b", "<2.0")],
        );
        let err = lock_from_report(&rep, &[], &[]).expect_err("inconsistent");
        match err {
            LockError::ResolverInconsistency { from, to, chosen, .. } => {
                assert_eq!(from, "pkg-a");
                assert_eq!(to, "pkg-b");
                assert_eq!(chosen, "2.0");
            }
            other => panic!("expected inconsistency, got {other:?}"),
        }
    }

    #[test]
    fn hash_order_is_canonical_within_entry() {
        let rep = report(
            vec![node(
                "demo-lib",
                "1.2.3",
                &[sha("f"), sha("a"), format!("sha512:{}", "c".repeat(128))],
            )],
            vec![],
        );
        let lock = lock_from_report(&rep, &[], &[]).expect("lock");
        let hashes: Vec<String> = lock.constraints[0]
            .hashes
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let rep = report(
            vec![
                node("demo-lib", "1.2.3", &[sha("a")]),
                node("Demo_Lib", "1.2.4", &[sha("b")]),
            ],
            vec![],
        );
        let err = lock_from_report(&rep, &[], &[]).expect_err("dup");
        assert!(matches!(err, LockError::MalformedReport(_)));
    }

    #[test]
    fn lock_generation_is_deterministic() {
        let make = || {
            let rep = report(
                vec![
                    node("zeta", "2.0", &[sha("d"), sha("c")]),
                    node("alpha", "1.0", &[sha("a")]),
                ],
                vec![edge(Some("zeta"), "alpha", ">=1.0")],
            );
            let lock = lock_from_report(&rep, &[], &[]).expect("lock");
            (serde_json::to_string(&lock).expect("json"), render_constraints(&lock))
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn parse_emit_roundtrip() {
        let rep = report(
            vec![
                node("demo-util", "0.4.7", &[sha("b"), sha("e")]),
                node("demo-lib", "1.2.3", &[sha("a")]),
            ],
            vec![],
        );
        let lock = lock_from_report(&rep, &[], &[]).expect("lock");
        let text = render_constraints(&lock);

        let parsed = parse_constraints(&text).expect("parse");
        assert_eq!(parsed.len(), 2);
        for (line, constraint) in parsed.iter().zip(&lock.constraints) {
            assert_eq!(line.name, constraint.coordinate.name);
            assert_eq!(line.version, constraint.coordinate.version);
            assert_eq!(line.hashes, constraint.hashes);
        }
    }

    #[test]
    fn parse_strips_comments_and_joins_continuations() {
        let text = format!(
            "# pinned by chiron\ndemo-lib==1.2.3 \\\n    --hash={} # inline note\n",
            sha("a")
        );
        let parsed = parse_constraints(&text).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "demo-lib");
        assert_eq!(parsed[0].hashes.len(), 1);
    }

    #[test]
    fn parse_rejects_hashless_lines() {
        let err = parse_constraints("demo-lib==1.2.3\n").expect_err("no hash");
        assert!(matches!(err, LockError::ConstraintsParse { .. }));
        assert_eq!(err.category(), ErrorCategory::InputInvalid);
    }

    #[test]
    fn parse_rejects_unpinned_requirements() {
        let err = parse_constraints("demo-lib>=1.0 --hash=sha256:aa\n").expect_err("unpinned");
        assert!(matches!(err, LockError::ConstraintsParse { .. }));
    }

    #[test]
    fn parse_accepts_extras_and_normalizes() {
        let text = format!("Demo_Lib[Crypto]==1.2.3 --hash={}\n", sha("a"));
        let parsed = parse_constraints(&text).expect("parse");
        assert_eq!(parsed[0].name, "demo-lib");
    }

    #[test]
    fn diff_locks_reports_changes() {
        let old = lock_from_report(
            &report(
                vec![
                    node("demo-lib", "1.2.3", &[sha("a")]),
                    node("gone", "0.1", &[sha("d")]),
                ],
                vec![],
            ),
            &[],
            &[],
        )
        .expect("lock");
        let new = lock_from_report(
            &report(
                vec![
                    node("demo-lib", "2.0.0", &[sha("b")]),
                    node("fresh", "0.9", &[sha("c")]),
                ],
                vec![],
            ),
            &[],
            &[],
        )
        .expect("lock");

        let diff = diff_locks(&old, &new);
        assert_eq!(diff.added, vec!["fresh".to_string()]);
        assert_eq!(diff.removed, vec!["gone".to_string()]);
        assert_eq!(
            diff.changed,
            vec![("demo-lib".to_string(), "1.2.3".to_string(), "2.0.0".to_string())]
        );
    }

    #[test]
    fn pyproject_manifest_parses_project_table() {
        let text = r#"
[project]
name = "Demo_App"
dependencies = ["demo-lib==1.2.3", "demo-util>=0.4,<0.5"]
requires-python = ">=3.11"
"#;
        let manifest = ProjectManifest::from_pyproject_str(text).expect("manifest");
        assert_eq!(manifest.name, "demo-app");
        assert_eq!(manifest.requirements.len(), 2);
        assert_eq!(manifest.requires_python.as_deref(), Some(">=3.11"));
    }

    #[test]
    fn pyproject_manifest_rejects_missing_project() {
        assert!(ProjectManifest::from_pyproject_str("[tool.other]\nx = 1\n").is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_entry() -> impl Strategy<Value = (String, String, Vec<String>)> {
            (
                "[a-z][a-z0-9-]{1,12}",
                (1u64..20, 0u64..20, 0u64..20).prop_map(|(a, b, c)| format!("{a}.{b}.{c}")),
                proptest::collection::vec("[0-9a-f]{64}", 1..3),
            )
                .prop_map(|(name, version, digests)| {
                    let hashes = digests
                        .into_iter()
                        .map(|d| format!("sha256:{d}"))
                        .collect();
                    (name, version, hashes)
                })
        }

        proptest! {
            #[test]
            fn emit_parse_identity(
                entries in proptest::collection::btree_map(
                    "[a-z][a-z0-9-]{1,10}",
                    ((1u64..9, 0u64..9).prop_map(|(a, b)| format!("{a}.{b}")),
                     proptest::collection::btree_set("[0-9a-f]{64}", 1..3)),
                    0..5,
                )
            ) {
                // Distinct raw names can normalize to the same entry;
                // keep one per normalized name like a real resolver.
                let mut seen = std::collections::BTreeSet::new();
                let nodes: Vec<ResolutionNode> = entries
                    .iter()
                    .filter(|(name, _)| seen.insert(normalize_name(name)))
                    .map(|(name, (version, digests))| ResolutionNode {
                        name: name.clone(),
                        version: version.clone(),
                        hashes: digests.iter().map(|d| format!("sha256:{d}")).collect(),
                        index_url: None,
                        vcs_spec: None,
                    })
                    .collect();
                let rep = ResolutionReport {
                    resolver_version: "uv test".to_string(),
                    nodes,
                    edges: vec![],
                };
                let lock = lock_from_report(&rep, &[], &[]).expect("lock");
                let text = render_constraints(&lock);
                let parsed = parse_constraints(&text).expect("parse");

                prop_assert_eq!(parsed.len(), lock.constraints.len());
                for (line, constraint) in parsed.iter().zip(&lock.constraints) {
                    prop_assert_eq!(&line.name, &constraint.coordinate.name);
                    prop_assert_eq!(&line.version, &constraint.coordinate.version);
                    prop_assert_eq!(&line.hashes, &constraint.hashes);
                }
            }

            #[test]
            fn emitted_lines_are_sorted(
                raw in proptest::collection::vec(arb_entry(), 0..6)
            ) {
                let mut seen = std::collections::BTreeSet::new();
                let nodes: Vec<ResolutionNode> = raw
                    .into_iter()
                    .filter(|(name, _, _)| seen.insert(normalize_name(name)))
                    .map(|(name, version, hashes)| ResolutionNode {
                        name,
                        version,
                        hashes,
                        index_url: None,
                        vcs_spec: None,
                    })
                    .collect();
                let rep = ResolutionReport {
                    resolver_version: "uv test".to_string(),
                    nodes,
                    edges: vec![],
                };
                let lock = lock_from_report(&rep, &[], &[]).expect("lock");
                let text = render_constraints(&lock);
                let names: Vec<&str> = text
                    .lines()
                    .filter_map(|l| l.split("==").next())
                    .collect();
                let mut sorted = names.clone();
                sorted.sort();
                prop_assert_eq!(names, sorted);
            }
        }
    }
}
