//! PEP 440 version and specifier handling for chiron.
//!
//! This crate provides the version vocabulary the rest of the engine is
//! built on: normalized distribution names (PEP 503), parsed versions
//! (PEP 440) with total ordering, and version specifier sets.
//!
//! # Example
//!
//! ```
//! use chiron_version::{Version, SpecifierSet, normalize_name};
//!
//! let v: Version = "1.2.3".parse().expect("version");
//! let spec: SpecifierSet = ">=1.0,<2.0".parse().expect("specifier");
//! assert!(spec.matches(&v));
//! assert_eq!(normalize_name("Demo_Lib.Extra"), "demo-lib-extra");
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while parsing versions or specifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("invalid version specifier: {0}")]
    InvalidSpecifier(String),
}

/// Normalize a distribution name per PEP 503: lowercase, with runs of
/// `-`, `_`, and `.` collapsed to a single `-`.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;

    for ch in raw.trim().chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            pending_sep = !out.is_empty();
        } else {
            if pending_sep {
                out.push('-');
                pending_sep = false;
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }

    out
}

/// Pre-release phase marker, ordered alpha < beta < rc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreKind {
    Alpha,
    Beta,
    Rc,
}

impl PreKind {
    fn as_str(&self) -> &'static str {
        match self {
            PreKind::Alpha => "a",
            PreKind::Beta => "b",
            PreKind::Rc => "rc",
        }
    }
}

/// A parsed PEP 440 version.
///
/// Supports the forms the package index actually serves:
/// `[epoch!]N(.N)*[{a|b|rc}N][.postN][.devN]`. Local version labels
/// (`+local`) are accepted and preserved but ignored for ordering, which
/// matches how hash-pinned resolution treats them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u32,
    pub release: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre: Option<(PreKind, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
}

impl Version {
    /// Release component at `idx`, zero when absent (`1.2` has patch 0).
    pub fn release_component(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    pub fn major(&self) -> u64 {
        self.release_component(0)
    }

    pub fn minor(&self) -> u64 {
        self.release_component(1)
    }

    pub fn patch(&self) -> u64 {
        self.release_component(2)
    }

    /// True when the version carries a pre-release or dev marker.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            match self.release_component(i).cmp(&other.release_component(i)) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    // PEP 440 phase ranking: a dev release of X sorts before any
    // pre-release of X, which sorts before the final release, which
    // sorts before post releases.
    fn pre_key(&self) -> (u8, u8, u64) {
        match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (0, 0, 0),
            (Some((kind, n)), _, _) => (1, kind as u8, n),
            (None, _, _) => (2, 0, 0),
        }
    }

    fn post_key(&self) -> (u8, u64) {
        match self.post {
            None => (0, 0),
            Some(n) => (1, n),
        }
    }

    fn dev_key(&self) -> (u8, u64) {
        match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.cmp_release(other))
            .then_with(|| self.pre_key().cmp(&other.pre_key()))
            .then_with(|| self.post_key().cmp(&other.post_key()))
            .then_with(|| self.dev_key().cmp(&other.dev_key()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((kind, n)) = self.pre {
            write!(f, "{}{}", kind.as_str(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        if let Some(local) = &self.local {
            write!(f, "+{}", local)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_version(raw)
    }
}

fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let original = raw;
    let mut s = raw.trim().to_ascii_lowercase();
    if let Some(rest) = s.strip_prefix('v') {
        s = rest.to_string();
    }
    if s.is_empty() {
        return Err(VersionError::InvalidVersion(original.to_string()));
    }

    let mut local = None;
    if let Some(idx) = s.find('+') {
        let label = s[idx + 1..].to_string();
        if label.is_empty() {
            return Err(VersionError::InvalidVersion(original.to_string()));
        }
        local = Some(label);
        s.truncate(idx);
    }

    let mut epoch = 0;
    let mut rest = s;
    if let Some(idx) = rest.find('!') {
        epoch = rest[..idx]
            .parse::<u32>()
            .map_err(|_| VersionError::InvalidVersion(original.to_string()))?;
        rest = rest[idx + 1..].to_string();
    }

    let mut dev = None;
    if let Some(idx) = rest.find(".dev") {
        let tail = &rest[idx + 4..];
        dev = Some(parse_segment_number(tail, original)?);
        rest.truncate(idx);
    }

    let mut post = None;
    if let Some(idx) = rest.find(".post") {
        let tail = &rest[idx + 5..];
        post = Some(parse_segment_number(tail, original)?);
        rest.truncate(idx);
    }

    let mut pre = None;
    for (marker, kind) in [
        ("rc", PreKind::Rc),
        ("a", PreKind::Alpha),
        ("b", PreKind::Beta),
    ] {
        if let Some(idx) = rest.find(marker) {
            let tail = &rest[idx + marker.len()..];
            pre = Some((kind, parse_segment_number(tail, original)?));
            rest.truncate(idx);
            // Tolerate the optional separator before the pre marker (1.0-rc1).
            while rest.ends_with('.') || rest.ends_with('-') || rest.ends_with('_') {
                rest.pop();
            }
            break;
        }
    }

    if rest.is_empty() {
        return Err(VersionError::InvalidVersion(original.to_string()));
    }

    let mut release = Vec::new();
    for part in rest.split('.') {
        let n = part
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidVersion(original.to_string()))?;
        release.push(n);
    }

    Ok(Version {
        epoch,
        release,
        pre,
        post,
        dev,
        local,
    })
}

fn parse_segment_number(tail: &str, original: &str) -> Result<u64, VersionError> {
    if tail.is_empty() {
        return Ok(0);
    }
    tail.parse::<u64>()
        .map_err(|_| VersionError::InvalidVersion(original.to_string()))
}

/// Comparison operator in a version specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
    ArbitraryEqual,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::Compatible => "~=",
            Operator::ArbitraryEqual => "===",
        }
    }
}

/// One clause of a version specifier (`>=1.0`, `==1.2.*`, `~=2.1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specifier {
    pub op: Operator,
    pub version: String,
}

impl Specifier {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Operator::ArbitraryEqual => candidate.to_string() == self.version,
            Operator::Equal => {
                if let Some(prefix) = self.version.strip_suffix(".*") {
                    prefix_matches(prefix, candidate)
                } else {
                    // Ordering comparison so `==1.0` matches `1.0.0`.
                    compare(candidate, &self.version, |o| o == Ordering::Equal)
                }
            }
            Operator::NotEqual => {
                if let Some(prefix) = self.version.strip_suffix(".*") {
                    !prefix_matches(prefix, candidate)
                } else {
                    compare(candidate, &self.version, |o| o != Ordering::Equal)
                }
            }
            Operator::GreaterEqual => compare(candidate, &self.version, |o| o != Ordering::Less),
            Operator::LessEqual => compare(candidate, &self.version, |o| o != Ordering::Greater),
            Operator::Greater => compare(candidate, &self.version, |o| o == Ordering::Greater),
            Operator::Less => compare(candidate, &self.version, |o| o == Ordering::Less),
            Operator::Compatible => {
                // ~=X.Y is >=X.Y, ==X.* ; ~=X.Y.Z is >=X.Y.Z, ==X.Y.*
                let Ok(floor) = self.version.parse::<Version>() else {
                    return false;
                };
                if floor.release.len() < 2 {
                    return false;
                }
                if candidate < &floor {
                    return false;
                }
                let prefix: Vec<String> = floor.release[..floor.release.len() - 1]
                    .iter()
                    .map(|n| n.to_string())
                    .collect();
                prefix_matches(&prefix.join("."), candidate)
            }
        }
    }
}

fn compare(candidate: &Version, bound: &str, accept: impl Fn(Ordering) -> bool) -> bool {
    match bound.parse::<Version>() {
        Ok(v) => accept(candidate.cmp(&v)),
        Err(_) => false,
    }
}

fn prefix_matches(prefix: &str, candidate: &Version) -> bool {
    let Ok(p) = prefix.parse::<Version>() else {
        return false;
    };
    if candidate.epoch != p.epoch {
        return false;
    }
    p.release
        .iter()
        .enumerate()
        .all(|(i, n)| candidate.release_component(i) == *n)
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

impl FromStr for Specifier {
    type Err = VersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        // Longest operators first so `>=` is not read as `>`.
        let table: [(&str, Operator); 8] = [
            ("===", Operator::ArbitraryEqual),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            (">=", Operator::GreaterEqual),
            ("<=", Operator::LessEqual),
            ("~=", Operator::Compatible),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ];
        for (token, op) in table {
            if let Some(version) = s.strip_prefix(token) {
                let version = version.trim();
                if version.is_empty() {
                    return Err(VersionError::InvalidSpecifier(raw.to_string()));
                }
                return Ok(Specifier {
                    op,
                    version: version.to_string(),
                });
            }
        }
        Err(VersionError::InvalidSpecifier(raw.to_string()))
    }
}

/// A comma-separated conjunction of specifiers (`>=0.4,<0.5`).
///
/// An empty set matches every version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecifierSet(pub Vec<Specifier>);

impl SpecifierSet {
    pub fn matches(&self, candidate: &Version) -> bool {
        self.0.iter().all(|s| s.matches(candidate))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for SpecifierSet {
    type Err = VersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(SpecifierSet::default());
        }
        let mut clauses = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            clauses.push(part.parse::<Specifier>()?);
        }
        Ok(SpecifierSet(clauses))
    }
}

/// Kind of release-segment change between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
    None,
}

/// Classify the release-segment jump from `from` to `to`.
///
/// Downgrades and epoch changes are reported as `Major` since they carry
/// the same review burden as a major bump.
pub fn classify_bump(from: &Version, to: &Version) -> BumpKind {
    if from.epoch != to.epoch || to < from {
        return BumpKind::Major;
    }
    if to.major() != from.major() {
        BumpKind::Major
    } else if to.minor() != from.minor() {
        BumpKind::Minor
    } else if to != from {
        BumpKind::Patch
    } else {
        BumpKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().expect("version")
    }

    #[test]
    fn normalize_name_collapses_separators() {
        assert_eq!(normalize_name("Demo_Lib.Extra"), "demo-lib-extra");
        assert_eq!(normalize_name("requests"), "requests");
        assert_eq!(normalize_name("A--B__C..D"), "a-b-c-d");
    }

    #[test]
    fn normalize_name_is_idempotent() {
        let once = normalize_name("Zope.Interface");
        assert_eq!(normalize_name(&once), once);
    }

    #[test]
    fn parses_plain_release() {
        let parsed = v("1.2.3");
        assert_eq!(parsed.release, vec![1, 2, 3]);
        assert_eq!(parsed.epoch, 0);
        assert!(parsed.pre.is_none());
    }

    #[test]
    fn parses_epoch_pre_post_dev() {
        let parsed = v("2!1.0rc2.post1.dev3");
        assert_eq!(parsed.epoch, 2);
        assert_eq!(parsed.pre, Some((PreKind::Rc, 2)));
        assert_eq!(parsed.post, Some(1));
        assert_eq!(parsed.dev, Some(3));
    }

    #[test]
    fn parses_local_label() {
        let parsed = v("1.0+cu121");
        assert_eq!(parsed.local.as_deref(), Some("cu121"));
        assert_eq!(parsed.to_string(), "1.0+cu121");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("not-a-version".parse::<Version>().is_err());
        assert!("1.2.x".parse::<Version>().is_err());
    }

    #[test]
    fn ordering_follows_pep440() {
        let ordered = [
            "1.0.dev1", "1.0a1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1", "1.1", "2.0",
        ];
        for pair in ordered.windows(2) {
            assert!(
                v(pair[0]) < v(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn equal_specifier_pads_release() {
        let spec: Specifier = "==1.0".parse().expect("spec");
        assert!(spec.matches(&v("1.0.0")));
        assert!(!spec.matches(&v("1.0.1")));
    }

    #[test]
    fn padded_release_orders_equal() {
        assert_eq!(v("1.0").cmp(&v("1.0.0")), Ordering::Equal);
        assert_eq!(v("1.0.0").cmp(&v("1.0")), Ordering::Equal);
    }

    #[test]
    fn specifier_basic_ops() {
        let ge: Specifier = ">=0.4".parse().expect("spec");
        assert!(ge.matches(&v("0.4.7")));
        assert!(!ge.matches(&v("0.3.9")));

        let lt: Specifier = "<0.5".parse().expect("spec");
        assert!(lt.matches(&v("0.4.7")));
        assert!(!lt.matches(&v("0.5")));
    }

    #[test]
    fn specifier_equal_prefix() {
        let spec: Specifier = "==1.4.*".parse().expect("spec");
        assert!(spec.matches(&v("1.4.0")));
        assert!(spec.matches(&v("1.4.12")));
        assert!(!spec.matches(&v("1.5.0")));
    }

    #[test]
    fn specifier_compatible_release() {
        let spec: Specifier = "~=2.1".parse().expect("spec");
        assert!(spec.matches(&v("2.1")));
        assert!(spec.matches(&v("2.9")));
        assert!(!spec.matches(&v("3.0")));
        assert!(!spec.matches(&v("2.0")));

        let patch: Specifier = "~=2.1.3".parse().expect("spec");
        assert!(patch.matches(&v("2.1.7")));
        assert!(!patch.matches(&v("2.2.0")));
    }

    #[test]
    fn specifier_set_conjunction() {
        let set: SpecifierSet = ">=0.4,<0.5".parse().expect("set");
        assert!(set.matches(&v("0.4.7")));
        assert!(!set.matches(&v("0.5.0")));
        assert!(!set.matches(&v("0.3.0")));
    }

    #[test]
    fn empty_specifier_set_matches_everything() {
        let set: SpecifierSet = "".parse().expect("set");
        assert!(set.matches(&v("0.0.1")));
        assert!(set.matches(&v("99!1.0")));
    }

    #[test]
    fn specifier_set_display_roundtrip() {
        let set: SpecifierSet = ">=0.4, <0.5".parse().expect("set");
        assert_eq!(set.to_string(), ">=0.4,<0.5");
        let reparsed: SpecifierSet = set.to_string().parse().expect("set");
        assert_eq!(reparsed, set);
    }

    #[test]
    fn classify_bump_levels() {
        assert_eq!(classify_bump(&v("1.2.3"), &v("2.0.0")), BumpKind::Major);
        assert_eq!(classify_bump(&v("1.2.3"), &v("1.3.0")), BumpKind::Minor);
        assert_eq!(classify_bump(&v("1.2.3"), &v("1.2.4")), BumpKind::Patch);
        assert_eq!(classify_bump(&v("1.2.3"), &v("1.2.3")), BumpKind::None);
    }

    #[test]
    fn classify_bump_downgrade_is_major() {
        assert_eq!(classify_bump(&v("1.2.3"), &v("1.2.2")), BumpKind::Major);
        assert_eq!(classify_bump(&v("1.0"), &v("1!0.1")), BumpKind::Major);
    }

    #[test]
    fn version_serde_roundtrip() {
        let parsed = v("1!2.3.4rc1.post2.dev3+local");
        let json = serde_json::to_string(&parsed).expect("serialize");
        let back: Version = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, parsed);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_version() -> impl Strategy<Value = Version> {
            (
                0u32..3,
                proptest::collection::vec(0u64..100, 1..4),
                proptest::option::of((0u8..3, 0u64..20)),
                proptest::option::of(0u64..20),
                proptest::option::of(0u64..20),
            )
                .prop_map(|(epoch, release, pre, post, dev)| Version {
                    epoch,
                    release,
                    pre: pre.map(|(k, n)| {
                        let kind = match k {
                            0 => PreKind::Alpha,
                            1 => PreKind::Beta,
                            _ => PreKind::Rc,
                        };
                        (kind, n)
                    }),
                    post,
                    dev,
                    local: None,
                })
        }

        proptest! {
            #[test]
            fn display_parse_roundtrip(version in arb_version()) {
                let rendered = version.to_string();
                let reparsed: Version = rendered.parse().expect("reparse");
                prop_assert_eq!(reparsed, version);
            }

            #[test]
            fn ordering_is_total_and_consistent(a in arb_version(), b in arb_version()) {
                let forward = a.cmp(&b);
                let backward = b.cmp(&a);
                prop_assert_eq!(forward, backward.reverse());
            }

            #[test]
            fn normalize_name_idempotent(raw in "[A-Za-z0-9._-]{1,40}") {
                let once = normalize_name(&raw);
                prop_assert_eq!(normalize_name(&once), once);
            }
        }
    }
}
