//! Canonical JSON serialization and content digests for chiron.
//!
//! Everything that gets hashed or signed goes through this crate. The
//! canonical form is byte-stable: UTF-8, no BOM, sorted object keys, no
//! insignificant whitespace, arrays in meaningful order, and numbers in
//! their shortest RFC 8259 rendering. Digests and signatures are always
//! computed over canonical bytes, never over pretty-printed files on
//! disk.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize any value to canonical JSON bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).context("value is not serializable to JSON")?;
    Ok(canonical_json(&value).into_bytes())
}

/// Produce canonical JSON text from a `serde_json::Value`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization cannot fail"));
        }
        Value::Array(arr) => {
            out.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json::Map preserves insertion order; sort explicitly.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(*key).expect("key serialization cannot fail"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Hex-encoded sha256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded sha256 of a value's canonical JSON bytes.
pub fn canonical_sha256<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Hex-encoded sha256 of a file, streamed so large wheels do not load
/// into memory.
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a serializable record with one top-level field removed.
///
/// This is how the bundle manifest's self-digest is defined: hash the
/// canonical serialization of the manifest with the digest field itself
/// excluded.
pub fn self_digest<T: Serialize>(value: &T, excluded_field: &str) -> Result<String> {
    let mut value = serde_json::to_value(value).context("value is not serializable to JSON")?;
    match value.as_object_mut() {
        Some(map) => {
            map.remove(excluded_field);
        }
        None => bail!("self_digest requires a JSON object at the top level"),
    }
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

/// Render a `checksums.sha256` document: `<hex>  <relative-path>` lines,
/// LF-terminated, sorted by path.
pub fn render_checksums(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (path, digest) in entries {
        out.push_str(digest);
        out.push_str("  ");
        out.push_str(path);
        out.push('\n');
    }
    out
}

/// Parse a `checksums.sha256` document back into path -> digest.
pub fn parse_checksums(text: &str) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((digest, path)) = line.split_once("  ") else {
            bail!("checksums line {} is malformed: {line}", lineno + 1);
        };
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("checksums line {} has a malformed digest", lineno + 1);
        }
        if entries.insert(path.to_string(), digest.to_string()).is_some() {
            bail!("checksums line {} repeats path {path}", lineno + 1);
        }
    }
    Ok(entries)
}
