//! Content and identity hashes, and the hash to cache path layout
//!
//! Every hash is a lowercase SHA-256 hex digest. Cache artefacts are spread
//! over three directory levels taken from the first six hex characters.

use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::json;

const READ_CHUNK: usize = 64 * 1024;

/// Hash a string
pub fn hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Hash a mapping of names to values
///
/// The mapping is canonicalised as `{"k1":v1,"k2":v2}` with keys sorted and
/// values written through their `Display` form, unquoted.
pub fn hash_mapping<I, K, V>(entries: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Display,
{
    let mut pairs: Vec<(String, String)> = entries
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_owned(), v.to_string()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let body = pairs
        .iter()
        .map(|(k, v)| format!("\"{k}\":{v}"))
        .collect::<Vec<_>>()
        .join(",");
    hash(&format!("{{{body}}}"))
}

/// Hash a JSON declaration, ignoring one top-level field
///
/// Content that is not valid JSON is hashed byte for byte instead.
pub fn hash_json_file(path: &Path, ignored_field: &str) -> Result<String> {
    let raw = std::fs::read(path)?;
    let text = String::from_utf8(raw)
        .map_err(|e| Error::Format(format!("`{}' is not UTF-8: {e}", path.display())))?;

    let mut value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(
                target: "beat::hash",
                path = %path.display(),
                error = %e,
                "not a JSON document, hashing raw contents"
            );
            return hash_file_contents(path);
        }
    };

    if let Some(map) = value.as_object_mut() {
        map.remove(ignored_field);
    }

    let canonical = json::to_sorted_string(&value)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Hash the full content of a file
pub fn hash_file_contents(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the identity of a database set
///
/// All whitespace is removed from the canonical object before hashing, so
/// stray blanks around the names do not change the result.
pub fn hash_dataset(database: &str, protocol: &str, set: &str) -> String {
    let text = format!(
        "{{\n    \"database\": \"{database}\",\n    \"protocol\": \"{protocol}\",\n    \"set\": \"{set}\"\n}}"
    );
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hash(&compact)
}

/// Map a hex hash to its location below a cache root
pub fn to_path(hex_hash: &str, suffix: &str) -> Result<PathBuf> {
    if hex_hash.len() < 7 || !hex_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidArgument(format!(
            "`{hex_hash}' is not a hexadecimal hash"
        )));
    }

    let mut path = PathBuf::from(&hex_hash[0..2]);
    path.push(&hex_hash[2..4]);
    path.push(&hex_hash[4..6]);
    path.push(format!("{}{suffix}", &hex_hash[6..]));
    Ok(path)
}

/// Location of a user's area below a cache root
pub fn to_user_path(username: &str) -> PathBuf {
    let h = hash(username);
    let mut path = PathBuf::from(&h[0..2]);
    path.push(&h[2..4]);
    path.push(username);
    path
}
