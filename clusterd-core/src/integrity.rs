//! Integrity: per-file SHA-256 digests and the status report built from them.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::sync::FileSet;

/// The `file_status` reply always describes the master's copy of the files.
pub const PERSPECTIVE: &str = "master";

/// Hex SHA-256 digest, as reported in `file_status`.
pub fn hex_digest(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
struct FileStatusEntry {
    sha256: String,
    size: u64,
}

/// Status descriptor for every file in `files`:
/// `{"perspective": "master", "files": {path: {"sha256", "size"}}}`.
pub fn status_report(files: &FileSet) -> Value {
    let entries: serde_json::Map<String, Value> = files
        .iter()
        .map(|f| {
            let entry = FileStatusEntry {
                sha256: hex_digest(&f.contents),
                size: f.contents.len() as u64,
            };
            (
                f.path.to_string_lossy().into_owned(),
                serde_json::to_value(entry).unwrap_or(Value::Null),
            )
        })
        .collect();
    json!({
        "perspective": PERSPECTIVE,
        "files": entries,
    })
}
