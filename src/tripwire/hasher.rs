//! KL-015: BLAKE3 hashing for output resources and installed tools.

use crate::core::error::KilnError;
use crate::core::types::OutputResource;
use std::path::Path;

/// Hash a file's contents, streaming. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String, KilnError> {
    let mut file = std::fs::File::open(path).map_err(|e| KilnError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| KilnError::io(path, e))?;
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Content hash of an output resource's desired state.
///
/// Covers type, identity, ownership, dependencies and body; serde_json
/// emits struct fields in declaration order, so the encoding is stable.
pub fn hash_output_resource(resource: &OutputResource) -> String {
    let encoded = serde_json::to_string(resource).unwrap_or_default();
    hash_string(&encoded)
}
