//! Definition hashes.
//!
//! Rollup tables and catalog rows are stamped with the hash of the cube
//! definitions they were built from, so edits invalidate them.

use sha2::{Digest, Sha256};

use crate::model::CubeDef;

/// Characters of the hash embedded in rollup table names.
const TABLE_HASH_LEN: usize = 8;

/// SHA-256 over the JSON form of the definitions, as lowercase hex.
pub fn definitions_hash(defs: &[CubeDef]) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    for def in defs {
        hasher.update(serde_json::to_vec(def)?);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Prefix of `hash` used in table names.
pub fn table_hash(hash: &str) -> &str {
    hash.get(..TABLE_HASH_LEN).unwrap_or(hash)
}
