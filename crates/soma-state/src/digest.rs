//! Content digests used for change detection on deployment payloads.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::StateResult;

/// Hex SHA-256 of the canonical JSON encoding of `value`.
///
/// `serde_json` maps are ordered, so equal documents hash equally.
pub fn json_digest<T: Serialize + ?Sized>(value: &T) -> StateResult<String> {
    let canonical = serde_json::to_value(value).map_err(map_err!(Serialize))?;
    let bytes = serde_json::to_vec(&canonical).map_err(map_err!(Serialize))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
