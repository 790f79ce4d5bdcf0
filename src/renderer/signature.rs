//! Render signatures.
//!
//! A signature is the SHA-256 of the JSON serialization of exactly the data a
//! region renders. Equal signatures mean the region is already up to date.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of `payload`'s JSON form.
pub fn render_signature<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
