//! EVM event fingerprint computation.
//!
//! The fingerprint of an EVM event is the keccak256 hash of its canonical
//! signature string, e.g.:
//!   keccak256("Withdraw(address,uint256)")
//!
//! For raw logs, topics[0] IS the fingerprint.

use tiny_keccak::{Hasher, Keccak};

/// Compute the keccak256 fingerprint of an event signature string as
/// lowercase `0x…` hex.
pub fn keccak256_signature(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

/// Extract the fingerprint from topics[0], lowercased.
/// Returns `None` if topics is empty or the first topic is malformed.
pub fn from_topics(topics: &[String]) -> Option<String> {
    let first = topics.first()?;
    let hex = first.strip_prefix("0x").unwrap_or(first);
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("0x{}", hex.to_ascii_lowercase()))
    } else {
        None
    }
}
