//! Payload integrity validation
//!
//! Every sub-record carries a checksum of its payload, verified before any
//! cached or loaded data is trusted. The checksum is a blake3 digest of the
//! canonical JSON encoding; `serde_json` serializes object keys in sorted
//! order, so semantically equal payloads hash equal regardless of how
//! their fields were inserted. Pure computation, no I/O.

use serde_json::Value;
use tracing::warn;

use crate::model::SessionRecord;

/// Deterministic content digest of a JSON payload (hex).
pub fn checksum(payload: &Value) -> String {
    // Canonical encoding: serde_json's map is ordered, so this is stable.
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// True iff recomputing the checksum of `payload` yields `digest`.
pub fn verify(payload: &Value, digest: &str) -> bool {
    checksum(payload) == digest
}

/// Verify every sub-record of a session.
///
/// A single mismatching mode fails the whole record: trusting a partially
/// corrupt record would let the conflict resolver propagate garbage, so
/// callers treat a `false` here as "not found".
pub fn validate_record(record: &SessionRecord) -> bool {
    for (name, mode) in &record.modes {
        if !verify(&mode.payload, &mode.checksum) {
            warn!(
                "Checksum mismatch for mode {} in session {}",
                name, record.session_id
            );
            return false;
        }
    }
    true
}
