//! Deterministic identifiers.

use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `cmd_` + 24 hex chars of sha256(patient ‖ normalized medication name).
pub fn command_id(patient_id: &str, medication_name: &str) -> String {
    let normalized = medication_name.trim().to_lowercase();
    let digest = sha256_hex(&format!("{patient_id}\u{1f}{normalized}"));
    format!("cmd_{}", &digest[..24])
}

/// `evt_` + 32 hex chars of sha256(command ‖ event type ‖ salt).
pub fn event_id(command_id: &str, event_type: &str, salt: &str) -> String {
    let digest = sha256_hex(&format!("{command_id}\u{1f}{event_type}\u{1f}{salt}"));
    format!("evt_{}", &digest[..32])
}

/// Shared by every undo/correction of `original_event_id`, so at most one
/// compensating event can ever be written for it.
pub fn retraction_id(command_id: &str, original_event_id: &str) -> String {
    event_id(command_id, "RETRACTION", original_event_id)
}
