//! Deterministic stage identifiers.
//!
//! A stage id is a hash of the stage kind, the ids (never the values) of its
//! inputs, and its typed parameters. Identical requests therefore produce
//! identical ids across runs, and any change to an upstream stage changes the
//! id of everything downstream of it.

use sha2::{Digest, Sha256};

use crate::core::{StageId, StageParams};

/// Computes the id of a stage.
#[must_use]
pub fn stage_id(params: &StageParams, inputs: &[StageId]) -> StageId {
    let mut hasher = Sha256::new();
    hasher.update(params.kind().to_string().as_bytes());
    hasher.update(b"\0");
    for input in inputs {
        hasher.update(input.as_str().as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(canonical_params(params).as_bytes());
    let digest = hasher.finalize();

    StageId::new(format!("{}-{}", params.kind(), hex::encode(&digest[..12])))
}

/// Serializes params with object keys in sorted order.
fn canonical_params(params: &StageParams) -> String {
    // serde_json's default map is ordered, so round-tripping through Value sorts keys.
    serde_json::to_value(params)
        .and_then(|value| serde_json::to_string(&value))
        .unwrap_or_default()
}
