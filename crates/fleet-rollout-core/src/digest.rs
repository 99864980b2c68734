//! Config digest: a non-cryptographic change detector for a fleet's batch-sequence
//! definition (§6, §9 "Config digest as restart trigger").
//!
//! MD5 is used only to detect operator-initiated edits, never for any security
//! property. The digest is stable under serialization because `serde_json`
//! preserves struct field declaration order rather than hashing a map.

use md5::{Digest, Md5};

use crate::model::BatchSequence;
use fleet_rollout_errors::{ReconcileError, ReconcileResult};

/// Compute the lowercase-hex MD5 digest of the canonical JSON serialization of
/// `sequence`.
///
/// # Errors
/// Returns [`ReconcileError::DataShape`] if the sequence cannot be serialized,
/// which should not happen for well-formed [`BatchSequence`] values.
pub fn batch_sequence_digest(sequence: &BatchSequence) -> ReconcileResult<String> {
    let canonical = serde_json::to_vec(sequence)
        .map_err(|e| ReconcileError::DataShape(format!("failed to serialize batch sequence: {e}")))?;
    let mut hasher = Md5::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Batch;

    #[test]
    fn digest_is_stable_for_equal_sequences() -> ReconcileResult<()> {
        let seq_a = BatchSequence {
            batches: vec![Batch::default()],
        };
        let seq_b = BatchSequence {
            batches: vec![Batch::default()],
        };
        assert_eq!(batch_sequence_digest(&seq_a)?, batch_sequence_digest(&seq_b)?);
        Ok(())
    }

    #[test]
    fn digest_changes_when_sequence_changes() -> ReconcileResult<()> {
        let empty = BatchSequence::default();
        let one = BatchSequence {
            batches: vec![Batch::default()],
        };
        assert_ne!(batch_sequence_digest(&empty)?, batch_sequence_digest(&one)?);
        Ok(())
    }
}
