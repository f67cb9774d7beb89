//! Text splice application for `strategy:"delta"` field updates.

use prism_proto::DeltaOp;

/// Apply edit ops left-to-right as a pure string operation. Each op's
/// `position` refers to the string as it stands before that op; out-of-range
/// positions and delete counts clamp to the current length. Positions count
/// characters, not bytes.
pub fn apply_delta(current: &str, ops: &[DeltaOp]) -> String {
    let mut chars: Vec<char> = current.chars().collect();

    for op in ops {
        let position = op.position.min(chars.len());
        let delete_end = position.saturating_add(op.delete).min(chars.len());
        chars.drain(position..delete_end);
        if let Some(insert) = &op.insert {
            chars.splice(position..position, insert.chars());
        }
    }

    chars.into_iter().collect()
}
