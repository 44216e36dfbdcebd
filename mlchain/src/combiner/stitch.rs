//! Concatenation of per-partition predictions.

use super::{CombineError, RowPrediction};
use crate::errors::PartitionMismatchError;

/// Lays partition outputs out in row order.
///
/// `ranges[i]` is the half-open row range partition `i` was asked to
/// predict; its output must hold exactly that many rows. Row `r` of the
/// result comes from the partition whose range contains `r`, whatever order
/// the partitions arrive in. The ranges must tile `0..total` with no gap or
/// overlap.
pub fn stitch(
    parts: Vec<Vec<RowPrediction>>,
    ranges: &[(usize, usize)],
) -> Result<Vec<RowPrediction>, CombineError> {
    if parts.len() != ranges.len() {
        return Err(CombineError::InputCount {
            expected: ranges.len(),
            actual: parts.len(),
        });
    }

    let mut placed: Vec<_> = parts.into_iter().zip(ranges.iter().copied()).enumerate().collect();
    placed.sort_by_key(|(_, (_, (start, _)))| *start);

    let total = ranges.iter().map(|&(_, end)| end).max().unwrap_or(0);
    let mut rows = Vec::with_capacity(total);
    for (partition, (part, (start, end))) in placed {
        if start != rows.len() {
            return Err(PartitionMismatchError::misplaced(partition, rows.len(), start).into());
        }
        let expected = end.saturating_sub(start);
        if part.len() != expected {
            return Err(PartitionMismatchError::new(partition, expected, part.len()).into());
        }
        rows.extend(part);
    }
    Ok(rows)
}
