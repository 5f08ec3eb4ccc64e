use std::fmt;

use strata_common::error::validate_range;
use strata_common::StrataError;

/// Inclusive block range processed as one unit of extraction work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: u64,
    pub end: u64,
}

impl Partition {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn blocks(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}-{:08}", self.start, self.end)
    }
}

/// Split `[start, end]` into contiguous partitions of at most `size` blocks.
pub fn partition_range(start: u64, end: u64, size: u64) -> Result<Vec<Partition>, StrataError> {
    validate_range(start, end)?;
    if size == 0 {
        return Err(StrataError::InvalidInput(
            "partition size must be greater than 0".to_string(),
        ));
    }

    let mut partitions = Vec::with_capacity(((end - start) / size + 1) as usize);
    let mut batch_start = start;
    loop {
        let batch_end = batch_start.saturating_add(size - 1).min(end);
        partitions.push(Partition {
            start: batch_start,
            end: batch_end,
        });
        if batch_end == end {
            break;
        }
        batch_start = batch_end + 1;
    }
    Ok(partitions)
}
