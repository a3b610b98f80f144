//! Contiguous acknowledgment ranges

use std::fmt;

use crate::quic::error::{PacketError, Result};

/// Inclusive range of acknowledged packet numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckRange {
    pub smallest: u64,
    pub largest: u64,
}

impl AckRange {
    pub fn new(smallest: u64, largest: u64) -> Result<Self> {
        if smallest > largest {
            return Err(PacketError::MalformedFrame(format!(
                "ack range [{}, {}] is inverted",
                smallest, largest
            ))
            .into());
        }
        Ok(Self { smallest, largest })
    }

    pub fn single(number: u64) -> Self {
        Self { smallest: number, largest: number }
    }

    pub fn contains(&self, number: u64) -> bool {
        self.smallest <= number && number <= self.largest
    }

    pub fn len(&self) -> u64 {
        self.largest - self.smallest + 1
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u64> {
        self.smallest..=self.largest
    }
}

impl fmt::Display for AckRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.largest, self.smallest)
    }
}

/// Coalesce packet numbers into ranges ordered by descending `largest`.
///
/// Input order and duplicates do not matter.
pub fn ranges_from_numbers<I>(numbers: I) -> Vec<AckRange>
where
    I: IntoIterator<Item = u64>,
{
    let mut sorted: Vec<u64> = numbers.into_iter().collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();

    let mut ranges: Vec<AckRange> = Vec::new();
    for number in sorted {
        match ranges.last_mut() {
            Some(range) if range.smallest == number + 1 => range.smallest = number,
            _ => ranges.push(AckRange::single(number)),
        }
    }
    ranges
}

/// Check that ranges are descending and separated by at least one gap
pub fn validate_ranges(ranges: &[AckRange]) -> Result<()> {
    for pair in ranges.windows(2) {
        if pair[1].largest + 1 >= pair[0].smallest {
            return Err(PacketError::MalformedFrame(format!(
                "ack ranges {} and {} overlap or are out of order",
                pair[0], pair[1]
            ))
            .into());
        }
    }
    Ok(())
}
