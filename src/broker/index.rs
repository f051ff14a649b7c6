//! Range index of a durable queue.
//!
//! Live message indices are kept as sorted, non-overlapping `{start, count}`
//! ranges. Appends always go one past the end of the last range (or past the
//! persisted high-water mark, whichever is larger), so an index is never
//! handed out twice, even after the tail of the queue was erased.

use crate::persistence::records::{MessageRange, QueueIndex};
use crate::utils::{Error, Result};

/// Where an index sits relative to the ranges of a [`QueueIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// First element of the range at this position.
    FoundAtStart(usize),
    /// Strictly inside the range at this position.
    FoundInterior(usize),
    /// Last element (and not the first) of the range at this position.
    FoundAtEnd(usize),
    NotFound,
}

/// Next index an append would use.
pub fn next_index(qi: &QueueIndex) -> u64 {
    let tail = qi.ranges.last().map(MessageRange::end).unwrap_or(0);
    tail.max(qi.next.unwrap_or(0))
}

/// Reserve the next index in `qi` and return it.
pub fn append(qi: &mut QueueIndex) -> u64 {
    let index = next_index(qi);
    match qi.ranges.last_mut() {
        Some(last) if last.end() == index => last.count += 1,
        _ => qi.ranges.push(MessageRange::new(index, 1)),
    }
    qi.size += 1;
    qi.next = Some(index + 1);
    index
}

pub fn locate(qi: &QueueIndex, index: u64) -> Location {
    for (pos, range) in qi.ranges.iter().enumerate() {
        if index < range.start {
            // sorted: nothing further can contain it
            break;
        }
        if index >= range.end() {
            continue;
        }
        return if index == range.start {
            Location::FoundAtStart(pos)
        } else if index == range.end() - 1 {
            Location::FoundAtEnd(pos)
        } else {
            Location::FoundInterior(pos)
        };
    }
    Location::NotFound
}

/// Remove `index` from `qi`, shrinking, splitting or dropping its range.
pub fn erase(qi: &mut QueueIndex, index: u64) -> Result<()> {
    match locate(qi, index) {
        Location::FoundAtStart(pos) => {
            let range = &mut qi.ranges[pos];
            range.start += 1;
            range.count -= 1;
            if range.count == 0 {
                qi.ranges.remove(pos);
            }
        }
        Location::FoundAtEnd(pos) => {
            qi.ranges[pos].count -= 1;
        }
        Location::FoundInterior(pos) => {
            let range = qi.ranges[pos];
            let head = index - range.start;
            qi.ranges[pos].count = head;
            qi.ranges
                .insert(pos + 1, MessageRange::new(index + 1, range.count - head - 1));
        }
        Location::NotFound => {
            return Err(Error::Inconsistent(format!(
                "index {index} is not covered by any range"
            )));
        }
    }
    qi.size = qi.size.saturating_sub(1);
    Ok(())
}

/// Every live index, in ascending order.
pub fn indices(qi: &QueueIndex) -> impl Iterator<Item = u64> + '_ {
    qi.ranges.iter().flat_map(|r| r.start..r.end())
}

/// Check the index invariants: ranges non-empty, sorted, non-overlapping, and
/// `size` equal to the number of covered indices.
pub fn is_consistent(qi: &QueueIndex) -> bool {
    let mut prev_end: Option<u64> = None;
    let mut total = 0u64;
    for range in &qi.ranges {
        if range.count == 0 {
            return false;
        }
        if let Some(end) = prev_end {
            if range.start < end {
                return false;
            }
        }
        prev_end = Some(range.end());
        total += range.count;
    }
    if let (Some(end), Some(next)) = (prev_end, qi.next) {
        if end > next {
            return false;
        }
    }
    total == qi.size
}
