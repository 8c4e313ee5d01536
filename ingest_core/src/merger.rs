//! Per-cell conflict resolution between overlapping source resolutions.

use crate::feed_config::MergeRule;

/// Resolved state of one `(row key, column)` slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    resolution_minutes: u32,
    priority: u8,
    /// Contributions by field code; more than one only under `MergeRule::Accumulate`.
    parts: Vec<(String, f64)>,
}

impl Cell {
    fn single(contribution: Contribution) -> Self {
        Self {
            resolution_minutes: contribution.resolution_minutes,
            priority: contribution.priority,
            parts: vec![(contribution.field_code, contribution.value)],
        }
    }

    fn holds_zero(&self) -> bool {
        self.value().map_or(true, |v| v == 0.0)
    }

    pub fn value(&self) -> Option<f64> {
        if self.parts.is_empty() {
            None
        } else {
            Some(self.parts.iter().map(|(_, v)| v).sum())
        }
    }

    pub fn resolution_minutes(&self) -> u32 {
        self.resolution_minutes
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub field_code: String,
    pub value: f64,
    pub resolution_minutes: u32,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Accumulated,
    /// Incoming data was coarser than what the cell already holds.
    Ignored,
    /// A preferred code already holds a usable value.
    Outranked,
}

impl MergeOutcome {
    /// The incoming value was dropped in favour of what the cell holds.
    pub fn is_superseded(self) -> bool {
        matches!(self, MergeOutcome::Ignored | MergeOutcome::Outranked)
    }
}

/// Finer resolution always wins; equal resolutions follow the column's rule.
///
/// Under `Override` a higher-priority code displaces a lower one, and a
/// lower-priority value only lands while the cell holds nothing but zero.
/// A zero from the preferred code does not displace a non-zero fallback.
pub fn merge(slot: &mut Option<Cell>, incoming: Contribution, rule: MergeRule) -> MergeOutcome {
    let cell = match slot {
        None => {
            *slot = Some(Cell::single(incoming));
            return MergeOutcome::Inserted;
        }
        Some(cell) => cell,
    };

    if incoming.resolution_minutes > cell.resolution_minutes {
        return MergeOutcome::Ignored;
    }
    if incoming.resolution_minutes < cell.resolution_minutes {
        *cell = Cell::single(incoming);
        return MergeOutcome::Replaced;
    }

    match rule {
        MergeRule::Override => {
            let outranked = match incoming.priority.cmp(&cell.priority) {
                std::cmp::Ordering::Less => !cell.holds_zero(),
                std::cmp::Ordering::Greater => incoming.value == 0.0 && !cell.holds_zero(),
                std::cmp::Ordering::Equal => false,
            };
            if outranked {
                return MergeOutcome::Outranked;
            }
            *cell = Cell::single(incoming);
            MergeOutcome::Replaced
        }
        MergeRule::Accumulate => {
            match cell
                .parts
                .iter_mut()
                .find(|(code, _)| *code == incoming.field_code)
            {
                // A refetched or repeated point replaces its own earlier value
                Some(part) => {
                    part.1 = incoming.value;
                    MergeOutcome::Replaced
                }
                None => {
                    cell.parts.push((incoming.field_code, incoming.value));
                    MergeOutcome::Accumulated
                }
            }
        }
    }
}
