use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/*
    A grow-only counter: one non-negative contribution per node. Merging two
    vectors takes the pointwise maximum, which is commutative, associative and
    idempotent, so replicas converge whatever order or multiplicity the
    vectors arrive in. The total is the sum of all contributions.
*/

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GCounter {
    slots: BTreeMap<String, u64>,
}

/// The value a slot should move to after seeing `theirs`, or `None` when the
/// local value already dominates.
pub fn merge_slot(mine: u64, theirs: u64) -> Option<u64> {
    (theirs > mine).then_some(theirs)
}

impl GCounter {
    pub fn new() -> Self {
        GCounter::default()
    }

    pub fn get(&self, node: &str) -> u64 {
        self.slots.get(node).copied().unwrap_or(0)
    }

    /// Raises every slot to at least the value in `other`. Returns how many
    /// slots moved.
    pub fn merge(&mut self, other: &GCounter) -> usize {
        let mut raised = 0;
        for (node, theirs) in &other.slots {
            let mine = self.slots.entry(node.clone()).or_insert(0);
            if let Some(next) = merge_slot(*mine, *theirs) {
                *mine = next;
                raised += 1;
            }
        }
        raised
    }

    /// Sum of all slots. Fails rather than reporting a wrapped or clamped
    /// total.
    pub fn value(&self) -> Result<u64> {
        self.slots.values().try_fold(0u64, |total, slot| {
            total
                .checked_add(*slot)
                .ok_or_else(|| Error::Overflow("total".to_owned()))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.slots.iter().map(|(node, slot)| (node.as_str(), *slot))
    }
}

impl FromIterator<(String, u64)> for GCounter {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut counter = GCounter::new();
        for (node, slot) in iter {
            let entry = counter.slots.entry(node).or_insert(0);
            *entry = (*entry).max(slot);
        }
        counter
    }
}
