//! Vector clock: per-origin count of applied writes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{InstanceId, Lsn};

/// Ordered mapping `origin -> highest applied lsn`.
///
/// An entry that is absent is "undefined": the owner has never heard of that
/// origin. An entry present at 0 means the origin is known but nothing from it
/// has been applied yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VClock(BTreeMap<InstanceId, Lsn>);

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: InstanceId) -> Option<Lsn> {
        self.0.get(&id).copied()
    }

    /// Lsn for `id`, treating an undefined entry as 0.
    pub fn lsn(&self, id: InstanceId) -> Lsn {
        self.get(id).unwrap_or(0)
    }

    /// Mark `id` as known without advancing it.
    pub fn define(&mut self, id: InstanceId) {
        self.0.entry(id).or_insert(0);
    }

    /// Raise the entry for `id` to `lsn`. Returns false (and leaves the
    /// clock untouched) if that would move the entry backwards.
    pub fn advance(&mut self, id: InstanceId, lsn: Lsn) -> bool {
        let entry = self.0.entry(id).or_insert(0);
        if lsn < *entry {
            return false;
        }
        *entry = lsn;
        true
    }

    /// Entry-wise maximum.
    pub fn merge(&mut self, other: &VClock) {
        for (&id, &lsn) in &other.0 {
            self.advance(id, lsn);
        }
    }

    /// True if every entry of `other` is reached by `self`.
    pub fn covers(&self, other: &VClock) -> bool {
        other.0.iter().all(|(&id, &lsn)| self.lsn(id) >= lsn)
    }

    /// Sum of all entries (total applied writes).
    pub fn signature(&self) -> Lsn {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, Lsn)> + '_ {
        self.0.iter().map(|(&id, &lsn)| (id, lsn))
    }
}

impl FromIterator<(InstanceId, Lsn)> for VClock {
    fn from_iter<T: IntoIterator<Item = (InstanceId, Lsn)>>(iter: T) -> Self {
        let mut clock = VClock::new();
        for (id, lsn) in iter {
            clock.advance(id, lsn);
        }
        clock
    }
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}: {lsn}")?;
        }
        write!(f, "}}")
    }
}
