//! Set difference between desired and observed membership
//!
//! Every member synchronization in the operator is driven by one
//! [`MemberDiff`]: what must be added and what must be removed. Inputs are
//! treated as sets, so duplicates collapse and ordering is irrelevant.

use std::collections::BTreeSet;

/// Members to add and remove to move observed membership to desired
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberDiff {
    /// Present in desired, absent from observed
    pub to_add: BTreeSet<String>,
    /// Present in observed, absent from desired
    pub to_remove: BTreeSet<String>,
}

impl MemberDiff {
    /// Compute `desired - observed` and `observed - desired`
    pub fn between<D, O, S, T>(desired: D, observed: O) -> Self
    where
        D: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(|m| m.as_ref().to_string()).collect();
        let observed: BTreeSet<String> =
            observed.into_iter().map(|m| m.as_ref().to_string()).collect();

        Self {
            to_add: desired.difference(&observed).cloned().collect(),
            to_remove: observed.difference(&desired).cloned().collect(),
        }
    }

    /// True when desired and observed already agree
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// True when both collections hold the same members, ignoring order and duplicates
pub fn same_members<S: AsRef<str>>(a: &[S], b: &[S]) -> bool {
    MemberDiff::between(a, b).is_empty()
}
