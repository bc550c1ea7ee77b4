use std::collections::HashSet;

use super::{StopSet, StopSetError, StopSetParams, StopSetSnapshot};

/// Hash-based stop set with exact membership
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExactSet {
    keys: HashSet<String>,
}

impl ExactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate members in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ExactSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl StopSet for ExactSet {
    const KIND: &'static str = "exact";

    fn with_params(_params: &StopSetParams) -> Self {
        Self::new()
    }

    fn empty_like(&self) -> Self {
        Self::new()
    }

    fn add(&mut self, key: &str) {
        if !self.keys.contains(key) {
            self.keys.insert(key.to_string());
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn union_with(&mut self, other: &Self) -> Result<(), StopSetError> {
        self.keys.extend(other.keys.iter().cloned());
        Ok(())
    }

    fn union_snapshot(&mut self, snapshot: &StopSetSnapshot) -> Result<(), StopSetError> {
        match snapshot {
            StopSetSnapshot::Exact { keys } => {
                self.keys.extend(keys.iter().cloned());
                Ok(())
            }
            // Bit positions cannot be turned back into keys
            other => Err(StopSetError::KindMismatch {
                expected: Self::KIND,
                found: other.kind(),
            }),
        }
    }

    fn wipe(&mut self) {
        self.keys.clear();
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn to_snapshot(&self) -> StopSetSnapshot {
        let mut keys: Vec<String> = self.keys.iter().cloned().collect();
        keys.sort();
        StopSetSnapshot::Exact { keys }
    }
}
