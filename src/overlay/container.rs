//! Per-key value containers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Values associated with one key, grouped by the input (file) that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueContainer<V> {
    values: BTreeMap<u32, Vec<V>>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

impl<V: PartialEq> ValueContainer<V> {
    pub fn add_value(&mut self, input_id: u32, value: V) {
        let slot = self.values.entry(input_id).or_default();
        if !slot.contains(&value) {
            slot.push(value);
        }
    }
}

impl<V> ValueContainer<V> {
    /// Drops everything `input_id` contributed; reports whether it had anything.
    pub fn remove_associated_value(&mut self, input_id: u32) -> bool {
        self.values.remove(&input_id).is_some()
    }

    #[must_use]
    pub fn values_for(&self, input_id: u32) -> &[V] {
        self.values.get(&input_id).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.values
            .iter()
            .flat_map(|(input_id, values)| values.iter().map(move |value| (*input_id, value)))
    }

    pub fn input_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.keys().copied()
    }

    /// Number of (input, value) associations.
    #[must_use]
    pub fn size(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// In-memory changes layered over a lazily loaded backend container.
#[derive(Debug, Clone)]
pub struct ChangeTrackingContainer<V> {
    added: ValueContainer<V>,
    invalidated: BTreeSet<u32>,
    merged: Option<ValueContainer<V>>,
}

impl<V> Default for ChangeTrackingContainer<V> {
    fn default() -> Self {
        Self {
            added: ValueContainer::default(),
            invalidated: BTreeSet::new(),
            merged: None,
        }
    }
}

impl<V: Clone + PartialEq> ChangeTrackingContainer<V> {
    pub fn add_value(&mut self, input_id: u32, value: V) {
        if let Some(merged) = &mut self.merged {
            merged.add_value(input_id, value.clone());
        }
        self.added.add_value(input_id, value);
    }

    pub fn remove_associated_value(&mut self, input_id: u32) {
        if let Some(merged) = &mut self.merged {
            merged.remove_associated_value(input_id);
        }
        self.added.remove_associated_value(input_id);
        self.invalidated.insert(input_id);
    }

    /// Returns the backend view with local changes applied, loading it on first use.
    pub fn merged(
        &mut self,
        load: impl FnOnce() -> Result<ValueContainer<V>>,
    ) -> Result<&ValueContainer<V>> {
        if self.merged.is_none() {
            let mut base = load()?;
            for input_id in &self.invalidated {
                base.remove_associated_value(*input_id);
            }
            for (input_id, value) in self.added.iter() {
                base.add_value(input_id, value.clone());
            }
            self.merged = Some(base);
        }
        Ok(self.merged.get_or_insert_with(ValueContainer::default))
    }
}

impl<V> ChangeTrackingContainer<V> {
    /// Forgets the merged view so the next read reloads the backend.
    pub fn drop_merged_data(&mut self) {
        self.merged = None;
    }

    /// Discards every local change made for `input_id`.
    pub fn drop_associated_value(&mut self, input_id: u32) {
        self.added.remove_associated_value(input_id);
        self.invalidated.remove(&input_id);
        self.merged = None;
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.invalidated.is_empty()
    }

    #[must_use]
    pub fn added(&self) -> &ValueContainer<V> {
        &self.added
    }

    pub fn invalidated(&self) -> impl Iterator<Item = u32> + '_ {
        self.invalidated.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ValueContainer<&'static str> {
        let mut base = ValueContainer::default();
        base.add_value(1, "one");
        base.add_value(2, "two");
        base
    }

    #[test]
    fn merged_view_applies_local_changes() {
        let mut container = ChangeTrackingContainer::default();
        container.remove_associated_value(1);
        container.add_value(3, "three");
        let merged = container.merged(|| Ok(backend())).expect("merge");
        assert_eq!(merged.input_ids().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(merged.size(), 2);
    }

    #[test]
    fn dropping_an_input_restores_backend_state() {
        let mut container = ChangeTrackingContainer::default();
        container.remove_associated_value(1);
        container.merged(|| Ok(backend())).expect("merge");
        container.drop_associated_value(1);
        assert!(!container.has_changes());
        let merged = container.merged(|| Ok(backend())).expect("reload");
        assert_eq!(merged.values_for(1), &["one"]);
    }

    #[test]
    fn duplicate_values_are_stored_once() {
        let mut container = ValueContainer::default();
        container.add_value(5, 'x');
        container.add_value(5, 'x');
        container.add_value(5, 'y');
        assert_eq!(container.size(), 2);
        assert!(container.remove_associated_value(5));
        assert!(!container.remove_associated_value(5));
    }
}
