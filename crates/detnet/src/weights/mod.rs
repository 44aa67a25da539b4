//! # Named Weight Maps
//!
//! A [`WeightMap`] is a flat, ordered ``name -> tensor`` mapping, keyed by the
//! dotted state-dict names the reference checkpoints use
//! (``layer1.0.bn1.running_var``, ``layer2.0.downsample.0.weight``, ...).
//!
//! * [`import`] - copying a [`WeightMap`] into modules, and exporting modules into one.

pub mod import;

use burn::prelude::TensorData;
use std::collections::BTreeMap;

/// Ordered mapping from parameter name to tensor data.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    items: BTreeMap<String, TensorData>,
}

impl WeightMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a named tensor.
    pub fn insert<S: Into<String>>(
        &mut self,
        name: S,
        data: TensorData,
    ) -> Option<TensorData> {
        self.items.insert(name.into(), data)
    }

    /// Builder-style [`WeightMap::insert`].
    pub fn with<S: Into<String>>(
        mut self,
        name: S,
        data: TensorData,
    ) -> Self {
        self.insert(name, data);
        self
    }

    /// Lookup a named tensor.
    pub fn get(
        &self,
        name: &str,
    ) -> Option<&TensorData> {
        self.items.get(name)
    }

    /// Check for a name.
    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.items.contains_key(name)
    }

    /// Remove a named tensor.
    pub fn remove(
        &mut self,
        name: &str,
    ) -> Option<TensorData> {
        self.items.remove(name)
    }

    /// Keep only the entries whose name satisfies `keep`.
    pub fn retain<F>(
        &mut self,
        mut keep: F,
    ) where
        F: FnMut(&str) -> bool,
    {
        self.items.retain(|name, _| keep(name));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Iterate over ``(name, data)`` pairs, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, TensorData)> for WeightMap {
    fn from_iter<T: IntoIterator<Item = (String, TensorData)>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WeightMap {
    type Item = (String, TensorData);
    type IntoIter = std::collections::btree_map::IntoIter<String, TensorData>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
