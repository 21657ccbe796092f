//! Concurrent catalog of selectable presets.

use std::sync::Arc;

use dashmap::DashMap;

use super::{PresetInfo, SharedPreset};

/// Registry of presets currently offered for selection.
///
/// The catalog is shared between the service handle (reads), the discovery
/// reconciler (dynamic adds and removals) and whoever loads the static
/// configuration. Removing an active preset does not tear it down; the
/// reconciler notices the dangling reference and requests the switch.
#[derive(Debug, Default)]
pub struct PresetCatalog {
    presets: DashMap<String, SharedPreset>,
}

impl PresetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a preset under its ID, returning the entry it replaced.
    pub fn add(&self, preset: SharedPreset) -> Option<SharedPreset> {
        self.presets.insert(preset.id().to_string(), preset)
    }

    /// Removes a preset by ID.
    pub fn remove(&self, id: &str) -> Option<SharedPreset> {
        self.presets.remove(id).map(|(_, preset)| preset)
    }

    pub fn get(&self, id: &str) -> Option<SharedPreset> {
        self.presets.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.presets.contains_key(id)
    }

    /// All preset IDs, sorted for stable listings.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.presets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Descriptions for the requested IDs; unknown IDs are omitted.
    pub fn describe(&self, ids: &[&str]) -> Vec<PresetInfo> {
        ids.iter()
            .filter_map(|id| self.get(id))
            .map(|preset| preset.describe())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}
