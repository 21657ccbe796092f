//! Registry of currently open connections.
//!
//! Every connection started by the supervision tree is registered here with
//! a purpose label so that operators can see what the service is holding
//! open. Entries are scoped: dropping the [`RegistrationHandle`] removes the
//! entry, which ties registry lifetime to preset lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Public view of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredConnection {
    /// Registry name, derived from the preset ID.
    pub name: String,
    /// What the connection is used for.
    pub purpose: String,
    /// Source descriptor, e.g. `serial:/dev/ttyUSB0?baud=115200`.
    pub target: String,
}

/// Concurrent name-to-connection map shared across the service.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<DashMap<String, RegisteredConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the handle keeping it listed.
    ///
    /// A preset with several sources registers the same base name more than
    /// once; later registrations get a `#n` suffix so every entry stays
    /// addressable.
    pub fn register(&self, name: &str, purpose: &str, target: &str) -> RegistrationHandle {
        let mut candidate = name.to_string();
        let mut suffix = 2;
        while self.entries.contains_key(&candidate) {
            candidate = format!("{}#{}", name, suffix);
            suffix += 1;
        }
        self.entries.insert(
            candidate.clone(),
            RegisteredConnection {
                name: candidate.clone(),
                purpose: purpose.to_string(),
                target: target.to_string(),
            },
        );
        RegistrationHandle {
            entries: Arc::clone(&self.entries),
            name: candidate,
        }
    }

    /// Snapshot of all registered connections, sorted by name.
    pub fn list(&self) -> Vec<RegisteredConnection> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps a registry entry alive; dropping it deregisters the connection.
#[derive(Debug)]
pub struct RegistrationHandle {
    entries: Arc<DashMap<String, RegisteredConnection>>,
    name: String,
}

impl RegistrationHandle {
    /// The (possibly suffixed) name under which the entry was registered.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.entries.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list() {
        let registry = ConnectionRegistry::new();
        let _handle = registry.register("rtk:base", "RTK corrections (Base)", "serial:/dev/tty0");
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "rtk:base");
        assert_eq!(listed[0].purpose, "RTK corrections (Base)");
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = ConnectionRegistry::new();
        {
            let _handle = registry.register("rtk:base", "RTK", "tcp:host:2101");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_names_get_suffixes() {
        let registry = ConnectionRegistry::new();
        let first = registry.register("rtk:base", "RTK", "serial:/dev/tty0");
        let second = registry.register("rtk:base", "RTK", "serial:/dev/tty1");
        assert_eq!(first.name(), "rtk:base");
        assert_eq!(second.name(), "rtk:base#2");
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].name, "rtk:base#2");
    }
}
