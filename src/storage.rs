//! Storage unit capacity snapshot.

use crate::client::{Resource, StorageUnitAttributes};
use std::collections::HashMap;

const UNKNOWN: &str = "unknown";
const TAPE: &str = "TAPE";

/// Label tuple for the storage family: (name, type, size).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    pub name: String,
    pub storage_type: String,
    /// `"free"` or `"used"`
    pub size: String,
}

impl StorageKey {
    pub fn new(name: &str, storage_type: &str, size: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_type: storage_type.to_string(),
            size: size.to_string(),
        }
    }

    pub fn labels(&self) -> [&str; 3] {
        [&self.name, &self.storage_type, &self.size]
    }
}

/// Bytes per (name, type, free/used).
pub type StorageSnapshot = HashMap<StorageKey, u64>;

/// Build a snapshot from storage units, skipping tape units.
pub fn build_snapshot(units: &[Resource<StorageUnitAttributes>]) -> StorageSnapshot {
    let mut snapshot = StorageSnapshot::new();

    for unit in units {
        let attrs = &unit.attributes;
        let is_tape = attrs
            .storage_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(TAPE));
        if is_tape {
            continue;
        }

        let name = if attrs.name.is_empty() {
            unit.id.as_str()
        } else {
            attrs.name.as_str()
        };
        let kind = attrs
            .storage_server_type
            .as_deref()
            .or(attrs.storage_type.as_deref())
            .unwrap_or(UNKNOWN);

        for (size, bytes) in [
            ("free", attrs.free_capacity_bytes),
            ("used", attrs.used_capacity_bytes),
        ] {
            let total = snapshot
                .entry(StorageKey::new(name, kind, size))
                .or_insert(0);
            *total = total.saturating_add(bytes.unwrap_or(0));
        }
    }

    snapshot
}
