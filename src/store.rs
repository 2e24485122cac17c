// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent JSON state store.
//!
//! One JSON document holds the device registry, the last published state
//! per device and the UI configuration. Reads recover from corruption by
//! quarantining the broken file and starting empty; writes are atomic
//! (temp file, fsync, rename).
//!
//! The store also owns the in-memory last-value cache that every publish
//! path consults to suppress unchanged MQTT and WebSocket traffic.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::registry::{CoverGroup, DeviceKind, DeviceRecord};
use crate::types::DeviceAddress;

/// UI configuration, persisted verbatim for the web surface.
///
/// The core never interprets these fields beyond cover groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub group_order: Vec<String>,
    pub cover_groups: Vec<CoverGroup>,
    pub hub_links: Vec<Value>,
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub devices: Vec<DeviceRecord>,
    pub states: BTreeMap<String, Value>,
    pub ui: UiConfig,
}

/// JSON-on-disk store with quarantine recovery and a last-value cache.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<PersistedState>,
    last_values: Mutex<HashMap<String, Value>>,
}

/// Builds the state key for one device: `light:1.100.2`.
#[must_use]
pub fn state_key(kind: DeviceKind, address: DeviceAddress) -> String {
    format!("{}:{}", kind.as_str(), address)
}

/// All state keys one device owns.
///
/// An air device publishes two values (AIR level and gas percentage)
/// and therefore owns two keys; everything else owns one.
#[must_use]
pub fn state_keys_for(kind: DeviceKind, address: DeviceAddress) -> Vec<String> {
    match kind {
        DeviceKind::Air => vec![
            format!("air_quality:{address}"),
            format!("gas_percent:{address}"),
        ],
        other => vec![state_key(other, address)],
    }
}

/// Builds the state key for a cover group.
#[must_use]
pub fn group_state_key(group_id: &str) -> String {
    format!("cover_group:{group_id}")
}

impl StateStore {
    /// Opens the store, quarantining a corrupt file.
    ///
    /// A missing file simply yields empty state. A file that exists but
    /// fails to decode is renamed to `<path>.corrupt.<unix-ts>` so it can
    /// be inspected, and the bridge starts empty instead of crashing.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "state read failed, starting empty");
                PersistedState::default()
            }
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    let quarantine =
                        path.with_extension(format!("json.corrupt.{}", chrono::Utc::now().timestamp()));
                    tracing::warn!(
                        path = %path.display(),
                        quarantine = %quarantine.display(),
                        error = %e,
                        "corrupt state file quarantined"
                    );
                    let _ = std::fs::rename(&path, &quarantine);
                    PersistedState::default()
                }
            },
        };

        // Prefill the last-value cache so a restart does not re-publish
        // unchanged retained values.
        let last_values = state
            .states
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            path,
            inner: Mutex::new(state),
            last_values: Mutex::new(last_values),
        }
    }

    /// Path of the persisted document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a deep copy of the current document.
    #[must_use]
    pub fn snapshot(&self) -> PersistedState {
        self.inner.lock().clone()
    }

    /// Mutates the document and flushes it to disk.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the flush fails; the in-memory
    /// mutation is kept so a transient disk error does not lose state.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut PersistedState) -> T) -> Result<T, StoreError> {
        let result = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            self.write_locked(&inner)?;
            result
        };
        Ok(result)
    }

    /// Stores the state value for `key` and flushes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the flush fails.
    pub fn set_state(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.states.insert(key.to_string(), value);
        })
    }

    /// Returns the persisted state value for `key`.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<Value> {
        self.inner.lock().states.get(key).cloned()
    }

    /// Returns all persisted state values.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, Value> {
        self.inner.lock().states.clone()
    }

    /// Change-suppression gate: records `value` as the last published
    /// payload for `key` and reports whether it differs from the previous
    /// one. Callers skip the publish when this returns `false`.
    pub fn update_if_changed(&self, key: &str, value: &Value) -> bool {
        let mut last = self.last_values.lock();
        if last.get(key) == Some(value) {
            return false;
        }
        last.insert(key.to_string(), value.clone());
        true
    }

    /// Drops the cached last value for `key` (device removed).
    pub fn forget_last_value(&self, key: &str) {
        self.last_values.lock().remove(key);
    }

    fn write_locked(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state)?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Light;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json"));
        (dir, store)
    }

    #[test]
    fn missing_file_starts_empty() {
        let (_dir, store) = temp_store();
        assert!(store.snapshot().devices.is_empty());
        assert!(store.states().is_empty());
    }

    #[test]
    fn mutate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::open(&path);
            store
                .mutate(|state| {
                    state.devices.push(DeviceRecord::Light(Light {
                        address: DeviceAddress::new(1, 100, 2),
                        name: "Desk".to_string(),
                        dimmable: true,
                        category: "Luci".to_string(),
                        icon: None,
                        group: None,
                    }));
                })
                .unwrap();
        }
        let store = StateStore::open(&path);
        assert_eq!(store.snapshot().devices.len(), 1);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = StateStore::open(&path);
        assert!(store.snapshot().devices.is_empty());
        assert!(!path.exists());

        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupt.")
            });
        assert!(quarantined, "expected a state.json.corrupt.* file");
    }

    #[test]
    fn update_if_changed_suppresses_duplicates() {
        let (_dir, store) = temp_store();
        let value = serde_json::json!({"state": "ON", "brightness": 128});
        assert!(store.update_if_changed("light:1.100.2", &value));
        assert!(!store.update_if_changed("light:1.100.2", &value));
        let other = serde_json::json!({"state": "OFF", "brightness": 0});
        assert!(store.update_if_changed("light:1.100.2", &other));
    }

    #[test]
    fn last_values_prefill_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::open(&path);
            store
                .set_state("temp:1.30.1", serde_json::json!({"value": 21.5}))
                .unwrap();
        }
        let store = StateStore::open(&path);
        // The reloaded value must count as already published.
        assert!(!store.update_if_changed("temp:1.30.1", &serde_json::json!({"value": 21.5})));
    }

    #[test]
    fn state_keys() {
        let addr = DeviceAddress::new(1, 100, 2);
        assert_eq!(state_key(DeviceKind::Light, addr), "light:1.100.2");
        assert_eq!(state_key(DeviceKind::DryContact, addr), "dry_contact:1.100.2");
        assert_eq!(group_state_key("abc"), "cover_group:abc");
    }

    #[test]
    fn air_owns_two_state_keys() {
        let addr = DeviceAddress::new(1, 60, 248);
        assert_eq!(
            state_keys_for(DeviceKind::Air, addr),
            vec!["air_quality:1.60.248", "gas_percent:1.60.248"]
        );
        assert_eq!(
            state_keys_for(DeviceKind::Pir, addr),
            vec!["pir:1.60.248"]
        );
    }
}
