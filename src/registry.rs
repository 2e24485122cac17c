// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed device registry.
//!
//! The registry is the single source of truth for configured devices:
//! lights, covers, environmental sensors and dry contacts, plus cover
//! groups. It enforces address uniqueness per kind, supports address
//! edits with state migration, and keeps the persisted document in sync
//! through the [`StateStore`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result, ValueError};
use crate::store::{state_keys_for, StateStore};
use crate::types::DeviceAddress;

/// Device classes known to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Light,
    Cover,
    Temp,
    Humidity,
    Illuminance,
    DryContact,
    /// Combined air-quality slot: AIR level plus gas percentage.
    Air,
    Pir,
    Ultrasonic,
}

impl DeviceKind {
    /// Stable string used in state keys and MQTT topics.
    ///
    /// An air device publishes under two topic roots (`air_quality` and
    /// `gas_percent`), so its state keys come from
    /// [`crate::store::state_keys_for`] instead of this string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Cover => "cover",
            Self::Temp => "temp",
            Self::Humidity => "humidity",
            Self::Illuminance => "illuminance",
            Self::DryContact => "dry_contact",
            Self::Air => "air",
            Self::Pir => "pir",
            Self::Ultrasonic => "ultrasonic",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_light_category() -> String {
    "Luci".to_string()
}

fn default_cover_category() -> String {
    "Cover".to_string()
}

fn default_opening_time() -> f64 {
    20.0
}

/// A dimmable or switched light channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub dimmable: bool,
    #[serde(default = "default_light_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// A motorized cover channel with per-direction travel calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cover {
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    /// Seconds for a full 0 -> 100 travel.
    #[serde(default = "default_opening_time")]
    pub opening_time_up_s: f64,
    /// Seconds for a full 100 -> 0 travel.
    #[serde(default = "default_opening_time")]
    pub opening_time_down_s: f64,
    /// Motor spin-up delay before the interpolation starts.
    #[serde(default)]
    pub start_delay_s: f64,
    #[serde(default)]
    pub reverse_icon: bool,
    #[serde(default = "default_cover_category")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Payload encodings observed for sensor telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFormat {
    /// Accept both the float32 and the short form (default).
    #[default]
    Auto,
    /// IEEE 754 float, little endian, at payload\[2..6\].
    Float32Le,
    /// Single raw byte with scale/offset.
    Uint8,
    /// 16-bit little endian with scale/offset.
    Uint16Le,
}

/// An environmental sensor slot (temperature, humidity or illuminance;
/// the kind lives on the wrapping [`DeviceRecord`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Channel doubles as the sensor id within the module.
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    /// Decimal places for published values (0..=3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    /// Readings below this are discarded as implausible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Readings above this are discarded as implausible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Multiplier for raw short-form values (default 0.5 for temperature).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default)]
    pub format: SensorFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Sensor {
    /// Applies min/max plausibility bounds.
    #[must_use]
    pub fn accepts(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }

    /// Decimal places for publishing, clamped to 0..=3.
    #[must_use]
    pub fn decimals_or(&self, default: u8) -> u8 {
        self.decimals.unwrap_or(default).min(3)
    }
}

/// A 12-in-1 air-quality slot reporting an AIR level and a gas
/// percentage. The channel is the raw header byte the module stamps on
/// its combined status payloads (248 or 245 on observed firmwares).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirSensor {
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Separate icon for the gas entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_icon: Option<String>,
}

/// A presence slot (PIR motion or ultrasonic occupancy; the kind lives
/// on the wrapping [`DeviceRecord`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSensor {
    /// Channel doubles as the sensor slot within the module.
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A dry-contact input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryContact {
    /// Channel doubles as the input index.
    #[serde(flatten)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub invert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceRecord {
    Light(Light),
    Cover(Cover),
    Temp(Sensor),
    Humidity(Sensor),
    Illuminance(Sensor),
    DryContact(DryContact),
    Air(AirSensor),
    Pir(PresenceSensor),
    Ultrasonic(PresenceSensor),
}

impl DeviceRecord {
    /// The device class of this record.
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        match self {
            Self::Light(_) => DeviceKind::Light,
            Self::Cover(_) => DeviceKind::Cover,
            Self::Temp(_) => DeviceKind::Temp,
            Self::Humidity(_) => DeviceKind::Humidity,
            Self::Illuminance(_) => DeviceKind::Illuminance,
            Self::DryContact(_) => DeviceKind::DryContact,
            Self::Air(_) => DeviceKind::Air,
            Self::Pir(_) => DeviceKind::Pir,
            Self::Ultrasonic(_) => DeviceKind::Ultrasonic,
        }
    }

    /// The record's address.
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        match self {
            Self::Light(d) => d.address,
            Self::Cover(d) => d.address,
            Self::Temp(d) | Self::Humidity(d) | Self::Illuminance(d) => d.address,
            Self::DryContact(d) => d.address,
            Self::Air(d) => d.address,
            Self::Pir(d) | Self::Ultrasonic(d) => d.address,
        }
    }

    fn set_address(&mut self, address: DeviceAddress) {
        match self {
            Self::Light(d) => d.address = address,
            Self::Cover(d) => d.address = address,
            Self::Temp(d) | Self::Humidity(d) | Self::Illuminance(d) => d.address = address,
            Self::DryContact(d) => d.address = address,
            Self::Air(d) => d.address = address,
            Self::Pir(d) | Self::Ultrasonic(d) => d.address = address,
        }
    }
}

/// A logical aggregate of covers, commanded together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverGroup {
    /// Stable id; never changes on rename so MQTT entities survive.
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub members: Vec<DeviceAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Outcome of a dedupe pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub removed: usize,
    pub kept: usize,
}

/// CRUD facade over the persisted device list.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    store: Arc<StateStore>,
}

impl DeviceRegistry {
    /// Creates a registry backed by `store`.
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// All configured devices, in insertion order.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.store.snapshot().devices
    }

    /// Finds one device by kind and address.
    #[must_use]
    pub fn find(&self, kind: DeviceKind, address: DeviceAddress) -> Option<DeviceRecord> {
        self.devices()
            .into_iter()
            .find(|d| d.kind() == kind && d.address() == address)
    }

    /// Adds a device.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] when a device of the same kind already uses the
    /// address; [`Error::Store`] when persisting fails.
    pub fn add(&self, record: DeviceRecord) -> Result<DeviceRecord> {
        if self.find(record.kind(), record.address()).is_some() {
            return Err(Error::Conflict);
        }
        self.store.mutate(|state| {
            state.devices.push(record.clone());
        })?;
        Ok(record)
    }

    /// Applies a JSON merge patch to a device.
    ///
    /// Keys with `null` values are removed (falling back to defaults on
    /// re-decode), everything else is replaced. The address and type
    /// cannot be patched; use [`DeviceRegistry::move_to`] for addresses.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown devices, [`Error::Value`] when the
    /// patched document no longer decodes as a valid record.
    pub fn patch(
        &self,
        kind: DeviceKind,
        address: DeviceAddress,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<DeviceRecord> {
        let current = self.find(kind, address).ok_or(Error::NotFound)?;
        let mut doc = serde_json::to_value(&current).map_err(|e| {
            Error::Value(ValueError::InvalidField {
                field: "record",
                message: e.to_string(),
            })
        })?;
        {
            let obj = doc.as_object_mut().ok_or(Error::NotFound)?;
            for (key, value) in updates {
                if matches!(
                    key.as_str(),
                    "type" | "subnet_id" | "device_id" | "channel"
                ) {
                    continue;
                }
                if value.is_null() {
                    obj.remove(key);
                } else {
                    obj.insert(key.clone(), value.clone());
                }
            }
        }
        let updated: DeviceRecord = serde_json::from_value(doc).map_err(|e| {
            Error::Value(ValueError::InvalidField {
                field: "patch",
                message: e.to_string(),
            })
        })?;

        self.store.mutate(|state| {
            if let Some(slot) = state
                .devices
                .iter_mut()
                .find(|d| d.kind() == kind && d.address() == address)
            {
                *slot = updated.clone();
            }
        })?;
        Ok(updated)
    }

    /// Moves a device to a new address, migrating its persisted state key.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the source does not exist and
    /// [`Error::Conflict`] when the target address is taken.
    pub fn move_to(
        &self,
        kind: DeviceKind,
        from: DeviceAddress,
        to: DeviceAddress,
    ) -> Result<DeviceRecord> {
        if from == to {
            return self.find(kind, from).ok_or(Error::NotFound);
        }
        if self.find(kind, to).is_some() {
            return Err(Error::Conflict);
        }
        let mut record = self.find(kind, from).ok_or(Error::NotFound)?;
        record.set_address(to);

        let old_keys = state_keys_for(kind, from);
        let new_keys = state_keys_for(kind, to);
        self.store.mutate(|state| {
            if let Some(slot) = state
                .devices
                .iter_mut()
                .find(|d| d.kind() == kind && d.address() == from)
            {
                *slot = record.clone();
            }
            for (old_key, new_key) in old_keys.iter().zip(&new_keys) {
                if let Some(value) = state.states.remove(old_key) {
                    state.states.entry(new_key.clone()).or_insert(value);
                }
            }
        })?;
        for old_key in &old_keys {
            self.store.forget_last_value(old_key);
        }
        Ok(record)
    }

    /// Removes a device along with its persisted state.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no such device exists.
    pub fn remove(&self, kind: DeviceKind, address: DeviceAddress) -> Result<()> {
        let keys = state_keys_for(kind, address);
        let removed = self.store.mutate(|state| {
            let before = state.devices.len();
            state
                .devices
                .retain(|d| !(d.kind() == kind && d.address() == address));
            for key in &keys {
                state.states.remove(key);
            }
            state.devices.len() != before
        })?;
        for key in &keys {
            self.store.forget_last_value(key);
        }
        if removed { Ok(()) } else { Err(Error::NotFound) }
    }

    /// Removes every device and all per-device state.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] when persisting fails.
    pub fn clear(&self) -> Result<()> {
        self.store.mutate(|state| {
            state.devices.clear();
            state.states.clear();
        })?;
        Ok(())
    }

    /// Removes duplicate definitions, keeping the most recent per
    /// `(kind, address)`.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] when persisting fails.
    pub fn dedupe(&self) -> Result<DedupeReport> {
        let report = self.store.mutate(|state| {
            let before = state.devices.len();
            let mut kept: Vec<DeviceRecord> = Vec::with_capacity(before);
            for record in state.devices.drain(..) {
                kept.retain(|d| !(d.kind() == record.kind() && d.address() == record.address()));
                kept.push(record);
            }
            state.devices = kept;
            DedupeReport {
                removed: before - state.devices.len(),
                kept: state.devices.len(),
            }
        })?;
        Ok(report)
    }

    // =====================================================================
    // Cover groups
    // =====================================================================

    /// All cover groups.
    #[must_use]
    pub fn cover_groups(&self) -> Vec<CoverGroup> {
        self.store.snapshot().ui.cover_groups
    }

    /// Finds a group by its stable id.
    #[must_use]
    pub fn cover_group(&self, id: Uuid) -> Option<CoverGroup> {
        self.cover_groups().into_iter().find(|g| g.id == id)
    }

    /// Creates or updates a cover group. A `None` id creates a group with
    /// a fresh stable id; renames keep the id (and thus MQTT entities).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when updating an id that does not exist.
    pub fn upsert_cover_group(
        &self,
        id: Option<Uuid>,
        name: String,
        members: Vec<DeviceAddress>,
        icon: Option<String>,
        category: Option<String>,
    ) -> Result<CoverGroup> {
        let group = CoverGroup {
            id: id.unwrap_or_else(Uuid::new_v4),
            name,
            members,
            icon,
            category,
        };
        let is_update = id.is_some();
        let stored = self.store.mutate(|state| {
            if let Some(slot) = state
                .ui
                .cover_groups
                .iter_mut()
                .find(|g| g.id == group.id)
            {
                *slot = group.clone();
                Some(group.clone())
            } else if is_update {
                None
            } else {
                state.ui.cover_groups.push(group.clone());
                Some(group.clone())
            }
        })?;
        stored.ok_or(Error::NotFound)
    }

    /// Deletes a cover group and its persisted state.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the id does not exist.
    pub fn delete_cover_group(&self, id: Uuid) -> Result<()> {
        let key = crate::store::group_state_key(&id.to_string());
        let removed = self.store.mutate(|state| {
            let before = state.ui.cover_groups.len();
            state.ui.cover_groups.retain(|g| g.id != id);
            state.states.remove(&key);
            state.ui.cover_groups.len() != before
        })?;
        self.store.forget_last_value(&key);
        if removed { Ok(()) } else { Err(Error::NotFound) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        (dir, DeviceRegistry::new(store))
    }

    fn light(subnet: u8, device: u8, channel: u8) -> DeviceRecord {
        DeviceRecord::Light(Light {
            address: DeviceAddress::new(subnet, device, channel),
            name: format!("Light {subnet}.{device}.{channel}"),
            dimmable: true,
            category: "Luci".to_string(),
            icon: None,
            group: None,
        })
    }

    fn cover(subnet: u8, device: u8, channel: u8) -> DeviceRecord {
        DeviceRecord::Cover(Cover {
            address: DeviceAddress::new(subnet, device, channel),
            name: String::new(),
            opening_time_up_s: 20.0,
            opening_time_down_s: 22.0,
            start_delay_s: 0.0,
            reverse_icon: false,
            category: "Cover".to_string(),
            icon: None,
            group: None,
        })
    }

    #[test]
    fn add_and_find() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        assert!(reg
            .find(DeviceKind::Light, DeviceAddress::new(1, 100, 2))
            .is_some());
        assert!(reg
            .find(DeviceKind::Cover, DeviceAddress::new(1, 100, 2))
            .is_none());
    }

    #[test]
    fn duplicate_address_conflicts() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        assert!(matches!(reg.add(light(1, 100, 2)), Err(Error::Conflict)));
        // Same address, different kind is fine.
        reg.add(cover(1, 100, 2)).unwrap();
    }

    #[test]
    fn patch_merges_and_null_removes() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();

        let mut updates = serde_json::Map::new();
        updates.insert("name".to_string(), serde_json::json!("Kitchen"));
        updates.insert("icon".to_string(), serde_json::json!("mdi:bulb"));
        let patched = reg
            .patch(DeviceKind::Light, DeviceAddress::new(1, 100, 2), &updates)
            .unwrap();
        let DeviceRecord::Light(l) = &patched else {
            panic!("kind changed")
        };
        assert_eq!(l.name, "Kitchen");
        assert_eq!(l.icon.as_deref(), Some("mdi:bulb"));

        let mut updates = serde_json::Map::new();
        updates.insert("icon".to_string(), Value::Null);
        let patched = reg
            .patch(DeviceKind::Light, DeviceAddress::new(1, 100, 2), &updates)
            .unwrap();
        let DeviceRecord::Light(l) = &patched else {
            panic!("kind changed")
        };
        assert!(l.icon.is_none());
    }

    #[test]
    fn patch_cannot_change_address() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        let mut updates = serde_json::Map::new();
        updates.insert("channel".to_string(), serde_json::json!(9));
        reg.patch(DeviceKind::Light, DeviceAddress::new(1, 100, 2), &updates)
            .unwrap();
        assert!(reg
            .find(DeviceKind::Light, DeviceAddress::new(1, 100, 2))
            .is_some());
    }

    #[test]
    fn move_migrates_state_and_detects_collisions() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        reg.add(light(1, 100, 3)).unwrap();
        reg.store
            .set_state("light:1.100.2", serde_json::json!({"state": "ON"}))
            .unwrap();

        assert!(matches!(
            reg.move_to(
                DeviceKind::Light,
                DeviceAddress::new(1, 100, 2),
                DeviceAddress::new(1, 100, 3)
            ),
            Err(Error::Conflict)
        ));

        let moved = reg
            .move_to(
                DeviceKind::Light,
                DeviceAddress::new(1, 100, 2),
                DeviceAddress::new(1, 101, 2),
            )
            .unwrap();
        assert_eq!(moved.address(), DeviceAddress::new(1, 101, 2));
        assert!(reg.store.state("light:1.100.2").is_none());
        assert_eq!(
            reg.store.state("light:1.101.2"),
            Some(serde_json::json!({"state": "ON"}))
        );
    }

    #[test]
    fn remove_drops_state() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        reg.store
            .set_state("light:1.100.2", serde_json::json!({"state": "ON"}))
            .unwrap();
        reg.remove(DeviceKind::Light, DeviceAddress::new(1, 100, 2))
            .unwrap();
        assert!(reg.store.state("light:1.100.2").is_none());
        assert!(matches!(
            reg.remove(DeviceKind::Light, DeviceAddress::new(1, 100, 2)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn air_removal_drops_both_state_keys() {
        let (_dir, reg) = registry();
        reg.add(DeviceRecord::Air(AirSensor {
            address: DeviceAddress::new(1, 60, 248),
            name: "Soggiorno".to_string(),
            category: None,
            icon: None,
            gas_icon: None,
        }))
        .unwrap();
        reg.store
            .set_state("air_quality:1.60.248", serde_json::json!({"state": "clean"}))
            .unwrap();
        reg.store
            .set_state("gas_percent:1.60.248", serde_json::json!({"value": 12.0}))
            .unwrap();

        reg.remove(DeviceKind::Air, DeviceAddress::new(1, 60, 248))
            .unwrap();
        assert!(reg.store.state("air_quality:1.60.248").is_none());
        assert!(reg.store.state("gas_percent:1.60.248").is_none());
    }

    #[test]
    fn dedupe_keeps_latest() {
        let (_dir, reg) = registry();
        // Go behind the registry's back to create duplicates.
        reg.store
            .mutate(|state| {
                state.devices.push(light(1, 100, 2));
                let mut newer = light(1, 100, 2);
                if let DeviceRecord::Light(l) = &mut newer {
                    l.name = "Newer".to_string();
                }
                state.devices.push(newer);
                state.devices.push(light(1, 100, 3));
            })
            .unwrap();

        let report = reg.dedupe().unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.kept, 2);
        let DeviceRecord::Light(kept) = reg
            .find(DeviceKind::Light, DeviceAddress::new(1, 100, 2))
            .unwrap()
        else {
            panic!("wrong kind")
        };
        assert_eq!(kept.name, "Newer");
    }

    #[test]
    fn no_duplicate_addresses_after_mutations() {
        let (_dir, reg) = registry();
        reg.add(light(1, 100, 2)).unwrap();
        reg.add(light(1, 100, 3)).unwrap();
        reg.add(cover(1, 50, 1)).unwrap();
        let _ = reg.add(light(1, 100, 2));
        reg.remove(DeviceKind::Light, DeviceAddress::new(1, 100, 3))
            .unwrap();
        let _ = reg.move_to(
            DeviceKind::Light,
            DeviceAddress::new(1, 100, 2),
            DeviceAddress::new(1, 100, 4),
        );

        let devices = reg.devices();
        for a in &devices {
            let same = devices
                .iter()
                .filter(|b| b.kind() == a.kind() && b.address() == a.address())
                .count();
            assert_eq!(same, 1);
        }
    }

    #[test]
    fn cover_group_rename_keeps_id() {
        let (_dir, reg) = registry();
        let group = reg
            .upsert_cover_group(
                None,
                "South".to_string(),
                vec![DeviceAddress::new(1, 50, 1)],
                None,
                None,
            )
            .unwrap();
        let renamed = reg
            .upsert_cover_group(
                Some(group.id),
                "South Facade".to_string(),
                vec![DeviceAddress::new(1, 50, 1), DeviceAddress::new(1, 50, 2)],
                None,
                None,
            )
            .unwrap();
        assert_eq!(renamed.id, group.id);
        assert_eq!(reg.cover_groups().len(), 1);
    }

    #[test]
    fn cover_group_delete() {
        let (_dir, reg) = registry();
        let group = reg
            .upsert_cover_group(None, "G".to_string(), Vec::new(), None, None)
            .unwrap();
        reg.delete_cover_group(group.id).unwrap();
        assert!(reg.cover_groups().is_empty());
        assert!(matches!(
            reg.delete_cover_group(group.id),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn record_roundtrips_with_type_tag() {
        let record = cover(1, 50, 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "cover");
        assert_eq!(json["subnet_id"], 1);
        let back: DeviceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
