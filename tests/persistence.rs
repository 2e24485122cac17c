// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store and registry lifecycle across process restarts.

use std::sync::Arc;

use buspro_bridge::registry::{Cover, DeviceKind, DeviceRecord, DeviceRegistry, Light};
use buspro_bridge::store::StateStore;
use buspro_bridge::types::DeviceAddress;

fn light(subnet: u8, device: u8, channel: u8, name: &str) -> DeviceRecord {
    DeviceRecord::Light(Light {
        address: DeviceAddress::new(subnet, device, channel),
        name: name.to_string(),
        dimmable: true,
        category: "Luci".to_string(),
        icon: None,
        group: None,
    })
}

fn cover(subnet: u8, device: u8, channel: u8) -> DeviceRecord {
    DeviceRecord::Cover(Cover {
        address: DeviceAddress::new(subnet, device, channel),
        name: "Tapparella".to_string(),
        opening_time_up_s: 18.0,
        opening_time_down_s: 21.0,
        start_delay_s: 1.5,
        reverse_icon: false,
        category: "Cover".to_string(),
        icon: Some("mdi:window-shutter".to_string()),
        group: None,
    })
}

#[test]
fn registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = Arc::new(StateStore::open(&path));
        let registry = DeviceRegistry::new(Arc::clone(&store));
        registry.add(light(1, 100, 2, "Kitchen")).unwrap();
        registry.add(cover(1, 50, 1)).unwrap();
        store
            .set_state(
                "cover:1.50.1",
                serde_json::json!({"state": "STOP", "position": 40}),
            )
            .unwrap();
        registry
            .upsert_cover_group(
                None,
                "South".to_string(),
                vec![DeviceAddress::new(1, 50, 1)],
                None,
                None,
            )
            .unwrap();
    }

    let store = Arc::new(StateStore::open(&path));
    let registry = DeviceRegistry::new(Arc::clone(&store));

    assert_eq!(registry.devices().len(), 2);
    let Some(DeviceRecord::Cover(reloaded)) =
        registry.find(DeviceKind::Cover, DeviceAddress::new(1, 50, 1))
    else {
        panic!("cover lost across restart");
    };
    // Calibration must survive verbatim.
    assert!((reloaded.opening_time_up_s - 18.0).abs() < f64::EPSILON);
    assert!((reloaded.opening_time_down_s - 21.0).abs() < f64::EPSILON);
    assert!((reloaded.start_delay_s - 1.5).abs() < f64::EPSILON);

    assert_eq!(
        store.state("cover:1.50.1"),
        Some(serde_json::json!({"state": "STOP", "position": 40}))
    );
    assert_eq!(registry.cover_groups().len(), 1);
    assert_eq!(registry.cover_groups()[0].name, "South");
}

#[test]
fn corrupt_store_quarantines_and_keeps_working() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{\"devices\": [{\"type\": \"light\", truncated").unwrap();

    let store = Arc::new(StateStore::open(&path));
    let registry = DeviceRegistry::new(Arc::clone(&store));

    // Empty but functional: normal CRUD keeps working after recovery.
    assert!(registry.devices().is_empty());
    registry.add(light(1, 100, 2, "Fresh start")).unwrap();
    assert_eq!(registry.devices().len(), 1);

    let quarantined: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("state.json.corrupt."))
        .collect();
    assert_eq!(quarantined.len(), 1, "one quarantine file: {quarantined:?}");

    // The timestamp suffix parses as a unix timestamp.
    let suffix = quarantined[0]
        .strip_prefix("state.json.corrupt.")
        .unwrap();
    assert!(suffix.parse::<i64>().is_ok(), "suffix {suffix} not a timestamp");
}

#[test]
fn address_edit_migrates_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let store = Arc::new(StateStore::open(&path));
    let registry = DeviceRegistry::new(Arc::clone(&store));
    registry.add(cover(1, 50, 1)).unwrap();
    store
        .set_state(
            "cover:1.50.1",
            serde_json::json!({"state": "OPEN", "position": 100}),
        )
        .unwrap();

    registry
        .move_to(
            DeviceKind::Cover,
            DeviceAddress::new(1, 50, 1),
            DeviceAddress::new(2, 60, 3),
        )
        .unwrap();

    // Reload from disk and verify the migration was persisted.
    let store = Arc::new(StateStore::open(&path));
    let registry = DeviceRegistry::new(Arc::clone(&store));
    assert!(registry
        .find(DeviceKind::Cover, DeviceAddress::new(1, 50, 1))
        .is_none());
    assert!(registry
        .find(DeviceKind::Cover, DeviceAddress::new(2, 60, 3))
        .is_some());
    assert!(store.state("cover:1.50.1").is_none());
    assert_eq!(
        store.state("cover:2.60.3"),
        Some(serde_json::json!({"state": "OPEN", "position": 100}))
    );
}

#[test]
fn tagged_record_format_matches_store_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let store = Arc::new(StateStore::open(&path));
        let registry = DeviceRegistry::new(store);
        registry.add(light(1, 100, 2, "Kitchen")).unwrap();
    }

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let device = &raw["devices"][0];
    assert_eq!(device["type"], "light");
    assert_eq!(device["subnet_id"], 1);
    assert_eq!(device["device_id"], 100);
    assert_eq!(device["channel"], 2);
    assert_eq!(device["name"], "Kitchen");
}
