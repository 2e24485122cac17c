// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Home Assistant MQTT discovery payloads.
//!
//! Object ids derive from the bus address, never from the user-facing
//! name: renaming a device must keep its discovery topic (and thus its
//! entity) stable. Cover groups use their stable uuid the same way.
//!
//! Entities are grouped into HA devices by user category; every cover and
//! cover group additionally gets a "no-%" clone under a dedicated device:
//! OPEN/CLOSE/STOP only, `assumed_state`, wired to the raw command topics
//! that bypass the position engine. That clone stays controllable when
//! the simulated position has drifted from reality.

use serde::Serialize;
use serde_json::Value;

use crate::config::Settings;
use crate::registry::{
    AirSensor, Cover, CoverGroup, DeviceRecord, DryContact, Light, PresenceSensor, Sensor,
};

/// Reduces a category name to a stable slug.
#[must_use]
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = false;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
            last_was_sep = false;
        } else if (ch == ' ' || ch == '-') && !last_was_sep && !slug.is_empty() {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        "device".to_string()
    } else {
        slug
    }
}

/// Discovery node id for this gateway instance.
#[must_use]
pub fn node_id(gateway_host: &str, gateway_port: u16) -> String {
    format!("buspro_{}_{}", gateway_host.replace('.', "_"), gateway_port)
}

/// HA device block grouping entities.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl DeviceInfo {
    fn category(category: &str) -> Self {
        Self {
            identifiers: vec![format!("buspro:category:{}", slugify(category))],
            name: format!("BusPro {category}"),
            manufacturer: "HDL",
            model: "BusPro",
        }
    }

    fn no_pct(nid: &str) -> Self {
        Self {
            identifiers: vec![format!("buspro:cover_no_pct:{nid}")],
            name: "BusPro Cover no %".to_string(),
            manufacturer: "HDL",
            model: "BusPro",
        }
    }
}

/// Availability fields shared by all entities.
#[derive(Debug, Clone, Serialize)]
struct Availability {
    availability_topic: String,
    payload_available: &'static str,
    payload_not_available: &'static str,
}

impl Availability {
    fn new(base_topic: &str) -> Self {
        Self {
            availability_topic: format!("{base_topic}/availability"),
            payload_available: "online",
            payload_not_available: "offline",
        }
    }
}

#[derive(Debug, Serialize)]
struct LightDiscovery {
    name: String,
    unique_id: String,
    schema: &'static str,
    state_topic: String,
    command_topic: String,
    #[serde(flatten)]
    availability: Availability,
    device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness_scale: Option<u16>,
}

#[derive(Debug, Serialize)]
struct CoverDiscovery {
    name: String,
    unique_id: String,
    #[serde(flatten)]
    availability: Availability,
    command_topic: String,
    state_topic: String,
    position_topic: String,
    set_position_topic: String,
    payload_open: &'static str,
    payload_close: &'static str,
    payload_stop: &'static str,
    state_open: &'static str,
    state_closed: &'static str,
    state_opening: &'static str,
    state_closing: &'static str,
    state_stopped: &'static str,
    position_open: u8,
    position_closed: u8,
    device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

#[derive(Debug, Serialize)]
struct CoverNoPctDiscovery {
    name: String,
    unique_id: String,
    #[serde(flatten)]
    availability: Availability,
    command_topic: String,
    payload_open: &'static str,
    payload_close: &'static str,
    payload_stop: &'static str,
    optimistic: bool,
    assumed_state: bool,
    device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

#[derive(Debug, Serialize)]
struct SensorDiscovery {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(flatten)]
    availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    /// Absent for textual sensors (the AIR level string).
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

#[derive(Debug, Serialize)]
struct BinarySensorDiscovery {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attributes_topic: Option<String>,
    #[serde(flatten)]
    availability: Availability,
    payload_on: &'static str,
    payload_off: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>,
    device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

/// Context shared by all discovery builders.
struct Ctx<'a> {
    prefix: &'a str,
    base: &'a str,
    nid: String,
}

impl<'a> Ctx<'a> {
    fn new(settings: &'a Settings) -> Self {
        Self {
            prefix: &settings.mqtt.discovery_prefix,
            base: &settings.mqtt.base_topic,
            nid: node_id(&settings.gateway.host, settings.gateway.port),
        }
    }

    fn config_topic(&self, component: &str, oid: &str) -> String {
        format!("{}/{}/{}/{}/config", self.prefix, component, self.nid, oid)
    }
}

fn light_message(ctx: &Ctx<'_>, light: &Light) -> (String, Value) {
    let a = light.address;
    let oid = format!("light_{}_{}_{}", a.subnet, a.device, a.channel);
    let payload = LightDiscovery {
        name: if light.name.is_empty() {
            format!("Light {a}")
        } else {
            light.name.clone()
        },
        unique_id: format!("{}_{}", ctx.nid, oid),
        schema: "json",
        state_topic: format!("{}/state/light/{}/{}/{}", ctx.base, a.subnet, a.device, a.channel),
        command_topic: format!("{}/cmd/light/{}/{}/{}", ctx.base, a.subnet, a.device, a.channel),
        availability: Availability::new(ctx.base),
        device: DeviceInfo::category(&light.category),
        icon: light.icon.clone(),
        brightness: light.dimmable.then_some(true),
        brightness_scale: light.dimmable.then_some(255),
    };
    (ctx.config_topic("light", &oid), to_value(&payload))
}

fn cover_messages(ctx: &Ctx<'_>, cover: &Cover) -> Vec<(String, Value)> {
    let a = cover.address;
    let name = if cover.name.is_empty() {
        format!("Cover {a}")
    } else {
        cover.name.clone()
    };
    let oid = format!("cover_{}_{}_{}", a.subnet, a.device, a.channel);
    let main = CoverDiscovery {
        name: name.clone(),
        unique_id: format!("{}_{}", ctx.nid, oid),
        availability: Availability::new(ctx.base),
        command_topic: format!("{}/cmd/cover/{}/{}/{}", ctx.base, a.subnet, a.device, a.channel),
        state_topic: format!(
            "{}/state/cover_state/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        position_topic: format!(
            "{}/state/cover_pos/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        set_position_topic: format!(
            "{}/cmd/cover_pos/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        payload_open: "OPEN",
        payload_close: "CLOSE",
        payload_stop: "STOP",
        state_open: "OPEN",
        state_closed: "CLOSED",
        state_opening: "OPENING",
        state_closing: "CLOSING",
        state_stopped: "STOP",
        position_open: 100,
        position_closed: 0,
        device: DeviceInfo::category(&cover.category),
        icon: cover.icon.clone(),
    };

    let no_pct_oid = format!("{oid}_no_pct");
    let no_pct = CoverNoPctDiscovery {
        name: format!("{name} no%"),
        unique_id: format!("{}_{}", ctx.nid, no_pct_oid),
        availability: Availability::new(ctx.base),
        command_topic: format!(
            "{}/cmd/cover_raw/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        payload_open: "OPEN",
        payload_close: "CLOSE",
        payload_stop: "STOP",
        optimistic: true,
        assumed_state: true,
        device: DeviceInfo::no_pct(&ctx.nid),
        icon: cover.icon.clone(),
    };

    vec![
        (ctx.config_topic("cover", &oid), to_value(&main)),
        (ctx.config_topic("cover", &no_pct_oid), to_value(&no_pct)),
    ]
}

fn cover_group_messages(ctx: &Ctx<'_>, group: &CoverGroup) -> Vec<(String, Value)> {
    let gid = group.id.to_string();
    let name = if group.name.is_empty() {
        "Cover Group".to_string()
    } else {
        group.name.clone()
    };
    let category = group.category.as_deref().unwrap_or("Cover");
    let oid = format!("group_{gid}");
    let main = CoverDiscovery {
        name: name.clone(),
        unique_id: format!("{}_cover_group_{}", ctx.nid, gid),
        availability: Availability::new(ctx.base),
        command_topic: format!("{}/cmd/cover_group/{}", ctx.base, gid),
        state_topic: format!("{}/state/cover_group_state/{}", ctx.base, gid),
        position_topic: format!("{}/state/cover_group_pos/{}", ctx.base, gid),
        set_position_topic: format!("{}/cmd/cover_group_pos/{}", ctx.base, gid),
        payload_open: "OPEN",
        payload_close: "CLOSE",
        payload_stop: "STOP",
        state_open: "OPEN",
        state_closed: "CLOSED",
        state_opening: "OPENING",
        state_closing: "CLOSING",
        state_stopped: "STOP",
        position_open: 100,
        position_closed: 0,
        device: DeviceInfo::category(category),
        icon: group.icon.clone(),
    };

    let no_pct_oid = format!("{oid}_no_pct");
    let no_pct = CoverNoPctDiscovery {
        name: format!("{name} no%"),
        unique_id: format!("{}_cover_group_{}_no_pct", ctx.nid, gid),
        availability: Availability::new(ctx.base),
        command_topic: format!("{}/cmd/cover_group_raw/{}", ctx.base, gid),
        payload_open: "OPEN",
        payload_close: "CLOSE",
        payload_stop: "STOP",
        optimistic: true,
        assumed_state: true,
        device: DeviceInfo::no_pct(&ctx.nid),
        icon: group.icon.clone(),
    };

    vec![
        (ctx.config_topic("cover", &oid), to_value(&main)),
        (ctx.config_topic("cover", &no_pct_oid), to_value(&no_pct)),
    ]
}

fn sensor_message(
    ctx: &Ctx<'_>,
    sensor: &Sensor,
    kind: &str,
    fallback_name: &str,
    default_category: &str,
    device_class: &'static str,
    unit: &'static str,
) -> (String, Value) {
    let a = sensor.address;
    let oid = format!("{kind}_{}_{}_{}", a.subnet, a.device, a.channel);
    let payload = SensorDiscovery {
        name: if sensor.name.is_empty() {
            format!("{fallback_name} {a}")
        } else {
            sensor.name.clone()
        },
        unique_id: format!("{}_{}", ctx.nid, oid),
        state_topic: format!("{}/state/{}/{}/{}/{}", ctx.base, kind, a.subnet, a.device, a.channel),
        availability: Availability::new(ctx.base),
        device_class: Some(device_class),
        state_class: Some("measurement"),
        unit_of_measurement: Some(unit),
        device: DeviceInfo::category(sensor.category.as_deref().unwrap_or(default_category)),
        icon: sensor.icon.clone(),
    };
    (ctx.config_topic("sensor", &oid), to_value(&payload))
}

/// The AIR level entity (textual state) and the gas percentage entity of
/// one air-quality slot.
fn air_messages(ctx: &Ctx<'_>, air: &AirSensor) -> Vec<(String, Value)> {
    let a = air.address;
    let base_name = if air.name.is_empty() {
        format!("Air {a}")
    } else {
        air.name.clone()
    };
    let device = DeviceInfo::category(air.category.as_deref().unwrap_or("Air"));

    let air_oid = format!("air_quality_{}_{}_{}", a.subnet, a.device, a.channel);
    let quality = SensorDiscovery {
        name: format!("{base_name} - AIR"),
        unique_id: format!("{}_{}", ctx.nid, air_oid),
        state_topic: format!(
            "{}/state/air_quality/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        availability: Availability::new(ctx.base),
        // String state (clean/mild/moderate/severe), no unit.
        device_class: None,
        state_class: None,
        unit_of_measurement: None,
        device: device.clone(),
        icon: air.icon.clone(),
    };

    let gas_oid = format!("gas_percent_{}_{}_{}", a.subnet, a.device, a.channel);
    let gas = SensorDiscovery {
        name: format!("{base_name} - Gas"),
        unique_id: format!("{}_{}", ctx.nid, gas_oid),
        state_topic: format!(
            "{}/state/gas_percent/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        availability: Availability::new(ctx.base),
        device_class: None,
        state_class: Some("measurement"),
        unit_of_measurement: Some("%"),
        device,
        icon: air.gas_icon.clone(),
    };

    vec![
        (ctx.config_topic("sensor", &air_oid), to_value(&quality)),
        (ctx.config_topic("sensor", &gas_oid), to_value(&gas)),
    ]
}

fn presence_message(
    ctx: &Ctx<'_>,
    sensor: &PresenceSensor,
    kind: &str,
    label: &str,
    device_class: &str,
) -> (String, Value) {
    let a = sensor.address;
    let base_name = if sensor.name.is_empty() {
        format!("Presence {a}")
    } else {
        sensor.name.clone()
    };
    let oid = format!("{kind}_{}_{}_{}", a.subnet, a.device, a.channel);
    let payload = BinarySensorDiscovery {
        name: format!("{base_name} - {label}"),
        unique_id: format!("{}_{}", ctx.nid, oid),
        state_topic: format!("{}/state/{}/{}/{}/{}", ctx.base, kind, a.subnet, a.device, a.channel),
        json_attributes_topic: None,
        availability: Availability::new(ctx.base),
        payload_on: "ON",
        payload_off: "OFF",
        device_class: Some(device_class.to_string()),
        device: DeviceInfo::category(sensor.category.as_deref().unwrap_or("Presence")),
        icon: sensor.icon.clone(),
    };
    (ctx.config_topic("binary_sensor", &oid), to_value(&payload))
}

fn dry_contact_message(ctx: &Ctx<'_>, contact: &DryContact) -> (String, Value) {
    let a = contact.address;
    let oid = format!("dry_contact_{}_{}_{}", a.subnet, a.device, a.channel);
    let payload = BinarySensorDiscovery {
        name: if contact.name.is_empty() {
            format!("Dry contact {a}")
        } else {
            contact.name.clone()
        },
        unique_id: format!("{}_{}", ctx.nid, oid),
        state_topic: format!(
            "{}/state/dry_contact/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        ),
        json_attributes_topic: Some(format!(
            "{}/state/dry_contact_attr/{}/{}/{}",
            ctx.base, a.subnet, a.device, a.channel
        )),
        availability: Availability::new(ctx.base),
        payload_on: "ON",
        payload_off: "OFF",
        device_class: contact
            .device_class
            .as_deref()
            .filter(|c| !matches!(c.to_lowercase().as_str(), "" | "none" | "null"))
            .map(ToString::to_string),
        device: DeviceInfo::category("Dry contact"),
        icon: contact.icon.clone(),
    };
    (ctx.config_topic("binary_sensor", &oid), to_value(&payload))
}

/// Builds the full retained discovery set for the current registry.
#[must_use]
pub fn discovery_messages(
    settings: &Settings,
    devices: &[DeviceRecord],
    groups: &[CoverGroup],
) -> Vec<(String, Value)> {
    let ctx = Ctx::new(settings);
    let mut messages = Vec::new();

    for device in devices {
        match device {
            DeviceRecord::Light(light) => messages.push(light_message(&ctx, light)),
            DeviceRecord::Cover(cover) => messages.extend(cover_messages(&ctx, cover)),
            DeviceRecord::Temp(sensor) => messages.push(sensor_message(
                &ctx,
                sensor,
                "temp",
                "Temperature",
                "Temperature",
                "temperature",
                "°C",
            )),
            DeviceRecord::Humidity(sensor) => messages.push(sensor_message(
                &ctx,
                sensor,
                "humidity",
                "Humidity",
                "Humidity",
                "humidity",
                "%",
            )),
            DeviceRecord::Illuminance(sensor) => messages.push(sensor_message(
                &ctx,
                sensor,
                "illuminance",
                "Illuminance",
                "Illuminance",
                "illuminance",
                "lx",
            )),
            DeviceRecord::DryContact(contact) => {
                messages.push(dry_contact_message(&ctx, contact));
            }
            DeviceRecord::Air(air) => messages.extend(air_messages(&ctx, air)),
            DeviceRecord::Pir(sensor) => {
                messages.push(presence_message(&ctx, sensor, "pir", "PIR", "motion"));
            }
            DeviceRecord::Ultrasonic(sensor) => messages.push(presence_message(
                &ctx,
                sensor,
                "ultrasonic",
                "Ultrasonic",
                "occupancy",
            )),
        }
    }
    for group in groups {
        messages.extend(cover_group_messages(&ctx, group));
    }
    messages
}

/// Discovery config topics for one device, used to clear retained
/// configs when the device is deleted.
#[must_use]
pub fn config_topics_for(settings: &Settings, device: &DeviceRecord) -> Vec<String> {
    let ctx = Ctx::new(settings);
    let a = device.address();
    let suffix = format!("{}_{}_{}", a.subnet, a.device, a.channel);
    match device {
        DeviceRecord::Light(_) => vec![ctx.config_topic("light", &format!("light_{suffix}"))],
        DeviceRecord::Cover(_) => vec![
            ctx.config_topic("cover", &format!("cover_{suffix}")),
            ctx.config_topic("cover", &format!("cover_{suffix}_no_pct")),
        ],
        DeviceRecord::Temp(_) => vec![ctx.config_topic("sensor", &format!("temp_{suffix}"))],
        DeviceRecord::Humidity(_) => vec![ctx.config_topic("sensor", &format!("humidity_{suffix}"))],
        DeviceRecord::Illuminance(_) => {
            vec![ctx.config_topic("sensor", &format!("illuminance_{suffix}"))]
        }
        DeviceRecord::DryContact(_) => {
            vec![ctx.config_topic("binary_sensor", &format!("dry_contact_{suffix}"))]
        }
        DeviceRecord::Air(_) => vec![
            ctx.config_topic("sensor", &format!("air_quality_{suffix}")),
            ctx.config_topic("sensor", &format!("gas_percent_{suffix}")),
        ],
        DeviceRecord::Pir(_) => vec![ctx.config_topic("binary_sensor", &format!("pir_{suffix}"))],
        DeviceRecord::Ultrasonic(_) => {
            vec![ctx.config_topic("binary_sensor", &format!("ultrasonic_{suffix}"))]
        }
    }
}

/// Discovery config topics for one cover group.
#[must_use]
pub fn config_topics_for_group(settings: &Settings, group: &CoverGroup) -> Vec<String> {
    let ctx = Ctx::new(settings);
    let gid = group.id.to_string();
    vec![
        ctx.config_topic("cover", &format!("group_{gid}")),
        ctx.config_topic("cover", &format!("group_{gid}_no_pct")),
    ]
}

fn to_value(payload: &impl Serialize) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceAddress;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.gateway.host = "192.168.1.8".to_string();
        settings
    }

    fn light(name: &str) -> DeviceRecord {
        DeviceRecord::Light(Light {
            address: DeviceAddress::new(1, 100, 2),
            name: name.to_string(),
            dimmable: true,
            category: "Luci".to_string(),
            icon: None,
            group: None,
        })
    }

    fn cover() -> DeviceRecord {
        DeviceRecord::Cover(Cover {
            address: DeviceAddress::new(1, 50, 1),
            name: "Salotto".to_string(),
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
    fn slugify_examples() {
        assert_eq!(slugify("Luci"), "luci");
        assert_eq!(slugify("Piano Terra - Sud"), "piano_terra_sud");
        assert_eq!(slugify("  "), "device");
        assert_eq!(slugify("Ümlaut!"), "mlaut");
    }

    #[test]
    fn node_id_is_host_derived() {
        assert_eq!(node_id("192.168.1.8", 6000), "buspro_192_168_1_8_6000");
    }

    #[test]
    fn light_discovery_topic_and_payload() {
        let msgs = discovery_messages(&settings(), &[light("Kitchen")], &[]);
        assert_eq!(msgs.len(), 1);
        let (topic, payload) = &msgs[0];
        assert_eq!(
            topic,
            "homeassistant/light/buspro_192_168_1_8_6000/light_1_100_2/config"
        );
        assert_eq!(payload["name"], "Kitchen");
        assert_eq!(payload["schema"], "json");
        assert_eq!(payload["state_topic"], "buspro/state/light/1/100/2");
        assert_eq!(payload["command_topic"], "buspro/cmd/light/1/100/2");
        assert_eq!(payload["brightness"], true);
        assert_eq!(payload["brightness_scale"], 255);
        assert_eq!(payload["availability_topic"], "buspro/availability");
        assert_eq!(payload["device"]["identifiers"][0], "buspro:category:luci");
    }

    #[test]
    fn object_id_is_stable_across_renames() {
        let before = discovery_messages(&settings(), &[light("Old name")], &[]);
        let after = discovery_messages(&settings(), &[light("New name")], &[]);
        assert_eq!(before[0].0, after[0].0);
        assert_eq!(before[0].1["unique_id"], after[0].1["unique_id"]);
    }

    #[test]
    fn cover_gets_a_no_pct_clone() {
        let msgs = discovery_messages(&settings(), &[cover()], &[]);
        assert_eq!(msgs.len(), 2);
        let (_, main) = &msgs[0];
        assert_eq!(main["set_position_topic"], "buspro/cmd/cover_pos/1/50/1");
        assert_eq!(main["state_stopped"], "STOP");

        let (clone_topic, clone) = &msgs[1];
        assert!(clone_topic.ends_with("cover_1_50_1_no_pct/config"));
        assert_eq!(clone["command_topic"], "buspro/cmd/cover_raw/1/50/1");
        assert_eq!(clone["assumed_state"], true);
        assert_eq!(clone["optimistic"], true);
        assert!(clone.get("position_topic").is_none());
        assert_eq!(
            clone["device"]["identifiers"][0],
            "buspro:cover_no_pct:buspro_192_168_1_8_6000"
        );
    }

    #[test]
    fn cover_group_uses_stable_id() {
        let group = CoverGroup {
            id: uuid::Uuid::nil(),
            name: "South".to_string(),
            members: vec![DeviceAddress::new(1, 50, 1)],
            icon: None,
            category: None,
        };
        let msgs = discovery_messages(&settings(), &[], &[group]);
        assert_eq!(msgs.len(), 2);
        let gid = uuid::Uuid::nil().to_string();
        assert!(msgs[0].0.contains(&format!("group_{gid}")));
        assert_eq!(
            msgs[0].1["command_topic"],
            format!("buspro/cmd/cover_group/{gid}")
        );
        assert_eq!(
            msgs[1].1["command_topic"],
            format!("buspro/cmd/cover_group_raw/{gid}")
        );
    }

    #[test]
    fn sensor_units_and_classes() {
        let sensor = Sensor {
            address: DeviceAddress::new(1, 30, 1),
            name: String::new(),
            decimals: None,
            min: None,
            max: None,
            scale: None,
            offset: None,
            format: Default::default(),
            category: None,
            icon: None,
        };
        let msgs = discovery_messages(
            &settings(),
            &[
                DeviceRecord::Temp(sensor.clone()),
                DeviceRecord::Humidity(sensor.clone()),
                DeviceRecord::Illuminance(sensor),
            ],
            &[],
        );
        assert_eq!(msgs[0].1["device_class"], "temperature");
        assert_eq!(msgs[0].1["unit_of_measurement"], "°C");
        assert_eq!(msgs[1].1["device_class"], "humidity");
        assert_eq!(msgs[2].1["unit_of_measurement"], "lx");
        // Default names fall back to the address.
        assert_eq!(msgs[0].1["name"], "Temperature 1.30.1");
    }

    #[test]
    fn air_slot_publishes_quality_and_gas_entities() {
        let air = DeviceRecord::Air(AirSensor {
            address: DeviceAddress::new(1, 60, 248),
            name: "Soggiorno".to_string(),
            category: None,
            icon: None,
            gas_icon: Some("mdi:gas-cylinder".to_string()),
        });
        let msgs = discovery_messages(&settings(), &[air], &[]);
        assert_eq!(msgs.len(), 2);

        let (quality_topic, quality) = &msgs[0];
        assert!(quality_topic.ends_with("air_quality_1_60_248/config"));
        assert_eq!(quality["name"], "Soggiorno - AIR");
        assert_eq!(quality["state_topic"], "buspro/state/air_quality/1/60/248");
        // String state: no unit, no state class.
        assert!(quality.get("unit_of_measurement").is_none());
        assert!(quality.get("state_class").is_none());

        let (gas_topic, gas) = &msgs[1];
        assert!(gas_topic.ends_with("gas_percent_1_60_248/config"));
        assert_eq!(gas["name"], "Soggiorno - Gas");
        assert_eq!(gas["unit_of_measurement"], "%");
        assert_eq!(gas["state_class"], "measurement");
        assert_eq!(gas["icon"], "mdi:gas-cylinder");
    }

    #[test]
    fn presence_entities_have_motion_and_occupancy_classes() {
        let sensor = PresenceSensor {
            address: DeviceAddress::new(1, 60, 3),
            name: String::new(),
            category: None,
            icon: None,
        };
        let msgs = discovery_messages(
            &settings(),
            &[
                DeviceRecord::Pir(sensor.clone()),
                DeviceRecord::Ultrasonic(sensor),
            ],
            &[],
        );
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].0.contains("/binary_sensor/"));
        assert_eq!(msgs[0].1["name"], "Presence 1.60.3 - PIR");
        assert_eq!(msgs[0].1["device_class"], "motion");
        assert_eq!(msgs[0].1["state_topic"], "buspro/state/pir/1/60/3");
        assert_eq!(msgs[1].1["name"], "Presence 1.60.3 - Ultrasonic");
        assert_eq!(msgs[1].1["device_class"], "occupancy");
        // Presence entities carry no attributes topic.
        assert!(msgs[0].1.get("json_attributes_topic").is_none());
    }

    #[test]
    fn dry_contact_has_attributes_topic() {
        let contact = DeviceRecord::DryContact(DryContact {
            address: DeviceAddress::new(1, 40, 3),
            name: String::new(),
            invert: false,
            device_class: Some("door".to_string()),
            icon: None,
        });
        let msgs = discovery_messages(&settings(), &[contact], &[]);
        let (topic, payload) = &msgs[0];
        assert!(topic.starts_with("homeassistant/binary_sensor/"));
        assert_eq!(
            payload["json_attributes_topic"],
            "buspro/state/dry_contact_attr/1/40/3"
        );
        assert_eq!(payload["device_class"], "door");
    }

    #[test]
    fn config_topics_match_discovery() {
        let device = cover();
        let topics = config_topics_for(&settings(), &device);
        let msgs = discovery_messages(&settings(), &[device], &[]);
        let published: Vec<&String> = msgs.iter().map(|(t, _)| t).collect();
        assert_eq!(topics.len(), published.len());
        for topic in &topics {
            assert!(published.contains(&topic));
        }
    }
}
