// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bridge core: wires transport, engine, store, MQTT and realtime
//! together and owns the long-lived worker tasks.
//!
//! All shared state lives on this one value; nothing is global. Teardown
//! publishes `availability=offline` and aborts the workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::codec::{OperateCode, Telegram};
use crate::bus::scheduler::{CommandKind, Job, SendScheduler, DEFAULT_PACING};
use crate::bus::transport::{BusSink, RxTelegram, UdpTransport};
use crate::config::Settings;
use crate::cover::engine::{CoverEngine, CoverUpdate};
use crate::cover::motion::CoverTimes;
use crate::error::{Error, ProtocolError, Result};
use crate::mqtt::bridge::{command_subscriptions, parse_command, BridgeCommand, GroupAction};
use crate::mqtt::client::{MqttClient, MqttEvent};
use crate::mqtt::discovery;
use crate::realtime::{RealtimeEvent, RealtimeHub};
use crate::registry::{
    CoverGroup, DeviceKind, DeviceRecord, DeviceRegistry, DryContact, Sensor, SensorFormat,
};
use crate::sensor::decode::{SensorReading, TempReading};
use crate::sensor::sniffer::TelegramSniffer;
use crate::store::{group_state_key, state_key, StateStore};
use crate::types::{Brightness, DeviceAddress, Position};

/// Default scale for 2-byte temperature payloads (0.5 °C steps).
const SHORT_TEMP_SCALE: f64 = 0.5;

/// The long-lived bridge instance.
pub struct Core {
    pub settings: Settings,
    pub store: Arc<StateStore>,
    pub registry: DeviceRegistry,
    pub transport: Arc<UdpTransport>,
    pub scheduler: Arc<SendScheduler>,
    pub covers: Arc<CoverEngine>,
    pub sniffer: TelegramSniffer,
    pub hub: RealtimeHub,
    pub mqtt: Arc<MqttClient>,
    replayed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Builds the core and spawns all workers.
    pub async fn start(settings: Settings) -> Arc<Self> {
        let store = Arc::new(StateStore::open(&settings.state_path));
        let registry = DeviceRegistry::new(Arc::clone(&store));

        let transport =
            Arc::new(UdpTransport::bind(&settings.gateway, settings.debug_telegram).await);
        let pacing = DEFAULT_PACING + Duration::from_secs_f64(settings.udp_send_interval_s);
        let scheduler = SendScheduler::new(
            Arc::clone(&transport) as Arc<dyn BusSink>,
            pacing,
        );

        let (cover_tx, cover_rx) = mpsc::unbounded_channel();
        let covers = CoverEngine::new(Arc::clone(&scheduler), cover_tx);

        let (mqtt_tx, mqtt_rx) = mpsc::unbounded_channel();
        let availability = format!("{}/availability", settings.mqtt.base_topic);
        let mqtt = MqttClient::spawn(&settings.mqtt, availability, mqtt_tx);

        let core = Arc::new(Self {
            settings,
            store,
            registry,
            transport,
            scheduler,
            covers,
            sniffer: TelegramSniffer::default(),
            hub: RealtimeHub::new(),
            mqtt,
            replayed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        // Register persisted covers with their calibration before any
        // telegram or command can reach them.
        for device in core.registry.devices() {
            if let DeviceRecord::Cover(cover) = device {
                core.covers.ensure(cover.address, Some(cover_times(&cover)));
            }
        }

        core.spawn_workers(cover_rx, mqtt_rx);
        core.subscribe_commands().await;
        core.initial_status_sweep();
        core
    }

    fn spawn_workers(
        self: &Arc<Self>,
        mut cover_rx: mpsc::UnboundedReceiver<CoverUpdate>,
        mut mqtt_rx: mpsc::UnboundedReceiver<MqttEvent>,
    ) {
        let mut tasks = Vec::new();

        let (rx_tx, mut rx_rx) = mpsc::unbounded_channel::<RxTelegram>();
        if let Some(handle) = self.transport.spawn_recv_loop(rx_tx) {
            tasks.push(handle);
        }

        let core = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(rx) = rx_rx.recv().await {
                core.handle_telegram(&rx).await;
            }
        }));

        let core = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(update) = cover_rx.recv().await {
                core.publish_cover_update(update).await;
            }
        }));

        let core = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = mqtt_rx.recv().await {
                match event {
                    MqttEvent::Connected => core.on_mqtt_connected().await,
                    MqttEvent::Message { topic, payload } => {
                        core.on_mqtt_message(&topic, &payload).await;
                    }
                }
            }
        }));

        tasks.push(self.scheduler.spawn());

        let core = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            core.poll_loop().await;
        }));

        self.tasks.lock().extend(tasks);
    }

    async fn subscribe_commands(&self) {
        for topic in command_subscriptions(&self.settings.mqtt.base_topic) {
            if let Err(e) = self.mqtt.subscribe(&topic).await {
                tracing::warn!(topic = %topic, error = %e, "command subscribe failed");
            }
        }
    }

    /// Periodic status sweep so state converges even on a quiet bus.
    async fn poll_loop(&self) {
        let interval = self.settings.poll_interval_s;
        if interval <= 0.0 {
            return;
        }
        let pace = Duration::from_secs_f64(self.settings.poll_pace_s);
        loop {
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            for device in self.registry.devices() {
                match device {
                    DeviceRecord::Cover(cover) => self.covers.read_status(cover.address),
                    DeviceRecord::Light(light) => self.read_light_status(light.address),
                    _ => continue,
                }
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
            }
        }
    }

    fn initial_status_sweep(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let pace = Duration::from_secs_f64(core.settings.poll_pace_s.max(0.05));
            for device in core.registry.devices() {
                match device {
                    DeviceRecord::Cover(cover) => core.covers.read_status(cover.address),
                    DeviceRecord::Light(light) => core.read_light_status(light.address),
                    _ => continue,
                }
                tokio::time::sleep(pace).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    fn read_light_status(&self, address: DeviceAddress) {
        self.scheduler.enqueue(
            DeviceKind::Light,
            address,
            Job::new(
                CommandKind::ReadStatus,
                Telegram::read_status_of_channels(address.bus()),
            ),
        );
    }

    // =====================================================================
    // Inbound telegrams
    // =====================================================================

    async fn handle_telegram(self: &Arc<Self>, rx: &RxTelegram) {
        self.sniffer.on_telegram(&rx.telegram, &rx.raw, Some(rx.peer));
        self.covers.handle_telegram(&rx.telegram);
        self.handle_light_telegram(&rx.telegram).await;
        for reading in crate::sensor::decode::decode(&rx.telegram) {
            self.handle_sensor_reading(&rx.telegram, reading).await;
        }
    }

    async fn handle_light_telegram(&self, telegram: &Telegram) {
        match telegram.opcode {
            OperateCode::SingleChannelControlResponse => {
                // payload: [channel, success, level]
                let (Some(&channel), Some(&level)) =
                    (telegram.payload.first(), telegram.payload.get(2))
                else {
                    return;
                };
                let address =
                    DeviceAddress::new(telegram.source.subnet, telegram.source.device, channel);
                self.update_light_state(address, level).await;
            }
            OperateCode::ReadStatusOfChannelsResponse => {
                // payload: [channel_count, level_1, level_2, ...]
                let Some(&count) = telegram.payload.first() else {
                    return;
                };
                for device in self.registry.devices() {
                    let DeviceRecord::Light(light) = device else {
                        continue;
                    };
                    if light.address.bus() != telegram.source {
                        continue;
                    }
                    let channel = light.address.channel;
                    if channel == 0 || channel > count {
                        continue;
                    }
                    if let Some(&level) = telegram.payload.get(channel as usize) {
                        self.update_light_state(light.address, level).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn update_light_state(&self, address: DeviceAddress, level: u8) {
        let Some(DeviceRecord::Light(light)) = self.registry.find(DeviceKind::Light, address)
        else {
            return;
        };
        let on = level > 0;
        let brightness = Brightness::from_percent(level);
        let state = if on { "ON" } else { "OFF" };

        let mut payload = json!({"state": state});
        if light.dimmable {
            payload["brightness"] = json!(brightness.value());
        }
        let key = state_key(DeviceKind::Light, address);
        if !self.store.update_if_changed(&key, &payload) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, payload.clone()) {
            tracing::warn!(error = %e, "state flush failed");
        }
        let topic = format!(
            "{}/state/light/{}/{}/{}",
            self.settings.mqtt.base_topic, address.subnet, address.device, address.channel
        );
        let _ = self.mqtt.publish_json(&topic, &payload, true).await;
        self.hub.broadcast(
            "state",
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "state": payload["state"],
                "brightness": payload.get("brightness").cloned().unwrap_or(Value::Null),
            }),
        );
    }

    async fn handle_sensor_reading(&self, telegram: &Telegram, reading: SensorReading) {
        let source = telegram.source;
        match reading {
            SensorReading::Temperature { sensor_id, raw } => {
                let address = DeviceAddress::new(source.subnet, source.device, sensor_id);
                let Some(DeviceRecord::Temp(sensor)) =
                    self.registry.find(DeviceKind::Temp, address)
                else {
                    return;
                };
                let Some(value) = temp_value(&sensor, raw) else {
                    return;
                };
                if !sensor.accepts(value) {
                    return;
                }
                self.publish_numeric(DeviceKind::Temp, &sensor, value, 1).await;
            }
            SensorReading::Humidity { value } => {
                for device in self.registry.devices() {
                    let DeviceRecord::Humidity(sensor) = device else {
                        continue;
                    };
                    if sensor.address.bus() != source || !sensor.accepts(f64::from(value)) {
                        continue;
                    }
                    self.publish_numeric(DeviceKind::Humidity, &sensor, f64::from(value), 0)
                        .await;
                }
            }
            SensorReading::Illuminance { lux } => {
                for device in self.registry.devices() {
                    let DeviceRecord::Illuminance(sensor) = device else {
                        continue;
                    };
                    if sensor.address.bus() != source {
                        continue;
                    }
                    let mut value = f64::from(lux);
                    if let Some(scale) = sensor.scale {
                        value *= scale;
                    }
                    if let Some(offset) = sensor.offset {
                        value += offset;
                    }
                    if !sensor.accepts(value) {
                        continue;
                    }
                    self.publish_numeric(DeviceKind::Illuminance, &sensor, value, 0)
                        .await;
                }
            }
            SensorReading::DryContact { input, on, x } => {
                let address = DeviceAddress::new(source.subnet, source.device, input);
                let Some(DeviceRecord::DryContact(contact)) =
                    self.registry.find(DeviceKind::DryContact, address)
                else {
                    return;
                };
                self.publish_dry_contact(&contact, on, x).await;
            }
            SensorReading::AirQuality { sensor_id, level } => {
                let address = DeviceAddress::new(source.subnet, source.device, sensor_id);
                if self.registry.find(DeviceKind::Air, address).is_none() {
                    return;
                }
                self.publish_air_quality(address, level).await;
            }
            SensorReading::GasPercent { sensor_id, percent } => {
                if percent > 100 {
                    return;
                }
                let address = DeviceAddress::new(source.subnet, source.device, sensor_id);
                if self.registry.find(DeviceKind::Air, address).is_none() {
                    return;
                }
                self.publish_gas_percent(address, percent).await;
            }
            SensorReading::Presence {
                sensor_id,
                pir,
                ultrasonic,
            } => {
                let address = DeviceAddress::new(source.subnet, source.device, sensor_id);
                if self.registry.find(DeviceKind::Pir, address).is_some() {
                    self.publish_presence(DeviceKind::Pir, address, pir).await;
                }
                if self.registry.find(DeviceKind::Ultrasonic, address).is_some() {
                    self.publish_presence(DeviceKind::Ultrasonic, address, ultrasonic)
                        .await;
                }
            }
            SensorReading::Raw { .. } => {}
        }
    }

    async fn publish_numeric(&self, kind: DeviceKind, sensor: &Sensor, value: f64, default_decimals: u8) {
        let decimals = sensor.decimals_or(default_decimals);
        let rounded = round_to(value, decimals);
        let address = sensor.address;

        let key = state_key(kind, address);
        let stored = json!({"value": rounded});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }

        let topic = format!(
            "{}/state/{}/{}/{}/{}",
            self.settings.mqtt.base_topic,
            kind.as_str(),
            address.subnet,
            address.device,
            address.channel
        );
        let text = format!("{rounded:.prec$}", prec = usize::from(decimals));
        let _ = self.mqtt.publish(&topic, text, true).await;
        self.hub.broadcast(
            &format!("{}_value", kind.as_str()),
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "value": rounded,
            }),
        );
    }

    async fn publish_dry_contact(&self, contact: &DryContact, on: bool, x: u8) {
        let on = on != contact.invert;
        let address = contact.address;
        let state = if on { "ON" } else { "OFF" };

        let key = state_key(DeviceKind::DryContact, address);
        let stored = json!({"state": state, "x": x});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }

        let base = &self.settings.mqtt.base_topic;
        let suffix = format!("{}/{}/{}", address.subnet, address.device, address.channel);
        let _ = self
            .mqtt
            .publish(&format!("{base}/state/dry_contact/{suffix}"), state, true)
            .await;
        let _ = self
            .mqtt
            .publish_json(
                &format!("{base}/state/dry_contact_attr/{suffix}"),
                &json!({"x": x}),
                true,
            )
            .await;
        self.hub.broadcast(
            "dry_contact_state",
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "state": state,
                "x": x,
            }),
        );
    }

    async fn publish_air_quality(&self, address: DeviceAddress, level: u8) {
        let text = air_level_text(level);
        let key = format!("air_quality:{address}");
        let stored = json!({"state": text});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }
        let topic = format!(
            "{}/state/air_quality/{}/{}/{}",
            self.settings.mqtt.base_topic, address.subnet, address.device, address.channel
        );
        let _ = self.mqtt.publish(&topic, text, true).await;
        self.hub.broadcast(
            "air_quality_state",
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "state": text,
            }),
        );
    }

    async fn publish_gas_percent(&self, address: DeviceAddress, percent: u8) {
        let key = format!("gas_percent:{address}");
        let stored = json!({"value": percent});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }
        let topic = format!(
            "{}/state/gas_percent/{}/{}/{}",
            self.settings.mqtt.base_topic, address.subnet, address.device, address.channel
        );
        let _ = self.mqtt.publish(&topic, percent.to_string(), true).await;
        self.hub.broadcast(
            "gas_percent_value",
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "value": percent,
            }),
        );
    }

    async fn publish_presence(&self, kind: DeviceKind, address: DeviceAddress, on: bool) {
        let state = if on { "ON" } else { "OFF" };
        let key = state_key(kind, address);
        let stored = json!({"state": state});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }
        let topic = format!(
            "{}/state/{}/{}/{}/{}",
            self.settings.mqtt.base_topic,
            kind.as_str(),
            address.subnet,
            address.device,
            address.channel
        );
        let _ = self.mqtt.publish(&topic, state, true).await;
        self.hub.broadcast(
            &format!("{}_state", kind.as_str()),
            json!({
                "subnet_id": address.subnet,
                "device_id": address.device,
                "channel": address.channel,
                "state": state,
            }),
        );
    }

    // =====================================================================
    // Cover publishing
    // =====================================================================

    async fn publish_cover_update(&self, update: CoverUpdate) {
        let address = update.address;
        if self
            .registry
            .find(DeviceKind::Cover, address)
            .is_none()
        {
            return;
        }
        let state = update.view.state.as_str();
        let position = update.view.position;

        let key = state_key(DeviceKind::Cover, address);
        let stored = json!({"state": state, "position": position});
        if self.store.update_if_changed(&key, &stored) {
            if let Err(e) = self.store.set_state(&key, stored) {
                tracing::warn!(error = %e, "state flush failed");
            }
            let base = &self.settings.mqtt.base_topic;
            let suffix = format!("{}/{}/{}", address.subnet, address.device, address.channel);
            let _ = self
                .mqtt
                .publish(&format!("{base}/state/cover_state/{suffix}"), state, true)
                .await;
            let _ = self
                .mqtt
                .publish(
                    &format!("{base}/state/cover_pos/{suffix}"),
                    position.to_string(),
                    true,
                )
                .await;
            self.hub.broadcast(
                "cover_state",
                json!({
                    "subnet_id": address.subnet,
                    "device_id": address.device,
                    "channel": address.channel,
                    "state": state,
                    "position": position,
                }),
            );
        }

        self.publish_groups_for_member(address).await;
    }

    async fn publish_groups_for_member(&self, member: DeviceAddress) {
        for group in self.registry.cover_groups() {
            if group.members.contains(&member) {
                self.publish_group_state(&group).await;
            }
        }
    }

    async fn publish_group_state(&self, group: &CoverGroup) {
        let Some(view) = self.covers.aggregate(&group.members) else {
            return;
        };
        let gid = group.id.to_string();
        let key = group_state_key(&gid);
        let stored = json!({"state": view.state.as_str(), "position": view.position});
        if !self.store.update_if_changed(&key, &stored) {
            return;
        }
        if let Err(e) = self.store.set_state(&key, stored) {
            tracing::warn!(error = %e, "state flush failed");
        }
        let base = &self.settings.mqtt.base_topic;
        let _ = self
            .mqtt
            .publish(
                &format!("{base}/state/cover_group_state/{gid}"),
                view.state.as_str(),
                true,
            )
            .await;
        let _ = self
            .mqtt
            .publish(
                &format!("{base}/state/cover_group_pos/{gid}"),
                view.position.to_string(),
                true,
            )
            .await;
        self.hub.broadcast(
            "cover_group_state",
            json!({
                "id": gid,
                "state": view.state.as_str(),
                "position": view.position,
            }),
        );
    }

    // =====================================================================
    // Commands
    // =====================================================================

    /// Drives a light channel. Turning on without a brightness sends
    /// 100%; any non-zero brightness maps to at least 1%.
    pub fn set_light(
        &self,
        address: DeviceAddress,
        on: bool,
        brightness: Option<Brightness>,
    ) -> Result<()> {
        self.ensure_transport()?;
        let percent = if !on {
            0
        } else {
            brightness.map_or(100, |b| b.percent())
        };
        self.scheduler.enqueue(
            DeviceKind::Light,
            address,
            Job::new(
                CommandKind::Light,
                Telegram::single_channel_control(address.bus(), address.channel, percent),
            ),
        );
        Ok(())
    }

    /// Dispatches a cover action.
    pub fn cover_command(
        self: &Arc<Self>,
        address: DeviceAddress,
        action: GroupAction,
        raw: bool,
    ) -> Result<()> {
        self.ensure_transport()?;
        self.ensure_cover(address);
        match (action, raw) {
            (GroupAction::Open, false) => self.covers.open(address),
            (GroupAction::Close, false) => self.covers.close(address),
            (GroupAction::Open, true) => self.covers.open_raw(address),
            (GroupAction::Close, true) => self.covers.close_raw(address),
            (GroupAction::Stop, _) => self.covers.stop(address),
        }
        Ok(())
    }

    /// Drives a cover to a position.
    pub fn cover_set_position(
        self: &Arc<Self>,
        address: DeviceAddress,
        position: Position,
    ) -> Result<()> {
        self.ensure_transport()?;
        self.ensure_cover(address);
        self.covers.set_position(address, position);
        Ok(())
    }

    /// Fans a command out over a cover group.
    pub fn group_command(
        self: &Arc<Self>,
        group_id: &str,
        action: GroupAction,
        raw: bool,
    ) -> Result<()> {
        let group = self.find_group(group_id).ok_or(Error::NotFound)?;
        self.ensure_transport()?;
        for member in &group.members {
            self.ensure_cover(*member);
        }
        self.covers.group_command(&group.members, action.action(), raw);
        Ok(())
    }

    /// Fans a position out over a cover group.
    pub fn group_set_position(self: &Arc<Self>, group_id: &str, position: Position) -> Result<()> {
        let group = self.find_group(group_id).ok_or(Error::NotFound)?;
        self.ensure_transport()?;
        for member in &group.members {
            self.ensure_cover(*member);
        }
        self.covers.group_set_position(&group.members, position);
        Ok(())
    }

    fn ensure_transport(&self) -> Result<()> {
        if self.transport.ready() {
            Ok(())
        } else {
            Err(Error::Protocol(ProtocolError::TransportNotReady))
        }
    }

    /// Registers the cover in the engine, feeding calibration from the
    /// registry when present. Never overwrites calibration with defaults.
    fn ensure_cover(&self, address: DeviceAddress) {
        let times = match self.registry.find(DeviceKind::Cover, address) {
            Some(DeviceRecord::Cover(cover)) => Some(cover_times(&cover)),
            _ => None,
        };
        self.covers.ensure(address, times);
    }

    fn find_group(&self, group_id: &str) -> Option<CoverGroup> {
        let groups = self.registry.cover_groups();
        if let Ok(id) = group_id.parse::<Uuid>() {
            if let Some(group) = groups.iter().find(|g| g.id == id) {
                return Some(group.clone());
            }
        }
        // Fallback: groups created before stable ids were addressed by
        // their slugified name.
        groups
            .into_iter()
            .find(|g| discovery::slugify(&g.name) == group_id)
    }

    // =====================================================================
    // MQTT lifecycle
    // =====================================================================

    /// Runs on connect and on every reconnect: brokers without retained
    /// persistence forget availability and discovery across restarts.
    async fn on_mqtt_connected(&self) {
        let base = &self.settings.mqtt.base_topic;
        let _ = self
            .mqtt
            .publish(&format!("{base}/availability"), "online", true)
            .await;
        self.republish_discovery().await;
        if !self.replayed.swap(true, Ordering::AcqRel) {
            self.replay_retained_states().await;
        }
    }

    /// Publishes the full retained discovery set.
    pub async fn republish_discovery(&self) {
        let messages = discovery::discovery_messages(
            &self.settings,
            &self.registry.devices(),
            &self.registry.cover_groups(),
        );
        let count = messages.len();
        for (topic, payload) in messages {
            let _ = self.mqtt.publish_json(&topic, &payload, true).await;
        }
        tracing::info!(entities = count, "discovery published");
    }

    /// Replays persisted states to the retained state topics once per
    /// process, so the platform has last-known values after a reboot.
    async fn replay_retained_states(&self) {
        let base = self.settings.mqtt.base_topic.clone();
        for (key, value) in self.store.states() {
            let Some((kind, addr)) = key.split_once(':') else {
                continue;
            };
            match kind {
                "light" => {
                    if let Ok(address) = addr.parse::<DeviceAddress>() {
                        let topic = format!(
                            "{base}/state/light/{}/{}/{}",
                            address.subnet, address.device, address.channel
                        );
                        let _ = self.mqtt.publish_json(&topic, &value, true).await;
                    }
                }
                "cover" => {
                    if let Ok(address) = addr.parse::<DeviceAddress>() {
                        let suffix = format!(
                            "{}/{}/{}",
                            address.subnet, address.device, address.channel
                        );
                        if let Some(state) = value.get("state").and_then(Value::as_str) {
                            let _ = self
                                .mqtt
                                .publish(&format!("{base}/state/cover_state/{suffix}"), state, true)
                                .await;
                        }
                        if let Some(pos) = value.get("position").and_then(Value::as_u64) {
                            let _ = self
                                .mqtt
                                .publish(
                                    &format!("{base}/state/cover_pos/{suffix}"),
                                    pos.to_string(),
                                    true,
                                )
                                .await;
                        }
                    }
                }
                "cover_group" => {
                    if let Some(state) = value.get("state").and_then(Value::as_str) {
                        let _ = self
                            .mqtt
                            .publish(&format!("{base}/state/cover_group_state/{addr}"), state, true)
                            .await;
                    }
                    if let Some(pos) = value.get("position").and_then(Value::as_u64) {
                        let _ = self
                            .mqtt
                            .publish(
                                &format!("{base}/state/cover_group_pos/{addr}"),
                                pos.to_string(),
                                true,
                            )
                            .await;
                    }
                }
                "temp" | "humidity" | "illuminance" => {
                    if let (Ok(address), Some(v)) = (
                        addr.parse::<DeviceAddress>(),
                        value.get("value").and_then(Value::as_f64),
                    ) {
                        let topic = format!(
                            "{base}/state/{kind}/{}/{}/{}",
                            address.subnet, address.device, address.channel
                        );
                        let _ = self.mqtt.publish(&topic, v.to_string(), true).await;
                    }
                }
                "dry_contact" | "pir" | "ultrasonic" | "air_quality" => {
                    if let (Ok(address), Some(state)) = (
                        addr.parse::<DeviceAddress>(),
                        value.get("state").and_then(Value::as_str),
                    ) {
                        let topic = format!(
                            "{base}/state/{kind}/{}/{}/{}",
                            address.subnet, address.device, address.channel
                        );
                        let _ = self.mqtt.publish(&topic, state, true).await;
                    }
                }
                "gas_percent" => {
                    if let (Ok(address), Some(v)) = (
                        addr.parse::<DeviceAddress>(),
                        value.get("value").and_then(Value::as_f64),
                    ) {
                        let topic = format!(
                            "{base}/state/gas_percent/{}/{}/{}",
                            address.subnet, address.device, address.channel
                        );
                        let _ = self.mqtt.publish(&topic, v.to_string(), true).await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn on_mqtt_message(self: &Arc<Self>, topic: &str, payload: &str) {
        let Some(command) = parse_command(&self.settings.mqtt.base_topic, topic, payload) else {
            return;
        };
        let result = match command {
            BridgeCommand::Light {
                address,
                on,
                brightness,
            } => self.set_light(address, on, brightness),
            BridgeCommand::Cover {
                address,
                action,
                raw,
            } => self.cover_command(address, action, raw),
            BridgeCommand::CoverPosition { address, position } => {
                self.cover_set_position(address, position)
            }
            BridgeCommand::CoverGroup {
                group_id,
                action,
                raw,
            } => self.group_command(&group_id, action, raw),
            BridgeCommand::CoverGroupPosition { group_id, position } => {
                self.group_set_position(&group_id, position)
            }
        };
        if let Err(e) = result {
            tracing::warn!(topic = %topic, error = %e, "command failed");
        }
    }

    // =====================================================================
    // Admin operations
    // =====================================================================

    /// Adds a device: persists it, announces it and publishes discovery.
    pub async fn add_device(self: &Arc<Self>, record: DeviceRecord) -> Result<DeviceRecord> {
        let record = self.registry.add(record)?;
        if let DeviceRecord::Cover(cover) = &record {
            self.covers.ensure(cover.address, Some(cover_times(cover)));
        }
        self.after_registry_change().await;
        Ok(record)
    }

    /// Patches a device (see [`DeviceRegistry::patch`]).
    pub async fn patch_device(
        self: &Arc<Self>,
        kind: DeviceKind,
        address: DeviceAddress,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<DeviceRecord> {
        let record = self.registry.patch(kind, address, updates)?;
        if let DeviceRecord::Cover(cover) = &record {
            self.covers.ensure(cover.address, Some(cover_times(cover)));
        }
        self.after_registry_change().await;
        Ok(record)
    }

    /// Moves a device to a new address, migrating state and discovery.
    pub async fn move_device(
        self: &Arc<Self>,
        kind: DeviceKind,
        from: DeviceAddress,
        to: DeviceAddress,
    ) -> Result<DeviceRecord> {
        let old = self.registry.find(kind, from).ok_or(Error::NotFound)?;
        let record = self.registry.move_to(kind, from, to)?;
        self.clear_device_topics(&old).await;
        if let DeviceRecord::Cover(cover) = &record {
            self.covers.ensure(cover.address, Some(cover_times(cover)));
        }
        self.after_registry_change().await;
        Ok(record)
    }

    /// Removes a device, its retained MQTT topics and its state.
    pub async fn remove_device(
        self: &Arc<Self>,
        kind: DeviceKind,
        address: DeviceAddress,
    ) -> Result<()> {
        let record = self.registry.find(kind, address).ok_or(Error::NotFound)?;
        self.registry.remove(kind, address)?;
        self.clear_device_topics(&record).await;
        self.after_registry_change().await;
        Ok(())
    }

    /// Removes every device, the retained topics and all state.
    pub async fn clear_devices(self: &Arc<Self>) -> Result<()> {
        let records = self.registry.devices();
        self.registry.clear()?;
        for record in &records {
            self.clear_device_topics(record).await;
        }
        self.after_registry_change().await;
        Ok(())
    }

    /// Drops duplicate device definitions.
    pub async fn dedupe_devices(self: &Arc<Self>) -> Result<crate::registry::DedupeReport> {
        let report = self.registry.dedupe()?;
        if report.removed > 0 {
            self.after_registry_change().await;
        }
        Ok(report)
    }

    /// Creates or updates a cover group.
    pub async fn upsert_cover_group(
        self: &Arc<Self>,
        id: Option<Uuid>,
        name: String,
        members: Vec<DeviceAddress>,
        icon: Option<String>,
        category: Option<String>,
    ) -> Result<CoverGroup> {
        let group = self
            .registry
            .upsert_cover_group(id, name, members, icon, category)?;
        self.hub
            .broadcast("cover_groups", serde_json::to_value(self.registry.cover_groups()).unwrap_or_default());
        self.republish_discovery().await;
        self.publish_group_state(&group).await;
        Ok(group)
    }

    /// Deletes a cover group and clears its retained topics.
    pub async fn delete_cover_group(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let group = self.registry.cover_group(id).ok_or(Error::NotFound)?;
        self.registry.delete_cover_group(id)?;
        for topic in discovery::config_topics_for_group(&self.settings, &group) {
            let _ = self.mqtt.clear_retained(&topic).await;
        }
        let base = &self.settings.mqtt.base_topic;
        let gid = id.to_string();
        let _ = self
            .mqtt
            .clear_retained(&format!("{base}/state/cover_group_state/{gid}"))
            .await;
        let _ = self
            .mqtt
            .clear_retained(&format!("{base}/state/cover_group_pos/{gid}"))
            .await;
        self.hub
            .broadcast("cover_groups", serde_json::to_value(self.registry.cover_groups()).unwrap_or_default());
        self.republish_discovery().await;
        Ok(())
    }

    async fn clear_device_topics(&self, record: &DeviceRecord) {
        for topic in discovery::config_topics_for(&self.settings, record) {
            let _ = self.mqtt.clear_retained(&topic).await;
        }
        let base = &self.settings.mqtt.base_topic;
        let a = record.address();
        let suffix = format!("{}/{}/{}", a.subnet, a.device, a.channel);
        let state_topics: Vec<String> = match record.kind() {
            DeviceKind::Light => vec![format!("{base}/state/light/{suffix}")],
            DeviceKind::Cover => vec![
                format!("{base}/state/cover_state/{suffix}"),
                format!("{base}/state/cover_pos/{suffix}"),
            ],
            DeviceKind::Temp => vec![format!("{base}/state/temp/{suffix}")],
            DeviceKind::Humidity => vec![format!("{base}/state/humidity/{suffix}")],
            DeviceKind::Illuminance => vec![format!("{base}/state/illuminance/{suffix}")],
            DeviceKind::DryContact => vec![
                format!("{base}/state/dry_contact/{suffix}"),
                format!("{base}/state/dry_contact_attr/{suffix}"),
            ],
            DeviceKind::Air => vec![
                format!("{base}/state/air_quality/{suffix}"),
                format!("{base}/state/gas_percent/{suffix}"),
            ],
            DeviceKind::Pir => vec![format!("{base}/state/pir/{suffix}")],
            DeviceKind::Ultrasonic => vec![format!("{base}/state/ultrasonic/{suffix}")],
        };
        for topic in state_topics {
            let _ = self.mqtt.clear_retained(&topic).await;
        }
    }

    async fn after_registry_change(&self) {
        self.hub.broadcast(
            "devices",
            serde_json::to_value(self.registry.devices()).unwrap_or_default(),
        );
        self.republish_discovery().await;
    }

    // =====================================================================
    // Realtime
    // =====================================================================

    /// Initial snapshot for a new WebSocket client.
    #[must_use]
    pub fn snapshot_event(&self) -> RealtimeEvent {
        let state = self.store.snapshot();
        let covers: Vec<Value> = self
            .covers
            .snapshot()
            .into_iter()
            .map(|u| {
                json!({
                    "subnet_id": u.address.subnet,
                    "device_id": u.address.device,
                    "channel": u.address.channel,
                    "state": u.view.state.as_str(),
                    "position": u.view.position,
                })
            })
            .collect();
        RealtimeEvent {
            kind: "snapshot".to_string(),
            data: json!({
                "devices": state.devices,
                "states": state.states,
                "cover_groups": state.ui.cover_groups,
                "ui": state.ui,
                "covers": covers,
                "gateway": {
                    "ready": self.transport.ready(),
                    "peer_tx": self.transport.peer_tx().to_string(),
                    "peer_rx": self.transport.peer_rx().map(|p| p.to_string()),
                },
            }),
        }
    }

    /// Publishes `availability=offline` and stops all workers.
    pub async fn shutdown(&self) {
        let base = &self.settings.mqtt.base_topic;
        let _ = self
            .mqtt
            .publish(&format!("{base}/availability"), "offline", true)
            .await;
        self.mqtt.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("devices", &self.registry.devices().len())
            .finish_non_exhaustive()
    }
}

fn cover_times(cover: &crate::registry::Cover) -> CoverTimes {
    CoverTimes {
        up: Duration::from_secs_f64(cover.opening_time_up_s.max(1.0)),
        down: Duration::from_secs_f64(cover.opening_time_down_s.max(1.0)),
        start_delay: Duration::from_secs_f64(cover.start_delay_s.max(0.0)),
    }
}

fn temp_value(sensor: &Sensor, raw: TempReading) -> Option<f64> {
    match raw {
        TempReading::Float(v) => match sensor.format {
            SensorFormat::Auto | SensorFormat::Float32Le => Some(f64::from(v)),
            SensorFormat::Uint8 | SensorFormat::Uint16Le => None,
        },
        TempReading::Short(v) => match sensor.format {
            SensorFormat::Float32Le => None,
            SensorFormat::Auto | SensorFormat::Uint8 | SensorFormat::Uint16Le => {
                let scale = sensor.scale.unwrap_or(SHORT_TEMP_SCALE);
                let offset = sensor.offset.unwrap_or(0.0);
                Some(f64::from(v) * scale + offset)
            }
        },
    }
}

fn round_to(value: f64, decimals: u8) -> f64 {
    let factor = 10f64.powi(i32::from(decimals));
    (value * factor).round() / factor
}

/// AIR level to the textual state published for air-quality entities.
fn air_level_text(level: u8) -> &'static str {
    match level {
        0 => "clean",
        1 => "mild",
        2 => "moderate",
        3 => "severe",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(format: SensorFormat, scale: Option<f64>, offset: Option<f64>) -> Sensor {
        Sensor {
            address: DeviceAddress::new(1, 30, 1),
            name: String::new(),
            decimals: None,
            min: Some(-40.0),
            max: Some(100.0),
            scale,
            offset,
            format,
            category: None,
            icon: None,
        }
    }

    #[test]
    fn temp_value_float_form() {
        let s = sensor(SensorFormat::Auto, None, None);
        assert_eq!(temp_value(&s, TempReading::Float(21.5)), Some(21.5));
    }

    #[test]
    fn temp_value_short_form_default_scale() {
        let s = sensor(SensorFormat::Auto, None, None);
        assert_eq!(temp_value(&s, TempReading::Short(43)), Some(21.5));
    }

    #[test]
    fn temp_value_short_form_custom_scale_offset() {
        let s = sensor(SensorFormat::Uint8, Some(0.1), Some(-2.0));
        assert_eq!(temp_value(&s, TempReading::Short(250)), Some(23.0));
    }

    #[test]
    fn temp_value_format_gates() {
        let s = sensor(SensorFormat::Float32Le, None, None);
        assert!(temp_value(&s, TempReading::Short(43)).is_none());
        let s = sensor(SensorFormat::Uint8, None, None);
        assert!(temp_value(&s, TempReading::Float(21.5)).is_none());
    }

    #[test]
    fn round_to_decimals() {
        assert!((round_to(21.456, 1) - 21.5).abs() < f64::EPSILON);
        assert!((round_to(21.456, 0) - 21.0).abs() < f64::EPSILON);
        assert!((round_to(21.456, 2) - 21.46).abs() < f64::EPSILON);
    }

    #[test]
    fn air_level_mapping() {
        assert_eq!(air_level_text(0), "clean");
        assert_eq!(air_level_text(1), "mild");
        assert_eq!(air_level_text(2), "moderate");
        assert_eq!(air_level_text(3), "severe");
        assert_eq!(air_level_text(9), "unknown");
    }

    #[test]
    fn cover_times_floor() {
        let cover = crate::registry::Cover {
            address: DeviceAddress::new(1, 50, 1),
            name: String::new(),
            opening_time_up_s: 0.0,
            opening_time_down_s: 25.0,
            start_delay_s: -1.0,
            reverse_icon: false,
            category: "Cover".to_string(),
            icon: None,
            group: None,
        };
        let times = cover_times(&cover);
        assert_eq!(times.up, Duration::from_secs(1));
        assert_eq!(times.down, Duration::from_secs(25));
        assert_eq!(times.start_delay, Duration::ZERO);
    }
}
