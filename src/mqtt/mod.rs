// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT bridge: broker client, Home Assistant discovery and command
//! topic parsing.

pub mod bridge;
pub mod client;
pub mod discovery;

pub use bridge::{parse_command, BridgeCommand, GroupAction};
pub use client::{MqttClient, MqttEvent};
