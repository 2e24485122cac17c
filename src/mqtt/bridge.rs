// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command topic parsing.
//!
//! Command topics mirror the state topics under `cmd/`:
//!
//! ```text
//! <base>/cmd/light/<s>/<d>/<c>            ON | OFF | {"state":..,"brightness":..}
//! <base>/cmd/cover/<s>/<d>/<c>            OPEN | CLOSE | STOP
//! <base>/cmd/cover_raw/<s>/<d>/<c>        OPEN | CLOSE | STOP (no position logic)
//! <base>/cmd/cover_pos/<s>/<d>/<c>        0..100 | {"position":n}
//! <base>/cmd/cover_group/<gid>            OPEN | CLOSE | STOP
//! <base>/cmd/cover_group_raw/<gid>        OPEN | CLOSE | STOP
//! <base>/cmd/cover_group_pos/<gid>        0..100 | {"position":n}
//! ```

use crate::bus::codec::CoverAction;
use crate::types::{Brightness, DeviceAddress, Position};

/// OPEN/CLOSE/STOP keyword payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Open,
    Close,
    Stop,
}

impl GroupAction {
    fn parse(payload: &str) -> Option<Self> {
        match payload.trim().to_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSE" => Some(Self::Close),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }

    /// The equivalent wire action.
    #[must_use]
    pub const fn action(self) -> CoverAction {
        match self {
            Self::Open => CoverAction::Open,
            Self::Close => CoverAction::Close,
            Self::Stop => CoverAction::Stop,
        }
    }
}

/// A parsed command from an MQTT message.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Light {
        address: DeviceAddress,
        on: bool,
        brightness: Option<Brightness>,
    },
    Cover {
        address: DeviceAddress,
        action: GroupAction,
        /// Raw commands bypass the position engine.
        raw: bool,
    },
    CoverPosition {
        address: DeviceAddress,
        position: Position,
    },
    CoverGroup {
        group_id: String,
        action: GroupAction,
        raw: bool,
    },
    CoverGroupPosition {
        group_id: String,
        position: Position,
    },
}

/// Parses one message from a `cmd/` topic.
///
/// Returns `None` for foreign topics and malformed payloads; command
/// handling is best-effort and never errors back over MQTT.
#[must_use]
pub fn parse_command(base_topic: &str, topic: &str, payload: &str) -> Option<BridgeCommand> {
    let rest = topic
        .strip_prefix(base_topic)?
        .strip_prefix("/cmd/")?;
    let mut parts = rest.split('/');
    let kind = parts.next()?;

    match kind {
        "light" => {
            let address = address_from(&mut parts)?;
            let (on, brightness) = parse_light_payload(payload)?;
            Some(BridgeCommand::Light {
                address,
                on,
                brightness,
            })
        }
        "cover" | "cover_raw" => {
            let address = address_from(&mut parts)?;
            Some(BridgeCommand::Cover {
                address,
                action: GroupAction::parse(payload)?,
                raw: kind == "cover_raw",
            })
        }
        "cover_pos" => {
            let address = address_from(&mut parts)?;
            Some(BridgeCommand::CoverPosition {
                address,
                position: parse_position_payload(payload)?,
            })
        }
        "cover_group" | "cover_group_raw" => {
            let group_id = parts.next().filter(|g| !g.is_empty())?.to_string();
            Some(BridgeCommand::CoverGroup {
                group_id,
                action: GroupAction::parse(payload)?,
                raw: kind == "cover_group_raw",
            })
        }
        "cover_group_pos" => {
            let group_id = parts.next().filter(|g| !g.is_empty())?.to_string();
            Some(BridgeCommand::CoverGroupPosition {
                group_id,
                position: parse_position_payload(payload)?,
            })
        }
        _ => None,
    }
}

fn address_from(parts: &mut std::str::Split<'_, char>) -> Option<DeviceAddress> {
    let subnet = parts.next()?.parse().ok()?;
    let device = parts.next()?.parse().ok()?;
    let channel = parts.next()?.parse().ok()?;
    Some(DeviceAddress::new(subnet, device, channel))
}

/// Parses a light payload: plain `ON`/`OFF` or the JSON schema used by
/// the discovery config (`{"state":"ON","brightness":128}`).
fn parse_light_payload(payload: &str) -> Option<(bool, Option<Brightness>)> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    if payload.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let on = value
            .get("state")
            .and_then(|s| s.as_str())
            .map_or(true, |s| !s.eq_ignore_ascii_case("OFF"));
        let brightness = value
            .get("brightness")
            .and_then(serde_json::Value::as_u64)
            .map(|b| Brightness::new(u8::try_from(b.min(255)).unwrap_or(u8::MAX)));
        return Some((on, brightness));
    }

    match payload.to_uppercase().as_str() {
        "ON" => Some((true, None)),
        "OFF" => Some((false, None)),
        _ => None,
    }
}

/// Parses a set-position payload: a bare number or `{"position":n}`.
fn parse_position_payload(payload: &str) -> Option<Position> {
    let payload = payload.trim();
    let raw = if payload.starts_with('{') {
        serde_json::from_str::<serde_json::Value>(payload)
            .ok()?
            .get("position")?
            .as_f64()?
    } else {
        payload.parse::<f64>().ok()?
    };
    if !raw.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(Position::clamped(raw.round().clamp(0.0, 100.0) as u8))
}

/// The command subscriptions the bridge maintains.
#[must_use]
pub fn command_subscriptions(base_topic: &str) -> Vec<String> {
    [
        "cmd/light/+/+/+",
        "cmd/cover/+/+/+",
        "cmd/cover_raw/+/+/+",
        "cmd/cover_pos/+/+/+",
        "cmd/cover_group/+",
        "cmd/cover_group_raw/+",
        "cmd/cover_group_pos/+",
    ]
    .iter()
    .map(|suffix| format!("{base_topic}/{suffix}"))
    .collect()
}
