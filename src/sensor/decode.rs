// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sensor payload decoding.
//!
//! Payload layouts are gateway-firmware dependent and were collected
//! empirically; each opcode can carry several variants. The decoder is a
//! pure function from telegram to tagged readings: device configuration
//! (scale, offset, plausibility bounds) is applied by the caller, so the
//! byte-level quirks stay testable in isolation.
//!
//! Observed layouts:
//!
//! - `BroadcastTemperatureResponse`: `[sensor_id, aux, f32le...]`, or the
//!   2-byte short form `[sensor_id, raw]` used by 12-in-1 modules.
//! - `ReadSensorsInOneStatusResponse` (0x1605), header byte 248 (245 on
//!   some firmwares): humidity at `[4]`, illuminance either 16-bit at
//!   `[2..4]` (when `[5]` is an air-quality nibble) or 24-bit at
//!   `[5..8]`, AIR level at `[5]` and gas percentage at `[6]`.
//! - raw 0x1630: like 0x1605 without the header byte.
//! - `ReadSensorStatusResponse` (0x1646): illuminance 16-bit at `[2..4]`
//!   behind a 248 header, or at `[0..2]` otherwise; presence frames
//!   carry `[248, sensor_id, 0, 0, pir, ultrasonic, ...]`.
//! - `BroadcastSensorStatusAutoResponse` (0x1647): presence as 0x1646
//!   with the sensor id in the first byte.
//! - `ControlPanelACResponse` (0xE3D9): `[x, input, value]`; the first
//!   byte varies across firmwares and must not gate acceptance.

use crate::bus::codec::{OperateCode, Telegram};

/// Marker byte that precedes 12-in-1 combined sensor payloads.
const SENSOR_HEADER: u8 = 248;

/// Raw temperature reading, before scale/offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempReading {
    /// IEEE 754 float carried in the long form.
    Float(f32),
    /// Raw byte from the short form; per-device scale applies.
    Short(u8),
}

/// A tagged reading extracted from one telegram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    Temperature {
        sensor_id: u8,
        raw: TempReading,
    },
    Humidity {
        value: u8,
    },
    Illuminance {
        lux: u32,
    },
    DryContact {
        input: u8,
        on: bool,
        /// Raw first payload byte, retained as a diagnostic attribute.
        x: u8,
    },
    /// AIR quality level (0 clean .. 3 severe).
    AirQuality {
        sensor_id: u8,
        level: u8,
    },
    /// Gas concentration percentage.
    GasPercent {
        sensor_id: u8,
        percent: u8,
    },
    /// PIR and ultrasonic presence flags of one sensor slot.
    Presence {
        sensor_id: u8,
        pir: bool,
        ultrasonic: bool,
    },
    /// Anything the bridge does not interpret; feeds the sniffer.
    Raw {
        opcode: u16,
    },
}

/// Decodes all readings carried by one telegram.
///
/// A 12-in-1 status telegram can yield humidity and illuminance at once.
/// Unknown opcodes yield a single [`SensorReading::Raw`].
#[must_use]
pub fn decode(telegram: &Telegram) -> Vec<SensorReading> {
    let payload = &telegram.payload;
    match telegram.opcode {
        OperateCode::BroadcastTemperatureResponse => decode_temperature(payload),
        OperateCode::ReadSensorsInOneStatusResponse => {
            let mut readings = Vec::new();
            if let Some(value) = humidity_1605(payload) {
                readings.push(SensorReading::Humidity { value });
            }
            if let Some(lux) = illuminance_1605(payload) {
                readings.push(SensorReading::Illuminance { lux });
            }
            readings.extend(air_1605(payload));
            readings
        }
        OperateCode::Unknown(0x1630) => {
            let mut readings = Vec::new();
            if let Some(value) = humidity_1630(payload) {
                readings.push(SensorReading::Humidity { value });
            }
            if let Some(lux) = illuminance_1630(payload) {
                readings.push(SensorReading::Illuminance { lux });
            }
            readings.extend(air_1630(payload));
            readings
        }
        OperateCode::ReadSensorStatusResponse => {
            let mut readings: Vec<SensorReading> = illuminance_1646(payload)
                .map(|lux| SensorReading::Illuminance { lux })
                .into_iter()
                .collect();
            readings.extend(presence_1646(payload));
            readings
        }
        OperateCode::BroadcastSensorStatusAutoResponse => {
            presence_1647(payload).into_iter().collect()
        }
        OperateCode::ControlPanelACResponse => dry_contact(payload).into_iter().collect(),
        OperateCode::Unknown(opcode) => vec![SensorReading::Raw { opcode }],
        _ => Vec::new(),
    }
}

fn decode_temperature(payload: &[u8]) -> Vec<SensorReading> {
    if payload.len() >= 6 {
        let bytes = [payload[2], payload[3], payload[4], payload[5]];
        return vec![SensorReading::Temperature {
            sensor_id: payload[0],
            raw: TempReading::Float(f32::from_le_bytes(bytes)),
        }];
    }
    if let [sensor_id, raw] = payload {
        return vec![SensorReading::Temperature {
            sensor_id: *sensor_id,
            raw: TempReading::Short(*raw),
        }];
    }
    Vec::new()
}

fn humidity_1605(payload: &[u8]) -> Option<u8> {
    if payload.len() >= 5 && payload[0] == SENSOR_HEADER {
        let value = payload[4];
        return (value != 0xFF).then_some(value);
    }
    None
}

fn humidity_1630(payload: &[u8]) -> Option<u8> {
    if payload.len() >= 4 {
        let value = payload[3];
        return (value != 0xFF).then_some(value);
    }
    None
}

fn illuminance_1605(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 || payload[0] != SENSOR_HEADER {
        return None;
    }
    let lux16 = match (payload[2], payload[3]) {
        (0xFF, 0xFF) => None,
        (hi, lo) => Some((u32::from(hi) << 8) + u32::from(lo)),
    };
    let lux24 = if payload.len() >= 8 {
        match (payload[5], payload[6], payload[7]) {
            (0xFF, 0xFF, 0xFF) => None,
            (b0, b1, b2) => {
                Some((u32::from(b0) << 16) + (u32::from(b1) << 8) + u32::from(b2))
            }
        }
    } else {
        None
    };

    // When byte 5 looks like an air-quality level the module uses the
    // 16-bit layout and bytes 5..8 are not a lux field at all.
    let maybe_air = payload.get(5).copied().unwrap_or(0xFF);
    if lux16.is_some() && maybe_air <= 3 {
        lux16
    } else {
        lux24.or(lux16)
    }
}

fn illuminance_1630(payload: &[u8]) -> Option<u32> {
    if payload.len() < 7 {
        return None;
    }
    match (payload[4], payload[5], payload[6]) {
        (0xFF, 0xFF, 0xFF) => None,
        (b0, b1, b2) => Some((u32::from(b0) << 16) + (u32::from(b1) << 8) + u32::from(b2)),
    }
}

fn illuminance_1646(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    let (hi, lo) = if payload[0] == SENSOR_HEADER {
        (payload[2], payload[3])
    } else {
        (payload[0], payload[1])
    };
    if hi == 0xFF && lo == 0xFF {
        return None;
    }
    Some((u32::from(hi) << 8) + u32::from(lo))
}

fn air_1605(payload: &[u8]) -> Vec<SensorReading> {
    // Header 248 or 245 depending on firmware; it doubles as the
    // sensor id the air device is configured with.
    if payload.len() < 7 || !matches!(payload[0], SENSOR_HEADER | 245) {
        return Vec::new();
    }
    air_readings(payload[0], payload[5], payload[6])
}

fn air_1630(payload: &[u8]) -> Vec<SensorReading> {
    if payload.len() < 6 {
        return Vec::new();
    }
    // No header byte on this variant; modules report as slot 248.
    air_readings(SENSOR_HEADER, payload[4], payload[5])
}

fn air_readings(sensor_id: u8, level: u8, percent: u8) -> Vec<SensorReading> {
    let mut readings = Vec::new();
    if level != 0xFF {
        readings.push(SensorReading::AirQuality { sensor_id, level });
    }
    if percent != 0xFF {
        readings.push(SensorReading::GasPercent { sensor_id, percent });
    }
    readings
}

fn presence_1646(payload: &[u8]) -> Option<SensorReading> {
    if payload.len() < 6 || payload[0] != SENSOR_HEADER {
        return None;
    }
    Some(SensorReading::Presence {
        sensor_id: payload[1],
        pir: payload[4] != 0,
        ultrasonic: payload[5] != 0,
    })
}

fn presence_1647(payload: &[u8]) -> Option<SensorReading> {
    if payload.len() < 6 {
        return None;
    }
    Some(SensorReading::Presence {
        sensor_id: payload[0],
        pir: payload[4] != 0,
        ultrasonic: payload[5] != 0,
    })
}

fn dry_contact(payload: &[u8]) -> Option<SensorReading> {
    let [x, input, value, ..] = payload else {
        return None;
    };
    let on = match value {
        1 => true,
        0 => false,
        _ => return None,
    };
    Some(SensorReading::DryContact {
        input: *input,
        on,
        x: *x,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusAddress;

    fn telegram(opcode: OperateCode, payload: Vec<u8>) -> Telegram {
        Telegram {
            source: BusAddress::new(1, 30),
            target: BusAddress::new(255, 255),
            device_type: 0,
            opcode,
            payload,
        }
    }

    #[test]
    fn temperature_float_form() {
        let mut payload = vec![1, 0];
        payload.extend_from_slice(&21.5f32.to_le_bytes());
        let readings = decode(&telegram(OperateCode::BroadcastTemperatureResponse, payload));
        assert_eq!(
            readings,
            vec![SensorReading::Temperature {
                sensor_id: 1,
                raw: TempReading::Float(21.5)
            }]
        );
    }

    #[test]
    fn temperature_short_form() {
        let readings = decode(&telegram(
            OperateCode::BroadcastTemperatureResponse,
            vec![2, 43],
        ));
        assert_eq!(
            readings,
            vec![SensorReading::Temperature {
                sensor_id: 2,
                raw: TempReading::Short(43)
            }]
        );
    }

    #[test]
    fn temperature_odd_length_yields_nothing() {
        assert!(decode(&telegram(OperateCode::BroadcastTemperatureResponse, vec![2, 43, 1])).is_empty());
    }

    #[test]
    fn combined_sensor_humidity_and_lux16() {
        // MASLA layout: humidity 55, lux16 = 0x0196 = 406, air nibble at [5].
        let payload = vec![248, 44, 0x01, 0x96, 55, 1, 20, 0, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(readings.contains(&SensorReading::Humidity { value: 55 }));
        assert!(readings.contains(&SensorReading::Illuminance { lux: 406 }));
    }

    #[test]
    fn combined_sensor_lux24_variant() {
        // Secondary layout: 16-bit field absent (0xFFFF), 24-bit at [5..8].
        let payload = vec![248, 44, 0xFF, 0xFF, 60, 0x00, 0x03, 0x21];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(readings.contains(&SensorReading::Illuminance { lux: 0x0321 }));
    }

    #[test]
    fn combined_sensor_absent_values() {
        let payload = vec![248, 44, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(readings.is_empty());
    }

    #[test]
    fn fallback_1630_layout() {
        // Same fields shifted by one (no header byte).
        let payload = vec![44, 0, 0, 61, 0x00, 0x01, 0x2C];
        let readings = decode(&telegram(OperateCode::Unknown(0x1630), payload));
        assert!(readings.contains(&SensorReading::Humidity { value: 61 }));
        assert!(readings.contains(&SensorReading::Illuminance { lux: 300 }));
    }

    #[test]
    fn lux16_1646_with_header() {
        let payload = vec![248, 48, 0, 150, 0, 1, 0, 0, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorStatusResponse, payload));
        assert!(readings.contains(&SensorReading::Illuminance { lux: 150 }));

        let payload = vec![248, 48, 3, 33, 0, 1, 0, 0, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorStatusResponse, payload));
        assert!(readings.contains(&SensorReading::Illuminance { lux: 801 }));
    }

    #[test]
    fn lux16_1646_without_header() {
        let payload = vec![0, 150, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorStatusResponse, payload));
        assert_eq!(readings, vec![SensorReading::Illuminance { lux: 150 }]);
    }

    #[test]
    fn air_levels_from_combined_status() {
        // MASLA: AIR level at [5], gas percent at [6].
        let payload = vec![248, 44, 0x01, 0x96, 55, 2, 14, 0, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(readings.contains(&SensorReading::AirQuality {
            sensor_id: 248,
            level: 2
        }));
        assert!(readings.contains(&SensorReading::GasPercent {
            sensor_id: 248,
            percent: 14
        }));
    }

    #[test]
    fn air_accepts_245_header() {
        let payload = vec![245, 44, 0, 0, 0, 1, 9];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(readings.contains(&SensorReading::AirQuality {
            sensor_id: 245,
            level: 1
        }));
    }

    #[test]
    fn air_from_1630_without_header() {
        let payload = vec![44, 0, 0, 61, 3, 80, 0x2C];
        let readings = decode(&telegram(OperateCode::Unknown(0x1630), payload));
        assert!(readings.contains(&SensorReading::AirQuality {
            sensor_id: 248,
            level: 3
        }));
        assert!(readings.contains(&SensorReading::GasPercent {
            sensor_id: 248,
            percent: 80
        }));
    }

    #[test]
    fn air_absent_values_are_skipped() {
        let payload = vec![248, 44, 0, 0, 0, 0xFF, 0xFF];
        let readings = decode(&telegram(OperateCode::ReadSensorsInOneStatusResponse, payload));
        assert!(!readings
            .iter()
            .any(|r| matches!(r, SensorReading::AirQuality { .. } | SensorReading::GasPercent { .. })));
    }

    #[test]
    fn presence_from_1646() {
        let payload = vec![248, 3, 0, 0, 1, 0, 0, 0];
        let readings = decode(&telegram(OperateCode::ReadSensorStatusResponse, payload));
        assert!(readings.contains(&SensorReading::Presence {
            sensor_id: 3,
            pir: true,
            ultrasonic: false
        }));
    }

    #[test]
    fn presence_from_1647_broadcast() {
        let payload = vec![5, 0, 0, 0, 0, 1];
        let readings = decode(&telegram(
            OperateCode::BroadcastSensorStatusAutoResponse,
            payload,
        ));
        assert_eq!(
            readings,
            vec![SensorReading::Presence {
                sensor_id: 5,
                pir: false,
                ultrasonic: true
            }]
        );
    }

    #[test]
    fn presence_1646_requires_header() {
        let payload = vec![7, 3, 0, 0, 1, 1];
        let readings = decode(&telegram(OperateCode::ReadSensorStatusResponse, payload));
        assert!(!readings
            .iter()
            .any(|r| matches!(r, SensorReading::Presence { .. })));
    }

    #[test]
    fn dry_contact_on_off() {
        let readings = decode(&telegram(OperateCode::ControlPanelACResponse, vec![9, 1, 1]));
        assert_eq!(
            readings,
            vec![SensorReading::DryContact {
                input: 1,
                on: true,
                x: 9
            }]
        );

        let readings = decode(&telegram(OperateCode::ControlPanelACResponse, vec![0, 2, 0]));
        assert_eq!(
            readings,
            vec![SensorReading::DryContact {
                input: 2,
                on: false,
                x: 0
            }]
        );
    }

    #[test]
    fn dry_contact_first_byte_never_gates() {
        // Firmware variants put arbitrary values in the first byte.
        for x in [0u8, 1, 9, 0x55, 0xFF] {
            let readings = decode(&telegram(OperateCode::ControlPanelACResponse, vec![x, 1, 1]));
            assert_eq!(readings.len(), 1, "x={x} must not gate acceptance");
        }
    }

    #[test]
    fn dry_contact_unknown_value_ignored() {
        assert!(decode(&telegram(OperateCode::ControlPanelACResponse, vec![0, 1, 7])).is_empty());
    }

    #[test]
    fn unknown_opcode_is_raw() {
        let readings = decode(&telegram(OperateCode::Unknown(0xBEEF), vec![1, 2]));
        assert_eq!(readings, vec![SensorReading::Raw { opcode: 0xBEEF }]);
    }

    #[test]
    fn known_non_sensor_opcode_yields_nothing() {
        assert!(decode(&telegram(OperateCode::SingleChannelControlResponse, vec![1, 1, 50])).is_empty());
    }
}
