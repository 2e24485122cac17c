// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BusPro frame codec.
//!
//! HDL BusPro telegrams travel inside UDP datagrams with this layout:
//!
//! ```text
//! offset  0..4   sender IPv4 (stamped by the sender; replies go there)
//! offset  4..14  literal "HDLMIRACLE"
//! offset 14..16  0xAA 0xAA
//! offset 16      length of the data package (11 + payload length)
//! offset 17      source subnet id
//! offset 18      source device id
//! offset 19..21  source device type (big endian)
//! offset 21..23  operate code (big endian)
//! offset 23      target subnet id
//! offset 24      target device id
//! offset 25..    payload
//! last 2 bytes   CRC-16/CCITT over frame[16..] excluding the CRC itself
//! ```
//!
//! [`decode`] validates the header, length and CRC and yields a
//! [`Telegram`]; [`raw_opcode`] peeks the 2-byte opcode without any
//! validation so frames that fail to decode can still be traced.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::ParseError;
use crate::types::BusAddress;

/// Frame marker following the sender IP.
const MAGIC: &[u8] = b"HDLMIRACLE\xaa\xaa";

/// Offset of the length byte, i.e. the first byte covered by the CRC.
const INDEX_LENGTH: usize = 16;

/// Offset of the 2-byte operate code within the datagram.
const INDEX_OPERATE_CODE: usize = 21;

/// Offset of the first payload byte.
const INDEX_CONTENT: usize = 25;

/// Device type stamped into frames originated by this bridge.
const BRIDGE_DEVICE_TYPE: u16 = 0xFFFC;

/// Source address stamped into frames originated by this bridge.
const BRIDGE_SOURCE: BusAddress = BusAddress::new(200, 200);

/// Operate codes the bridge understands.
///
/// Everything else decodes as [`OperateCode::Unknown`]; unknown opcodes are
/// not errors, they are simply traced and offered to the sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperateCode {
    /// Drive a light channel to a percentage.
    SingleChannelControl,
    /// Ack/echo of a light channel command.
    SingleChannelControlResponse,
    /// Request the level of all channels of a module.
    ReadStatusOfChannels,
    /// Per-channel levels of a module.
    ReadStatusOfChannelsResponse,
    /// Drive a curtain channel (stop/open/close).
    CurtainSwitchControl,
    /// Ack/echo of a curtain command (also emitted for panel presses).
    CurtainSwitchControlResponse,
    /// Request the state of a curtain channel.
    ReadCurtainStatus,
    /// State of a curtain channel.
    CurtainSwitchStatusResponse,
    /// Periodic temperature broadcast.
    BroadcastTemperatureResponse,
    /// Combined sensor status of 12-in-1 modules.
    ReadSensorsInOneStatusResponse,
    /// Sensor status (illuminance/presence variants).
    ReadSensorStatusResponse,
    /// Unsolicited sensor status broadcast.
    BroadcastSensorStatusAutoResponse,
    /// Dry-contact / panel input state.
    ControlPanelACResponse,
    /// Any opcode the bridge does not interpret.
    Unknown(u16),
}

impl OperateCode {
    /// Maps a raw 16-bit opcode.
    #[must_use]
    pub const fn from_u16(raw: u16) -> Self {
        match raw {
            0x0031 => Self::SingleChannelControl,
            0x0032 => Self::SingleChannelControlResponse,
            0x0033 => Self::ReadStatusOfChannels,
            0x0034 => Self::ReadStatusOfChannelsResponse,
            0xE3E0 => Self::CurtainSwitchControl,
            0xE3E1 => Self::CurtainSwitchControlResponse,
            0xE3E2 => Self::ReadCurtainStatus,
            0xE3E3 => Self::CurtainSwitchStatusResponse,
            0xE3E5 => Self::BroadcastTemperatureResponse,
            0x1605 => Self::ReadSensorsInOneStatusResponse,
            0x1646 => Self::ReadSensorStatusResponse,
            0x1647 => Self::BroadcastSensorStatusAutoResponse,
            0xE3D9 => Self::ControlPanelACResponse,
            other => Self::Unknown(other),
        }
    }

    /// Returns the raw 16-bit opcode.
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        match self {
            Self::SingleChannelControl => 0x0031,
            Self::SingleChannelControlResponse => 0x0032,
            Self::ReadStatusOfChannels => 0x0033,
            Self::ReadStatusOfChannelsResponse => 0x0034,
            Self::CurtainSwitchControl => 0xE3E0,
            Self::CurtainSwitchControlResponse => 0xE3E1,
            Self::ReadCurtainStatus => 0xE3E2,
            Self::CurtainSwitchStatusResponse => 0xE3E3,
            Self::BroadcastTemperatureResponse => 0xE3E5,
            Self::ReadSensorsInOneStatusResponse => 0x1605,
            Self::ReadSensorStatusResponse => 0x1646,
            Self::BroadcastSensorStatusAutoResponse => 0x1647,
            Self::ControlPanelACResponse => 0xE3D9,
            Self::Unknown(other) => *other,
        }
    }
}

impl fmt::Display for OperateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "raw:0x{raw:04x}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Curtain command values carried in the second payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoverAction {
    /// Stop (also reported as "no movement" by some gateways).
    Stop = 0,
    /// Open / move up.
    Open = 1,
    /// Close / move down.
    Close = 2,
}

impl CoverAction {
    /// Maps a raw status byte; values outside 0..=2 are unknown.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Stop),
            1 => Some(Self::Open),
            2 => Some(Self::Close),
            _ => None,
        }
    }
}

/// A decoded BusPro telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Module the telegram originates from.
    pub source: BusAddress,
    /// Module the telegram targets (255.255 broadcasts).
    pub target: BusAddress,
    /// Source device type, verbatim from the frame.
    pub device_type: u16,
    /// Operate code.
    pub opcode: OperateCode,
    /// Opcode-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Telegram {
    /// Builds a command telegram originated by the bridge.
    #[must_use]
    pub fn command(target: BusAddress, opcode: OperateCode, payload: Vec<u8>) -> Self {
        Self {
            source: BRIDGE_SOURCE,
            target,
            device_type: BRIDGE_DEVICE_TYPE,
            opcode,
            payload,
        }
    }

    /// Light channel command: drive `channel` to `percent` immediately.
    #[must_use]
    pub fn single_channel_control(target: BusAddress, channel: u8, percent: u8) -> Self {
        Self::command(
            target,
            OperateCode::SingleChannelControl,
            vec![channel, percent.min(100), 0, 0],
        )
    }

    /// Request the level of every channel of a module.
    #[must_use]
    pub fn read_status_of_channels(target: BusAddress) -> Self {
        Self::command(target, OperateCode::ReadStatusOfChannels, Vec::new())
    }

    /// Curtain channel command.
    #[must_use]
    pub fn curtain_switch_control(target: BusAddress, channel: u8, action: CoverAction) -> Self {
        Self::command(
            target,
            OperateCode::CurtainSwitchControl,
            vec![channel, action as u8],
        )
    }

    /// Request the state of a curtain channel.
    #[must_use]
    pub fn read_curtain_status(target: BusAddress, channel: u8) -> Self {
        Self::command(target, OperateCode::ReadCurtainStatus, vec![channel])
    }
}

/// Decodes a datagram into a [`Telegram`].
///
/// # Errors
///
/// Returns a [`ParseError`] when the frame is truncated, does not carry the
/// HDL header, declares an impossible length or fails the CRC check.
pub fn decode(data: &[u8]) -> Result<Telegram, ParseError> {
    if data.len() < INDEX_CONTENT + 2 {
        return Err(ParseError::Truncated(data.len()));
    }
    if &data[4..16] != MAGIC {
        return Err(ParseError::BadHeader);
    }

    let declared = data[INDEX_LENGTH] as usize;
    if declared < 11 || data.len() < INDEX_LENGTH + declared {
        return Err(ParseError::BadLength {
            declared,
            actual: data.len(),
        });
    }

    let frame = &data[INDEX_LENGTH..INDEX_LENGTH + declared];
    let crc_expected = u16::from_be_bytes([frame[declared - 2], frame[declared - 1]]);
    if crc16(&frame[..declared - 2]) != crc_expected {
        return Err(ParseError::Crc);
    }

    let payload_len = declared - 11;
    let raw_opcode = u16::from_be_bytes([data[INDEX_OPERATE_CODE], data[INDEX_OPERATE_CODE + 1]]);

    Ok(Telegram {
        source: BusAddress::new(data[17], data[18]),
        target: BusAddress::new(data[23], data[24]),
        device_type: u16::from_be_bytes([data[19], data[20]]),
        opcode: OperateCode::from_u16(raw_opcode),
        payload: data[INDEX_CONTENT..INDEX_CONTENT + payload_len].to_vec(),
    })
}

/// Encodes a telegram into a datagram, stamping `local_ip` into the header.
#[must_use]
pub fn encode(telegram: &Telegram, local_ip: Ipv4Addr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INDEX_CONTENT + telegram.payload.len() + 2);
    buf.extend_from_slice(&local_ip.octets());
    buf.extend_from_slice(MAGIC);

    // length byte truncation cannot happen: payloads never approach 244 bytes
    #[allow(clippy::cast_possible_truncation)]
    buf.push((11 + telegram.payload.len()) as u8);
    buf.push(telegram.source.subnet);
    buf.push(telegram.source.device);
    buf.extend_from_slice(&telegram.device_type.to_be_bytes());
    buf.extend_from_slice(&telegram.opcode.as_u16().to_be_bytes());
    buf.push(telegram.target.subnet);
    buf.push(telegram.target.device);
    buf.extend_from_slice(&telegram.payload);

    let crc = crc16(&buf[INDEX_LENGTH..]);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Reads the raw 2-byte opcode without validating the frame.
///
/// Used to trace frames that fail to decode as `raw:0x....`.
#[must_use]
pub fn raw_opcode(data: &[u8]) -> Option<u16> {
    if data.len() < INDEX_OPERATE_CODE + 2 {
        return None;
    }
    Some(u16::from_be_bytes([
        data[INDEX_OPERATE_CODE],
        data[INDEX_OPERATE_CODE + 1],
    ]))
}

/// CRC-16/CCITT (XModem): poly 0x1021, init 0, no reflection.
fn crc16(data: &[u8]) -> u16 {
    let mut reg: u16 = 0;
    for octet in data {
        for i in 0..8 {
            let mut topbit = reg & 0x8000;
            if octet & (0x80 >> i) != 0 {
                topbit ^= 0x8000;
            }
            reg <<= 1;
            if topbit != 0 {
                reg ^= 0x1021;
            }
        }
    }
    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 10)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let telegram = Telegram::curtain_switch_control(BusAddress::new(1, 50), 1, CoverAction::Open);
        let wire = encode(&telegram, local_ip());
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, telegram);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let telegram = Telegram::read_status_of_channels(BusAddress::new(1, 100));
        let wire = encode(&telegram, local_ip());
        assert_eq!(wire.len(), 27);
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.opcode, OperateCode::ReadStatusOfChannels);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn header_carries_local_ip() {
        let telegram = Telegram::read_status_of_channels(BusAddress::new(1, 1));
        let wire = encode(&telegram, local_ip());
        assert_eq!(&wire[..4], &[192, 168, 1, 10]);
        assert_eq!(&wire[4..14], b"HDLMIRACLE");
        assert_eq!(&wire[14..16], &[0xAA, 0xAA]);
    }

    #[test]
    fn decode_rejects_bad_crc() {
        let telegram = Telegram::single_channel_control(BusAddress::new(1, 100), 2, 50);
        let mut wire = encode(&telegram, local_ip());
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert_eq!(decode(&wire), Err(ParseError::Crc));
    }

    #[test]
    fn decode_rejects_truncated() {
        assert!(matches!(decode(&[0u8; 10]), Err(ParseError::Truncated(10))));
    }

    #[test]
    fn decode_rejects_bad_header() {
        let telegram = Telegram::read_status_of_channels(BusAddress::new(1, 1));
        let mut wire = encode(&telegram, local_ip());
        wire[4] = b'X';
        assert_eq!(decode(&wire), Err(ParseError::BadHeader));
    }

    #[test]
    fn decode_rejects_short_declared_length() {
        let telegram = Telegram::read_status_of_channels(BusAddress::new(1, 1));
        let mut wire = encode(&telegram, local_ip());
        wire[16] = 60;
        assert!(matches!(decode(&wire), Err(ParseError::BadLength { .. })));
    }

    #[test]
    fn unknown_opcode_decodes() {
        let telegram = Telegram::command(
            BusAddress::new(1, 2),
            OperateCode::Unknown(0x1630),
            vec![1, 2, 3],
        );
        let wire = encode(&telegram, local_ip());
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.opcode, OperateCode::Unknown(0x1630));
        assert_eq!(decoded.opcode.to_string(), "raw:0x1630");
    }

    #[test]
    fn raw_opcode_peek() {
        let telegram = Telegram::curtain_switch_control(BusAddress::new(1, 50), 1, CoverAction::Stop);
        let wire = encode(&telegram, local_ip());
        assert_eq!(raw_opcode(&wire), Some(0xE3E0));
        assert_eq!(raw_opcode(&wire[..20]), None);
    }

    #[test]
    fn opcode_mapping_is_inverse() {
        for raw in [0x0031u16, 0x0034, 0xE3E0, 0xE3E3, 0xE3E5, 0x1605, 0x1646, 0xE3D9, 0x1630] {
            assert_eq!(OperateCode::from_u16(raw).as_u16(), raw);
        }
    }

    #[test]
    fn light_command_clamps_percent() {
        let t = Telegram::single_channel_control(BusAddress::new(1, 100), 2, 150);
        assert_eq!(t.payload, vec![2, 100, 0, 0]);
    }

    #[test]
    fn cover_action_from_raw() {
        assert_eq!(CoverAction::from_u8(0), Some(CoverAction::Stop));
        assert_eq!(CoverAction::from_u8(1), Some(CoverAction::Open));
        assert_eq!(CoverAction::from_u8(2), Some(CoverAction::Close));
        assert_eq!(CoverAction::from_u8(7), None);
    }
}
