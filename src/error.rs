// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the BusPro bridge.
//!
//! This module provides a comprehensive error hierarchy for handling failures
//! across the bridge: value validation, bus and MQTT transport, telegram
//! parsing, and state persistence.

use thiserror::Error;

/// The main error type for this crate.
///
/// This enum encompasses all possible errors that can occur while bridging
/// a BusPro installation to MQTT.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred during value validation.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Error occurred on the UDP or MQTT transport.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred while parsing a telegram or payload.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Error occurred while reading or writing the state store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A device with the same kind and address already exists.
    #[error("duplicate address")]
    Conflict,

    /// Device or cover group was not found.
    #[error("not found")]
    NotFound,
}

/// Errors related to value validation and constraints.
///
/// These errors occur when attempting to create constrained types
/// with invalid values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A numeric value is outside the allowed range.
    #[error("value {actual} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Minimum allowed value.
        min: u16,
        /// Maximum allowed value.
        max: u16,
        /// The actual value that was provided.
        actual: u16,
    },

    /// A device address component could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A field required by a device kind is missing or empty.
    #[error("invalid field {field}: {message}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },
}

/// Errors related to transport (UDP bus / MQTT broker).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The UDP socket never bound; commands cannot reach the bus.
    #[error("UDP not ready")]
    TransportNotReady,

    /// Sending a datagram failed at the socket level.
    #[error("UDP send failed: {0}")]
    UdpSend(#[from] std::io::Error),

    /// MQTT connection or communication failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to decoding BusPro telegrams and payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram is too short to contain a full frame.
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    /// The frame does not carry the expected header constant.
    #[error("bad frame header")]
    BadHeader,

    /// The declared payload length does not fit the datagram.
    #[error("bad frame length {declared} for {actual} bytes")]
    BadLength {
        /// Length byte carried in the frame.
        declared: usize,
        /// Actual datagram size.
        actual: usize,
    },

    /// CRC check failed.
    #[error("crc mismatch")]
    Crc,
}

/// Errors related to the persistent JSON store.
///
/// Reads recover automatically by quarantining a corrupt file, so only
/// write failures surface here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writing the temporary file or renaming it over the store failed.
    #[error("persist failed: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory state could not be serialized.
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
