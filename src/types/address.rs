// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus and device addressing.
//!
//! A BusPro installation addresses modules by `(subnet, device)` and
//! individual channels (light channels, curtain channels, sensor slots,
//! dry-contact inputs) by a third component. [`BusAddress`] identifies a
//! module on the wire; [`DeviceAddress`] identifies one logical channel
//! and is the key for registry records, state topics and coalescing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Address of a module on the bus: `(subnet, device)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    /// Subnet id (0-255).
    pub subnet: u8,
    /// Device id within the subnet (0-255).
    pub device: u8,
}

impl BusAddress {
    /// Creates a bus address.
    #[must_use]
    pub const fn new(subnet: u8, device: u8) -> Self {
        Self { subnet, device }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subnet, self.device)
    }
}

/// Address of one logical channel: `(subnet, device, channel)`.
///
/// The channel component doubles as the sensor slot for environmental
/// sensors and as the input index for dry contacts.
///
/// # Examples
///
/// ```
/// use buspro_bridge::types::DeviceAddress;
///
/// let addr = DeviceAddress::new(1, 100, 2);
/// assert_eq!(addr.to_string(), "1.100.2");
/// assert_eq!("1.100.2".parse::<DeviceAddress>().unwrap(), addr);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Subnet id (0-255).
    #[serde(rename = "subnet_id")]
    pub subnet: u8,
    /// Device id within the subnet (0-255).
    #[serde(rename = "device_id")]
    pub device: u8,
    /// Channel, sensor slot or input index (0-255).
    pub channel: u8,
}

impl DeviceAddress {
    /// Creates a device address.
    #[must_use]
    pub const fn new(subnet: u8, device: u8, channel: u8) -> Self {
        Self {
            subnet,
            device,
            channel,
        }
    }

    /// Returns the module part of the address.
    #[must_use]
    pub const fn bus(&self) -> BusAddress {
        BusAddress::new(self.subnet, self.device)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.subnet, self.device, self.channel)
    }
}

impl FromStr for DeviceAddress {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.trim().parse::<u8>().ok())
                .ok_or_else(|| ValueError::InvalidAddress(s.to_string()))
        };
        let subnet = next()?;
        let device = next()?;
        let channel = next()?;
        if parts.next().is_some() {
            return Err(ValueError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(subnet, device, channel))
    }
}
