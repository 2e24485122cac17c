// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Brightness type for dimmable lights.
//!
//! MQTT light entities report brightness on a 0-255 scale while the bus
//! drives channels with a 0-100 percentage. This type owns that mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Brightness on the MQTT 0-255 scale.
///
/// The bus-side percentage is derived with rounding; any non-zero
/// brightness maps to at least 1% so a light asked to be on cannot be
/// driven to 0 by rounding.
///
/// # Examples
///
/// ```
/// use buspro_bridge::types::Brightness;
///
/// assert_eq!(Brightness::new(128).percent(), 50);
/// assert_eq!(Brightness::new(1).percent(), 1);
/// assert_eq!(Brightness::new(0).percent(), 0);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Brightness(u8);

impl Brightness {
    /// Minimum brightness (off).
    pub const MIN: Self = Self(0);

    /// Maximum brightness.
    pub const MAX: Self = Self(255);

    /// Creates a brightness value. All u8 values are valid.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Returns the raw 0-255 value.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Returns the bus-side percentage (0-100).
    ///
    /// Rounds to nearest, clamping non-zero values to at least 1.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.0 == 0 {
            return 0;
        }
        let pct = (u32::from(self.0) * 100 + 127) / 255;
        #[allow(clippy::cast_possible_truncation)]
        let pct = pct as u8;
        pct.max(1)
    }

    /// Creates a brightness from a bus-side percentage, clamping to 100.
    #[must_use]
    pub fn from_percent(percent: u8) -> Self {
        let pct = u32::from(percent.min(100));
        #[allow(clippy::cast_possible_truncation)]
        Self(((pct * 255 + 50) / 100) as u8)
    }

    /// Whether this brightness represents an "on" level.
    #[must_use]
    pub const fn is_on(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Brightness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/255", self.0)
    }
}

impl From<u8> for Brightness {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
