// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cover position type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Cover position as a percentage: 0 = fully closed, 100 = fully open.
///
/// # Examples
///
/// ```
/// use buspro_bridge::types::Position;
///
/// let pos = Position::new(50).unwrap();
/// assert_eq!(pos.value(), 50);
/// assert!(Position::new(101).is_err());
/// assert_eq!(Position::clamped(150), Position::OPEN);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(u8);

impl Position {
    /// Fully closed.
    pub const CLOSED: Self = Self(0);

    /// Fully open.
    pub const OPEN: Self = Self(100);

    /// Creates a position value.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::OutOfRange` if value exceeds 100.
    pub fn new(value: u8) -> Result<Self, ValueError> {
        if value > 100 {
            return Err(ValueError::OutOfRange {
                min: 0,
                max: 100,
                actual: u16::from(value),
            });
        }
        Ok(Self(value))
    }

    /// Creates a position, clamping values above 100.
    #[must_use]
    pub const fn clamped(value: u8) -> Self {
        if value > 100 { Self(100) } else { Self(value) }
    }

    /// Returns the percentage value.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Whether the cover is at the closed endstop.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.0 == 0
    }

    /// Whether the cover is at the open endstop.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.0 == 100
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl TryFrom<u8> for Position {
    type Error = ValueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_range() {
        for v in 0..=100 {
            assert_eq!(Position::new(v).unwrap().value(), v);
        }
    }

    #[test]
    fn out_of_range() {
        assert!(Position::new(101).is_err());
        assert!(Position::new(255).is_err());
    }

    #[test]
    fn clamped() {
        assert_eq!(Position::clamped(150).value(), 100);
        assert_eq!(Position::clamped(42).value(), 42);
    }

    #[test]
    fn endstops() {
        assert!(Position::CLOSED.is_closed());
        assert!(Position::OPEN.is_open());
        assert!(!Position::new(50).unwrap().is_closed());
    }

    #[test]
    fn display() {
        assert_eq!(Position::new(75).unwrap().to_string(), "75%");
    }
}
