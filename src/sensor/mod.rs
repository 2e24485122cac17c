// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sensor and dry-contact telegram decoding, plus the telegram sniffer.

pub mod decode;
pub mod sniffer;

pub use decode::{decode, SensorReading, TempReading};
pub use sniffer::{SnifferFilters, TelegramSniffer};
