// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BusPro Bridge - an HDL BusPro to MQTT bridge.
//!
//! The bridge connects an HDL BusPro field bus (reached through a UDP
//! gateway) to a home-automation platform speaking MQTT discovery. It
//! decodes bus telegrams, tracks lights, motorized covers, dry contacts
//! and environmental sensors, publishes retained state and discovery on
//! MQTT, accepts command topics to drive the bus, and fans realtime
//! updates out over WebSocket.
//!
//! # Architecture
//!
//! ```text
//! UDP gateway ──► codec ──► dispatcher ──► cover engine ──┐
//!      ▲                        │          sensor decode ──┤
//!      │                        │          light states  ──┤
//! send scheduler ◄── commands ◄─┴──────────────────────────┤
//!      ▲                                                   ▼
//!  MQTT cmd topics                         state store + last-value cache
//!                                                          │
//!                                     MQTT retained state + WebSocket hub
//! ```
//!
//! Covers deserve the extra machinery: BusPro curtain modules report
//! direction but not position, so position is simulated from calibrated
//! travel times, reconciled with bus confirmations, and stopped on
//! absolute deadlines (see [`cover`]).
//!
//! # Quick start
//!
//! ```no_run
//! use buspro_bridge::config::Settings;
//! use buspro_bridge::core::Core;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Settings::load(Settings::options_path()).unwrap_or_default();
//!     let core = Core::start(settings).await;
//!     // ... serve the web surface, then:
//!     core.shutdown().await;
//! }
//! ```

pub mod bus;
pub mod config;
pub mod core;
pub mod cover;
pub mod error;
pub mod mqtt;
pub mod realtime;
pub mod registry;
pub mod sensor;
pub mod store;
pub mod types;

pub use config::Settings;
pub use core::Core;
pub use error::{Error, ParseError, ProtocolError, Result, StoreError, ValueError};
pub use types::{Brightness, BusAddress, DeviceAddress, Position};
