// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-based cover position engine.
//!
//! BusPro curtain modules report movement direction but not position, so
//! position is simulated from calibrated travel times. [`motion`] holds
//! the per-cover state machine; [`engine`] drives it with deadlines,
//! confirmation fallbacks, a shared ticker and group fan-out.

pub mod engine;
pub mod motion;

pub use engine::{CoverEngine, CoverUpdate};
pub use motion::{CoverMotion, CoverPhase, CoverStateView, CoverTimes, Direction};
