// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cover motion state machine.
//!
//! Each cover runs through three phases:
//!
//! ```text
//! Idle ──command──► Pending ──bus confirm / fallback──► Moving ──► Idle
//! ```
//!
//! A command does not start the position interpolation immediately: some
//! motors spin up seconds after the ACK, and counting too early leaves
//! the UI ahead of the physical cover. The interpolation starts on bus
//! confirmation (or a fallback timeout), while the auto-STOP deadline
//! stays anchored to the command send time so confirmation lag cannot
//! cause overshoot.
//!
//! The machine is purely synchronous and driven with explicit `now`
//! instants; all task scheduling lives in [`super::engine`].

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::bus::codec::CoverAction;

/// Same-direction status responses within this window after a STOP are
/// replays of the last movement, not new movements.
pub const STOP_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Final position snaps to the requested target when within this margin.
const SNAP_TOLERANCE: f64 = 2.0;

/// Movement direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Open,
    Close,
}

impl Direction {
    /// The wire command for this direction.
    #[must_use]
    pub const fn action(self) -> CoverAction {
        match self {
            Self::Open => CoverAction::Open,
            Self::Close => CoverAction::Close,
        }
    }

    /// Maps a wire status value, ignoring STOP.
    #[must_use]
    pub const fn from_action(action: CoverAction) -> Option<Self> {
        match action {
            CoverAction::Open => Some(Self::Open),
            CoverAction::Close => Some(Self::Close),
            CoverAction::Stop => None,
        }
    }

    const fn endstop(self) -> f64 {
        match self {
            Self::Open => 100.0,
            Self::Close => 0.0,
        }
    }
}

/// Travel calibration of one cover.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverTimes {
    /// Full 0 -> 100 travel.
    pub up: Duration,
    /// Full 100 -> 0 travel.
    pub down: Duration,
    /// Motor spin-up delay before interpolation starts on fallback.
    pub start_delay: Duration,
}

impl Default for CoverTimes {
    fn default() -> Self {
        Self {
            up: Duration::from_secs(20),
            down: Duration::from_secs(20),
            start_delay: Duration::ZERO,
        }
    }
}

impl CoverTimes {
    fn for_direction(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Open => self.up,
            Direction::Close => self.down,
        }
    }
}

/// Reported cover state, matching the MQTT discovery state strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoverPhase {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPENING")]
    Opening,
    #[serde(rename = "CLOSING")]
    Closing,
    #[serde(rename = "STOP")]
    Stopped,
}

impl CoverPhase {
    /// The wire string for state topics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Opening => "OPENING",
            Self::Closing => "CLOSING",
            Self::Stopped => "STOP",
        }
    }
}

/// Snapshot of one cover for publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoverStateView {
    pub state: CoverPhase,
    pub position: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Pending { direction: Direction },
    Moving { direction: Direction },
}

/// What the engine must do after a pending command starts moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The existing deadline task is still valid.
    Started,
    /// The deadline had already passed (very late confirmation); a new
    /// auto-STOP must be scheduled `fire_in` from now for `generation`.
    Rescheduled { generation: u64, fire_in: Duration },
}

/// Effect of a bus telegram on the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOutcome {
    /// Nothing changed.
    Ignored,
    /// A pending command was confirmed and interpolation started.
    Confirmed(ConfirmOutcome),
    /// A movement not initiated by us started (wall panel, other
    /// controller); there is no scheduled STOP for it.
    ExternalStart { direction: Direction },
    /// Movement stopped; position frozen.
    Frozen,
}

/// Class of telegram feeding [`CoverMotion::bus_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// `CurtainSwitchControl` / `CurtainSwitchControlResponse`: a command
    /// seen on the bus (ours or a panel's).
    Control,
    /// `CurtainSwitchStatusResponse`: what the module reports. Value 0
    /// means "not moving / no info" on observed gateways.
    Status,
}

/// The per-cover state record.
#[derive(Debug, Clone)]
pub struct CoverMotion {
    times: CoverTimes,
    phase: Phase,
    /// Settled position when not interpolating.
    position: f64,
    start_pos: f64,
    requested: f64,
    start_ts: Option<Instant>,
    /// Duration of the current interpolation.
    travel: Duration,
    /// Scheduled auto-STOP instant; `None` for external movements.
    deadline: Option<Instant>,
    last_stop: Option<(Instant, Direction)>,
    /// Bumped whenever scheduled work (stop/fallback/probe) becomes stale.
    generation: u64,
}

impl CoverMotion {
    /// Creates a cover at the closed position.
    #[must_use]
    pub fn new(times: CoverTimes) -> Self {
        Self {
            times,
            phase: Phase::Idle,
            position: 0.0,
            start_pos: 0.0,
            requested: 0.0,
            start_ts: None,
            travel: Duration::ZERO,
            deadline: None,
            last_stop: None,
            generation: 0,
        }
    }

    /// Updates calibration. Existing covers keep calibrated times unless
    /// new ones are explicitly provided, so defaults never clobber a
    /// measured travel time.
    pub fn set_times(&mut self, times: CoverTimes) {
        self.times = times;
    }

    /// Current calibration.
    #[must_use]
    pub const fn times(&self) -> CoverTimes {
        self.times
    }

    /// Scheduled-work generation; tasks capture it and bail on mismatch.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the cover is interpolating.
    #[must_use]
    pub const fn is_moving(&self) -> bool {
        matches!(self.phase, Phase::Moving { .. })
    }

    /// Whether a command awaits bus confirmation.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Pending { .. })
    }

    /// Time left until the scheduled auto-STOP.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Interpolated position at `now`, 0..=100.
    #[must_use]
    pub fn current_position(&self, now: Instant) -> u8 {
        let pos = self.position_f64(now).round().clamp(0.0, 100.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            pos as u8
        }
    }

    fn position_f64(&self, now: Instant) -> f64 {
        if let (Phase::Moving { .. }, Some(start_ts)) = (self.phase, self.start_ts) {
            if !self.travel.is_zero() {
                let frac =
                    (now.duration_since(start_ts).as_secs_f64() / self.travel.as_secs_f64()).min(1.0);
                return self.start_pos + (self.requested - self.start_pos) * frac;
            }
            return self.requested;
        }
        self.position
    }

    /// Publishing view at `now`.
    #[must_use]
    pub fn view(&self, now: Instant) -> CoverStateView {
        let position = self.current_position(now);
        let state = match self.phase {
            Phase::Moving {
                direction: Direction::Open,
            } => CoverPhase::Opening,
            Phase::Moving {
                direction: Direction::Close,
            } => CoverPhase::Closing,
            Phase::Idle | Phase::Pending { .. } => match position {
                0 => CoverPhase::Closed,
                100 => CoverPhase::Open,
                _ => CoverPhase::Stopped,
            },
        };
        CoverStateView { state, position }
    }

    /// Starts a position command: picks the direction, computes the
    /// travel share and enters `Pending`. The auto-STOP deadline is
    /// anchored at `now` (the send time).
    ///
    /// Returns the direction to put on the wire, the travel duration for
    /// the deadline task and the generation guarding it.
    pub fn begin_set_position(&mut self, target: u8, now: Instant) -> MoveStart {
        let current = f64::from(self.current_position(now));
        let target = f64::from(target.min(100));
        self.generation += 1;

        let direction = if target > current {
            Direction::Open
        } else {
            Direction::Close
        };
        let share = (target - current).abs() / 100.0;
        let travel = self.times.for_direction(direction).mul_f64(share);

        self.position = current;
        self.start_pos = current;
        self.requested = target;
        self.start_ts = None;
        self.travel = travel;
        self.deadline = Some(now + travel);
        self.phase = Phase::Pending { direction };

        MoveStart {
            direction,
            travel,
            generation: self.generation,
        }
    }

    /// Moves `Pending` into `Moving` (bus confirmation or fallback).
    ///
    /// When the absolute deadline is still ahead, the interpolation is
    /// fitted to it. When the confirmation arrived after the deadline,
    /// the remaining travel is recomputed from the full distance and the
    /// engine must schedule a fresh auto-STOP.
    pub fn start_moving(&mut self, now: Instant) -> Option<ConfirmOutcome> {
        let Phase::Pending { direction } = self.phase else {
            return None;
        };
        self.start_ts = Some(now);
        self.phase = Phase::Moving { direction };

        match self.deadline {
            Some(deadline) if deadline > now => {
                self.travel = deadline - now;
                Some(ConfirmOutcome::Started)
            }
            _ => {
                let share = (self.requested - self.start_pos).abs() / 100.0;
                let travel = self.times.for_direction(direction).mul_f64(share);
                self.travel = travel;
                self.deadline = Some(now + travel);
                self.generation += 1;
                Some(ConfirmOutcome::Rescheduled {
                    generation: self.generation,
                    fire_in: travel,
                })
            }
        }
    }

    /// Applies a cover telegram.
    pub fn bus_event(&mut self, kind: BusKind, action: CoverAction, now: Instant) -> BusOutcome {
        match (kind, Direction::from_action(action)) {
            // STOP / "not moving": only meaningful while we move.
            (_, None) => {
                if matches!(self.phase, Phase::Idle) {
                    BusOutcome::Ignored
                } else {
                    self.freeze(now);
                    BusOutcome::Frozen
                }
            }
            (BusKind::Control, Some(direction)) => self.directional_event(direction, now, false),
            (BusKind::Status, Some(direction)) => self.directional_event(direction, now, true),
        }
    }

    fn directional_event(&mut self, direction: Direction, now: Instant, is_status: bool) -> BusOutcome {
        match self.phase {
            Phase::Pending {
                direction: pending_dir,
            } if pending_dir == direction => {
                if is_status {
                    // The movement really started; begin interpolating.
                    self.start_moving(now).map_or(BusOutcome::Ignored, BusOutcome::Confirmed)
                } else {
                    // Control echo is only the command ACK; wait for a
                    // status response or the fallback timer.
                    BusOutcome::Ignored
                }
            }
            Phase::Moving {
                direction: moving_dir,
            } if moving_dir == direction => BusOutcome::Ignored,
            _ => {
                // Same-direction status replays right after a STOP would
                // restart a phantom interpolation.
                if is_status {
                    if let Some((stopped_at, stop_dir)) = self.last_stop {
                        if stop_dir == direction
                            && now.duration_since(stopped_at) <= STOP_DEBOUNCE
                        {
                            return BusOutcome::Ignored;
                        }
                    }
                }
                self.external_start(direction, now)
            }
        }
    }

    /// A movement we did not command: interpolate toward the endstop
    /// without scheduling a STOP.
    fn external_start(&mut self, direction: Direction, now: Instant) -> BusOutcome {
        let current = f64::from(self.current_position(now));
        if (current - direction.endstop()).abs() < f64::EPSILON {
            return BusOutcome::Ignored;
        }
        self.generation += 1;
        self.position = current;
        self.start_pos = current;
        self.requested = direction.endstop();
        self.start_ts = Some(now);
        self.travel = self
            .times
            .for_direction(direction)
            .mul_f64((self.requested - current).abs() / 100.0);
        self.deadline = None;
        self.phase = Phase::Moving { direction };
        BusOutcome::ExternalStart { direction }
    }

    /// Stops immediately, freezing the interpolated position.
    ///
    /// Returns the frozen position.
    pub fn freeze(&mut self, now: Instant) -> u8 {
        let position = self.position_f64(now).clamp(0.0, 100.0);
        let was_direction = match self.phase {
            Phase::Moving { direction } | Phase::Pending { direction } => Some(direction),
            Phase::Idle => None,
        };
        self.generation += 1;
        self.position = position;
        self.start_ts = None;
        self.deadline = None;
        self.phase = Phase::Idle;
        if let Some(direction) = was_direction {
            self.last_stop = Some((now, direction));
        }
        self.current_position(now)
    }

    /// Completes a scheduled auto-STOP: snaps to the target when within
    /// tolerance, otherwise keeps the interpolated estimate.
    ///
    /// Returns the final position.
    pub fn finish(&mut self, now: Instant) -> u8 {
        let mut position = self.position_f64(now);
        if (position - self.requested).abs() <= SNAP_TOLERANCE {
            position = self.requested;
        }
        let was_direction = match self.phase {
            Phase::Moving { direction } | Phase::Pending { direction } => Some(direction),
            Phase::Idle => None,
        };
        self.generation += 1;
        self.position = position.clamp(0.0, 100.0);
        self.start_ts = None;
        self.deadline = None;
        self.phase = Phase::Idle;
        if let Some(direction) = was_direction {
            self.last_stop = Some((now, direction));
        }
        self.current_position(now)
    }
}

/// Parameters of a freshly issued position command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveStart {
    pub direction: Direction,
    /// Estimated movement duration; the auto-STOP fires this far from
    /// the command send time.
    pub travel: Duration,
    pub generation: u64,
}
