// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cover engine: schedules movements, confirmations and stops.
//!
//! The engine owns one [`CoverMotion`] per cover and drives it with
//! absolute deadlines:
//!
//! - a position command enqueues OPEN/CLOSE through the send scheduler
//!   and schedules the auto-STOP at `send time + travel`,
//! - a confirmation fallback starts the interpolation when the bus stays
//!   silent,
//! - short probes request status while a command is unconfirmed,
//! - one shared ticker animates positions and paces status polls while
//!   anything moves.
//!
//! Every scheduled task captures the motion generation and quietly
//! expires when a newer command replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::codec::{CoverAction, OperateCode, Telegram};
use crate::bus::scheduler::{CommandKind, Job, SendScheduler};
use crate::cover::motion::{
    BusKind, BusOutcome, ConfirmOutcome, CoverMotion, CoverPhase, CoverStateView, CoverTimes,
};
use crate::registry::DeviceKind;
use crate::types::{DeviceAddress, Position};

/// Give up waiting for a movement confirmation after this long.
const CONFIRM_FALLBACK: Duration = Duration::from_millis(2500);

/// Status probe schedule while a command is unconfirmed.
const PENDING_PROBES: [Duration; 3] = [
    Duration::from_millis(350),
    Duration::from_millis(900),
    Duration::from_millis(1800),
];

/// Position broadcast cadence while moving.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Status poll cadence while moving.
const MOVING_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Suspend polls this close to the scheduled stop: a queued poll could
/// delay the STOP and let the cover run past the target.
const POLL_SUSPEND_WINDOW: Duration = Duration::from_millis(2800);

/// State change notification for the publish paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverUpdate {
    pub address: DeviceAddress,
    pub view: CoverStateView,
}

/// The cover engine.
pub struct CoverEngine {
    covers: Mutex<HashMap<DeviceAddress, CoverMotion>>,
    scheduler: Arc<SendScheduler>,
    updates: mpsc::UnboundedSender<CoverUpdate>,
    ticker_live: AtomicBool,
}

impl CoverEngine {
    /// Creates the engine; `updates` receives every state change worth
    /// publishing (consumers dedupe).
    #[must_use]
    pub fn new(
        scheduler: Arc<SendScheduler>,
        updates: mpsc::UnboundedSender<CoverUpdate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            covers: Mutex::new(HashMap::new()),
            scheduler,
            updates,
            ticker_live: AtomicBool::new(false),
        })
    }

    /// Registers a cover or updates its calibration.
    ///
    /// Passing `None` keeps existing times: re-ensuring a cover from a
    /// command path must not overwrite a measured calibration with
    /// defaults.
    pub fn ensure(&self, address: DeviceAddress, times: Option<CoverTimes>) {
        let mut covers = self.covers.lock();
        match covers.get_mut(&address) {
            Some(motion) => {
                if let Some(times) = times {
                    motion.set_times(times);
                }
            }
            None => {
                covers.insert(address, CoverMotion::new(times.unwrap_or_default()));
            }
        }
    }

    /// Snapshot of every known cover.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CoverUpdate> {
        let now = Instant::now();
        self.covers
            .lock()
            .iter()
            .map(|(address, motion)| CoverUpdate {
                address: *address,
                view: motion.view(now),
            })
            .collect()
    }

    /// View of a single cover.
    #[must_use]
    pub fn view(&self, address: DeviceAddress) -> Option<CoverStateView> {
        let now = Instant::now();
        self.covers.lock().get(&address).map(|m| m.view(now))
    }

    /// Fully open (position 100).
    pub fn open(self: &Arc<Self>, address: DeviceAddress) {
        self.set_position(address, Position::OPEN);
    }

    /// Fully close (position 0).
    pub fn close(self: &Arc<Self>, address: DeviceAddress) {
        self.set_position(address, Position::CLOSED);
    }

    /// Raw OPEN without position tracking or auto-STOP (calibration and
    /// the "no-%" entities).
    pub fn open_raw(&self, address: DeviceAddress) {
        self.ensure(address, None);
        self.scheduler.enqueue(
            DeviceKind::Cover,
            address,
            Job::new(CommandKind::Motion, command(address, CoverAction::Open)),
        );
    }

    /// Raw CLOSE without position tracking or auto-STOP.
    pub fn close_raw(&self, address: DeviceAddress) {
        self.ensure(address, None);
        self.scheduler.enqueue(
            DeviceKind::Cover,
            address,
            Job::new(CommandKind::Motion, command(address, CoverAction::Close)),
        );
    }

    /// Stops the cover, freezing the simulated position.
    pub fn stop(&self, address: DeviceAddress) {
        self.ensure(address, None);
        {
            let mut covers = self.covers.lock();
            if let Some(motion) = covers.get_mut(&address) {
                motion.freeze(Instant::now());
            }
        }
        self.enqueue_stop(address);
        self.emit(address);
    }

    /// Drives the cover to `target`.
    pub fn set_position(self: &Arc<Self>, address: DeviceAddress, target: Position) {
        self.ensure(address, None);
        let start = {
            let mut covers = self.covers.lock();
            let Some(motion) = covers.get_mut(&address) else {
                return;
            };
            motion.begin_set_position(target.value(), Instant::now())
        };

        self.scheduler.enqueue(
            DeviceKind::Cover,
            address,
            Job::new(
                CommandKind::SetPosition,
                command(address, start.direction.action()),
            ),
        );
        self.emit(address);

        self.spawn_auto_stop(address, start.generation, start.travel);
        self.spawn_confirm_fallback(address, start.generation);
        self.spawn_pending_probes(address, start.generation);
    }

    /// Requests the cover status through the scheduler's read lane.
    pub fn read_status(&self, address: DeviceAddress) {
        self.scheduler.enqueue(
            DeviceKind::Cover,
            address,
            Job::new(CommandKind::ReadStatus, read_status(address)),
        );
    }

    /// Fans a command out to group members in order; the send scheduler
    /// paces the resulting telegrams, so large groups cannot flood the
    /// bus.
    pub fn group_command(
        self: &Arc<Self>,
        members: &[DeviceAddress],
        action: CoverAction,
        raw: bool,
    ) {
        for member in members {
            match (action, raw) {
                (CoverAction::Open, false) => self.open(*member),
                (CoverAction::Close, false) => self.close(*member),
                (CoverAction::Open, true) => self.open_raw(*member),
                (CoverAction::Close, true) => self.close_raw(*member),
                (CoverAction::Stop, _) => self.stop(*member),
            }
        }
    }

    /// Fans a position out to group members.
    pub fn group_set_position(
        self: &Arc<Self>,
        members: &[DeviceAddress],
        target: Position,
    ) {
        for member in members {
            self.set_position(*member, target);
        }
    }

    /// Aggregates member states into a group state.
    ///
    /// Moving members win: OPENING unless another member closes (and vice
    /// versa); otherwise the endstops decide, and a mixed bag is STOP.
    /// The aggregate position is the rounded mean.
    #[must_use]
    pub fn aggregate(&self, members: &[DeviceAddress]) -> Option<CoverStateView> {
        let now = Instant::now();
        let covers = self.covers.lock();
        let views: Vec<CoverStateView> = members
            .iter()
            .filter_map(|m| covers.get(m).map(|motion| motion.view(now)))
            .collect();
        drop(covers);
        if views.is_empty() {
            return None;
        }

        let any_opening = views.iter().any(|v| v.state == CoverPhase::Opening);
        let any_closing = views.iter().any(|v| v.state == CoverPhase::Closing);
        let state = if any_opening && !any_closing {
            CoverPhase::Opening
        } else if any_closing && !any_opening {
            CoverPhase::Closing
        } else if views.iter().all(|v| v.position == 0) {
            CoverPhase::Closed
        } else if views.iter().all(|v| v.position == 100) {
            CoverPhase::Open
        } else {
            CoverPhase::Stopped
        };

        let sum: u32 = views.iter().map(|v| u32::from(v.position)).sum();
        #[allow(clippy::cast_possible_truncation)]
        let position = ((f64::from(sum) / views.len() as f64).round() as u8).min(100);

        Some(CoverStateView { state, position })
    }

    /// Feeds a received cover telegram into the matching state machine.
    pub fn handle_telegram(self: &Arc<Self>, telegram: &Telegram) {
        let kind = match telegram.opcode {
            OperateCode::CurtainSwitchControl | OperateCode::CurtainSwitchControlResponse => {
                BusKind::Control
            }
            OperateCode::CurtainSwitchStatusResponse => BusKind::Status,
            _ => return,
        };
        let Some(&channel) = telegram.payload.first() else {
            return;
        };
        let address = DeviceAddress::new(telegram.source.subnet, telegram.source.device, channel);

        let outcome = {
            let mut covers = self.covers.lock();
            let Some(motion) = covers.get_mut(&address) else {
                return;
            };
            let now = Instant::now();
            match telegram.payload.get(1).copied().map(CoverAction::from_u8) {
                Some(Some(action)) => motion.bus_event(kind, action, now),
                // Unexpected status byte: freeze rather than run away.
                Some(None) | None => {
                    if motion.is_moving() || motion.is_pending() {
                        motion.freeze(now);
                        BusOutcome::Frozen
                    } else {
                        BusOutcome::Ignored
                    }
                }
            }
        };

        match outcome {
            BusOutcome::Confirmed(ConfirmOutcome::Rescheduled {
                generation,
                fire_in,
            }) => {
                self.spawn_auto_stop(address, generation, fire_in);
                self.ensure_ticker();
            }
            BusOutcome::Confirmed(ConfirmOutcome::Started)
            | BusOutcome::ExternalStart { .. } => self.ensure_ticker(),
            BusOutcome::Frozen | BusOutcome::Ignored => {}
        }
        self.emit(address);
    }

    fn enqueue_stop(&self, address: DeviceAddress) {
        self.scheduler.enqueue(
            DeviceKind::Cover,
            address,
            Job::stop(command(address, CoverAction::Stop), read_status(address)),
        );
    }

    fn spawn_auto_stop(self: &Arc<Self>, address: DeviceAddress, generation: u64, travel: Duration) {
        let engine = Arc::clone(self);
        let fire_at = Instant::now() + travel;
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            let due = {
                let mut covers = engine.covers.lock();
                match covers.get_mut(&address) {
                    Some(motion) if motion.generation() == generation => {
                        motion.finish(Instant::now());
                        true
                    }
                    _ => false,
                }
            };
            if due {
                engine.enqueue_stop(address);
                engine.emit(address);
            }
        });
    }

    fn spawn_confirm_fallback(self: &Arc<Self>, address: DeviceAddress, generation: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CONFIRM_FALLBACK).await;
            let started = {
                let mut covers = engine.covers.lock();
                match covers.get_mut(&address) {
                    Some(motion)
                        if motion.generation() == generation && motion.is_pending() =>
                    {
                        motion.start_moving(Instant::now())
                    }
                    _ => None,
                }
            };
            match started {
                Some(ConfirmOutcome::Rescheduled {
                    generation,
                    fire_in,
                }) => {
                    engine.spawn_auto_stop(address, generation, fire_in);
                    engine.ensure_ticker();
                    engine.emit(address);
                }
                Some(ConfirmOutcome::Started) => {
                    engine.ensure_ticker();
                    engine.emit(address);
                }
                None => {}
            }
        });
    }

    fn spawn_pending_probes(self: &Arc<Self>, address: DeviceAddress, generation: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let issued = Instant::now();
            for delay in PENDING_PROBES {
                tokio::time::sleep_until(issued + delay).await;
                let still_pending = {
                    let covers = engine.covers.lock();
                    covers
                        .get(&address)
                        .is_some_and(|m| m.generation() == generation && m.is_pending())
                };
                if !still_pending {
                    return;
                }
                engine.read_status(address);
            }
        });
    }

    /// Starts the shared ticker unless it is already running. The ticker
    /// broadcasts interpolated positions so the UI animates even when the
    /// bus emits no intermediate telegrams, and paces status polls while
    /// moving.
    fn ensure_ticker(self: &Arc<Self>) {
        if self.ticker_live.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_poll: HashMap<DeviceAddress, Instant> = HashMap::new();
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                let now = Instant::now();
                let mut moving: Vec<(DeviceAddress, CoverStateView, Option<Duration>)> = Vec::new();
                let mut any_live = false;
                {
                    let covers = engine.covers.lock();
                    for (address, motion) in covers.iter() {
                        if motion.is_moving() {
                            any_live = true;
                            moving.push((*address, motion.view(now), motion.remaining(now)));
                        } else if motion.is_pending() {
                            any_live = true;
                        }
                    }
                }

                for (address, view, remaining) in moving {
                    let _ = engine.updates.send(CoverUpdate { address, view });

                    let poll_due = last_poll
                        .get(&address)
                        .map_or(true, |t| now.duration_since(*t) >= MOVING_POLL_INTERVAL);
                    let near_stop =
                        remaining.is_some_and(|r| r <= POLL_SUSPEND_WINDOW);
                    if poll_due && !near_stop {
                        engine.read_status(address);
                        last_poll.insert(address, now);
                    }
                }

                if !any_live {
                    engine.ticker_live.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }

    fn emit(&self, address: DeviceAddress) {
        let now = Instant::now();
        let view = {
            let covers = self.covers.lock();
            covers.get(&address).map(|m| m.view(now))
        };
        if let Some(view) = view {
            let _ = self.updates.send(CoverUpdate { address, view });
        }
    }
}

impl std::fmt::Debug for CoverEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverEngine")
            .field("covers", &self.covers.lock().len())
            .finish_non_exhaustive()
    }
}

fn command(address: DeviceAddress, action: CoverAction) -> Telegram {
    Telegram::curtain_switch_control(address.bus(), address.channel, action)
}

fn read_status(address: DeviceAddress) -> Telegram {
    Telegram::read_curtain_status(address.bus(), address.channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::BusSink;
    use crate::error::ProtocolError;
    use crate::types::BusAddress;

    #[derive(Default)]
    struct NullSink;

    impl BusSink for NullSink {
        fn send(&self, _telegram: &Telegram) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn engine() -> (Arc<CoverEngine>, mpsc::UnboundedReceiver<CoverUpdate>) {
        let scheduler = SendScheduler::new(
            Arc::new(NullSink),
            crate::bus::scheduler::DEFAULT_PACING,
        );
        let _worker = scheduler.spawn();
        let (tx, rx) = mpsc::unbounded_channel();
        (CoverEngine::new(scheduler, tx), rx)
    }

    fn addr() -> DeviceAddress {
        DeviceAddress::new(1, 50, 1)
    }

    fn times() -> CoverTimes {
        CoverTimes {
            up: Duration::from_secs(20),
            down: Duration::from_secs(22),
            start_delay: Duration::ZERO,
        }
    }

    fn status_telegram(action: CoverAction) -> Telegram {
        Telegram {
            source: BusAddress::new(1, 50),
            target: BusAddress::new(200, 200),
            device_type: 0,
            opcode: OperateCode::CurtainSwitchStatusResponse,
            payload: vec![1, action as u8],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_keeps_calibration() {
        let (engine, _rx) = engine();
        engine.ensure(addr(), Some(times()));
        // Command-path re-ensure must not reset to defaults.
        engine.ensure(addr(), None);
        let covers = engine.covers.lock();
        assert_eq!(covers[&addr()].times().down, Duration::from_secs(22));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_starts_movement_without_confirmation() {
        let (engine, _rx) = engine();
        engine.ensure(addr(), Some(times()));
        engine.set_position(addr(), Position::new(50).unwrap());

        tokio::time::sleep(Duration::from_millis(2600)).await;
        let view = engine.view(addr()).unwrap();
        assert_eq!(view.state, CoverPhase::Opening);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stop_fires_at_deadline() {
        let (engine, _rx) = engine();
        engine.ensure(addr(), Some(times()));
        // 0 -> 50 with 20 s up time: stop at 10 s.
        engine.set_position(addr(), Position::new(50).unwrap());

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        let view = engine.view(addr()).unwrap();
        assert_eq!(view.state, CoverPhase::Stopped);
        assert_eq!(view.position, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn external_status_animates_cover() {
        let (engine, mut rx) = engine();
        engine.ensure(addr(), Some(times()));

        engine.handle_telegram(&status_telegram(CoverAction::Open));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let view = engine.view(addr()).unwrap();
        assert_eq!(view.state, CoverPhase::Opening);
        assert!(view.position > 0);
        assert!(rx.recv().await.is_some(), "ticker emits position updates");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_status_replay_stays_idle() {
        let (engine, _rx) = engine();
        engine.ensure(addr(), Some(times()));
        engine.set_position(addr(), Position::OPEN);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.view(addr()).unwrap().state, CoverPhase::Opening);

        engine.stop(addr());
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.handle_telegram(&status_telegram(CoverAction::Open));

        let view = engine.view(addr()).unwrap();
        assert_ne!(view.state, CoverPhase::Opening, "debounced replay");
    }

    #[tokio::test(start_paused = true)]
    async fn telegram_for_unknown_cover_is_ignored() {
        let (engine, mut rx) = engine();
        engine.handle_telegram(&status_telegram(CoverAction::Open));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_mixed_group() {
        let (engine, _rx) = engine();
        let a = DeviceAddress::new(1, 50, 1);
        let b = DeviceAddress::new(1, 50, 2);
        engine.ensure(a, Some(times()));
        engine.ensure(b, Some(times()));

        // Both closed initially.
        let agg = engine.aggregate(&[a, b]).unwrap();
        assert_eq!(agg.state, CoverPhase::Closed);
        assert_eq!(agg.position, 0);

        engine.set_position(a, Position::OPEN);
        tokio::time::sleep(Duration::from_secs(4)).await;
        let agg = engine.aggregate(&[a, b]).unwrap();
        assert_eq!(agg.state, CoverPhase::Opening);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_unknown_members_is_none() {
        let (engine, _rx) = engine();
        assert!(engine.aggregate(&[addr()]).is_none());
    }
}
