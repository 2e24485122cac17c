// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Paced send scheduler.
//!
//! All outbound telegrams pass through one dispatcher task, the only
//! writer of the UDP socket. The scheduler paces dispatches (default
//! 180 ms apart), keeps a single pending slot per device so bursts of
//! commands for the same target coalesce to the latest, and lets STOP
//! preempt queued motion commands.
//!
//! Slots are keyed by device kind as well as address: a light and a
//! cover may legitimately share an address, and neither may swallow the
//! other's traffic. Status reads additionally use a separate lane per
//! device, so a poll can never supersede a queued command either.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::codec::Telegram;
use crate::bus::transport::BusSink;
use crate::registry::DeviceKind;
use crate::types::DeviceAddress;

/// Default minimum interval between dispatches.
pub const DEFAULT_PACING: Duration = Duration::from_millis(180);

/// Classes of outbound work, used for coalescing and priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Raw OPEN/CLOSE (calibration, no-% entities).
    Motion,
    /// Position-driven OPEN/CLOSE.
    SetPosition,
    /// STOP: preempts, is sent twice, and is followed by a status read.
    Stop,
    /// Light on/off/brightness.
    Light,
    /// Status poll, separate lane.
    ReadStatus,
}

impl CommandKind {
    const fn lane(self) -> Lane {
        match self {
            Self::ReadStatus => Lane::Read,
            _ => Lane::Command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Command,
    Read,
}

/// Coalescing key: one slot per (kind, address, lane).
type SlotKey = (DeviceKind, DeviceAddress, Lane);

/// One unit of outbound work.
#[derive(Debug, Clone)]
pub struct Job {
    pub kind: CommandKind,
    pub telegram: Telegram,
    /// Sent after a STOP pair (the best-effort status read).
    pub follow_up: Option<Telegram>,
}

impl Job {
    /// A plain single-telegram job.
    #[must_use]
    pub fn new(kind: CommandKind, telegram: Telegram) -> Self {
        Self {
            kind,
            telegram,
            follow_up: None,
        }
    }

    /// A STOP job: the telegram is sent twice, then `read_status`.
    #[must_use]
    pub fn stop(telegram: Telegram, read_status: Telegram) -> Self {
        Self {
            kind: CommandKind::Stop,
            telegram,
            follow_up: Some(read_status),
        }
    }
}

#[derive(Default)]
struct Queue {
    slots: HashMap<SlotKey, Job>,
    fifo: VecDeque<SlotKey>,
}

/// The paced outbound queue.
///
/// Enqueueing is synchronous and cheap; dispatch happens on the worker
/// task spawned by [`SendScheduler::spawn`].
pub struct SendScheduler {
    sink: Arc<dyn BusSink>,
    pacing: Duration,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl SendScheduler {
    /// Creates a scheduler writing through `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn BusSink>, pacing: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            pacing: pacing.max(Duration::from_millis(1)),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueues a job for one device, replacing any pending job of the
    /// same lane (latest wins). STOP moves the slot to the front of the
    /// queue.
    ///
    /// A replaced job is considered superseded, not failed.
    pub fn enqueue(&self, device: DeviceKind, address: DeviceAddress, job: Job) {
        let slot = (device, address, job.kind.lane());
        let is_stop = job.kind == CommandKind::Stop;
        {
            let mut queue = self.queue.lock();
            if let Some(prev) = queue.slots.insert(slot, job) {
                tracing::debug!(
                    device = device.as_str(),
                    address = %address,
                    kind = ?prev.kind,
                    "superseding queued command"
                );
            }
            queue.fifo.retain(|k| *k != slot);
            if is_stop {
                queue.fifo.push_front(slot);
            } else {
                queue.fifo.push_back(slot);
            }
        }
        self.notify.notify_one();
    }

    /// Number of pending jobs (test/diagnostic aid).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().slots.len()
    }

    fn pop(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        while let Some(slot) = queue.fifo.pop_front() {
            if let Some(job) = queue.slots.remove(&slot) {
                return Some(job);
            }
        }
        None
    }

    fn send_logged(&self, telegram: &Telegram) {
        if let Err(e) = self.sink.send(telegram) {
            tracing::warn!(opcode = %telegram.opcode, error = %e, "bus send failed");
        }
    }

    /// Spawns the dispatcher task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let job = loop {
                    if let Some(job) = this.pop() {
                        break job;
                    }
                    this.notify.notified().await;
                };

                this.send_logged(&job.telegram);
                if job.kind == CommandKind::Stop {
                    // Some installations ignore a single STOP telegram,
                    // especially when the movement was started externally.
                    tokio::time::sleep(this.pacing).await;
                    this.send_logged(&job.telegram);
                    if let Some(read) = &job.follow_up {
                        tokio::time::sleep(this.pacing).await;
                        this.send_logged(read);
                    }
                }
                tokio::time::sleep(this.pacing).await;
            }
        })
    }
}

impl std::fmt::Debug for SendScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendScheduler")
            .field("pacing", &self.pacing)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
