// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Telegram sniffer.
//!
//! A bounded ring buffer of recent telegrams for protocol debugging.
//! Unknown opcodes are always captured so new payload formats can be
//! reverse engineered from the admin surface; full capture with optional
//! filters is switched on explicitly.

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::bus::codec::{self, OperateCode, Telegram};
use crate::types::BusAddress;

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 5000;

/// Upper bound for `recent()` queries.
const RECENT_LIMIT: usize = 500;

/// Capture filters; all must match.
#[derive(Debug, Clone, Default)]
pub struct SnifferFilters {
    /// Case-insensitive substrings matched against the opcode name
    /// (`raw:0x....` for unknown opcodes). Empty means all.
    pub op_contains: Vec<String>,
    pub src: Option<BusAddress>,
    pub dst: Option<BusAddress>,
    /// Capture the raw frame hex alongside the decoded fields.
    pub include_raw: bool,
}

impl SnifferFilters {
    fn matches(&self, telegram: &Telegram) -> bool {
        if !self.op_contains.is_empty() {
            let name = telegram.opcode.to_string().to_lowercase();
            if !self
                .op_contains
                .iter()
                .any(|s| name.contains(&s.to_lowercase()))
            {
                return false;
            }
        }
        if let Some(src) = self.src {
            if telegram.source != src {
                return false;
            }
        }
        if let Some(dst) = self.dst {
            if telegram.target != dst {
                return false;
            }
        }
        true
    }
}

/// One captured telegram.
#[derive(Debug, Clone, Serialize)]
pub struct SnifferEntry {
    /// Unix timestamp, seconds.
    pub ts: f64,
    pub operate_code: String,
    pub operate_code_raw_hex: Option<String>,
    pub operate_code_raw_int: Option<u16>,
    pub source_address: [u8; 2],
    pub target_address: [u8; 2],
    pub payload: Vec<u8>,
    pub udp_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_data_hex: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    enabled: bool,
    filters: SnifferFilters,
    buf: VecDeque<SnifferEntry>,
    matched: u64,
    started_ts: Option<f64>,
}

/// The sniffer.
#[derive(Debug)]
pub struct TelegramSniffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for TelegramSniffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TelegramSniffer {
    /// Creates a sniffer with the given ring capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(100),
        }
    }

    /// Starts capture with the given filters, clearing previous filters.
    pub fn start(&self, filters: SnifferFilters) {
        let mut inner = self.inner.lock();
        inner.filters = filters;
        inner.enabled = true;
        inner.started_ts = Some(unix_now());
    }

    /// Stops capture; the buffer is kept for inspection.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.started_ts = None;
    }

    /// Drops all captured entries and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.matched = 0;
    }

    /// Capture status for the admin surface.
    #[must_use]
    pub fn status(&self) -> Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "enabled": inner.enabled,
            "buffer_len": inner.buf.len(),
            "buffer_max": self.capacity,
            "matched": inner.matched,
            "filters": {
                "op_contains": inner.filters.op_contains,
                "src": inner.filters.src.map(|a| [a.subnet, a.device]),
                "dst": inner.filters.dst.map(|a| [a.subnet, a.device]),
                "include_raw": inner.filters.include_raw,
            },
            "started_ts": inner.started_ts,
        })
    }

    /// The most recent `limit` entries, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<SnifferEntry> {
        let limit = limit.clamp(1, RECENT_LIMIT);
        let inner = self.inner.lock();
        inner
            .buf
            .iter()
            .skip(inner.buf.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Offers a received telegram to the ring.
    ///
    /// Unknown opcodes are always kept; everything else only while
    /// capture is enabled and the filters match.
    pub fn on_telegram(&self, telegram: &Telegram, raw: &[u8], peer: Option<SocketAddr>) {
        let is_unknown = matches!(telegram.opcode, OperateCode::Unknown(_));
        let mut inner = self.inner.lock();
        let captured = inner.enabled && inner.filters.matches(telegram);
        if !captured && !is_unknown {
            return;
        }
        if captured {
            inner.matched += 1;
        }

        let raw_opcode = codec::raw_opcode(raw);
        let include_raw = inner.filters.include_raw && captured;
        let entry = SnifferEntry {
            ts: unix_now(),
            operate_code: telegram.opcode.to_string(),
            operate_code_raw_hex: raw_opcode.map(|op| format!("{op:04x}")),
            operate_code_raw_int: raw_opcode,
            source_address: [telegram.source.subnet, telegram.source.device],
            target_address: [telegram.target.subnet, telegram.target.device],
            payload: telegram.payload.clone(),
            udp_address: peer.map(|p| p.to_string()),
            udp_data_hex: include_raw.then(|| hex(raw)),
        };
        if inner.buf.len() >= self.capacity {
            inner.buf.pop_front();
        }
        inner.buf.push_back(entry);
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
