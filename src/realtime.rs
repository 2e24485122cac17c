// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Realtime hub: WebSocket fan-out of device and state events.
//!
//! Events are idempotent replacements keyed by address, so clients can
//! tolerate duplicates and reordering; the hub only guarantees
//! at-least-once delivery to connected sockets. Slow clients lag behind
//! the broadcast channel and lose old events instead of blocking
//! publishers.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default broadcast capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One event on the WebSocket: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Fan-out hub for realtime events.
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    /// Creates a hub with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a hub with the given event buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcasts one event; dropped silently with no subscribers.
    pub fn broadcast(&self, kind: &str, data: Value) {
        let _ = self.sender.send(RealtimeEvent {
            kind: kind.to_string(),
            data,
        });
    }

    /// Subscribes to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Serves one WebSocket client: sends the snapshot, then forwards
    /// events until the peer disconnects.
    pub async fn serve_socket(&self, socket: WebSocket, snapshot: RealtimeEvent) {
        let (mut sender, mut receiver) = socket.split();
        if let Ok(text) = serde_json::to_string(&snapshot) {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }

        let mut events = self.subscribe();
        let forward = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        // Clients only ever send pings/keepalives; drain until close.
        while let Some(Ok(_)) = receiver.next().await {}
        forward.abort();
    }
}
