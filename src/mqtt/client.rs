// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker client.
//!
//! Thin wrapper around rumqttc's async client that owns the event loop
//! task, re-subscribes recorded subscriptions on every ConnAck and
//! reports connectivity through an event channel. Brokers with retained
//! message persistence disabled lose availability and discovery across a
//! restart, and subscriptions do not survive a reconnect either; the
//! consumer re-publishes both on every [`MqttEvent::Connected`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::MqttConfig;
use crate::error::ProtocolError;

/// Initial reconnect backoff; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connectivity and message events delivered to the bridge core.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    /// Connected or reconnected; discovery and availability must be
    /// (re)published.
    Connected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: String },
}

/// The broker connection.
pub struct MqttClient {
    client: AsyncClient,
    subscriptions: Mutex<Vec<String>>,
}

impl MqttClient {
    /// Connects to the broker and spawns the event loop task.
    ///
    /// `availability_topic` carries the retained LWT (`offline`).
    #[must_use]
    pub fn spawn(
        config: &MqttConfig,
        availability_topic: String,
        events: mpsc::UnboundedSender<MqttEvent>,
    ) -> Arc<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            availability_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let this = Arc::new(Self {
            client,
            subscriptions: Mutex::new(Vec::new()),
        });

        let handle = Arc::clone(&this);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("MQTT connected");
                        backoff = INITIAL_BACKOFF;
                        handle.resubscribe().await;
                        if events.send(MqttEvent::Connected).is_err() {
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        tracing::debug!(topic = %publish.topic, payload = %payload, "MQTT RX");
                        if events
                            .send(MqttEvent::Message {
                                topic: publish.topic,
                                payload,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, backoff_s = backoff.as_secs(), "MQTT disconnected");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        this
    }

    /// Publishes a string payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the client request queue is closed.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.into())
            .await
            .map_err(ProtocolError::Mqtt)
    }

    /// Serializes `value` as JSON and publishes it.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the publish fails.
    pub async fn publish_json(
        &self,
        topic: &str,
        value: &impl serde::Serialize,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ProtocolError::ChannelClosed(e.to_string()))?;
        self.publish(topic, payload, retain).await
    }

    /// Clears a retained topic by publishing an empty payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the publish fails.
    pub async fn clear_retained(&self, topic: &str) -> Result<(), ProtocolError> {
        self.publish(topic, Vec::new(), true).await
    }

    /// Subscribes and records the topic for replay after reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscribe request fails; the topic is
    /// still recorded and retried on the next reconnect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        {
            let mut subs = self.subscriptions.lock();
            if !subs.iter().any(|t| t == topic) {
                subs.push(topic.to_string());
            }
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn resubscribe(&self) {
        let topics: Vec<String> = self.subscriptions.lock().clone();
        for topic in topics {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                tracing::warn!(topic = %topic, error = %e, "resubscribe failed");
            }
        }
    }

    /// Disconnects from the broker.
    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}
