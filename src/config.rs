// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge configuration.
//!
//! Settings are read from a JSON options file (the add-on options document).
//! The path comes from the `BRIDGE_OPTIONS` environment variable and defaults
//! to `/data/options.json`. A missing file yields defaults so the bridge can
//! start unconfigured.

use std::path::Path;

use serde::Deserialize;

/// Authentication modes for the admin and user surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication.
    #[default]
    None,
    /// Bearer token.
    Token,
    /// HTTP basic credentials.
    Basic,
}

/// Authentication configuration for one surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Requested mode. Degrades to [`AuthMode::None`] when the matching
    /// credentials are missing (see [`AuthConfig::normalize`]).
    pub mode: AuthMode,
    pub token: String,
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    /// Falls back to `none` when the configured mode has no usable
    /// credentials, so a half-filled options file cannot lock the UI out.
    fn normalize(mut self) -> Self {
        match self.mode {
            AuthMode::Token if self.token.trim().is_empty() => self.mode = AuthMode::None,
            AuthMode::Basic
                if self.username.trim().is_empty() || self.password.trim().is_empty() =>
            {
                self.mode = AuthMode::None;
            }
            _ => {}
        }
        self
    }
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Topic prefix for state and command topics.
    pub base_topic: String,
    /// Home Assistant discovery prefix.
    pub discovery_prefix: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "core-mosquitto".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            base_topic: "buspro".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            client_id: "buspro-bridge".to_string(),
        }
    }
}

/// BusPro gateway endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Local UDP bind port; defaults to the gateway port (BusPro
    /// gateways send to the port they receive on).
    pub local_udp_port: Option<u16>,
    /// Optional override for the IPv4 stamped into outgoing frame headers.
    /// When empty, the local interface toward the gateway is auto-detected.
    pub local_ip: String,
}

impl GatewayConfig {
    /// Port the UDP socket binds on.
    #[must_use]
    pub fn bind_port(&self) -> u16 {
        self.local_udp_port.unwrap_or(self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6000,
            local_udp_port: None,
            local_ip: String::new(),
        }
    }
}

/// Top-level bridge settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewayConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    /// Separate authentication for the end-user surface.
    pub user_auth: AuthConfig,
    /// Idle status sweep interval in seconds (0 disables the sweep).
    pub poll_interval_s: f64,
    /// Delay between individual reads inside a sweep.
    pub poll_pace_s: f64,
    /// Extra global pacing added on top of the scheduler minimum.
    pub udp_send_interval_s: f64,
    pub debug: bool,
    /// Trace raw RX frames at DEBUG level.
    pub debug_telegram: bool,
    /// Admin auth bypass for requests arriving through the platform ingress.
    pub ingress: bool,
    /// Persistent store location.
    pub state_path: String,
    /// Port of the web surface (WebSocket + health).
    pub http_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            user_auth: AuthConfig::default(),
            poll_interval_s: 180.0,
            poll_pace_s: 0.15,
            udp_send_interval_s: 0.0,
            debug: false,
            debug_telegram: false,
            ingress: false,
            state_path: "/data/state.json".to_string(),
            http_port: 8099,
        }
    }
}

impl Settings {
    /// Loads settings from the options file.
    ///
    /// A missing file is not an error; defaults apply. A present but
    /// malformed file is: the operator should notice a broken options
    /// document instead of silently running unconfigured.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default().normalized());
            }
            Err(e) => return Err(e),
        };
        let settings: Self = serde_json::from_str(&raw).map_err(std::io::Error::other)?;
        Ok(settings.normalized())
    }

    /// Returns the options file path from the environment.
    #[must_use]
    pub fn options_path() -> String {
        std::env::var("BRIDGE_OPTIONS").unwrap_or_else(|_| "/data/options.json".to_string())
    }

    fn normalized(mut self) -> Self {
        self.auth = self.auth.normalize();
        self.user_auth = self.user_auth.normalize();
        self.poll_interval_s = self.poll_interval_s.max(0.0);
        self.poll_pace_s = self.poll_pace_s.max(0.0);
        self.udp_send_interval_s = self.udp_send_interval_s.max(0.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.gateway.port, 6000);
        assert_eq!(s.mqtt.base_topic, "buspro");
        assert_eq!(s.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(s.auth.mode, AuthMode::None);
        assert!((s.poll_interval_s - 180.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_full_options() {
        let raw = r#"{
            "gateway": {"host": "192.168.1.8", "port": 6000},
            "mqtt": {"host": "broker.local", "port": 1884, "base_topic": "hdl"},
            "auth": {"mode": "token", "token": "secret"},
            "debug_telegram": true
        }"#;
        let s: Settings = serde_json::from_str(raw).unwrap();
        let s = s.normalized();
        assert_eq!(s.gateway.host, "192.168.1.8");
        assert_eq!(s.mqtt.port, 1884);
        assert_eq!(s.mqtt.base_topic, "hdl");
        assert_eq!(s.auth.mode, AuthMode::Token);
        assert!(s.debug_telegram);
    }

    #[test]
    fn token_mode_without_token_degrades_to_none() {
        let raw = r#"{"auth": {"mode": "token"}}"#;
        let s: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(s.normalized().auth.mode, AuthMode::None);
    }

    #[test]
    fn basic_mode_without_password_degrades_to_none() {
        let raw = r#"{"user_auth": {"mode": "basic", "username": "admin"}}"#;
        let s: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(s.normalized().user_auth.mode, AuthMode::None);
    }

    #[test]
    fn negative_intervals_clamp_to_zero() {
        let raw = r#"{"poll_interval_s": -5, "udp_send_interval_s": -1}"#;
        let s: Settings = serde_json::from_str(raw).unwrap();
        let s = s.normalized();
        assert!(s.poll_interval_s.abs() < f64::EPSILON);
        assert!(s.udp_send_interval_s.abs() < f64::EPSILON);
    }
}
