// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge daemon entry point.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use buspro_bridge::config::Settings;
use buspro_bridge::core::Core;

fn init_tracing(settings: &Settings) {
    let default = if settings.debug { "debug" } else { "info" };
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    if settings.debug_telegram {
        if let Ok(directive) = "buspro_bridge::bus=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(State(core): State<Arc<Core>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| async move {
        let snapshot = core.snapshot_event();
        core.hub.serve_socket(socket, snapshot).await;
    })
}

#[tokio::main]
async fn main() {
    let settings = match Settings::load(Settings::options_path()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to read options: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&settings);
    tracing::info!(
        gateway = %settings.gateway.host,
        gateway_port = settings.gateway.port,
        mqtt = %settings.mqtt.host,
        "starting BusPro bridge"
    );

    let core = Core::start(settings).await;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&core));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], core.settings.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "web surface bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %addr, "web surface listening");

    let shutdown_core = Arc::clone(&core);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        shutdown_core.shutdown().await;
    });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
    }
}
