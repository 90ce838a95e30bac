use std::{error::Error, sync::Arc};

use cec_bridge::{
    config::BridgeConfig,
    engine::linux::LinuxEngineFactory,
    http::{self, ApiState},
    logs::LogBuffer,
    mqtt::MqttBridge,
    supervisor::{Backoff, ConnectOptions, SessionSlot, Supervisor},
    EventHub,
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn shutdown_signal() {
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term => {},
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = BridgeConfig::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "starting cec-bridge");

    let hub = EventHub::new();
    let slot = Arc::new(SessionSlot::new());

    // the HTTP server comes up whether or not an adapter is present
    let supervisor = Supervisor::spawn(
        ConnectOptions {
            factory: Arc::new(LinuxEngineFactory),
            engine: config.engine_config(),
            callbacks: hub.callbacks(),
            timing: config.timing(),
            adapter: config.adapter(),
            backoff: Backoff::default(),
        },
        slot.clone(),
    )?;

    let mqtt = match config.mqtt() {
        Some(mqtt) => match MqttBridge::start(mqtt, slot.clone(), &hub) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!("MQTT disabled: {e}");
                None
            }
        },
        None => None,
    };

    // open event streams would hold the graceful shutdown forever
    let closing = hub.clone();
    let shutdown = async move {
        shutdown_signal().await;
        closing.close_all();
    };
    let state = ApiState {
        slot: slot.clone(),
        hub,
        logs,
    };
    let served = http::serve(state, config.bind, shutdown).await;

    if let Some(mqtt) = mqtt {
        mqtt.shutdown().await;
    }
    tokio::task::spawn_blocking(move || {
        supervisor.shutdown();
        if let Some(session) = slot.take() {
            session.close();
        }
    })
    .await?;
    served?;
    info!("bye");
    Ok(())
}
