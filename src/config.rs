//! Command line and environment configuration of the bridge binary.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::{
    address::DeviceType,
    engine::EngineConfig,
    mqtt::MqttConfig,
    session::SessionTiming,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "HDMI-CEC to HTTP and MQTT bridge", long_about = None)]
pub struct BridgeConfig {
    /// HTTP listen address
    #[arg(long, env = "CEC_BRIDGE_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// OSD name claimed on the bus (at most 14 bytes are used)
    #[arg(long, env = "CEC_BRIDGE_NAME", default_value = "CEC Bridge")]
    pub name: String,

    /// Device type claimed on the bus: tv, recording, tuner, playback or audio
    #[arg(long, env = "CEC_BRIDGE_DEVICE_TYPE", default_value = "recording")]
    pub device_type: DeviceType,

    /// Adapter to open. The first adapter found is used when empty
    #[arg(long, env = "CEC_BRIDGE_ADAPTER")]
    pub adapter: Option<String>,

    /// MQTT broker, `tcp://host:port` or `mqtt://host:port`. MQTT is off when empty
    #[arg(long, env = "CEC_BRIDGE_MQTT_BROKER")]
    pub mqtt_broker: Option<String>,

    #[arg(long, env = "CEC_BRIDGE_MQTT_USER")]
    pub mqtt_user: Option<String>,

    #[arg(long, env = "CEC_BRIDGE_MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    /// Prefix of all MQTT topics
    #[arg(long, env = "CEC_BRIDGE_MQTT_PREFIX", default_value = "capi")]
    pub mqtt_prefix: String,

    /// Overall deadline for querying all devices of a listing
    #[arg(long, env = "CEC_BRIDGE_DEVICE_DEADLINE_MS", default_value_t = 20_000)]
    pub device_deadline_ms: u64,

    /// How long volume and mute keys are held
    #[arg(long, env = "CEC_BRIDGE_VOLUME_HOLD_MS", default_value_t = 300)]
    pub volume_hold_ms: u64,

    /// Default log filter, `RUST_LOG` takes precedence
    #[arg(long, env = "CEC_BRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BridgeConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            device_name: self.name.clone(),
            device_type: self.device_type,
        }
    }

    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            listing_deadline: Duration::from_millis(self.device_deadline_ms),
            volume_hold: Duration::from_millis(self.volume_hold_ms),
            ..SessionTiming::default()
        }
    }

    /// `None` when no broker is configured.
    pub fn mqtt(&self) -> Option<MqttConfig> {
        let broker = self.mqtt_broker.as_deref().filter(|b| !b.is_empty())?;
        Some(MqttConfig {
            broker: broker.to_string(),
            user: self.mqtt_user.clone().filter(|u| !u.is_empty()),
            pass: self.mqtt_pass.clone().filter(|p| !p.is_empty()),
            prefix: self.mqtt_prefix.clone(),
        })
    }

    /// The configured adapter, if it names one.
    pub fn adapter(&self) -> Option<String> {
        self.adapter.clone().filter(|a| !a.is_empty())
    }
}
