//! MQTT bridge.
//!
//! Commands arrive on `{prefix}/command/{name}` and go through the same
//! [BridgeCommand] parser as the HTTP surface. Every hub event is published as
//! its `data` object on `{prefix}/event/{type}`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    command::BridgeCommand,
    error::{Error, Result, ValidationError},
    http::blocking,
    hub::{EventHub, Subscription},
    supervisor::SessionSlot,
};

/// Pause after a lost or failed broker connection.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    /// `tcp://host[:port]` or `mqtt://host[:port]`
    pub broker: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub prefix: String,
}

impl MqttConfig {
    fn endpoint(&self) -> std::result::Result<(String, u16), ValidationError> {
        let url = Url::parse(&self.broker)
            .map_err(|e| ValidationError::new("mqtt broker", e.to_string()))?;
        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(ValidationError::new(
                "mqtt broker",
                format!("unsupported scheme {:?}", url.scheme()),
            ));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ValidationError::new("mqtt broker", "missing host"))?;
        Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
    }

    pub fn options(&self, client_id: &str) -> std::result::Result<MqttOptions, ValidationError> {
        let (host, port) = self.endpoint()?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(user) = &self.user {
            options.set_credentials(user.as_str(), self.pass.as_deref().unwrap_or_default());
        }
        Ok(options)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/#", self.prefix)
    }

    /// The command name of `topic`, if it is one of ours.
    pub fn command_name<'t>(&self, topic: &'t str) -> Option<&'t str> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/command/")
            .filter(|name| !name.is_empty())
    }

    pub fn event_topic(&self, kind: &str) -> String {
        format!("{}/event/{}", self.prefix, kind)
    }
}

fn client_id() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into());
    format!("capi-{}-{}", host, std::process::id())
}

/// Parse and run one command on the current session.
pub async fn dispatch(slot: &SessionSlot, name: &str, payload: &[u8]) -> Result<String> {
    let session = slot.get()?;
    let command = BridgeCommand::parse(name, payload)?;
    blocking(move || command.execute(&session)).await
}

/// Running MQTT connection. Dropping it stops both tasks.
pub struct MqttBridge {
    client: AsyncClient,
    tasks: Vec<JoinHandle<()>>,
}

impl MqttBridge {
    /// Connect in the background. Fails only if the broker address is unusable.
    pub fn start(config: MqttConfig, slot: Arc<SessionSlot>, hub: &EventHub) -> Result<Self> {
        let options = config.options(&client_id())?;
        let (client, eventloop) = AsyncClient::new(options, 32);
        let config = Arc::new(config);
        let connected = Arc::new(AtomicBool::new(false));
        info!(broker = %config.broker, prefix = %config.prefix, "starting MQTT bridge");

        let connection = tokio::spawn(run_connection(
            eventloop,
            client.clone(),
            config.clone(),
            slot,
            connected.clone(),
        ));
        let forwarder = tokio::spawn(forward_events(hub.subscribe(), client.clone(), config, connected));
        Ok(Self {
            client,
            tasks: vec![connection, forwarder],
        })
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
        for t in self.tasks.drain(..) {
            t.abort();
        }
        info!("MQTT bridge stopped");
    }
}

impl Drop for MqttBridge {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

async fn run_connection(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: Arc<MqttConfig>,
    slot: Arc<SessionSlot>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Release);
                info!(broker = %config.broker, "MQTT connected");
                let filter = config.command_filter();
                match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                    Ok(()) => info!(topic = %filter, "MQTT subscribed"),
                    Err(e) => warn!("MQTT subscribe failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                let Some(name) = config.command_name(&msg.topic).map(str::to_string) else {
                    continue;
                };
                let slot = slot.clone();
                tokio::spawn(async move {
                    match dispatch(&slot, &name, &msg.payload).await {
                        Ok(done) => info!(command = %name, "{done}"),
                        Err(Error::ServiceUnavailable) => {
                            info!(command = %name, "ignoring command: CEC adapter not available")
                        }
                        Err(e) => warn!(command = %name, "{e}"),
                    }
                });
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Release);
                warn!("MQTT connection lost: {e}, retrying in {RETRY_INTERVAL:?}");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn forward_events(
    mut events: Subscription,
    client: AsyncClient,
    config: Arc<MqttConfig>,
    connected: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if !connected.load(Ordering::Acquire) {
            continue;
        }
        let topic = config.event_topic(event.payload.type_name());
        let payload = match serde_json::to_vec(&event.payload.data()) {
            Ok(p) => p,
            Err(e) => {
                debug!("unserializable event: {e}");
                continue;
            }
        };
        if let Err(e) = client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            debug!("MQTT publish dropped: {e}");
        }
    }
}
