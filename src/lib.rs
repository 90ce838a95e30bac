#![cfg_attr(docsrs, feature(doc_cfg))]
/*!
 * Bridge an HDMI-CEC bus to REST, Server-Sent Events and MQTT.
 *
 * The bus is reached through the [Linux CEC API](https://www.kernel.org/doc/html/latest/userspace-api/media/cec/cec-api.html)
 * by a [LinuxEngine](engine::linux::LinuxEngine). A [Session] serializes all bus
 * traffic, the [EventHub] fans bus activity out to any number of consumers, and the
 * [supervisor] keeps trying to acquire an adapter until one can be opened.
 *
 * ```no_run
 * # use std::sync::Arc;
 * # use cec_bridge::{engine::{linux::LinuxEngineFactory, EngineConfig}, address::{DeviceType, LogicalAddress}};
 * # use cec_bridge::{EventHub, Session, SessionTiming};
 * # fn main() -> cec_bridge::Result<()> {
 * let hub = EventHub::new();
 * let config = EngineConfig {
 *     device_name: "Bridge".into(),
 *     device_type: DeviceType::RecordingDevice,
 * };
 * let session = Session::open(&LinuxEngineFactory, &config, hub.callbacks(), SessionTiming::default())?;
 * session.open_adapter("/dev/cec0")?;
 * session.power_on(LogicalAddress::TV)?;
 * # Ok(())
 * # }
 * ```
 */
mod sys;

pub mod address;
pub mod command;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod http;
pub mod hub;
pub mod logs;
pub mod mqtt;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use error::{Error, Result, ValidationError};
pub use hub::{CecEvent, EventHub, EventPayload, Subscription};
pub use session::{Session, SessionState, SessionTiming};
