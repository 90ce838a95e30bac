/*!
 * The protocol engine that actually talks to a CEC adapter.
 *
 * A [CecEngine] exposes a fixed set of blocking primitives. It is driven from a
 * single [Session](crate::session::Session) which serializes every call, so
 * implementations do not need to guard against concurrent use of one instance.
 *
 * Asynchronous bus activity is reported through [EngineCallbacks], which the engine
 * may invoke from its own threads at any time.
 */
use std::{io, sync::Arc, time::Duration};

use crate::{
    address::{DeviceType, HdmiPort, LogicalAddress, LogicalAddressSet, PhysicalAddress},
    command::Command,
    device::AudioStatus,
    protocol::{Alert, CecVersion, PowerStatus},
};

pub mod linux;
#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod mock;

/// An adapter the engine could open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDescriptor {
    /// what to pass to [CecEngine::open]
    pub path: String,
    /// how the adapter is attached (driver/name); a device node if known
    pub comm: String,
}

impl AdapterDescriptor {
    /// The path to open: the communication path if that names a device node.
    pub fn open_path(&self) -> &str {
        if self.comm.starts_with("/dev/") {
            &self.comm
        } else {
            &self.path
        }
    }
}

/// Identity this bridge claims on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// OSD name, at most 14 bytes are used
    pub device_name: String,
    pub device_type: DeviceType,
}

/// Receiver of asynchronous bus activity.
pub trait EngineCallbacks: Send + Sync {
    /// A remote control key was pressed (`duration` zero) or released after `duration`.
    fn on_key_press(&self, keycode: u8, duration: Duration);
    /// Any frame seen on the bus.
    fn on_command(&self, command: &Command);
    fn on_source_activated(&self, address: LogicalAddress, activated: bool);
    fn on_alert(&self, alert: Alert, param: u32);
}

/// Blocking primitives of a protocol engine.
///
/// Every method that talks to the bus reports failure as an [io::Error]:
/// a device that does not answer is an error, never a default value.
pub trait CecEngine: Send {
    /// Candidate adapters. An empty list means none were found.
    fn find_adapters(&mut self) -> io::Result<Vec<AdapterDescriptor>>;
    fn open(&mut self, path: &str) -> io::Result<()>;
    /// Release the adapter. Must be safe to call more than once.
    fn close(&mut self);

    fn transmit(&mut self, command: &Command) -> io::Result<()>;
    fn power_on(&mut self, address: LogicalAddress) -> io::Result<()>;
    fn standby(&mut self, address: LogicalAddress) -> io::Result<()>;
    fn volume_up(&mut self, send_release: bool) -> io::Result<()>;
    fn volume_down(&mut self, send_release: bool) -> io::Result<()>;
    fn toggle_mute(&mut self) -> io::Result<()>;
    fn mute(&mut self) -> io::Result<()>;
    fn unmute(&mut self) -> io::Result<()>;
    fn send_keypress(&mut self, address: LogicalAddress, keycode: u8, wait_ack: bool) -> io::Result<()>;
    fn send_key_release(&mut self, address: LogicalAddress, wait_ack: bool) -> io::Result<()>;
    /// Make the root display show `port`. May be unsupported by the adapter.
    fn set_hdmi_port(&mut self, port: HdmiPort) -> io::Result<()>;

    fn power_status(&mut self, address: LogicalAddress) -> io::Result<PowerStatus>;
    fn active_source(&mut self) -> io::Result<LogicalAddress>;
    fn physical_address(&mut self, address: LogicalAddress) -> io::Result<PhysicalAddress>;
    /// 24 bit vendor id
    fn vendor_id(&mut self, address: LogicalAddress) -> io::Result<u32>;
    fn osd_name(&mut self, address: LogicalAddress) -> io::Result<String>;
    fn menu_language(&mut self, address: LogicalAddress) -> io::Result<String>;
    fn cec_version(&mut self, address: LogicalAddress) -> io::Result<CecVersion>;
    fn audio_status(&mut self) -> io::Result<AudioStatus>;

    /// Addresses known to be present, without touching the bus.
    fn active_devices(&mut self) -> LogicalAddressSet;
    /// Poll the bus to refresh [CecEngine::active_devices].
    fn rescan(&mut self) -> io::Result<()>;
    /// Addresses claimed by this adapter.
    fn logical_addresses(&mut self) -> LogicalAddressSet;
    fn own_physical_address(&mut self) -> io::Result<PhysicalAddress>;

    /// Short description of the engine and the opened adapter.
    fn info(&self) -> String;
}

/// Creates a fresh engine per connection attempt.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        config: &EngineConfig,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> io::Result<Box<dyn CecEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineConfig, Arc<dyn EngineCallbacks>) -> io::Result<Box<dyn CecEngine>> + Send + Sync,
{
    fn create(
        &self,
        config: &EngineConfig,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> io::Result<Box<dyn CecEngine>> {
        self(config, callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_nodes_are_preferred() {
        let a = AdapterDescriptor {
            path: "cec0".into(),
            comm: "/dev/cec0".into(),
        };
        assert_eq!(a.open_path(), "/dev/cec0");
        let b = AdapterDescriptor {
            path: "/dev/cec1".into(),
            comm: "RPI".into(),
        };
        assert_eq!(b.open_path(), "/dev/cec1");
    }
}
