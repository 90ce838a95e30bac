/*!
 * The one connection to the CEC adapter.
 *
 * A [Session] owns the protocol engine behind a mutex. Every bus operation holds
 * that mutex for its whole duration, compound operations included, so frames of two
 * callers never interleave on the wire.
 *
 * ```text
 * Uninitialized -> Initialized -> AdapterFound -> AdapterOpen (ready) -> Closed
 * ```
 *
 * There is no way back from a failed or closed session. The
 * [supervisor](crate::supervisor) builds a new one instead.
 */
use std::{
    collections::BTreeMap,
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    address::{HdmiPort, LogicalAddress, PhysicalAddress},
    command::Command,
    device::{AudioStatus, BusTopology, Device, DeviceListing, PortDevices, TopologyDevice},
    engine::{AdapterDescriptor, CecEngine, EngineCallbacks, EngineConfig, EngineFactory},
    error::{Error, Result},
    protocol::{CecVersion, Opcode, PowerStatus, UserControlCode},
};

/// Delays between the steps of compound operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// after waking the TV, before routing
    pub settle: Duration,
    /// press to release for navigation keys
    pub button_hold: Duration,
    /// press to release for volume and mute keys, some receivers ignore shorter presses
    pub volume_hold: Duration,
    /// overall budget for listing all devices
    pub listing_deadline: Duration,
    /// after opening the adapter, before the session is used
    pub post_open_settle: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(300),
            button_hold: Duration::from_millis(100),
            volume_hold: Duration::from_millis(300),
            listing_deadline: Duration::from_secs(20),
            post_open_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// no engine yet
    Uninitialized,
    Initialized,
    AdapterFound,
    AdapterOpen,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::AdapterFound => "adapter found",
            SessionState::AdapterOpen => "open",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Bus {
    engine: Box<dyn CecEngine>,
    state: SessionState,
}

impl Bus {
    /// The engine, if bus operations are allowed.
    fn ready_engine(&mut self, operation: &'static str) -> Result<&mut dyn CecEngine> {
        if self.state != SessionState::AdapterOpen {
            return Err(Error::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(self.engine.as_mut())
    }
}

/// The address frames built by the session are sent from.
fn initiator(engine: &mut dyn CecEngine) -> LogicalAddress {
    engine
        .logical_addresses()
        .iter()
        .next()
        .unwrap_or(LogicalAddress::BROADCAST)
}

/// Discard a failed sub-query of a best-effort battery, keeping a trace of it.
fn best_effort<T>(what: &'static str, address: LogicalAddress, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(%address, "{what} unavailable: {e}");
            None
        }
    }
}

fn wake_tv(engine: &mut dyn CecEngine) {
    let wake = Command::short(initiator(engine), LogicalAddress::TV, Opcode::ImageViewOn, &[]);
    if let Err(e) = engine.transmit(&wake) {
        debug!("waking the TV failed, continuing: {e}");
    }
}

fn broadcast_active_source(engine: &mut dyn CecEngine, pa: PhysicalAddress) -> io::Result<()> {
    let cmd = Command::short(
        initiator(engine),
        LogicalAddress::BROADCAST,
        Opcode::ActiveSource,
        &pa.to_bytes(),
    );
    engine.transmit(&cmd)
}

/// Query every attribute of one device. Failing sub-queries leave their field empty.
fn query_device(
    engine: &mut dyn CecEngine,
    address: LogicalAddress,
    active_source: Option<LogicalAddress>,
) -> Device {
    let mut dev = Device::new(address);
    dev.is_active = engine.active_devices().contains(address);
    dev.is_active_source = active_source == Some(address);
    dev.physical_address = best_effort("physical address", address, engine.physical_address(address));
    dev.vendor_id = best_effort("vendor id", address, engine.vendor_id(address));
    dev.cec_version = best_effort("cec version", address, engine.cec_version(address));
    dev.power_status = best_effort("power status", address, engine.power_status(address))
        .unwrap_or(PowerStatus::Unknown);
    dev.osd_name = best_effort("osd name", address, engine.osd_name(address));
    dev.menu_language = best_effort("menu language", address, engine.menu_language(address));
    dev
}

pub struct Session {
    bus: Arc<Mutex<Bus>>,
    ready: AtomicBool,
    timing: SessionTiming,
}

impl Session {
    /// Initialise a protocol engine. No adapter is bound yet.
    pub fn open(
        factory: &dyn EngineFactory,
        config: &EngineConfig,
        callbacks: Arc<dyn EngineCallbacks>,
        timing: SessionTiming,
    ) -> Result<Self> {
        let engine = factory
            .create(config, callbacks)
            .map_err(Error::AdapterInitFailed)?;
        info!(name = %config.device_name, device_type = %config.device_type, "CEC engine initialised");
        Ok(Self {
            bus: Arc::new(Mutex::new(Bus {
                engine,
                state: SessionState::Initialized,
            })),
            ready: AtomicBool::new(false),
            timing,
        })
    }

    pub fn timing(&self) -> &SessionTiming {
        &self.timing
    }

    pub fn state(&self) -> SessionState {
        self.bus.lock().state
    }

    /// True once an adapter is open. Bus operations fail before that.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Adapters that could be opened. An empty list is not an error.
    pub fn find_adapters(&self) -> Result<Vec<AdapterDescriptor>> {
        let mut bus = self.bus.lock();
        if !matches!(bus.state, SessionState::Initialized | SessionState::AdapterFound) {
            return Err(Error::InvalidState {
                operation: "find_adapters",
                state: bus.state.as_str(),
            });
        }
        let adapters = bus.engine.find_adapters().map_err(Error::AdapterInitFailed)?;
        if !adapters.is_empty() {
            bus.state = SessionState::AdapterFound;
        }
        debug!(count = adapters.len(), "found CEC adapters");
        Ok(adapters)
    }

    /// Bind to an adapter. A session opens at most one adapter, once.
    pub fn open_adapter(&self, path: &str) -> Result<()> {
        let mut bus = self.bus.lock();
        if !matches!(bus.state, SessionState::Initialized | SessionState::AdapterFound) {
            return Err(Error::InvalidState {
                operation: "open_adapter",
                state: bus.state.as_str(),
            });
        }
        bus.engine
            .open(path)
            .map_err(|source| Error::AdapterOpenFailed {
                path: path.to_string(),
                source,
            })?;
        bus.state = SessionState::AdapterOpen;
        // listings without a rescan only know what has been polled
        if let Err(e) = bus.engine.rescan() {
            warn!(%path, "initial device scan failed: {e}");
        }
        self.ready.store(true, Ordering::Release);
        info!(%path, devices = bus.engine.active_devices().iter().count(), "CEC adapter open");
        Ok(())
    }

    /// Release adapter and engine. Closing twice is a no-op.
    pub fn close(&self) {
        let mut bus = self.bus.lock();
        if bus.state == SessionState::Closed {
            return;
        }
        self.ready.store(false, Ordering::Release);
        bus.engine.close();
        bus.state = SessionState::Closed;
        info!("CEC session closed");
    }

    pub fn engine_info(&self) -> String {
        self.bus.lock().engine.info()
    }

    /// Run one engine primitive under the bus lock.
    fn with_engine<T>(
        &self,
        operation: &'static str,
        address: Option<LogicalAddress>,
        f: impl FnOnce(&mut dyn CecEngine) -> io::Result<T>,
    ) -> Result<T> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine(operation)?;
        f(engine).map_err(|e| {
            let err = Error::bus(operation, address)(e);
            warn!("{err}");
            err
        })
    }

    pub fn power_on(&self, address: LogicalAddress) -> Result<()> {
        self.with_engine("power_on", Some(address), |e| e.power_on(address))
    }

    pub fn standby(&self, address: LogicalAddress) -> Result<()> {
        self.with_engine("standby", Some(address), |e| e.standby(address))
    }

    pub fn volume_up(&self, send_release: bool) -> Result<()> {
        self.with_engine("volume_up", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.volume_up(send_release))
    }

    pub fn volume_down(&self, send_release: bool) -> Result<()> {
        self.with_engine("volume_down", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.volume_down(send_release))
    }

    pub fn audio_toggle_mute(&self) -> Result<()> {
        self.with_engine("audio_toggle_mute", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.toggle_mute())
    }

    pub fn audio_mute(&self) -> Result<()> {
        self.with_engine("audio_mute", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.mute())
    }

    pub fn audio_unmute(&self) -> Result<()> {
        self.with_engine("audio_unmute", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.unmute())
    }

    /// Send a raw frame. The command was validated when it was built.
    pub fn transmit(&self, command: &Command) -> Result<()> {
        self.with_engine("transmit", Some(command.destination), |e| e.transmit(command))
    }

    pub fn get_device_power_status(&self, address: LogicalAddress) -> Result<PowerStatus> {
        self.with_engine("get_device_power_status", Some(address), |e| e.power_status(address))
    }

    pub fn get_active_source(&self) -> Result<LogicalAddress> {
        self.with_engine("get_active_source", None, |e| e.active_source())
    }

    pub fn get_device_physical_address(&self, address: LogicalAddress) -> Result<PhysicalAddress> {
        self.with_engine("get_device_physical_address", Some(address), |e| e.physical_address(address))
    }

    pub fn get_device_vendor_id(&self, address: LogicalAddress) -> Result<u32> {
        self.with_engine("get_device_vendor_id", Some(address), |e| e.vendor_id(address))
    }

    pub fn get_device_osd_name(&self, address: LogicalAddress) -> Result<String> {
        self.with_engine("get_device_osd_name", Some(address), |e| e.osd_name(address))
    }

    pub fn get_device_menu_language(&self, address: LogicalAddress) -> Result<String> {
        self.with_engine("get_device_menu_language", Some(address), |e| e.menu_language(address))
    }

    pub fn get_device_cec_version(&self, address: LogicalAddress) -> Result<CecVersion> {
        self.with_engine("get_device_cec_version", Some(address), |e| e.cec_version(address))
    }

    /// Last known active addresses, ascending. Does not touch the bus.
    pub fn get_active_devices(&self) -> Result<Vec<LogicalAddress>> {
        self.with_engine("get_active_devices", None, |e| Ok(e.active_devices().iter().collect()))
    }

    /// Poll every address. Blocks while the devices answer.
    pub fn rescan_devices(&self) -> Result<()> {
        self.with_engine("rescan_devices", None, |e| e.rescan())
    }

    /// The addresses this adapter claimed.
    pub fn get_logical_addresses(&self) -> Result<Vec<LogicalAddress>> {
        self.with_engine("get_logical_addresses", None, |e| Ok(e.logical_addresses().iter().collect()))
    }

    pub fn get_audio_status(&self) -> Result<AudioStatus> {
        self.with_engine("get_audio_status", Some(LogicalAddress::AUDIO_SYSTEM), |e| e.audio_status())
    }

    /// Make the root display show HDMI input `port`.
    ///
    /// Wakes the TV, waits for it to settle and asks the engine to select the port.
    /// If that fails for any reason an `Active Source` for `port.0.0.0` is broadcast instead.
    pub fn switch_to_hdmi_port(&self, port: HdmiPort) -> Result<()> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("switch_to_hdmi_port")?;
        wake_tv(engine);
        thread::sleep(self.timing.settle);
        match engine.set_hdmi_port(port) {
            Ok(()) => {
                info!(%port, "switched HDMI port");
                return Ok(());
            }
            Err(e) => debug!(%port, "selecting the port directly failed, broadcasting active source: {e}"),
        }
        broadcast_active_source(engine, port.physical_address())
            .map_err(Error::bus("switch_to_hdmi_port", None))?;
        info!(%port, "switched HDMI port via active source");
        Ok(())
    }

    /// Make the root display show the device at `address`.
    pub fn switch_to_device(&self, address: LogicalAddress) -> Result<()> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("switch_to_device")?;
        wake_tv(engine);
        thread::sleep(self.timing.settle);
        let pa = engine
            .physical_address(address)
            .map_err(|e| Error::RouteUnresolved {
                address,
                source: Box::new(Error::bus("get_device_physical_address", Some(address))(e)),
            })?;
        broadcast_active_source(engine, pa).map_err(Error::bus("switch_to_device", Some(address)))?;
        info!(%address, physical_address = %pa, "switched source");
        Ok(())
    }

    /// Press and release a volume or mute key, waiting for both to be acknowledged.
    pub fn send_volume_key(&self, address: LogicalAddress, key: UserControlCode) -> Result<()> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("send_volume_key")?;
        engine
            .send_keypress(address, key.into(), true)
            .map_err(Error::bus("send_volume_key", Some(address)))?;
        thread::sleep(self.timing.volume_hold);
        engine
            .send_key_release(address, true)
            .map_err(Error::bus("send_volume_key", Some(address)))
    }

    /// Press and release a key without waiting for acknowledgements.
    pub fn send_button(&self, address: LogicalAddress, keycode: u8) -> Result<()> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("send_button")?;
        engine
            .send_keypress(address, keycode, false)
            .map_err(Error::bus("send_button", Some(address)))?;
        thread::sleep(self.timing.button_hold);
        engine
            .send_key_release(address, false)
            .map_err(Error::bus("send_button", Some(address)))
    }

    /// One device with every attribute that could be queried.
    pub fn get_device_info(&self, address: LogicalAddress) -> Result<Device> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("get_device_info")?;
        let active_source = best_effort("active source", address, engine.active_source());
        Ok(query_device(engine, address, active_source))
    }

    /// All active devices, queried one after another within the listing deadline.
    ///
    /// When the deadline passes the devices gathered so far are returned, marked partial.
    /// A query that is still running then finishes in the background.
    pub fn list_devices(&self, force_rescan: bool) -> Result<DeviceListing> {
        let (addresses, active_source) = {
            let mut bus = self.bus.lock();
            let engine = bus.ready_engine("list_devices")?;
            if force_rescan {
                engine.rescan().map_err(Error::bus("rescan_devices", None))?;
            }
            let active_source = engine.active_source().ok();
            (engine.active_devices(), active_source)
        };
        let total = addresses.len();
        let deadline = Instant::now() + self.timing.listing_deadline;

        let (tx, rx) = mpsc::channel();
        let bus = self.bus.clone();
        thread::Builder::new()
            .name("cec-device-query".into())
            .spawn(move || {
                for address in addresses.iter() {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let mut bus = bus.lock();
                    let Ok(engine) = bus.ready_engine("list_devices") else {
                        break;
                    };
                    let dev = query_device(engine, address, active_source);
                    drop(bus);
                    if tx.send(dev).is_err() {
                        break;
                    }
                }
            })
            .map_err(Error::bus("list_devices", None))?;

        let mut devices = Vec::with_capacity(total);
        let mut partial = false;
        while devices.len() < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(dev) => devices.push(dev),
                Err(RecvTimeoutError::Timeout) => {
                    partial = true;
                    break;
                }
                // the query thread stopped early
                Err(RecvTimeoutError::Disconnected) => {
                    partial = true;
                    break;
                }
            }
        }
        if partial {
            warn!(retrieved = devices.len(), total, "device listing incomplete");
        }
        Ok(DeviceListing {
            devices,
            total,
            partial,
        })
    }

    /// Active devices grouped by the HDMI input they are connected to.
    ///
    /// The TV and devices without a usable physical address are left out.
    pub fn get_bus_topology(&self) -> Result<BusTopology> {
        let mut bus = self.bus.lock();
        let engine = bus.ready_engine("get_bus_topology")?;
        let own = engine.logical_addresses();
        let own_physical_address = engine
            .own_physical_address()
            .unwrap_or(PhysicalAddress::INVALID);

        let mut ports: BTreeMap<u8, Vec<TopologyDevice>> = BTreeMap::new();
        for address in engine.active_devices().iter() {
            if address == LogicalAddress::TV || address == LogicalAddress::BROADCAST {
                continue;
            }
            let Some(pa) = best_effort("physical address", address, engine.physical_address(address)) else {
                continue;
            };
            if !pa.is_placeable() {
                continue;
            }
            let name = best_effort("osd name", address, engine.osd_name(address))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| address.name().to_string());
            ports
                .entry(pa.port())
                .or_default()
                .push(TopologyDevice { address, name });
        }

        let own_port = if own_physical_address.is_placeable() {
            own_physical_address.port()
        } else {
            0
        };
        let known_port_count = ports.len() + usize::from(own_port != 0 && !ports.contains_key(&own_port));
        Ok(BusTopology {
            own_addresses: own.iter().collect(),
            own_physical_address,
            own_port,
            known_port_count,
            active_ports: ports
                .into_iter()
                .map(|(port, devices)| PortDevices { port, devices })
                .collect(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::DeviceType,
        engine::mock::{Call, MockDevice, MockEngine},
        hub::EventHub,
    };

    fn la(raw: u8) -> LogicalAddress {
        LogicalAddress::new(raw).unwrap()
    }

    fn fast() -> SessionTiming {
        SessionTiming {
            settle: Duration::ZERO,
            button_hold: Duration::ZERO,
            volume_hold: Duration::ZERO,
            listing_deadline: Duration::from_secs(5),
            post_open_settle: Duration::ZERO,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            device_name: "Test".into(),
            device_type: DeviceType::RecordingDevice,
        }
    }

    fn session_with(mock: &MockEngine, timing: SessionTiming) -> Session {
        let hub = EventHub::new();
        let session = Session::open(&mock.factory(), &config(), hub.callbacks(), timing).unwrap();
        session.open_adapter("/dev/cec0").unwrap();
        mock.clear_calls();
        session
    }

    fn open_session(mock: &MockEngine) -> Session {
        session_with(mock, fast())
    }

    fn transmit(from: u8, to: u8, opcode: Opcode, params: &[u8]) -> Call {
        Call::Transmit(Command::short(la(from), la(to), opcode, params))
    }

    #[test]
    fn lifecycle() {
        let mock = MockEngine::new();
        let hub = EventHub::new();
        let session = Session::open(&mock.factory(), &config(), hub.callbacks(), fast()).unwrap();
        assert_eq!(session.state(), SessionState::Initialized);
        assert!(!session.is_ready());
        assert!(matches!(
            session.power_on(LogicalAddress::TV),
            Err(Error::InvalidState { .. })
        ));

        let adapters = session.find_adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(session.state(), SessionState::AdapterFound);

        session.open_adapter(adapters[0].open_path()).unwrap();
        assert!(session.is_ready());
        assert!(matches!(
            session.open_adapter("/dev/cec0"),
            Err(Error::InvalidState { operation: "open_adapter", .. })
        ));

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_ready());
        assert!(!mock.is_open());
        assert_eq!(mock.calls().iter().filter(|c| **c == Call::Close).count(), 1);
    }

    #[test]
    fn opening_scans_the_bus() {
        let mock = MockEngine::new();
        mock.on_bus(4, MockDevice::at(0x1000).named("Player"));
        let session = open_session(&mock);
        assert_eq!(session.get_active_devices().unwrap(), vec![la(4)]);
        let listing = session.list_devices(false).unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.devices[0].logical_address, la(4));
        assert!(listing.devices[0].is_active);
        assert_eq!(session.get_bus_topology().unwrap().active_ports[0].port, 1);
    }

    #[test]
    fn failed_initial_scan_still_opens() {
        let mock = MockEngine::new();
        mock.fail("rescan");
        mock.on_bus(4, MockDevice::at(0x1000));
        let session = open_session(&mock);
        assert!(session.is_ready());
        assert!(session.get_active_devices().unwrap().is_empty());
    }

    #[test]
    fn no_adapters_is_an_empty_list() {
        let mock = MockEngine::new();
        mock.set_adapters(vec![]);
        let session = Session::open(&mock.factory(), &config(), EventHub::new().callbacks(), fast()).unwrap();
        assert!(session.find_adapters().unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn engine_failures_are_classified() {
        let mock = MockEngine::new();
        mock.fail("create");
        let err = Session::open(&mock.factory(), &config(), EventHub::new().callbacks(), fast());
        assert!(matches!(err, Err(Error::AdapterInitFailed(_))));

        let mock = MockEngine::new();
        mock.fail("open");
        let session = Session::open(&mock.factory(), &config(), EventHub::new().callbacks(), fast()).unwrap();
        assert!(matches!(
            session.open_adapter("/dev/cec0"),
            Err(Error::AdapterOpenFailed { .. })
        ));
        assert!(!session.is_ready());
    }

    #[test]
    fn failed_primitives_are_reported_once() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        mock.fail("power_on");
        let err = session.power_on(la(4)).unwrap_err();
        match &err {
            Error::BusOperationFailed { operation, address, .. } => {
                assert_eq!(*operation, "power_on");
                assert_eq!(*address, Some(la(4)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.http_status(), 500);
        assert_eq!(mock.calls(), vec![Call::PowerOn(la(4))]);

        mock.set_audio(Some(AudioStatus { volume: 10, muted: true }));
        for op in ["rescan", "vendor_id", "menu_language", "cec_version", "unmute"] {
            mock.fail(op);
        }
        let failures: Vec<(&str, Error)> = vec![
            ("rescan_devices", session.rescan_devices().unwrap_err()),
            ("get_device_vendor_id", session.get_device_vendor_id(la(4)).map(|_| ()).unwrap_err()),
            ("get_device_menu_language", session.get_device_menu_language(la(4)).map(|_| ()).unwrap_err()),
            ("get_device_cec_version", session.get_device_cec_version(la(4)).map(|_| ()).unwrap_err()),
            ("audio_unmute", session.audio_unmute().unwrap_err()),
        ];
        for (expected, err) in failures {
            assert!(
                matches!(err, Error::BusOperationFailed { operation, .. } if operation == expected),
                "{expected}: {err:?}"
            );
        }
        assert_eq!(
            mock.calls().iter().filter(|c| **c == Call::Rescan).count(),
            1,
            "failed rescans are not retried"
        );
    }

    #[test]
    fn queries_of_answering_devices() {
        let mut dev = MockDevice::at(0x2000);
        dev.menu_language = Some("eng".into());
        let mock = MockEngine::new().with_device(4, dev);
        mock.set_audio(Some(AudioStatus { volume: 10, muted: true }));
        let session = open_session(&mock);
        session.rescan_devices().unwrap();
        assert_eq!(session.get_active_devices().unwrap(), vec![la(4)]);
        assert_eq!(session.get_device_vendor_id(la(4)).unwrap(), 0x0000F0);
        assert_eq!(session.get_device_menu_language(la(4)).unwrap(), "eng");
        assert_eq!(session.get_device_cec_version(la(4)).unwrap(), CecVersion::V1_4);
        session.audio_unmute().unwrap();
        assert!(!session.get_audio_status().unwrap().muted);
    }

    #[test]
    fn absent_devices_are_errors_not_defaults() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        assert!(session.get_device_power_status(la(8)).is_err());
        assert!(session.get_device_osd_name(la(8)).is_err());
        assert!(session.get_audio_status().is_err());
    }

    #[test]
    fn invalid_ports_never_reach_the_bus() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        for port in [0u8, 16] {
            let result = HdmiPort::try_from(port)
                .map_err(Error::from)
                .and_then(|p| session.switch_to_hdmi_port(p));
            assert_eq!(result.unwrap_err().http_status(), 400);
        }
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn hdmi_port_primary_path() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        session.switch_to_hdmi_port(HdmiPort::try_from(2).unwrap()).unwrap();
        assert_eq!(
            mock.calls(),
            vec![transmit(1, 0, Opcode::ImageViewOn, &[]), Call::SetHdmiPort(2)]
        );
    }

    #[test]
    fn hdmi_port_falls_back_to_active_source() {
        let mock = MockEngine::new();
        mock.fail("set_hdmi_port");
        let session = open_session(&mock);
        session.switch_to_hdmi_port(HdmiPort::try_from(2).unwrap()).unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                transmit(1, 0, Opcode::ImageViewOn, &[]),
                Call::SetHdmiPort(2),
                transmit(1, 15, Opcode::ActiveSource, &[0x20, 0x00]),
            ]
        );
    }

    #[test]
    fn wake_failures_do_not_stop_switching() {
        let mock = MockEngine::new();
        mock.fail_times("transmit", 1);
        let session = open_session(&mock);
        session.switch_to_hdmi_port(HdmiPort::try_from(3).unwrap()).unwrap();
        assert_eq!(mock.calls().last(), Some(&Call::SetHdmiPort(3)));
    }

    #[test]
    fn switch_to_device_routes_to_its_physical_address() {
        let mock = MockEngine::new().with_device(4, MockDevice::at(0x2100));
        let session = open_session(&mock);
        session.switch_to_device(la(4)).unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                transmit(1, 0, Opcode::ImageViewOn, &[]),
                Call::PhysicalAddress(la(4)),
                transmit(1, 15, Opcode::ActiveSource, &[0x21, 0x00]),
            ]
        );
    }

    #[test]
    fn switch_to_unknown_device_fails() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        let err = session.switch_to_device(la(8)).unwrap_err();
        assert!(matches!(err, Error::RouteUnresolved { address, .. } if address == la(8)));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Transmit(cmd) if cmd.opcode == u8::from(Opcode::ActiveSource))));
    }

    #[test]
    fn volume_keys_wait_for_acks_buttons_do_not() {
        let mock = MockEngine::new();
        let session = open_session(&mock);
        session.send_volume_key(la(5), UserControlCode::VolumeUp).unwrap();
        session.send_button(la(4), 0x01).unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                Call::KeyPress { address: la(5), keycode: 0x41, wait_ack: true },
                Call::KeyRelease { address: la(5), wait_ack: true },
                Call::KeyPress { address: la(4), keycode: 0x01, wait_ack: false },
                Call::KeyRelease { address: la(4), wait_ack: false },
            ]
        );
    }

    #[test]
    fn volume_hold_is_applied() {
        let mock = MockEngine::new();
        let session = session_with(
            &mock,
            SessionTiming {
                volume_hold: Duration::from_millis(50),
                ..fast()
            },
        );
        let start = Instant::now();
        session.send_volume_key(la(5), UserControlCode::Mute).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn device_info_tolerates_failing_queries() {
        let mut dev = MockDevice::at(0x1000).named("Player");
        dev.menu_language = None;
        dev.power_status = None;
        let mock = MockEngine::new().with_device(4, dev);
        mock.set_active_source(Some(la(4)));
        let session = open_session(&mock);

        let info = session.get_device_info(la(4)).unwrap();
        assert_eq!(info.physical_address, Some(PhysicalAddress::new(0x1000)));
        assert_eq!(info.osd_name.as_deref(), Some("Player"));
        assert_eq!(info.menu_language, None);
        assert_eq!(info.power_status, PowerStatus::Unknown);
        assert!(info.is_active);
        assert!(info.is_active_source);
    }

    #[test]
    fn listing_without_rescan_uses_known_devices() {
        let mock = MockEngine::new()
            .with_device(0, MockDevice::at(0x0000))
            .with_device(4, MockDevice::at(0x1000));
        let session = open_session(&mock);
        let listing = session.list_devices(false).unwrap();
        assert!(!listing.partial);
        assert_eq!(listing.total, 2);
        assert_eq!(listing.devices.len(), 2);
        assert!(!mock.calls().contains(&Call::Rescan));

        session.list_devices(true).unwrap();
        assert!(mock.calls().contains(&Call::Rescan));
    }

    #[test]
    fn listing_stops_at_the_deadline() {
        let mock = MockEngine::new()
            .with_device(1, MockDevice::at(0x1000))
            .with_device(2, MockDevice::at(0x2000))
            .with_device(3, MockDevice::at(0x3000).slow(Duration::from_secs(2)))
            .with_device(4, MockDevice::at(0x4000))
            .with_device(5, MockDevice::at(0x5000));
        let session = session_with(
            &mock,
            SessionTiming {
                listing_deadline: Duration::from_millis(300),
                ..fast()
            },
        );

        let start = Instant::now();
        let listing = session.list_devices(false).unwrap();
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert!(listing.partial);
        assert_eq!(listing.total, 5);
        assert!(listing.devices.len() <= 2);
        assert_eq!(
            listing.message(),
            format!("Devices retrieved (partial: {} of 5, CEC bus slow)", listing.devices.len())
        );
    }

    #[test]
    fn topology_groups_by_port() {
        let mock = MockEngine::new()
            .with_device(0, MockDevice::at(0x0000).named("TV"))
            .with_device(4, MockDevice::at(0x2000).named("Player"))
            .with_device(5, MockDevice::at(0x2100))
            .with_device(8, MockDevice::at(0x3000).named("Console"))
            .with_device(11, MockDevice::at(0xffff))
            .with_device(3, MockDevice::default());
        let session = open_session(&mock);

        let topology = session.get_bus_topology().unwrap();
        assert_eq!(topology.own_addresses, vec![la(1)]);
        assert_eq!(topology.own_port, 1);
        assert_eq!(topology.known_port_count, 3);
        let ports: Vec<(u8, Vec<String>)> = topology
            .active_ports
            .iter()
            .map(|p| (p.port, p.devices.iter().map(|d| d.name.clone()).collect()))
            .collect();
        assert_eq!(
            ports,
            vec![
                (2, vec!["Player".to_string(), "Audio System".to_string()]),
                (3, vec!["Console".to_string()]),
            ]
        );
    }

    #[test]
    fn audio_status_passes_through() {
        let mock = MockEngine::new();
        mock.set_audio(Some(AudioStatus { volume: 30, muted: false }));
        let session = open_session(&mock);
        assert_eq!(session.get_audio_status().unwrap(), AudioStatus { volume: 30, muted: false });
        session.audio_mute().unwrap();
        assert!(session.get_audio_status().unwrap().muted);
    }

    #[test]
    fn bus_operations_are_serialized() {
        let mock = MockEngine::new();
        let session = Arc::new(session_with(
            &mock,
            SessionTiming {
                volume_hold: Duration::from_millis(20),
                ..fast()
            },
        ));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                thread::spawn(move || session.send_volume_key(la(5), UserControlCode::VolumeDown).unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let calls = mock.calls();
        assert_eq!(calls.len(), 8);
        for pair in calls.chunks(2) {
            assert!(matches!(pair[0], Call::KeyPress { .. }));
            assert!(matches!(pair[1], Call::KeyRelease { .. }));
        }
    }
}
