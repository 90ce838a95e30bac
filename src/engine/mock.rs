//! A scriptable engine that records every primitive call.
//!
//! Clones share their state, so a test can keep one handle while the session owns another.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use super::{AdapterDescriptor, CecEngine, EngineCallbacks, EngineConfig, EngineFactory};
use crate::{
    address::{HdmiPort, LogicalAddress, LogicalAddressSet, PhysicalAddress},
    command::Command,
    device::AudioStatus,
    protocol::{CecVersion, PowerStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindAdapters,
    Open(String),
    Close,
    Transmit(Command),
    PowerOn(LogicalAddress),
    Standby(LogicalAddress),
    VolumeUp(bool),
    VolumeDown(bool),
    ToggleMute,
    Mute,
    Unmute,
    KeyPress {
        address: LogicalAddress,
        keycode: u8,
        wait_ack: bool,
    },
    KeyRelease {
        address: LogicalAddress,
        wait_ack: bool,
    },
    SetHdmiPort(u8),
    PowerStatus(LogicalAddress),
    ActiveSource,
    PhysicalAddress(LogicalAddress),
    VendorId(LogicalAddress),
    OsdName(LogicalAddress),
    MenuLanguage(LogicalAddress),
    CecVersion(LogicalAddress),
    AudioStatus,
    Rescan,
}

/// What a scripted device answers. `None` fields do not answer.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    pub physical_address: Option<PhysicalAddress>,
    pub vendor_id: Option<u32>,
    pub cec_version: Option<CecVersion>,
    pub power_status: Option<PowerStatus>,
    pub osd_name: Option<String>,
    pub menu_language: Option<String>,
    /// the first query to this device blocks this long
    pub delay: Option<Duration>,
}

impl MockDevice {
    pub fn at(physical_address: u16) -> Self {
        Self {
            physical_address: Some(PhysicalAddress::new(physical_address)),
            vendor_id: Some(0x0000F0),
            cec_version: Some(CecVersion::V1_4),
            power_status: Some(PowerStatus::On),
            ..Default::default()
        }
    }
    pub fn named(mut self, name: &str) -> Self {
        self.osd_name = Some(name.to_string());
        self
    }
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    adapters: Vec<AdapterDescriptor>,
    devices: BTreeMap<LogicalAddress, MockDevice>,
    active: LogicalAddressSet,
    own: LogicalAddressSet,
    own_physical_address: Option<PhysicalAddress>,
    active_source: Option<LogicalAddress>,
    audio: Option<AudioStatus>,
    /// remaining failures per operation, `usize::MAX` for always
    failures: HashMap<&'static str, usize>,
    created: usize,
    config: Option<EngineConfig>,
    callbacks: Option<Arc<dyn EngineCallbacks>>,
    open: bool,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<State>>,
}

fn no_answer(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what}: no answer"))
}

impl MockEngine {
    /// An engine with one adapter, claiming address 1 at `1.0.0.0`.
    pub fn new() -> Self {
        let mock = Self::default();
        {
            let mut s = mock.state.lock();
            s.adapters.push(AdapterDescriptor {
                path: "/dev/cec0".into(),
                comm: "mock".into(),
            });
            s.own.insert(LogicalAddress::RECORDING_DEVICE_1);
            s.own_physical_address = Some(PhysicalAddress::new(0x1000));
        }
        mock
    }
    pub fn with_device(self, address: u8, device: MockDevice) -> Self {
        self.add_device(address, device);
        self
    }
    pub fn add_device(&self, address: u8, device: MockDevice) {
        let address = LogicalAddress::from_nibble(address);
        let mut s = self.state.lock();
        s.active.insert(address);
        s.devices.insert(address, device);
    }
    /// A device that answers but is not known as active until the bus is scanned.
    pub fn on_bus(&self, address: u8, device: MockDevice) {
        let address = LogicalAddress::from_nibble(address);
        self.state.lock().devices.insert(address, device);
    }
    pub fn set_adapters(&self, adapters: Vec<AdapterDescriptor>) {
        self.state.lock().adapters = adapters;
    }
    pub fn set_active_source(&self, address: Option<LogicalAddress>) {
        self.state.lock().active_source = address;
    }
    pub fn set_audio(&self, audio: Option<AudioStatus>) {
        self.state.lock().audio = audio;
    }
    pub fn set_own_physical_address(&self, pa: Option<PhysicalAddress>) {
        self.state.lock().own_physical_address = pa;
    }
    /// Make `operation` (a [CecEngine] method name, or `create`) fail from now on.
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation, usize::MAX);
    }
    /// Make `operation` fail the next `times` calls.
    pub fn fail_times(&self, operation: &'static str, times: usize) {
        self.state.lock().failures.insert(operation, times);
    }
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
    /// how many engines the factory handed out
    pub fn created(&self) -> usize {
        self.state.lock().created
    }
    pub fn config(&self) -> Option<EngineConfig> {
        self.state.lock().config.clone()
    }
    /// Callbacks registered by the last engine created through [MockEngine::factory].
    pub fn callbacks(&self) -> Option<Arc<dyn EngineCallbacks>> {
        self.state.lock().callbacks.clone()
    }
    pub fn factory(&self) -> impl EngineFactory {
        let mock = self.clone();
        move |config: &EngineConfig, callbacks: Arc<dyn EngineCallbacks>| -> io::Result<Box<dyn CecEngine>> {
            {
                let mut s = mock.state.lock();
                s.created += 1;
                s.config = Some(config.clone());
                s.callbacks = Some(callbacks);
            }
            mock.check("create")?;
            Ok(Box::new(mock.clone()))
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
    fn check(&self, operation: &'static str) -> io::Result<()> {
        let mut s = self.state.lock();
        match s.failures.get_mut(operation) {
            Some(0) | None => Ok(()),
            Some(left) => {
                if *left != usize::MAX {
                    *left -= 1;
                }
                Err(io::Error::new(io::ErrorKind::Other, format!("{operation} failed")))
            }
        }
    }
    /// The scripted device, after waiting out its delay. The lock is not held while waiting.
    fn device(&self, address: LogicalAddress) -> Option<MockDevice> {
        let delay = self
            .state
            .lock()
            .devices
            .get_mut(&address)
            .and_then(|d| d.delay.take());
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.state.lock().devices.get(&address).cloned()
    }
    fn step(&self, call: Call, operation: &'static str) -> io::Result<()> {
        self.record(call);
        self.check(operation)
    }
}

impl CecEngine for MockEngine {
    fn find_adapters(&mut self) -> io::Result<Vec<AdapterDescriptor>> {
        self.step(Call::FindAdapters, "find_adapters")?;
        Ok(self.state.lock().adapters.clone())
    }
    fn open(&mut self, path: &str) -> io::Result<()> {
        self.step(Call::Open(path.to_string()), "open")?;
        self.state.lock().open = true;
        Ok(())
    }
    fn close(&mut self) {
        self.record(Call::Close);
        self.state.lock().open = false;
    }
    fn transmit(&mut self, command: &Command) -> io::Result<()> {
        self.step(Call::Transmit(command.clone()), "transmit")
    }
    fn power_on(&mut self, address: LogicalAddress) -> io::Result<()> {
        self.step(Call::PowerOn(address), "power_on")
    }
    fn standby(&mut self, address: LogicalAddress) -> io::Result<()> {
        self.step(Call::Standby(address), "standby")
    }
    fn volume_up(&mut self, send_release: bool) -> io::Result<()> {
        self.step(Call::VolumeUp(send_release), "volume_up")
    }
    fn volume_down(&mut self, send_release: bool) -> io::Result<()> {
        self.step(Call::VolumeDown(send_release), "volume_down")
    }
    fn toggle_mute(&mut self) -> io::Result<()> {
        self.step(Call::ToggleMute, "toggle_mute")?;
        if let Some(audio) = self.state.lock().audio.as_mut() {
            audio.muted = !audio.muted;
        }
        Ok(())
    }
    fn mute(&mut self) -> io::Result<()> {
        self.step(Call::Mute, "mute")?;
        if let Some(audio) = self.state.lock().audio.as_mut() {
            audio.muted = true;
        }
        Ok(())
    }
    fn unmute(&mut self) -> io::Result<()> {
        self.step(Call::Unmute, "unmute")?;
        if let Some(audio) = self.state.lock().audio.as_mut() {
            audio.muted = false;
        }
        Ok(())
    }
    fn send_keypress(&mut self, address: LogicalAddress, keycode: u8, wait_ack: bool) -> io::Result<()> {
        self.step(
            Call::KeyPress {
                address,
                keycode,
                wait_ack,
            },
            "send_keypress",
        )
    }
    fn send_key_release(&mut self, address: LogicalAddress, wait_ack: bool) -> io::Result<()> {
        self.step(Call::KeyRelease { address, wait_ack }, "send_key_release")
    }
    fn set_hdmi_port(&mut self, port: HdmiPort) -> io::Result<()> {
        self.step(Call::SetHdmiPort(port.value()), "set_hdmi_port")
    }
    fn power_status(&mut self, address: LogicalAddress) -> io::Result<PowerStatus> {
        self.step(Call::PowerStatus(address), "power_status")?;
        self.device(address)
            .and_then(|d| d.power_status)
            .ok_or_else(|| no_answer("power status"))
    }
    fn active_source(&mut self) -> io::Result<LogicalAddress> {
        self.step(Call::ActiveSource, "active_source")?;
        self.state
            .lock()
            .active_source
            .ok_or_else(|| no_answer("active source"))
    }
    fn physical_address(&mut self, address: LogicalAddress) -> io::Result<PhysicalAddress> {
        self.step(Call::PhysicalAddress(address), "physical_address")?;
        self.device(address)
            .and_then(|d| d.physical_address)
            .ok_or_else(|| no_answer("physical address"))
    }
    fn vendor_id(&mut self, address: LogicalAddress) -> io::Result<u32> {
        self.step(Call::VendorId(address), "vendor_id")?;
        self.device(address)
            .and_then(|d| d.vendor_id)
            .ok_or_else(|| no_answer("vendor id"))
    }
    fn osd_name(&mut self, address: LogicalAddress) -> io::Result<String> {
        self.step(Call::OsdName(address), "osd_name")?;
        self.device(address)
            .and_then(|d| d.osd_name)
            .ok_or_else(|| no_answer("osd name"))
    }
    fn menu_language(&mut self, address: LogicalAddress) -> io::Result<String> {
        self.step(Call::MenuLanguage(address), "menu_language")?;
        self.device(address)
            .and_then(|d| d.menu_language)
            .ok_or_else(|| no_answer("menu language"))
    }
    fn cec_version(&mut self, address: LogicalAddress) -> io::Result<CecVersion> {
        self.step(Call::CecVersion(address), "cec_version")?;
        self.device(address)
            .and_then(|d| d.cec_version)
            .ok_or_else(|| no_answer("cec version"))
    }
    fn audio_status(&mut self) -> io::Result<AudioStatus> {
        self.step(Call::AudioStatus, "audio_status")?;
        self.state.lock().audio.ok_or_else(|| no_answer("audio status"))
    }
    fn active_devices(&mut self) -> LogicalAddressSet {
        self.state.lock().active
    }
    fn rescan(&mut self) -> io::Result<()> {
        self.step(Call::Rescan, "rescan")?;
        let mut s = self.state.lock();
        s.active = s.devices.keys().copied().collect();
        Ok(())
    }
    fn logical_addresses(&mut self) -> LogicalAddressSet {
        self.state.lock().own
    }
    fn own_physical_address(&mut self) -> io::Result<PhysicalAddress> {
        self.state
            .lock()
            .own_physical_address
            .ok_or_else(|| no_answer("own physical address"))
    }
    fn info(&self) -> String {
        "mock engine".to_string()
    }
}
