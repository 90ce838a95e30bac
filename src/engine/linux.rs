/*!
 * [CecEngine] over the [CEC linux API](https://www.kernel.org/doc/html/latest/userspace-api/media/cec/cec-api.html).
 *
 * One file handle transmits and waits for replies. A second handle is switched to
 * follower mode and read by a receiver thread, which keeps track of the devices and
 * the active source it sees and forwards everything to the [EngineCallbacks].
 */
use std::{
    fs::File,
    io,
    mem::MaybeUninit,
    os::fd::{AsFd, AsRawFd},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::{AdapterDescriptor, CecEngine, EngineCallbacks, EngineConfig, EngineFactory};
use crate::{
    address::{HdmiPort, LogicalAddress, LogicalAddressSet, PhysicalAddress},
    command::Command,
    device::AudioStatus,
    protocol::{Alert, CecVersion, Opcode, PowerStatus, UserControlCode},
    sys::{
        self, c_string, Capabilities, CecCaps, CecEvent, CecLogAddrs, CecMsg, RxStatus,
        CEC_EVENT_LOST_MSGS, CEC_EVENT_STATE_CHANGE, CEC_MODE_FOLLOWER_ALL,
        CEC_MODE_FOLLOWER_REPLIES_ONLY, CEC_MODE_INITIATOR_SEND, CEC_PHYS_ADDR_INVALID,
    },
};

/// How long a query waits for its reply
const REPLY_TIMEOUT_MS: u32 = 1000;
/// How often the receiver checks whether it should stop
const RECEIVE_POLL_MS: u16 = 200;
/// CEC version claimed for our logical address (1.4)
const OWN_CEC_VERSION: u8 = 5;

/// A handle on a CEC device node.
pub struct CecHandle(File);

impl CecHandle {
    /// Open a CEC device. Typically `/dev/cecX`
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(Self)
    }
    /// Wait up to `timeout_ms` for `events`. Returns the events that occurred.
    pub fn poll(&self, events: PollFlags, timeout_ms: u16) -> io::Result<PollFlags> {
        let mut fds = [PollFd::new(self.0.as_fd(), events)];
        poll(&mut fds, PollTimeout::from(timeout_ms))?;
        fds[0].revents().ok_or_else(|| io::ErrorKind::Other.into())
    }
    pub fn get_capas(&self) -> io::Result<CecCaps> {
        let mut capas = CecCaps::default();
        unsafe { sys::capabilities(self.0.as_raw_fd(), &mut capas) }?;
        Ok(capas)
    }
    /// Set initiator and follower mode of this handle, see `sys::CEC_MODE_*`.
    pub fn set_mode(&self, mode: u32) -> io::Result<()> {
        unsafe { sys::set_mode(self.0.as_raw_fd(), &mode) }?;
        Ok(())
    }
    /// Only possible with [Capabilities::PHYS_ADDR].
    pub fn set_phys(&self, addr: u16) -> io::Result<()> {
        unsafe { sys::set_phys(self.0.as_raw_fd(), &addr) }?;
        Ok(())
    }
    /// e.g. 0x3300 -> 3.3.0.0
    pub fn get_phys(&self) -> io::Result<u16> {
        let mut addr = 0;
        unsafe { sys::get_phys(self.0.as_raw_fd(), &mut addr) }?;
        Ok(addr)
    }
    /// Only possible with [Capabilities::LOG_ADDRS].
    /// Blocks until the addresses are claimed if the physical address is valid.
    pub fn set_log(&self, mut log: CecLogAddrs) -> io::Result<()> {
        unsafe { sys::set_log(self.0.as_raw_fd(), &mut log) }?;
        Ok(())
    }
    pub fn get_log(&self) -> io::Result<CecLogAddrs> {
        let mut log = MaybeUninit::uninit();
        unsafe { sys::get_log(self.0.as_raw_fd(), log.as_mut_ptr()) }?;
        Ok(unsafe { log.assume_init() })
    }
    pub fn get_event(&self) -> io::Result<AdapterEvent> {
        let mut evt = CecEvent::default();
        unsafe { sys::get_event(self.0.as_raw_fd(), &mut evt) }?;
        Ok(match evt.event {
            CEC_EVENT_STATE_CHANGE => {
                let s = unsafe { evt.payload.state_change };
                AdapterEvent::StateChange {
                    phys_addr: s.phys_addr,
                    log_addr_mask: s.log_addr_mask,
                }
            }
            CEC_EVENT_LOST_MSGS => AdapterEvent::LostMsgs(unsafe { evt.payload.lost_msgs.lost_msgs }),
            other => AdapterEvent::Other(other),
        })
    }
    /// Send `msg` and wait for it to be acknowledged (or for its reply, if [CecMsg::reply] is set).
    ///
    /// Only failures of the ioctl itself are errors, the caller decides what to make of the tx status.
    pub fn transmit(&self, msg: &mut CecMsg) -> io::Result<()> {
        unsafe { sys::transmit(self.0.as_raw_fd(), msg) }?;
        Ok(())
    }
    /// Send a message and wait for a reply with opcode `wait_for`. Returns its parameters.
    pub fn request_data(
        &self,
        from: LogicalAddress,
        to: LogicalAddress,
        opcode: Opcode,
        data: &[u8],
        wait_for: Opcode,
    ) -> io::Result<Vec<u8>> {
        let mut msg = CecMsg::with_data(from.value(), to.value(), opcode.into(), data);
        msg.reply = wait_for.into();
        msg.timeout = REPLY_TIMEOUT_MS;
        self.transmit(&mut msg)?;
        if !msg.is_acked() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, msg.tx_error()));
        }
        let rx = msg.rx_status();
        if rx.contains(RxStatus::FEATURE_ABORT) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("device {to} refused {opcode:?}"),
            ));
        }
        if !rx.contains(RxStatus::OK) {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no {wait_for:?} from device {to}"),
            ));
        }
        Ok(msg.parameters().to_vec())
    }
    /// receive a single message, block for at most `timeout` ms (0 = forever)
    pub fn rec_for(&self, timeout: u32) -> io::Result<CecMsg> {
        let mut msg = CecMsg::init(0, 0);
        msg.timeout = timeout;
        unsafe { sys::receive(self.0.as_raw_fd(), &mut msg) }?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The physical or the logical addresses of the adapter changed
    StateChange { phys_addr: u16, log_addr_mask: u16 },
    /// Messages were lost because they were not read in time
    LostMsgs(u32),
    Other(u32),
}

/// What the receiver learned about the bus.
#[derive(Debug, Default)]
struct BusView {
    active: LogicalAddressSet,
    active_source: Option<LogicalAddress>,
}

#[derive(Default)]
struct Shared {
    view: Mutex<BusView>,
    changed: Condvar,
}

struct Connection {
    path: String,
    tx: CecHandle,
    driver: String,
    name: String,
    version: String,
    capabilities: Capabilities,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl Connection {
    /// The address we send from, unregistered if none is claimed.
    fn initiator(&self) -> LogicalAddress {
        self.tx
            .get_log()
            .ok()
            .and_then(|log| log.claimed().next())
            .map(LogicalAddress::from_nibble)
            .unwrap_or(LogicalAddress::BROADCAST)
    }
    fn send(&self, to: LogicalAddress, opcode: Opcode, data: &[u8], wait_ack: bool) -> io::Result<()> {
        let from = self.initiator();
        let mut msg = CecMsg::with_data(from.value(), to.value(), opcode.into(), data);
        trace!(from = %from, to = %to, ?opcode, "tx");
        self.tx.transmit(&mut msg)?;
        if msg.is_acked() {
            Ok(())
        } else if wait_ack {
            Err(io::Error::new(io::ErrorKind::Other, msg.tx_error()))
        } else {
            debug!(to = %to, ?opcode, status = %msg.tx_error(), "not acknowledged");
            Ok(())
        }
    }
    fn keypress(&self, to: LogicalAddress, key: u8, wait_ack: bool) -> io::Result<()> {
        self.send(to, Opcode::UserControlPressed, &[key], wait_ack)
    }
    fn release(&self, to: LogicalAddress, wait_ack: bool) -> io::Result<()> {
        self.send(to, Opcode::UserControlReleased, &[], wait_ack)
    }
    fn request(&self, to: LogicalAddress, opcode: Opcode, wait_for: Opcode) -> io::Result<Vec<u8>> {
        let from = self.initiator();
        trace!(from = %from, to = %to, ?opcode, "request");
        self.tx.request_data(from, to, opcode, &[], wait_for)
    }
    fn audio_status(&self) -> io::Result<AudioStatus> {
        let data = self.request(
            LogicalAddress::AUDIO_SYSTEM,
            Opcode::GiveAudioStatus,
            Opcode::ReportAudioStatus,
        )?;
        data.first()
            .copied()
            .and_then(AudioStatus::from_operand)
            .ok_or_else(|| invalid_reply("audio status"))
    }
    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                warn!(path = %self.path, "CEC receiver panicked");
            }
        }
    }
}

fn invalid_reply(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed {what} reply"))
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "no CEC adapter open")
}

pub struct LinuxEngine {
    config: EngineConfig,
    callbacks: Arc<dyn EngineCallbacks>,
    conn: Option<Connection>,
}

impl LinuxEngine {
    pub fn new(config: EngineConfig, callbacks: Arc<dyn EngineCallbacks>) -> Self {
        Self {
            config,
            callbacks,
            conn: None,
        }
    }
    fn conn(&self) -> io::Result<&Connection> {
        self.conn.as_ref().ok_or_else(not_open)
    }
    /// Claim a logical address unless the adapter (or someone else) already did.
    fn claim(&self, tx: &CecHandle) -> io::Result<()> {
        let current = tx.get_log()?;
        if current.num_log_addrs > 0 {
            debug!(mask = current.log_addr_mask, "logical addresses already configured");
            return Ok(());
        }
        let ty = self.config.device_type;
        let log = CecLogAddrs::claim(
            &self.config.device_name,
            OWN_CEC_VERSION,
            ty.log_addr_type(),
            ty.primary_device_type(),
            ty.all_device_types(),
        );
        match tx.set_log(log) {
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => {
                debug!("logical addresses are being configured by someone else");
                Ok(())
            }
            other => other,
        }
    }
}

impl Drop for LinuxEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_cec_node(name: &str) -> bool {
    name.strip_prefix("cec")
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

impl CecEngine for LinuxEngine {
    fn find_adapters(&mut self) -> io::Result<Vec<AdapterDescriptor>> {
        let mut nodes: Vec<String> = std::fs::read_dir("/dev")?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| is_cec_node(n))
            .collect();
        nodes.sort();
        let mut adapters = Vec::with_capacity(nodes.len());
        for node in nodes {
            let path = format!("/dev/{node}");
            match CecHandle::open(&path).and_then(|h| h.get_capas()) {
                Ok(caps) => adapters.push(AdapterDescriptor {
                    comm: format!("{} {}", caps.driver(), caps.name()),
                    path,
                }),
                Err(e) => debug!(%path, "skipping CEC device: {e}"),
            }
        }
        Ok(adapters)
    }

    fn open(&mut self, path: &str) -> io::Result<()> {
        if self.conn.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "adapter already open"));
        }
        let tx = CecHandle::open(path)?;
        let caps = tx.get_capas()?;
        tx.set_mode(CEC_MODE_INITIATOR_SEND | CEC_MODE_FOLLOWER_REPLIES_ONLY)?;
        if caps.capabilities().contains(Capabilities::LOG_ADDRS) {
            self.claim(&tx)?;
        }

        let rx = CecHandle::open(path)?;
        rx.set_mode(CEC_MODE_INITIATOR_SEND | CEC_MODE_FOLLOWER_ALL)?;

        let shared = Arc::new(Shared::default());
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = {
            let shared = shared.clone();
            let stop = stop.clone();
            let callbacks = self.callbacks.clone();
            thread::Builder::new()
                .name("cec-receiver".into())
                .spawn(move || receive_loop(rx, &shared, callbacks.as_ref(), &stop))?
        };

        info!(
            %path,
            driver = %caps.driver(),
            name = %caps.name(),
            capabilities = ?caps.capabilities(),
            "opened CEC adapter"
        );
        self.conn = Some(Connection {
            path: path.to_string(),
            tx,
            driver: caps.driver(),
            name: caps.name(),
            version: caps.version(),
            capabilities: caps.capabilities(),
            shared,
            stop,
            receiver: Some(receiver),
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            info!(path = %conn.path, "closed CEC adapter");
        }
    }

    fn transmit(&mut self, command: &Command) -> io::Result<()> {
        let conn = self.conn()?;
        let mut msg = CecMsg::with_data(
            command.initiator.value(),
            command.destination.value(),
            command.opcode,
            command.parameters(),
        );
        trace!(%command, "tx");
        conn.tx.transmit(&mut msg)?;
        if msg.is_acked() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, msg.tx_error()))
        }
    }

    fn power_on(&mut self, address: LogicalAddress) -> io::Result<()> {
        let conn = self.conn()?;
        if address == LogicalAddress::TV {
            conn.send(address, Opcode::ImageViewOn, &[], true)
        } else {
            conn.keypress(address, UserControlCode::Power.into(), true)?;
            conn.release(address, true)
        }
    }

    fn standby(&mut self, address: LogicalAddress) -> io::Result<()> {
        self.conn()?.send(address, Opcode::Standby, &[], true)
    }

    fn volume_up(&mut self, send_release: bool) -> io::Result<()> {
        let conn = self.conn()?;
        conn.keypress(LogicalAddress::AUDIO_SYSTEM, UserControlCode::VolumeUp.into(), true)?;
        if send_release {
            conn.release(LogicalAddress::AUDIO_SYSTEM, true)?;
        }
        Ok(())
    }

    fn volume_down(&mut self, send_release: bool) -> io::Result<()> {
        let conn = self.conn()?;
        conn.keypress(LogicalAddress::AUDIO_SYSTEM, UserControlCode::VolumeDown.into(), true)?;
        if send_release {
            conn.release(LogicalAddress::AUDIO_SYSTEM, true)?;
        }
        Ok(())
    }

    fn toggle_mute(&mut self) -> io::Result<()> {
        let conn = self.conn()?;
        conn.keypress(LogicalAddress::AUDIO_SYSTEM, UserControlCode::Mute.into(), true)?;
        conn.release(LogicalAddress::AUDIO_SYSTEM, true)
    }

    fn mute(&mut self) -> io::Result<()> {
        if !self.conn()?.audio_status()?.muted {
            self.toggle_mute()?;
        }
        Ok(())
    }

    fn unmute(&mut self) -> io::Result<()> {
        if self.conn()?.audio_status()?.muted {
            self.toggle_mute()?;
        }
        Ok(())
    }

    fn send_keypress(&mut self, address: LogicalAddress, keycode: u8, wait_ack: bool) -> io::Result<()> {
        self.conn()?.keypress(address, keycode, wait_ack)
    }

    fn send_key_release(&mut self, address: LogicalAddress, wait_ack: bool) -> io::Result<()> {
        self.conn()?.release(address, wait_ack)
    }

    fn set_hdmi_port(&mut self, port: HdmiPort) -> io::Result<()> {
        let conn = self.conn()?;
        if !conn.capabilities.contains(Capabilities::PHYS_ADDR) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "adapter does not allow setting the physical address",
            ));
        }
        let pa = port.physical_address();
        conn.tx.set_phys(pa.value())?;
        conn.send(LogicalAddress::BROADCAST, Opcode::ActiveSource, &pa.to_bytes(), true)
    }

    fn power_status(&mut self, address: LogicalAddress) -> io::Result<PowerStatus> {
        let data = self.conn()?.request(
            address,
            Opcode::GiveDevicePowerStatus,
            Opcode::ReportPowerStatus,
        )?;
        data.first()
            .map(|b| PowerStatus::from_operand(*b))
            .ok_or_else(|| invalid_reply("power status"))
    }

    fn active_source(&mut self) -> io::Result<LogicalAddress> {
        let conn = self.conn()?;
        if let Some(addr) = conn.shared.view.lock().active_source {
            return Ok(addr);
        }
        conn.send(LogicalAddress::BROADCAST, Opcode::RequestActiveSource, &[], false)?;
        let deadline = Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS as u64);
        let mut view = conn.shared.view.lock();
        while view.active_source.is_none() {
            if conn.shared.changed.wait_until(&mut view, deadline).timed_out() {
                break;
            }
        }
        view.active_source.ok_or_else(|| {
            io::Error::new(io::ErrorKind::TimedOut, "no device reported itself as active source")
        })
    }

    fn physical_address(&mut self, address: LogicalAddress) -> io::Result<PhysicalAddress> {
        if self.logical_addresses().contains(address) {
            return self.own_physical_address();
        }
        let data = self.conn()?.request(address, Opcode::GivePhysicalAddr, Opcode::ReportPhysicalAddr)?;
        PhysicalAddress::from_bytes(&data).ok_or_else(|| invalid_reply("physical address"))
    }

    fn vendor_id(&mut self, address: LogicalAddress) -> io::Result<u32> {
        let data = self.conn()?.request(address, Opcode::GiveDeviceVendorId, Opcode::DeviceVendorId)?;
        match data[..] {
            [a, b, c, ..] => Ok(u32::from_be_bytes([0, a, b, c])),
            _ => Err(invalid_reply("vendor id")),
        }
    }

    fn osd_name(&mut self, address: LogicalAddress) -> io::Result<String> {
        if self.logical_addresses().contains(address) {
            return Ok(self.config.device_name.chars().take(14).collect());
        }
        let data = self.conn()?.request(address, Opcode::GiveOsdName, Opcode::SetOsdName)?;
        Ok(c_string(&data))
    }

    fn menu_language(&mut self, address: LogicalAddress) -> io::Result<String> {
        let data = self.conn()?.request(address, Opcode::GetMenuLanguage, Opcode::SetMenuLanguage)?;
        if data.len() < 3 {
            return Err(invalid_reply("menu language"));
        }
        Ok(c_string(&data[..3]))
    }

    fn cec_version(&mut self, address: LogicalAddress) -> io::Result<CecVersion> {
        let data = self.conn()?.request(address, Opcode::GetCecVersion, Opcode::CecVersion)?;
        data.first()
            .map(|b| CecVersion::from_operand(*b))
            .ok_or_else(|| invalid_reply("cec version"))
    }

    fn audio_status(&mut self) -> io::Result<AudioStatus> {
        self.conn()?.audio_status()
    }

    fn active_devices(&mut self) -> LogicalAddressSet {
        match &self.conn {
            Some(conn) => conn.shared.view.lock().active,
            None => LogicalAddressSet::default(),
        }
    }

    fn rescan(&mut self) -> io::Result<()> {
        let own = self.logical_addresses();
        let conn = self.conn()?;
        let from = conn.initiator();
        let mut found = LogicalAddressSet::default();
        for addr in LogicalAddress::devices().filter(|a| !own.contains(*a)) {
            let mut msg = CecMsg::init(from.value(), addr.value());
            conn.tx.transmit(&mut msg)?;
            if msg.is_acked() {
                found.insert(addr);
            }
        }
        debug!(mask = found.mask(), "rescan finished");
        conn.shared.view.lock().active = found;
        Ok(())
    }

    fn logical_addresses(&mut self) -> LogicalAddressSet {
        self.conn
            .as_ref()
            .and_then(|c| c.tx.get_log().ok())
            .map(|log| log.claimed().map(LogicalAddress::from_nibble).collect())
            .unwrap_or_default()
    }

    fn own_physical_address(&mut self) -> io::Result<PhysicalAddress> {
        Ok(PhysicalAddress::new(self.conn()?.tx.get_phys()?))
    }

    fn info(&self) -> String {
        match &self.conn {
            Some(c) => format!(
                "linux CEC framework {} ({} {}) on {}",
                c.version, c.driver, c.name, c.path
            ),
            None => "linux CEC framework (no adapter open)".to_string(),
        }
    }
}

/// Creates a [LinuxEngine] per connection attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxEngineFactory;

impl EngineFactory for LinuxEngineFactory {
    fn create(
        &self,
        config: &EngineConfig,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> io::Result<Box<dyn CecEngine>> {
        if !Path::new("/dev").is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "/dev is not available"));
        }
        Ok(Box::new(LinuxEngine::new(config.clone(), callbacks)))
    }
}

fn receive_loop(rx: CecHandle, shared: &Shared, callbacks: &dyn EngineCallbacks, stop: &AtomicBool) {
    let mut pressed: Option<(u8, Instant)> = None;
    while !stop.load(Ordering::Relaxed) {
        let flags = match rx.poll(PollFlags::POLLIN | PollFlags::POLLPRI, RECEIVE_POLL_MS) {
            Ok(flags) => flags,
            Err(e) if e.raw_os_error() == Some(Errno::EINTR as i32) => continue,
            Err(e) => {
                warn!("CEC receiver stopped: {e}");
                callbacks.on_alert(Alert::ConnectionLost, 0);
                return;
            }
        };
        if flags.contains(PollFlags::POLLPRI) {
            match rx.get_event() {
                Ok(event) => handle_event(event, shared, callbacks),
                Err(e) => debug!("dequeueing event failed: {e}"),
            }
        }
        if flags.intersects(PollFlags::POLLIN | PollFlags::POLLRDNORM) {
            match rx.rec_for(u32::from(RECEIVE_POLL_MS)) {
                Ok(msg) => handle_message(&msg, shared, callbacks, &mut pressed),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => debug!("receive failed: {e}"),
            }
        }
        if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            warn!("CEC adapter went away");
            callbacks.on_alert(Alert::ConnectionLost, 0);
            return;
        }
    }
}

fn handle_event(event: AdapterEvent, shared: &Shared, callbacks: &dyn EngineCallbacks) {
    match event {
        AdapterEvent::StateChange {
            phys_addr,
            log_addr_mask,
        } => {
            info!(
                physical_address = %PhysicalAddress::new(phys_addr),
                log_addr_mask,
                "adapter state changed"
            );
            if phys_addr == CEC_PHYS_ADDR_INVALID {
                let mut view = shared.view.lock();
                view.active = LogicalAddressSet::default();
                view.active_source = None;
                drop(view);
                callbacks.on_alert(Alert::PhysicalAddressError, u32::from(phys_addr));
            }
        }
        AdapterEvent::LostMsgs(n) => warn!(lost = n, "CEC messages were lost"),
        AdapterEvent::Other(kind) => trace!(kind, "ignoring adapter event"),
    }
}

fn handle_message(
    msg: &CecMsg,
    shared: &Shared,
    callbacks: &dyn EngineCallbacks,
    pressed: &mut Option<(u8, Instant)>,
) {
    let initiator = LogicalAddress::from_nibble(msg.initiator());
    let destination = LogicalAddress::from_nibble(msg.destination());
    if initiator != LogicalAddress::BROADCAST {
        shared.view.lock().active.insert(initiator);
    }
    let Some(opcode) = msg.opcode() else {
        return;
    };
    let Ok(command) = Command::new(initiator, destination, opcode, msg.parameters()) else {
        return;
    };
    trace!(%command, "rx");

    match command.known_opcode() {
        Some(Opcode::ActiveSource) => {
            shared.view.lock().active_source = Some(initiator);
            shared.changed.notify_all();
            callbacks.on_source_activated(initiator, true);
        }
        Some(Opcode::InactiveSource) => {
            {
                let mut view = shared.view.lock();
                if view.active_source == Some(initiator) {
                    view.active_source = None;
                }
            }
            callbacks.on_source_activated(initiator, false);
        }
        Some(Opcode::RoutingChange | Opcode::RoutingInformation | Opcode::SetStreamPath) => {
            shared.view.lock().active_source = None;
        }
        Some(Opcode::UserControlPressed) => {
            if let Some(key) = command.parameters().first() {
                *pressed = Some((*key, Instant::now()));
                callbacks.on_key_press(*key, Duration::ZERO);
            }
        }
        Some(Opcode::UserControlReleased) => {
            // the release does not repeat the key
            if let Some((key, since)) = pressed.take() {
                callbacks.on_key_press(key, since.elapsed());
            }
        }
        _ => {}
    }
    callbacks.on_command(&command);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
    }
    impl EngineCallbacks for Recorder {
        fn on_key_press(&self, keycode: u8, duration: Duration) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("key {keycode:02x} {}", duration.is_zero()));
        }
        fn on_command(&self, command: &Command) {
            self.seen.lock().unwrap().push(format!("cmd {command}"));
        }
        fn on_source_activated(&self, address: LogicalAddress, activated: bool) {
            self.seen.lock().unwrap().push(format!("src {address} {activated}"));
        }
        fn on_alert(&self, alert: Alert, param: u32) {
            self.seen.lock().unwrap().push(format!("alert {alert:?} {param}"));
        }
    }

    #[test]
    fn cec_nodes() {
        assert!(is_cec_node("cec0"));
        assert!(is_cec_node("cec12"));
        assert!(!is_cec_node("cec"));
        assert!(!is_cec_node("cec-notifier"));
        assert!(!is_cec_node("tty0"));
    }

    #[test]
    fn received_frames_update_the_view() {
        let shared = Shared::default();
        let rec = Recorder::default();
        let mut pressed = None;

        let active = CecMsg::with_data(4, 15, Opcode::ActiveSource.into(), &[0x20, 0x00]);
        handle_message(&active, &shared, &rec, &mut pressed);
        let poll_frame = CecMsg::init(8, 0);
        handle_message(&poll_frame, &shared, &rec, &mut pressed);
        {
            let view = shared.view.lock();
            assert_eq!(view.active_source, LogicalAddress::new(4));
            assert_eq!(view.active.mask(), 1 << 4 | 1 << 8);
        }

        let inactive = CecMsg::with_data(4, 0, Opcode::InactiveSource.into(), &[0x20, 0x00]);
        handle_message(&inactive, &shared, &rec, &mut pressed);
        assert_eq!(shared.view.lock().active_source, None);

        let press = CecMsg::with_data(0, 4, Opcode::UserControlPressed.into(), &[0x01]);
        handle_message(&press, &shared, &rec, &mut pressed);
        let release = CecMsg::with_data(0, 4, Opcode::UserControlReleased.into(), &[]);
        handle_message(&release, &shared, &rec, &mut pressed);

        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec![
                "src 4 true",
                "cmd 4F:82:20:00",
                "src 4 false",
                "cmd 40:9D:20:00",
                "key 01 true",
                "cmd 04:44:01",
                "key 01 false",
                "cmd 04:45",
            ]
        );
    }

    #[test]
    fn unplugging_clears_the_view() {
        let shared = Shared::default();
        shared.view.lock().active.insert(LogicalAddress::TV);
        let rec = Recorder::default();
        handle_event(
            AdapterEvent::StateChange {
                phys_addr: CEC_PHYS_ADDR_INVALID,
                log_addr_mask: 0,
            },
            &shared,
            &rec,
        );
        assert!(shared.view.lock().active.is_empty());
        assert_eq!(*rec.seen.lock().unwrap(), vec!["alert PhysicalAddressError 65535"]);
    }

    #[test]
    fn closed_engine_refuses_bus_operations() {
        let mut engine = LinuxEngine::new(
            EngineConfig {
                device_name: "test".into(),
                device_type: crate::address::DeviceType::RecordingDevice,
            },
            Arc::new(Recorder::default()),
        );
        assert_eq!(
            engine.standby(LogicalAddress::TV).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(engine.active_devices().is_empty());
        engine.close();
        engine.close();
    }
}
