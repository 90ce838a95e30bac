//! Raw bindings to the linux CEC userspace API.
//!
//! See <https://www.kernel.org/doc/html/latest/userspace-api/media/cec/cec-api.html>.
//! Only the parts the linux engine needs are mapped. Fields the driver fills in are
//! kept as plain integers so that an unexpected value coming from a newer kernel can
//! never produce an invalid enum.

use bitflags::bitflags;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

//#define CEC_ADAP_G_CAPS         _IOWR('a',  0, struct cec_caps)
ioctl_readwrite! {
    /// Query device capabilities
    capabilities, b'a',  0, CecCaps
}
//#define CEC_ADAP_G_PHYS_ADDR    _IOR('a',  1, __u16)
ioctl_read! {
    /// Query the physical address
    get_phys, b'a',  1, u16
}
//#define CEC_ADAP_S_PHYS_ADDR    _IOW('a',  2, __u16)
ioctl_write_ptr! {
    /// Only available with [Capabilities::PHYS_ADDR].
    /// Blocks until the configured logical addresses are claimed again.
    set_phys, b'a',  2, u16
}
//#define CEC_ADAP_G_LOG_ADDRS    _IOR('a',  3, struct cec_log_addrs)
ioctl_read! {
    /// Query the claimed logical addresses
    get_log, b'a',  3, CecLogAddrs
}
//#define CEC_ADAP_S_LOG_ADDRS    _IOWR('a',  4, struct cec_log_addrs)
ioctl_readwrite! {
    /// Only available with [Capabilities::LOG_ADDRS].
    /// Returns EBUSY if logical address types are already defined.
    set_log, b'a',  4, CecLogAddrs
}
//#define CEC_TRANSMIT            _IOWR('a',  5, struct cec_msg)
ioctl_readwrite! {
    /// Transmit a message. In blocking mode this waits for the ack and,
    /// if [CecMsg::reply] is set, for the reply.
    transmit, b'a',  5, CecMsg
}
//#define CEC_RECEIVE             _IOWR('a',  6, struct cec_msg)
ioctl_readwrite! {
    /// Receive a message, honoring [CecMsg::timeout].
    receive, b'a',  6, CecMsg
}
//#define CEC_DQEVENT             _IOWR('a',  7, struct cec_event)
ioctl_readwrite! {
    /// Dequeue a pending adapter event.
    get_event, b'a',  7, CecEvent
}
//#define CEC_S_MODE              _IOW('a',  9, __u32)
ioctl_write_ptr! {
    /// Set initiator and follower mode of this filehandle
    set_mode, b'a',  9, u32
}

pub const CEC_MODE_INITIATOR_SEND: u32 = 1;
pub const CEC_MODE_FOLLOWER_REPLIES_ONLY: u32 = 0x0 << 4;
pub const CEC_MODE_FOLLOWER_ALL: u32 = 0x1 << 4;

pub const CEC_PHYS_ADDR_INVALID: u16 = 0xffff;
pub const CEC_LOG_ADDR_INVALID: u8 = 0xff;

const CEC_MAX_MSG_SIZE: usize = 16;
const CEC_MAX_LOG_ADDRS: usize = 4;

/// information about the CEC adapter
#[derive(Debug)]
#[repr(C)]
pub struct CecCaps {
    driver: [u8; 32],
    name: [u8; 32],
    available_log_addrs: u32,
    capabilities: u32,
    version: u32,
}
impl CecCaps {
    /// name of the CEC device driver
    pub fn driver(&self) -> String {
        c_string(&self.driver)
    }
    /// name of the CEC device. driver + name are unique
    pub fn name(&self) -> String {
        c_string(&self.name)
    }
    #[inline]
    pub fn available_log_addrs(&self) -> u32 {
        self.available_log_addrs
    }
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.capabilities)
    }
    /// version of the CEC adapter framework as `major.minor.patch`
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }
}
impl Default for CecCaps {
    fn default() -> Self {
        Self {
            driver: [0; 32],
            name: [0; 32],
            available_log_addrs: 0,
            capabilities: 0,
            version: 0,
        }
    }
}

bitflags! {
    /// capabilities of the CEC adapter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Userspace has to configure the physical address
        const PHYS_ADDR = 0b00000001;
        /// Userspace has to configure the logical addresses
        const LOG_ADDRS = 0b00000010;
        /// Userspace can transmit messages
        const TRANSMIT = 0b00000100;
        const PASSTHROUGH = 0b00001000;
        const RC = 0b00010000;
        const MONITOR_ALL = 0b00100000;
    }
}

/// CEC logical addresses structure
#[derive(Debug)]
#[repr(C)]
pub struct CecLogAddrs {
    /// the claimed logical addresses. Set by the driver.
    pub log_addr: [u8; CEC_MAX_LOG_ADDRS],
    /// bitmask of the claimed logical addresses. Set by the driver.
    pub log_addr_mask: u16,
    pub cec_version: u8,
    /// how many logical addresses should be claimed. 0 clears them all.
    pub num_log_addrs: u8,
    pub vendor_id: u32,
    pub flags: u32,
    pub osd_name: [u8; 15],
    pub primary_device_type: [u8; CEC_MAX_LOG_ADDRS],
    pub log_addr_type: [u8; CEC_MAX_LOG_ADDRS],
    pub all_device_types: [u8; CEC_MAX_LOG_ADDRS],
    pub features: [[u8; 12]; CEC_MAX_LOG_ADDRS],
}
impl Default for CecLogAddrs {
    fn default() -> Self {
        Self {
            log_addr: [CEC_LOG_ADDR_INVALID; CEC_MAX_LOG_ADDRS],
            log_addr_mask: 0,
            cec_version: 0,
            num_log_addrs: 0,
            vendor_id: CEC_VENDOR_ID_NONE,
            flags: 0,
            osd_name: [0; 15],
            primary_device_type: [0; CEC_MAX_LOG_ADDRS],
            log_addr_type: [0; CEC_MAX_LOG_ADDRS],
            all_device_types: [0; CEC_MAX_LOG_ADDRS],
            features: [[0; 12]; CEC_MAX_LOG_ADDRS],
        }
    }
}
impl CecLogAddrs {
    /// Request a single logical address of the given kind.
    ///
    /// `log_addr_type` and `primary_device_type` use the kernel's numbering,
    /// see [crate::address::DeviceType::log_addr_type].
    pub fn claim(
        osd_name: &str,
        cec_version: u8,
        log_addr_type: u8,
        primary_device_type: u8,
        all_device_types: u8,
    ) -> Self {
        let mut log = Self {
            cec_version,
            num_log_addrs: 1,
            flags: CEC_LOG_ADDRS_FL_ALLOW_UNREG_FALLBACK,
            ..Default::default()
        };
        let name = osd_name.as_bytes();
        let len = name.len().min(14);
        log.osd_name[..len].copy_from_slice(&name[..len]);
        log.log_addr_type[0] = log_addr_type;
        log.primary_device_type[0] = primary_device_type;
        log.all_device_types[0] = all_device_types;
        log
    }
    /// the logical addresses that are actually claimed
    pub fn claimed(&self) -> impl Iterator<Item = u8> + '_ {
        self.log_addr
            .iter()
            .take(self.num_log_addrs as usize)
            .copied()
            .filter(|a| *a != CEC_LOG_ADDR_INVALID)
    }
}

pub const CEC_LOG_ADDRS_FL_ALLOW_UNREG_FALLBACK: u32 = 1 << 0;
pub const CEC_VENDOR_ID_NONE: u32 = 0xffffffff;

#[derive(Debug, Clone)]
#[repr(C)]
pub struct CecMsg {
    /// Timestamp in nanoseconds using CLOCK_MONOTONIC. Set by the driver.
    tx_ts: u64,
    rx_ts: u64,
    pub len: u32,
    /// Timeout in ms for CEC_RECEIVE (0 = forever) or for the reply of CEC_TRANSMIT.
    pub timeout: u32,
    pub sequence: u32,
    flags: u32,
    /// initiator/destination header, opcode and parameters
    pub msg: [u8; CEC_MAX_MSG_SIZE],
    /// If non-zero wait for a reply with this opcode.
    pub reply: u8,
    rx_status: u8,
    tx_status: u8,
    tx_arb_lost_cnt: u8,
    tx_nack_cnt: u8,
    tx_low_drive_cnt: u8,
    tx_error_cnt: u8,
}
impl CecMsg {
    pub fn init(from: u8, to: u8) -> CecMsg {
        let mut m = Self {
            tx_ts: 0,
            rx_ts: 0,
            len: 1,
            timeout: 0,
            sequence: 0,
            flags: 0,
            msg: [0; CEC_MAX_MSG_SIZE],
            reply: 0,
            rx_status: 0,
            tx_status: 0,
            tx_arb_lost_cnt: 0,
            tx_nack_cnt: 0,
            tx_low_drive_cnt: 0,
            tx_error_cnt: 0,
        };
        m.msg[0] = (from & 0xf) << 4 | (to & 0xf);
        m
    }
    /// A message with an opcode and up to 14 parameter bytes.
    /// Excess parameters are cut off.
    pub fn with_data(from: u8, to: u8, opcode: u8, data: &[u8]) -> CecMsg {
        let mut m = Self::init(from, to);
        let data = &data[..data.len().min(CEC_MAX_MSG_SIZE - 2)];
        m.msg[1] = opcode;
        m.msg[2..2 + data.len()].copy_from_slice(data);
        m.len = 2 + data.len() as u32;
        m
    }
    pub fn initiator(&self) -> u8 {
        self.msg[0] >> 4
    }
    pub fn destination(&self) -> u8 {
        self.msg[0] & 0xf
    }
    /// None for a poll message
    pub fn opcode(&self) -> Option<u8> {
        if self.len > 1 {
            Some(self.msg[1])
        } else {
            None
        }
    }
    pub fn parameters(&self) -> &[u8] {
        let len = (self.len as usize).min(CEC_MAX_MSG_SIZE);
        if len > 2 {
            &self.msg[2..len]
        } else {
            &[]
        }
    }
    pub fn tx_status(&self) -> TxStatus {
        TxStatus::from_bits_truncate(self.tx_status)
    }
    pub fn rx_status(&self) -> RxStatus {
        RxStatus::from_bits_truncate(self.rx_status)
    }
    /// true if the message was sent and acknowledged
    pub fn is_acked(&self) -> bool {
        self.tx_status().contains(TxStatus::OK)
    }
    /// true for a message that was received and was not a feature abort
    pub fn is_ok(&self) -> bool {
        let (tx, rx) = (self.tx_status(), self.rx_status());
        if !tx.is_empty() && !tx.contains(TxStatus::OK) {
            return false;
        }
        if !rx.is_empty() && !rx.contains(RxStatus::OK) {
            return false;
        }
        if rx.is_empty() && tx.is_empty() {
            return false;
        }
        !rx.contains(RxStatus::FEATURE_ABORT)
    }
    /// human readable summary of the transmit status
    pub fn tx_error(&self) -> String {
        format!(
            "tx status {:?} (arb lost {}, nack {}, low drive {}, error {})",
            self.tx_status(),
            self.tx_arb_lost_cnt,
            self.tx_nack_cnt,
            self.tx_low_drive_cnt,
            self.tx_error_cnt
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxStatus: u8 {
        const OK          = (1 << 0);
        const ARB_LOST    = (1 << 1);
        const NACK        = (1 << 2);
        const LOW_DRIVE   = (1 << 3);
        const ERROR       = (1 << 4);
        const MAX_RETRIES = (1 << 5);
    }
}
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RxStatus: u8 {
        const OK            = (1 << 0);
        const TIMEOUT       = (1 << 1);
        const FEATURE_ABORT = (1 << 2);
    }
}

pub const CEC_EVENT_STATE_CHANGE: u32 = 1;
pub const CEC_EVENT_LOST_MSGS: u32 = 2;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CecEventStateChange {
    pub phys_addr: u16,
    pub log_addr_mask: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CecEventLostMsgs {
    pub lost_msgs: u32,
}

#[repr(C)]
pub union CecEventPayload {
    pub state_change: CecEventStateChange,
    pub lost_msgs: CecEventLostMsgs,
    raw: [u32; 16],
}

#[repr(C)]
pub struct CecEvent {
    pub ts: u64,
    pub event: u32,
    pub flags: u32,
    pub payload: CecEventPayload,
}
impl Default for CecEvent {
    fn default() -> Self {
        Self {
            ts: 0,
            event: 0,
            flags: 0,
            payload: CecEventPayload { raw: [0; 16] },
        }
    }
}

/// Read a NUL terminated (or full length) byte array as text.
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
