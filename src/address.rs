//! Addressing on the CEC bus.
//!
//! Every device claims a [LogicalAddress] (its role) and owns a [PhysicalAddress]
//! (its place in the HDMI cascade below the TV).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A decimal number written with ASCII digits only, without a sign.
fn decimal(text: &str) -> Option<u8> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// A 4 bit logical address. Values outside `0..=15` cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LogicalAddress(u8);

impl LogicalAddress {
    pub const TV: LogicalAddress = LogicalAddress(0);
    pub const RECORDING_DEVICE_1: LogicalAddress = LogicalAddress(1);
    pub const AUDIO_SYSTEM: LogicalAddress = LogicalAddress(5);
    pub const FREE_USE: LogicalAddress = LogicalAddress(14);
    /// as destination: every device. as initiator: unregistered
    pub const BROADCAST: LogicalAddress = LogicalAddress(15);

    pub fn new(raw: u8) -> Option<Self> {
        (raw <= 15).then_some(Self(raw))
    }
    /// the low nibble of `raw`
    pub(crate) fn from_nibble(raw: u8) -> Self {
        Self(raw & 0xf)
    }
    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }
    /// All addresses a device can occupy, i.e. without broadcast.
    pub fn devices() -> impl Iterator<Item = LogicalAddress> {
        (0..15).map(LogicalAddress)
    }
    /// The role this address stands for.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "TV",
            1 => "Recording Device 1",
            2 => "Recording Device 2",
            3 => "Tuner 1",
            4 => "Playback Device 1",
            5 => "Audio System",
            6 => "Tuner 2",
            7 => "Tuner 3",
            8 => "Playback Device 2",
            9 => "Recording Device 3",
            10 => "Tuner 4",
            11 => "Playback Device 3",
            12 => "Reserved 1",
            13 => "Reserved 2",
            14 => "Free Use",
            _ => "Broadcast",
        }
    }
}

impl TryFrom<u8> for LogicalAddress {
    type Error = ValidationError;
    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| ValidationError::new("address", "must be between 0 and 15"))
    }
}

impl From<LogicalAddress> for u8 {
    fn from(addr: LogicalAddress) -> Self {
        addr.0
    }
}

impl FromStr for LogicalAddress {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decimal(s.trim())
            .and_then(Self::new)
            .ok_or_else(|| ValidationError::new("address", "must be between 0 and 15"))
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the HDMI cascade as four nibbles `a.b.c.d`.
///
/// The TV is `0.0.0.0`, a device on its HDMI input 2 is `2.0.0.0`,
/// a device behind that one on input 1 is `2.1.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhysicalAddress(u16);

impl PhysicalAddress {
    pub const ROOT: PhysicalAddress = PhysicalAddress(0x0000);
    /// nothing connected / not known
    pub const INVALID: PhysicalAddress = PhysicalAddress(0xffff);

    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }
    #[inline]
    pub fn value(self) -> u16 {
        self.0
    }
    /// The HDMI input of the root display this address sits behind.
    #[inline]
    pub fn port(self) -> u8 {
        (self.0 >> 12) as u8
    }
    pub fn nibbles(self) -> [u8; 4] {
        [
            (self.0 >> 12) as u8 & 0xf,
            (self.0 >> 8) as u8 & 0xf,
            (self.0 >> 4) as u8 & 0xf,
            self.0 as u8 & 0xf,
        ]
    }
    /// False for the sentinels `0.0.0.0` and `f.f.f.f`,
    /// which cannot be placed below the root display.
    pub fn is_placeable(self) -> bool {
        self != Self::ROOT && self != Self::INVALID
    }
    /// Wire representation, high byte first.
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [hi, lo, ..] => Some(Self(u16::from_be_bytes([*hi, *lo]))),
            _ => None,
        }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.nibbles();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl FromStr for PhysicalAddress {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::new("physical address", "expected a.b.c.d with each part between 0 and 15");
        let mut raw = 0u16;
        let mut parts = 0;
        for part in s.trim().split('.') {
            let nibble = decimal(part).ok_or_else(invalid)?;
            if nibble > 15 || parts == 4 {
                return Err(invalid());
            }
            raw = raw << 4 | nibble as u16;
            parts += 1;
        }
        if parts != 4 {
            return Err(invalid());
        }
        Ok(Self(raw))
    }
}

impl TryFrom<String> for PhysicalAddress {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PhysicalAddress> for String {
    fn from(addr: PhysicalAddress) -> Self {
        addr.to_string()
    }
}

/// An HDMI input of the root display, `1..=15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HdmiPort(u8);

impl HdmiPort {
    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }
    /// `port.0.0.0`
    pub fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress((self.0 as u16) << 12)
    }
}

impl TryFrom<u8> for HdmiPort {
    type Error = ValidationError;
    fn try_from(port: u8) -> Result<Self, Self::Error> {
        if (1..=15).contains(&port) {
            Ok(Self(port))
        } else {
            Err(ValidationError::new("port", "must be between 1 and 15"))
        }
    }
}

impl FromStr for HdmiPort {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let port = decimal(s.trim()).ok_or_else(|| ValidationError::new("port", "must be between 1 and 15"))?;
        Self::try_from(port)
    }
}

impl fmt::Display for HdmiPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of device, as implied by a logical address or claimed by this bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    #[serde(rename = "TV")]
    Tv,
    #[serde(rename = "Recording Device")]
    RecordingDevice,
    #[serde(rename = "Tuner")]
    Tuner,
    #[serde(rename = "Playback Device")]
    PlaybackDevice,
    #[serde(rename = "Audio System")]
    AudioSystem,
    #[serde(rename = "Reserved")]
    Reserved,
}

impl DeviceType {
    pub fn for_address(addr: LogicalAddress) -> Self {
        match addr.value() {
            0 => DeviceType::Tv,
            1 | 2 | 9 => DeviceType::RecordingDevice,
            3 | 6 | 7 | 10 => DeviceType::Tuner,
            4 | 8 | 11 => DeviceType::PlaybackDevice,
            5 => DeviceType::AudioSystem,
            _ => DeviceType::Reserved,
        }
    }
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Tv => "TV",
            DeviceType::RecordingDevice => "Recording Device",
            DeviceType::Tuner => "Tuner",
            DeviceType::PlaybackDevice => "Playback Device",
            DeviceType::AudioSystem => "Audio System",
            DeviceType::Reserved => "Reserved",
        }
    }
    /// `CEC_LOG_ADDR_TYPE_*`
    pub(crate) fn log_addr_type(self) -> u8 {
        match self {
            DeviceType::Tv => 0,
            DeviceType::RecordingDevice => 1,
            DeviceType::Tuner => 2,
            DeviceType::PlaybackDevice => 3,
            DeviceType::AudioSystem => 4,
            DeviceType::Reserved => 6,
        }
    }
    /// `CEC_OP_PRIM_DEVTYPE_*`
    pub(crate) fn primary_device_type(self) -> u8 {
        match self {
            DeviceType::Tv => 0,
            DeviceType::RecordingDevice => 1,
            DeviceType::Tuner => 3,
            DeviceType::PlaybackDevice => 4,
            DeviceType::AudioSystem => 5,
            DeviceType::Reserved => 7,
        }
    }
    /// `CEC_OP_ALL_DEVTYPE_*`
    pub(crate) fn all_device_types(self) -> u8 {
        match self {
            DeviceType::Tv => 0x80,
            DeviceType::RecordingDevice => 0x40,
            DeviceType::Tuner => 0x20,
            DeviceType::PlaybackDevice => 0x10,
            DeviceType::AudioSystem => 0x08,
            DeviceType::Reserved => 0,
        }
    }
}

impl FromStr for DeviceType {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tv" => Ok(DeviceType::Tv),
            "recording" | "recording device" => Ok(DeviceType::RecordingDevice),
            "tuner" => Ok(DeviceType::Tuner),
            "playback" | "playback device" => Ok(DeviceType::PlaybackDevice),
            "audio" | "audio system" => Ok(DeviceType::AudioSystem),
            _ => Err(ValidationError::new(
                "device type",
                "expected one of tv, recording, tuner, playback, audio",
            )),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of logical addresses, stored as the bus' 16 bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LogicalAddressSet(u16);

impl LogicalAddressSet {
    #[inline]
    pub const fn from_mask(mask: u16) -> Self {
        Self(mask)
    }
    #[inline]
    pub fn mask(self) -> u16 {
        self.0
    }
    pub fn insert(&mut self, addr: LogicalAddress) {
        self.0 |= 1 << addr.value();
    }
    pub fn remove(&mut self, addr: LogicalAddress) {
        self.0 &= !(1 << addr.value());
    }
    pub fn contains(self, addr: LogicalAddress) -> bool {
        self.0 & (1 << addr.value()) != 0
    }
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    /// ascending
    pub fn iter(self) -> impl Iterator<Item = LogicalAddress> {
        (0..16u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(LogicalAddress)
    }
}

impl FromIterator<LogicalAddress> for LogicalAddressSet {
    fn from_iter<T: IntoIterator<Item = LogicalAddress>>(iter: T) -> Self {
        let mut set = Self::default();
        for addr in iter {
            set.insert(addr);
        }
        set
    }
}
