//! CEC message vocabulary: opcodes, remote control codes and the enumerated operands
//! the bridge understands.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

/// Opcodes the bridge sends or interprets. Unknown opcodes still travel as raw `u8`.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Opcode {
    FeatureAbort = 0x00,
    ImageViewOn = 0x04,
    TextViewOn = 0x0d,
    GiveDeckStatus = 0x1a,
    DeckStatus = 0x1b,
    /// Put the destination (or everyone, when broadcast) into standby
    Standby = 0x36,
    SetMenuLanguage = 0x32,
    Play = 0x41,
    DeckControl = 0x42,
    /// __Parameters:__ [UserControlCode]
    UserControlPressed = 0x44,
    UserControlReleased = 0x45,
    GiveOsdName = 0x46,
    SetOsdName = 0x47,
    SetOsdString = 0x64,
    SystemAudioModeRequest = 0x70,
    GiveAudioStatus = 0x71,
    SetSystemAudioMode = 0x72,
    /// __Parameters:__ 1 byte, bit 7 mute, bits 0-6 volume
    ReportAudioStatus = 0x7a,
    GiveSystemAudioModeStatus = 0x7d,
    SystemAudioModeStatus = 0x7e,
    RoutingChange = 0x80,
    RoutingInformation = 0x81,
    /// __Parameters:__ 2 byte physical address
    ActiveSource = 0x82,
    GivePhysicalAddr = 0x83,
    /// __Parameters:__ 2 byte physical address, 1 byte device type
    ReportPhysicalAddr = 0x84,
    RequestActiveSource = 0x85,
    SetStreamPath = 0x86,
    /// __Parameters:__ 3 byte vendor id
    DeviceVendorId = 0x87,
    VendorCommand = 0x89,
    VendorRemoteButtonDown = 0x8a,
    VendorRemoteButtonUp = 0x8b,
    GiveDeviceVendorId = 0x8c,
    MenuRequest = 0x8d,
    MenuStatus = 0x8e,
    GiveDevicePowerStatus = 0x8f,
    /// __Parameters:__ [PowerStatus]
    ReportPowerStatus = 0x90,
    GetMenuLanguage = 0x91,
    InactiveSource = 0x9d,
    CecVersion = 0x9e,
    GetCecVersion = 0x9f,
    VendorCommandWithId = 0xa0,
    GiveFeatures = 0xa5,
    ReportFeatures = 0xa6,
    Abort = 0xff,
}

/// Remote control key codes used with [Opcode::UserControlPressed].
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Clone, Copy, Hash)]
#[repr(u8)]
pub enum UserControlCode {
    Select = 0x00,
    Up = 0x01,
    Down = 0x02,
    Left = 0x03,
    Right = 0x04,
    RootMenu = 0x09,
    SetupMenu = 0x0a,
    Exit = 0x0d,
    Enter = 0x2b,
    Power = 0x40,
    VolumeUp = 0x41,
    VolumeDown = 0x42,
    Mute = 0x43,
    Play = 0x44,
    Stop = 0x45,
    Pause = 0x46,
}

/// Operand of [Opcode::ReportPowerStatus].
/// Anything the device does not (correctly) report is [PowerStatus::Unknown].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerStatus {
    On,
    Standby,
    TransitioningToOn,
    TransitioningToStandby,
    Unknown,
}

impl PowerStatus {
    pub fn from_operand(byte: u8) -> Self {
        match byte {
            0x00 => PowerStatus::On,
            0x01 => PowerStatus::Standby,
            0x02 => PowerStatus::TransitioningToOn,
            0x03 => PowerStatus::TransitioningToStandby,
            _ => PowerStatus::Unknown,
        }
    }
    /// machine name as used in events
    pub fn as_str(self) -> &'static str {
        match self {
            PowerStatus::On => "on",
            PowerStatus::Standby => "standby",
            PowerStatus::TransitioningToOn => "transitioning_to_on",
            PowerStatus::TransitioningToStandby => "transitioning_to_standby",
            PowerStatus::Unknown => "unknown",
        }
    }
    pub fn display_name(self) -> &'static str {
        match self {
            PowerStatus::On => "On",
            PowerStatus::Standby => "Standby",
            PowerStatus::TransitioningToOn => "Transitioning to On",
            PowerStatus::TransitioningToStandby => "Transitioning to Standby",
            PowerStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operand of [Opcode::CecVersion].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum CecVersion {
    V1_2,
    V1_2a,
    V1_3,
    V1_3a,
    V1_4,
    V2_0,
    Unknown(u8),
}

impl CecVersion {
    pub fn from_operand(byte: u8) -> Self {
        match byte {
            1 => CecVersion::V1_2,
            2 => CecVersion::V1_2a,
            3 => CecVersion::V1_3,
            4 => CecVersion::V1_3a,
            5 => CecVersion::V1_4,
            6 => CecVersion::V2_0,
            other => CecVersion::Unknown(other),
        }
    }
    pub fn operand(self) -> u8 {
        match self {
            CecVersion::V1_2 => 1,
            CecVersion::V1_2a => 2,
            CecVersion::V1_3 => 3,
            CecVersion::V1_3a => 4,
            CecVersion::V1_4 => 5,
            CecVersion::V2_0 => 6,
            CecVersion::Unknown(other) => other,
        }
    }
}

impl fmt::Display for CecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CecVersion::V1_2 => f.write_str("1.2"),
            CecVersion::V1_2a => f.write_str("1.2a"),
            CecVersion::V1_3 => f.write_str("1.3"),
            CecVersion::V1_3a => f.write_str("1.3a"),
            CecVersion::V1_4 => f.write_str("1.4"),
            CecVersion::V2_0 => f.write_str("2.0"),
            CecVersion::Unknown(_) => f.write_str("unknown"),
        }
    }
}

impl Serialize for CecVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Conditions the engine reports outside of any request.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Alert {
    ServiceDevice = 1,
    ConnectionLost = 2,
    PermissionError = 3,
    PortBusy = 4,
    PhysicalAddressError = 5,
    TvPollFailed = 6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_status_operands() {
        assert_eq!(PowerStatus::from_operand(0), PowerStatus::On);
        assert_eq!(PowerStatus::from_operand(1).as_str(), "standby");
        assert_eq!(PowerStatus::from_operand(2).as_str(), "transitioning_to_on");
        assert_eq!(PowerStatus::from_operand(3).as_str(), "transitioning_to_standby");
        assert_eq!(PowerStatus::from_operand(9), PowerStatus::Unknown);
        assert_eq!(
            serde_json::to_string(&PowerStatus::TransitioningToOn).unwrap(),
            "\"transitioning_to_on\""
        );
    }

    #[test]
    fn versions() {
        assert_eq!(CecVersion::from_operand(5).to_string(), "1.4");
        assert_eq!(CecVersion::from_operand(2).to_string(), "1.2a");
        assert_eq!(CecVersion::from_operand(6).to_string(), "2.0");
        assert_eq!(CecVersion::from_operand(0x42).to_string(), "unknown");
        assert_eq!(CecVersion::from_operand(0x42).operand(), 0x42);
    }

    #[test]
    fn opcodes() {
        assert_eq!(u8::from(Opcode::ReportPowerStatus), 0x90);
        assert_eq!(Opcode::try_from(0x82u8), Ok(Opcode::ActiveSource));
        assert!(Opcode::try_from(0x01u8).is_err());
        assert_eq!(u8::from(UserControlCode::Enter), 0x2b);
    }
}
