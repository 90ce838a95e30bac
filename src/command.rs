//! Frames, keys and the validation of everything that reaches the bus from outside.
//!
//! HTTP and MQTT both turn their input into a [BridgeCommand] (or a [Command] for raw
//! frames) through the parsers in this module, so both accept exactly the same input.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use tracing::debug;

use crate::{
    address::{HdmiPort, LogicalAddress},
    error::{Result, ValidationError},
    protocol::{Opcode, UserControlCode},
    session::Session,
};

/// A frame can carry at most 14 bytes after the header and the opcode.
pub const MAX_PARAMETERS: usize = 14;

/// A raw CEC frame: header, opcode and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub initiator: LogicalAddress,
    pub destination: LogicalAddress,
    pub opcode: u8,
    parameters: Vec<u8>,
}

impl Command {
    pub fn new(
        initiator: LogicalAddress,
        destination: LogicalAddress,
        opcode: impl Into<u8>,
        parameters: impl Into<Vec<u8>>,
    ) -> std::result::Result<Self, ValidationError> {
        let parameters = parameters.into();
        if parameters.len() > MAX_PARAMETERS {
            return Err(ValidationError::new(
                "parameters",
                format!("at most {MAX_PARAMETERS} bytes"),
            ));
        }
        Ok(Self {
            initiator,
            destination,
            opcode: opcode.into(),
            parameters,
        })
    }
    /// For frames whose size is known to fit.
    pub(crate) fn short(
        initiator: LogicalAddress,
        destination: LogicalAddress,
        opcode: Opcode,
        parameters: &[u8],
    ) -> Self {
        Self {
            initiator,
            destination,
            opcode: opcode.into(),
            parameters: parameters[..parameters.len().min(MAX_PARAMETERS)].to_vec(),
        }
    }
    #[inline]
    pub fn parameters(&self) -> &[u8] {
        &self.parameters
    }
    /// The opcode, if it is one this crate knows by name.
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:X}{:X}:{:02X}",
            self.initiator.value(),
            self.destination.value(),
            self.opcode
        )?;
        for p in &self.parameters {
            write!(f, ":{p:02X}")?;
        }
        Ok(())
    }
}

/// Names accepted for remote control keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyName {
    Up,
    Down,
    Left,
    Right,
    Select,
    Enter,
    Back,
    Home,
    Menu,
    Play,
    Pause,
    Stop,
}

impl KeyName {
    pub fn code(self) -> UserControlCode {
        match self {
            KeyName::Up => UserControlCode::Up,
            KeyName::Down => UserControlCode::Down,
            KeyName::Left => UserControlCode::Left,
            KeyName::Right => UserControlCode::Right,
            KeyName::Select => UserControlCode::Select,
            KeyName::Enter => UserControlCode::Enter,
            KeyName::Back => UserControlCode::Exit,
            KeyName::Home => UserControlCode::RootMenu,
            KeyName::Menu => UserControlCode::SetupMenu,
            KeyName::Play => UserControlCode::Play,
            KeyName::Pause => UserControlCode::Pause,
            KeyName::Stop => UserControlCode::Stop,
        }
    }
}

impl FromStr for KeyName {
    type Err = ValidationError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "up" => KeyName::Up,
            "down" => KeyName::Down,
            "left" => KeyName::Left,
            "right" => KeyName::Right,
            "select" => KeyName::Select,
            "enter" => KeyName::Enter,
            "back" => KeyName::Back,
            "home" => KeyName::Home,
            "menu" => KeyName::Menu,
            "play" => KeyName::Play,
            "pause" => KeyName::Pause,
            "stop" => KeyName::Stop,
            _ => return Err(ValidationError::new("key", format!("unsupported key name {s:?}"))),
        })
    }
}

fn in_range<T: TryFrom<i64>>(field: &'static str, value: i64, max: i64) -> std::result::Result<T, ValidationError> {
    if !(0..=max).contains(&value) {
        return Err(ValidationError::new(field, format!("must be between 0 and {max}")));
    }
    T::try_from(value).map_err(|_| ValidationError::new(field, format!("must be between 0 and {max}")))
}

fn address_field(field: &'static str, value: i64) -> std::result::Result<LogicalAddress, ValidationError> {
    let raw: u8 = in_range(field, value, 15)?;
    LogicalAddress::try_from(raw)
}

/// Body of a raw transmit request.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommandRequest {
    pub initiator: i64,
    pub destination: i64,
    pub opcode: i64,
    #[serde(default)]
    pub parameters: Vec<u8>,
}

impl RawCommandRequest {
    pub fn validate(self) -> std::result::Result<Command, ValidationError> {
        let initiator = address_field("initiator", self.initiator)?;
        let destination = address_field("destination", self.destination)?;
        let opcode: u8 = in_range("opcode", self.opcode, 255)?;
        Command::new(initiator, destination, opcode, self.parameters)
    }
}

/// Body of a key request. Either a key name or a raw keycode must be given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyRequest {
    #[serde(default)]
    pub address: i64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub keycode: Option<i64>,
}

impl KeyRequest {
    pub fn validate(self) -> std::result::Result<(LogicalAddress, u8), ValidationError> {
        let address = address_field("address", self.address)?;
        let key = self.key.filter(|k| !k.is_empty());
        let code = match (key, self.keycode) {
            (Some(name), _) => name.parse::<KeyName>()?.code().into(),
            (None, Some(code)) => in_range("keycode", code, 255)?,
            (None, None) => {
                return Err(ValidationError::new(
                    "key",
                    "either 'key' or 'keycode' must be provided",
                ))
            }
        };
        Ok((address, code))
    }
}

/// Parse a logical address given as text, e.g. a path segment or an MQTT payload.
pub fn parse_logical_address(text: &str) -> std::result::Result<LogicalAddress, ValidationError> {
    text.parse()
}

/// Parse an HDMI input number given as text.
pub fn parse_hdmi_port(text: &str) -> std::result::Result<HdmiPort, ValidationError> {
    text.parse()
}

/// Everything an external caller can ask the bridge to do on the bus,
/// apart from raw frames and queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    PowerOn(LogicalAddress),
    PowerOff(LogicalAddress),
    /// `None` uses the audio system, `Some` sends the key to that device
    VolumeUp(Option<LogicalAddress>),
    VolumeDown(Option<LogicalAddress>),
    VolumeMute(Option<LogicalAddress>),
    Source(LogicalAddress),
    Hdmi(HdmiPort),
    Key { address: LogicalAddress, keycode: u8 },
}

fn optional_address(payload: &str) -> std::result::Result<Option<LogicalAddress>, ValidationError> {
    let payload = payload.trim();
    if payload.is_empty() {
        Ok(None)
    } else {
        parse_logical_address(payload).map(Some)
    }
}

impl BridgeCommand {
    /// Parse a command given by name (`power/on`, `volume/up`, `hdmi`, ...) and its payload.
    ///
    /// Power commands default to the TV, volume commands to the audio system.
    /// `source` and `hdmi` require a payload, `key` takes a JSON [KeyRequest].
    pub fn parse(name: &str, payload: &[u8]) -> std::result::Result<Self, ValidationError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ValidationError::new("payload", "must be UTF-8"))?;
        Ok(match name.trim_matches('/') {
            "power/on" => BridgeCommand::PowerOn(optional_address(text)?.unwrap_or(LogicalAddress::TV)),
            "power/off" => BridgeCommand::PowerOff(optional_address(text)?.unwrap_or(LogicalAddress::TV)),
            "volume/up" => BridgeCommand::VolumeUp(optional_address(text)?),
            "volume/down" => BridgeCommand::VolumeDown(optional_address(text)?),
            "volume/mute" => BridgeCommand::VolumeMute(optional_address(text)?),
            "source" => BridgeCommand::Source(parse_logical_address(text)?),
            "hdmi" => BridgeCommand::Hdmi(parse_hdmi_port(text)?),
            "key" => {
                let req: KeyRequest = serde_json::from_slice(payload)
                    .map_err(|e| ValidationError::new("payload", e.to_string()))?;
                let (address, keycode) = req.validate()?;
                BridgeCommand::Key { address, keycode }
            }
            other => return Err(ValidationError::new("command", format!("unknown command {other:?}"))),
        })
    }

    /// Run the command. Returns a message describing what was sent.
    pub fn execute(&self, session: &Session) -> Result<String> {
        debug!(command = ?self, "executing");
        match *self {
            BridgeCommand::PowerOn(addr) => {
                session.power_on(addr)?;
                Ok(format!("Power on command sent to device {addr}"))
            }
            BridgeCommand::PowerOff(addr) => {
                session.standby(addr)?;
                Ok(format!("Standby command sent to device {addr}"))
            }
            BridgeCommand::VolumeUp(None) => {
                session.volume_up(true)?;
                Ok("Volume up command sent".into())
            }
            BridgeCommand::VolumeUp(Some(addr)) => {
                session.send_volume_key(addr, UserControlCode::VolumeUp)?;
                Ok(format!("Volume up sent to device {addr}"))
            }
            BridgeCommand::VolumeDown(None) => {
                session.volume_down(true)?;
                Ok("Volume down command sent".into())
            }
            BridgeCommand::VolumeDown(Some(addr)) => {
                session.send_volume_key(addr, UserControlCode::VolumeDown)?;
                Ok(format!("Volume down sent to device {addr}"))
            }
            BridgeCommand::VolumeMute(None) => {
                session.audio_toggle_mute()?;
                Ok("Mute toggle command sent".into())
            }
            BridgeCommand::VolumeMute(Some(addr)) => {
                session.send_volume_key(addr, UserControlCode::Mute)?;
                Ok(format!("Mute sent to device {addr}"))
            }
            BridgeCommand::Source(addr) => {
                session.switch_to_device(addr)?;
                Ok(format!("Switched to device {addr}"))
            }
            BridgeCommand::Hdmi(port) => {
                session.switch_to_hdmi_port(port)?;
                Ok(format!("Switched to HDMI port {port}"))
            }
            BridgeCommand::Key { address, keycode } => {
                session.send_button(address, keycode)?;
                Ok("Key command sent".into())
            }
        }
    }
}
