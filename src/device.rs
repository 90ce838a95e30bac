//! Snapshots of what is on the bus.

use serde::{Serialize, Serializer};

use crate::{
    address::{DeviceType, LogicalAddress, PhysicalAddress},
    protocol::{CecVersion, PowerStatus},
};

/// One device as seen by a single battery of queries.
///
/// Every attribute is queried separately. A query that fails leaves its field
/// empty (`None`, or [PowerStatus::Unknown]) instead of failing the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub logical_address: LogicalAddress,
    pub physical_address: Option<PhysicalAddress>,
    pub vendor_id: Option<u32>,
    pub cec_version: Option<CecVersion>,
    pub power_status: PowerStatus,
    pub osd_name: Option<String>,
    pub menu_language: Option<String>,
    pub is_active: bool,
    pub is_active_source: bool,
}

impl Device {
    pub fn new(logical_address: LogicalAddress) -> Self {
        Self {
            logical_address,
            physical_address: None,
            vendor_id: None,
            cec_version: None,
            power_status: PowerStatus::Unknown,
            osd_name: None,
            menu_language: None,
            is_active: false,
            is_active_source: false,
        }
    }
    pub fn device_type(&self) -> DeviceType {
        DeviceType::for_address(self.logical_address)
    }
    /// HDMI input of the root display, 0 when the position is unknown
    pub fn hdmi_port(&self) -> u8 {
        match self.physical_address {
            Some(pa) if pa.is_placeable() => pa.port(),
            _ => 0,
        }
    }
    /// The OSD name, or the role of the logical address if the device did not report one.
    pub fn display_name(&self) -> &str {
        match self.osd_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.logical_address.name(),
        }
    }
}

#[derive(Serialize)]
struct DeviceJson<'a> {
    logical_address: u8,
    address_name: &'static str,
    physical_address: String,
    device_type: DeviceType,
    hdmi_port: u8,
    vendor_id: Option<String>,
    vendor_name: Option<String>,
    cec_version: Option<CecVersion>,
    power_status: &'static str,
    osd_name: Option<&'a str>,
    menu_language: Option<&'a str>,
    is_active: bool,
    is_active_source: bool,
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DeviceJson {
            logical_address: self.logical_address.value(),
            address_name: self.logical_address.name(),
            physical_address: self
                .physical_address
                .unwrap_or(PhysicalAddress::INVALID)
                .to_string(),
            device_type: self.device_type(),
            hdmi_port: self.hdmi_port(),
            vendor_id: self.vendor_id.map(|id| format!("0x{id:06X}")),
            vendor_name: self.vendor_id.map(vendor_name),
            cec_version: self.cec_version,
            power_status: self.power_status.display_name(),
            osd_name: self.osd_name.as_deref(),
            menu_language: self.menu_language.as_deref(),
            is_active: self.is_active,
            is_active_source: self.is_active_source,
        }
        .serialize(serializer)
    }
}

/// Result of listing every active device within a deadline.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub devices: Vec<Device>,
    /// how many devices were active when the listing started
    pub total: usize,
    /// true if the deadline cut the listing short
    pub partial: bool,
}

impl DeviceListing {
    pub fn message(&self) -> String {
        if self.partial {
            format!(
                "Devices retrieved (partial: {} of {}, CEC bus slow)",
                self.devices.len(),
                self.total
            )
        } else {
            "Devices retrieved".to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioStatus {
    /// 0 - 100
    pub volume: u8,
    pub muted: bool,
}

impl AudioStatus {
    /// Decode the operand of `Report Audio Status`. `0x7f` means the volume is unknown.
    pub fn from_operand(byte: u8) -> Option<Self> {
        let volume = byte & 0x7f;
        if volume == 0x7f {
            return None;
        }
        Some(Self {
            volume: volume.min(100),
            muted: byte & 0x80 != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyDevice {
    pub address: LogicalAddress,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDevices {
    pub port: u8,
    pub devices: Vec<TopologyDevice>,
}

/// Active devices grouped by the HDMI input of the root display they sit behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusTopology {
    pub own_addresses: Vec<LogicalAddress>,
    pub own_physical_address: PhysicalAddress,
    /// 0 when this adapter's position is unknown
    pub own_port: u8,
    /// inputs with a known occupant, this adapter's included
    pub known_port_count: usize,
    /// sorted by port
    pub active_ports: Vec<PortDevices>,
}

const VENDORS: &[(u32, &str)] = &[
    (0x000039, "Toshiba"),
    (0x0000F0, "Samsung"),
    (0x0005CD, "Denon"),
    (0x000678, "Marantz"),
    (0x000982, "Loewe"),
    (0x0009B0, "Onkyo"),
    (0x000CB8, "Medion"),
    (0x000CE7, "Toshiba"),
    (0x001582, "Pulse Eight"),
    (0x001950, "Google"),
    (0x001A11, "Akai"),
    (0x0020C7, "AOC"),
    (0x002467, "Panasonic"),
    (0x008045, "Philips"),
    (0x00903E, "Pioneer"),
    (0x009053, "LG"),
    (0x00A0DE, "Sharp"),
    (0x00D0D5, "Vizio"),
    (0x00E036, "Harman Kardon"),
    (0x00E091, "Yamaha"),
    (0x08001F, "Sony"),
    (0x18C086, "Broadcom"),
    (0x6B746D, "Vizio"),
    (0x8065E9, "Benq"),
    (0x9C645E, "Daewoo"),
];

/// Human readable name of a 24 bit IEEE OUI vendor id.
pub fn vendor_name(vendor_id: u32) -> String {
    VENDORS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Unknown (0x{vendor_id:06X})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendors() {
        assert_eq!(vendor_name(0x0000F0), "Samsung");
        assert_eq!(vendor_name(0x08001F), "Sony");
        assert_eq!(vendor_name(0x6B746D), "Vizio");
        assert_eq!(vendor_name(0x123456), "Unknown (0x123456)");
        assert_eq!(vendor_name(0xAB), "Unknown (0x0000AB)");
    }

    #[test]
    fn audio_status_operand() {
        assert_eq!(
            AudioStatus::from_operand(0x80 | 25),
            Some(AudioStatus { volume: 25, muted: true })
        );
        assert_eq!(
            AudioStatus::from_operand(40),
            Some(AudioStatus { volume: 40, muted: false })
        );
        assert_eq!(AudioStatus::from_operand(0x7f), None);
        assert_eq!(AudioStatus::from_operand(0xff), None);
    }

    #[test]
    fn device_json() {
        let mut dev = Device::new(LogicalAddress::new(4).unwrap());
        dev.physical_address = Some(PhysicalAddress::new(0x2100));
        dev.vendor_id = Some(0x0000F0);
        dev.cec_version = Some(CecVersion::V1_4);
        dev.power_status = PowerStatus::On;
        dev.is_active = true;

        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["logical_address"], 4);
        assert_eq!(json["address_name"], "Playback Device 1");
        assert_eq!(json["physical_address"], "2.1.0.0");
        assert_eq!(json["device_type"], "Playback Device");
        assert_eq!(json["hdmi_port"], 2);
        assert_eq!(json["vendor_id"], "0x0000F0");
        assert_eq!(json["vendor_name"], "Samsung");
        assert_eq!(json["cec_version"], "1.4");
        assert_eq!(json["power_status"], "On");
        assert!(json["osd_name"].is_null());
        assert_eq!(dev.display_name(), "Playback Device 1");
    }

    #[test]
    fn unknown_position_has_no_port() {
        let mut dev = Device::new(LogicalAddress::new(5).unwrap());
        assert_eq!(dev.hdmi_port(), 0);
        dev.physical_address = Some(PhysicalAddress::INVALID);
        assert_eq!(dev.hdmi_port(), 0);
    }

    #[test]
    fn listing_message() {
        let listing = DeviceListing {
            devices: vec![Device::new(LogicalAddress::TV)],
            total: 3,
            partial: true,
        };
        assert_eq!(listing.message(), "Devices retrieved (partial: 1 of 3, CEC bus slow)");
    }
}
