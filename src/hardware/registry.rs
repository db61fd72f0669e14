//! Device enumeration registry.
//!
//! The registry is an explicit value built once from an enumeration pass and
//! handed to whoever needs to select a device. There is no process-global
//! device list: two registries enumerated at different times are two
//! independent snapshots.

use serde::{Deserialize, Serialize};

/// One enumerated motion-control device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Vendor device name (e.g., "EPOS4").
    pub device_name: String,
    /// Protocol stack name (e.g., "MAXON SERIAL V2").
    pub protocol: String,
    /// Interface name (e.g., "USB").
    pub interface: String,
    /// Port name (e.g., "USB0").
    pub port: String,
    /// Maximum supported baud rate on this port.
    pub baud_rate: u32,
    /// Device serial number (object 0x1018:04).
    pub serial_number: u64,
    /// CANopen node id.
    pub node_id: u16,
    /// Sensor type code.
    pub sensor_type: i32,
}

/// Snapshot of enumerated devices.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Select a device by serial number.
    pub fn find_by_serial(&self, serial_number: u64) -> Option<&DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.serial_number == serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(serial: u64, port: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            device_name: "EPOS4".to_string(),
            protocol: "MAXON SERIAL V2".to_string(),
            interface: "USB".to_string(),
            port: port.to_string(),
            baud_rate: 1_000_000,
            serial_number: serial,
            node_id: 1,
            sensor_type: 1,
        }
    }

    #[test]
    fn test_find_by_serial() {
        let registry = DeviceRegistry::new(vec![
            descriptor(12345, "USB0"),
            descriptor(67890, "USB1"),
        ]);

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.find_by_serial(67890).map(|d| d.port.as_str()),
            Some("USB1")
        );
        assert!(registry.find_by_serial(11111).is_none());
    }

    #[test]
    fn test_empty_registry() {
        let registry = DeviceRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.find_by_serial(0).is_none());
    }
}
