//! Ready-made containers for Bluetooth SIG services and two generic models.

use uuid::Uuid;

use crate::attribute::{Attribute, AttributeId};
use crate::hw::Advertisement;
use crate::model::{AttributeContainer, AttributeRegistry, DeviceModel};

/// Generic Access service.
pub const GENERIC_ACCESS_SERVICE: u16 = 0x1800;
/// Device Information service.
pub const DEVICE_INFORMATION_SERVICE: u16 = 0x180A;
/// Battery service.
pub const BATTERY_SERVICE: u16 = 0x180F;

const DEVICE_NAME: u16 = 0x2A00;
const BATTERY_LEVEL: u16 = 0x2A19;
const MODEL_NUMBER: u16 = 0x2A24;
const FIRMWARE_REVISION: u16 = 0x2A26;
const MANUFACTURER_NAME: u16 = 0x2A29;

fn service(short: u16) -> Uuid {
    AttributeId::from_u16(short).uuid()
}

/// The Generic Access device-name characteristic.
#[derive(Debug, Clone)]
pub struct GenericAccess {
    device_name: Attribute<String>,
}

impl GenericAccess {
    #[must_use]
    pub fn new(initial_name: impl Into<String>) -> Self {
        Self {
            device_name: Attribute::new(AttributeId::from_u16(DEVICE_NAME), initial_name.into()),
        }
    }

    #[must_use]
    pub fn device_name(&self) -> &Attribute<String> {
        &self.device_name
    }
}

impl AttributeContainer for GenericAccess {
    fn register_attributes(&self, registry: &mut AttributeRegistry) {
        registry.attribute(&self.device_name);
    }
}

/// The Battery service: a percentage pushed by most peripherals.
#[derive(Debug, Clone)]
pub struct BatteryService {
    battery_level: Attribute<u8>,
}

impl BatteryService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            battery_level: Attribute::new(AttributeId::from_u16(BATTERY_LEVEL), 0),
        }
    }

    /// Battery charge in percent.
    #[must_use]
    pub fn battery_level(&self) -> &Attribute<u8> {
        &self.battery_level
    }
}

impl Default for BatteryService {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeContainer for BatteryService {
    fn register_attributes(&self, registry: &mut AttributeRegistry) {
        registry.attribute(&self.battery_level);
    }
}

/// The Device Information service strings.
#[derive(Debug, Clone)]
pub struct DeviceInformation {
    manufacturer_name: Attribute<String>,
    model_number: Attribute<String>,
    firmware_revision: Attribute<String>,
}

impl DeviceInformation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            manufacturer_name: Attribute::new(
                AttributeId::from_u16(MANUFACTURER_NAME),
                String::new(),
            ),
            model_number: Attribute::new(AttributeId::from_u16(MODEL_NUMBER), String::new()),
            firmware_revision: Attribute::new(
                AttributeId::from_u16(FIRMWARE_REVISION),
                String::new(),
            ),
        }
    }

    #[must_use]
    pub fn manufacturer_name(&self) -> &Attribute<String> {
        &self.manufacturer_name
    }

    #[must_use]
    pub fn model_number(&self) -> &Attribute<String> {
        &self.model_number
    }

    #[must_use]
    pub fn firmware_revision(&self) -> &Attribute<String> {
        &self.firmware_revision
    }
}

impl Default for DeviceInformation {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeContainer for DeviceInformation {
    fn register_attributes(&self, registry: &mut AttributeRegistry) {
        registry
            .attribute(&self.manufacturer_name)
            .attribute(&self.model_number)
            .attribute(&self.firmware_revision);
    }
}

/// A model for any peripheral, mirroring the common SIG services it may expose.
#[derive(Debug, Clone)]
pub struct GenericPeripheral {
    advertised_name: Option<String>,
    generic_access: GenericAccess,
    battery: BatteryService,
    device_information: DeviceInformation,
}

impl GenericPeripheral {
    /// Returns the best known name: the GAP device name, else the advertised one.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let device_name = self.generic_access.device_name().read();
        if device_name.is_empty() {
            self.advertised_name.clone()
        } else {
            Some(device_name)
        }
    }

    #[must_use]
    pub fn generic_access(&self) -> &GenericAccess {
        &self.generic_access
    }

    #[must_use]
    pub fn battery(&self) -> &BatteryService {
        &self.battery
    }

    #[must_use]
    pub fn device_information(&self) -> &DeviceInformation {
        &self.device_information
    }
}

impl AttributeContainer for GenericPeripheral {
    fn register_attributes(&self, registry: &mut AttributeRegistry) {
        registry
            .container(&self.generic_access)
            .container(&self.battery)
            .container(&self.device_information);
    }
}

impl DeviceModel for GenericPeripheral {
    fn from_advertisement(advertisement: &Advertisement) -> Self {
        let advertised_name = advertisement.local_name().map(str::to_string);
        Self {
            generic_access: GenericAccess::new(advertised_name.clone().unwrap_or_default()),
            advertised_name,
            battery: BatteryService::new(),
            device_information: DeviceInformation::new(),
        }
    }
}

/// A model restricted to peripherals advertising the Battery service.
#[derive(Debug, Clone)]
pub struct BatteryPeripheral {
    battery: BatteryService,
}

impl BatteryPeripheral {
    #[must_use]
    pub fn battery(&self) -> &BatteryService {
        &self.battery
    }
}

impl AttributeContainer for BatteryPeripheral {
    fn register_attributes(&self, registry: &mut AttributeRegistry) {
        registry.container(&self.battery);
    }
}

impl DeviceModel for BatteryPeripheral {
    fn from_advertisement(_advertisement: &Advertisement) -> Self {
        Self {
            battery: BatteryService::new(),
        }
    }

    fn advertised_services() -> Vec<Uuid> {
        vec![service(BATTERY_SERVICE)]
    }

    fn services_to_discover() -> Option<Vec<Uuid>> {
        Some(vec![service(BATTERY_SERVICE)])
    }
}
