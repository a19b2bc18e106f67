mod cell;
mod map;
mod signal;

use std::str::FromStr;

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

pub use self::cell::{Attribute, AttributeValue, DEFAULT_POLLING_INTERVAL};
pub use self::map::AttributeMap;
pub(crate) use self::map::ErasedAttribute;
pub use self::signal::{ChangeReceiver, ChangeSignal};

/// Identifier of a remote characteristic (its GATT UUID).
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct AttributeId(Uuid);

impl AttributeId {
    /// Creates an identifier from a 16-bit Bluetooth SIG assigned number.
    ///
    /// ```
    /// let battery_level = gatt_mirror::AttributeId::from_u16(0x2A19);
    /// assert_eq!(
    ///     "00002a19-0000-1000-8000-00805f9b34fb",
    ///     battery_level.to_string()
    /// );
    /// ```
    #[must_use]
    pub fn from_u16(short: u16) -> Self {
        Self(uuid_from_u16(short))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn uuid(self) -> Uuid {
        self.0
    }
}

impl FromStr for AttributeId {
    type Err = uuid::Error;

    /// Parses a full UUID, or a 4-digit SIG short form such as `2A19`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() == 4
            && let Ok(short) = u16::from_str_radix(trimmed, 16)
        {
            return Ok(Self::from_u16(short));
        }
        Uuid::parse_str(trimmed).map(Self)
    }
}
