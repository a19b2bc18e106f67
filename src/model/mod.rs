mod device;
mod resolver;

pub use self::device::{ConnectionState, Device, DeviceModel};
pub use self::resolver::{AttributeContainer, AttributeRegistry, DuplicatePolicy, ModelResolver};
