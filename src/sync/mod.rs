mod bridge;
mod command;

pub use self::bridge::BridgeState;
pub(crate) use self::bridge::SyncBridge;
pub(crate) use self::command::{Binding, CommandDriver, CommandKind, CommandSender, TransportCommand};
#[cfg(test)]
pub(crate) use self::command::CommandReceiver;
