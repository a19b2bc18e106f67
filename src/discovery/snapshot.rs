use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio_stream::Stream;
use tokio_stream::wrappers::WatchStream;

use crate::hw::PeripheralId;
use crate::model::{Device, DeviceModel};

/// Immutable point-in-time copy of the live device set, in discovery order.
pub struct Snapshot<M> {
    devices: Arc<[Device<M>]>,
}

impl<M> Snapshot<M> {
    pub(crate) fn new(devices: Vec<Device<M>>) -> Self {
        Self {
            devices: devices.into(),
        }
    }

    #[must_use]
    pub fn devices(&self) -> &[Device<M>] {
        &self.devices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device<M>> {
        self.devices.iter()
    }

    /// Looks up a device by peripheral identifier.
    #[must_use]
    pub fn get(&self, peripheral: &PeripheralId) -> Option<&Device<M>> {
        self.devices.iter().find(|device| device.id() == peripheral)
    }

    #[must_use]
    pub fn contains(&self, peripheral: &PeripheralId) -> bool {
        self.get(peripheral).is_some()
    }
}

impl<M> Clone for Snapshot<M> {
    fn clone(&self) -> Self {
        Self {
            devices: Arc::clone(&self.devices),
        }
    }
}

impl<M> fmt::Debug for Snapshot<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.devices.iter().map(Device::id))
            .finish()
    }
}

impl<'a, M> IntoIterator for &'a Snapshot<M> {
    type Item = &'a Device<M>;
    type IntoIter = std::slice::Iter<'a, Device<M>>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

/// Live sequence of snapshots produced while a scan is active.
///
/// Only snapshots produced after the stream was created are observed; a slow
/// consumer skips intermediate snapshots and sees the latest one. The stream
/// ends when the scan stops.
pub struct SnapshotStream<M> {
    inner: WatchStream<Snapshot<M>>,
}

impl<M: DeviceModel> SnapshotStream<M> {
    pub(crate) fn new(receiver: watch::Receiver<Snapshot<M>>) -> Self {
        Self {
            inner: WatchStream::from_changes(receiver),
        }
    }
}

impl<M: DeviceModel> Stream for SnapshotStream<M> {
    type Item = Snapshot<M>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<M> fmt::Debug for SnapshotStream<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStream").finish_non_exhaustive()
    }
}
