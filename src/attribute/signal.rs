use std::sync::Arc;

use tokio::sync::watch;

/// A change notifier carrying a monotonically increasing generation counter.
///
/// Receivers observe at least the latest generation; rapid changes may be
/// coalesced into a single wake-up, but a change is never lost entirely.
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    sender: Arc<watch::Sender<u64>>,
}

impl ChangeSignal {
    /// Creates a signal at generation zero.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(0);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Bumps the generation and wakes every receiver.
    pub(crate) fn notify(&self) {
        self.sender
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Returns the number of changes signalled so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.sender.borrow()
    }

    /// Subscribes to future changes.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`ChangeSignal`].
#[derive(Debug, Clone)]
pub struct ChangeReceiver {
    receiver: watch::Receiver<u64>,
}

impl ChangeReceiver {
    /// Waits for the next change and returns the generation it produced.
    ///
    /// Returns `None` once the owning signal has been dropped.
    pub async fn changed(&mut self) -> Option<u64> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }

    /// Returns whether a change has happened since the last observation.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    /// Returns the latest generation without marking it observed.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.receiver.borrow()
    }
}
