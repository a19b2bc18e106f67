use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::config::DiscoveryConfig;
use super::snapshot::{Snapshot, SnapshotStream};
use crate::error::DiscoveryError;
use crate::hw::{
    Advertisement, EventStream, GattTransport, PeripheralEvent, PeripheralId, TransportEvent,
};
use crate::model::{ConnectionState, Device, DeviceModel, ModelResolver};
use crate::sync::{CommandDriver, CommandSender};

/// An explicitly owned scanning session tracking devices of model `M`.
///
/// The session routes every transport event to the device it concerns and
/// keeps a live set of devices that are either connected or were seen within
/// the configured timeout. Dropping the session stops all background work.
pub struct DiscoverySession<M: DeviceModel> {
    transport: Arc<dyn GattTransport>,
    live: Arc<Mutex<LiveSet<M>>>,
    config: DiscoveryConfig,
    shutdown: CancellationToken,
    _shutdown_guard: DropGuard,
}

impl<M: DeviceModel> DiscoverySession<M> {
    /// Subscribes to `transport` and starts routing its events.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport event stream cannot be opened.
    #[instrument(skip(transport), level = "debug")]
    pub async fn new(
        transport: Arc<dyn GattTransport>,
        config: DiscoveryConfig,
    ) -> Result<Self, DiscoveryError> {
        let events = transport.events().await?;
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (loopback, loopback_receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        CommandDriver::spawn(
            Arc::clone(&transport),
            command_receiver,
            loopback,
            shutdown.clone(),
        );

        let required_services = config
            .service_filter()
            .map_or_else(M::advertised_services, <[Uuid]>::to_vec);
        let live = Arc::new(Mutex::new(LiveSet::new(
            required_services,
            config.timeout(),
        )));
        let router = Router {
            live: Arc::clone(&live),
            commands,
            resolver: ModelResolver::new(config.duplicate_policy()),
        };
        tokio::spawn(router.run(
            events,
            loopback_receiver,
            config.prune_interval(),
            shutdown.clone(),
        ));

        Ok(Self {
            transport,
            live,
            config,
            _shutdown_guard: shutdown.clone().drop_guard(),
            shutdown,
        })
    }

    /// Starts scanning and returns the live snapshot sequence.
    ///
    /// The first snapshot is produced by the first change after this call.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::AlreadyScanning`] if a scan is active, or the
    /// transport error if the radio refuses to scan.
    #[instrument(skip(self), level = "info")]
    pub async fn start_scan(&self) -> Result<SnapshotStream<M>, DiscoveryError> {
        let (receiver, services) = {
            let mut live = self.lock();
            if self.shutdown.is_cancelled() {
                return Err(DiscoveryError::SessionClosed);
            }
            if live.snapshots.is_some() {
                return Err(DiscoveryError::AlreadyScanning);
            }
            let (sender, receiver) = watch::channel(live.snapshot());
            live.snapshots = Some(sender);
            (receiver, live.required_services.clone())
        };

        if let Err(error) = self.transport.start_scan(&services).await {
            self.lock().snapshots = None;
            return Err(error.into());
        }
        info!(
            timeout = %humantime::format_duration(self.config.timeout()),
            "scan started"
        );
        Ok(SnapshotStream::new(receiver))
    }

    /// Stops scanning and ends the snapshot sequence.
    ///
    /// Devices already tracked keep receiving their transport events.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the radio fails to stop scanning.
    #[instrument(skip(self), level = "info")]
    pub async fn stop_scan(&self) -> Result<(), DiscoveryError> {
        if self.lock().snapshots.take().is_none() {
            return Ok(());
        }
        self.transport.stop_scan().await?;
        info!("scan stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().snapshots.is_some()
    }

    /// Returns the current live set.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<M> {
        self.lock().snapshot()
    }

    /// Looks up a tracked device.
    #[must_use]
    pub fn device(&self, peripheral: &PeripheralId) -> Option<Device<M>> {
        self.lock().device(peripheral)
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LiveSet<M>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: DeviceModel> fmt::Debug for DiscoverySession<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySession")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("scanning", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

struct Router<M> {
    live: Arc<Mutex<LiveSet<M>>>,
    commands: CommandSender,
    resolver: ModelResolver,
}

impl<M: DeviceModel> Router<M> {
    async fn run(
        self,
        mut events: EventStream,
        mut loopback: mpsc::UnboundedReceiver<TransportEvent>,
        prune_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut prune = time::interval(prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.next() => {
                    let Some(event) = event else {
                        debug!("transport event stream ended");
                        break;
                    };
                    self.route(event);
                }
                Some(event) = loopback.recv() => self.route(event),
                _ = prune.tick() => self.lock().prune_tick(Instant::now()),
            }
        }
        trace!("event router stopped");
    }

    fn route(&self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(advertisement) => self.lock().on_advertisement(
                advertisement,
                Instant::now(),
                &self.commands,
                &self.resolver,
            ),
            TransportEvent::Peripheral { peripheral, event } => {
                let Some(device) = self.lock().device(&peripheral) else {
                    trace!(%peripheral, "event for untracked peripheral, ignoring");
                    return;
                };
                device.handle_event(&event);
                if matches!(
                    event,
                    PeripheralEvent::Connected | PeripheralEvent::Disconnected
                ) {
                    let mut live = self.lock();
                    if live.snapshots.is_some() {
                        live.prune(Instant::now());
                    }
                    live.publish();
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LiveSet<M>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LiveSet<M> {
    devices: Vec<Device<M>>,
    last_seen: HashMap<PeripheralId, Instant>,
    required_services: Vec<Uuid>,
    timeout: Duration,
    snapshots: Option<watch::Sender<Snapshot<M>>>,
}

impl<M: DeviceModel> LiveSet<M> {
    fn new(required_services: Vec<Uuid>, timeout: Duration) -> Self {
        Self {
            devices: Vec::new(),
            last_seen: HashMap::new(),
            required_services,
            timeout,
            snapshots: None,
        }
    }

    fn device(&self, peripheral: &PeripheralId) -> Option<Device<M>> {
        self.devices
            .iter()
            .find(|device| device.id() == peripheral)
            .cloned()
    }

    fn snapshot(&self) -> Snapshot<M> {
        Snapshot::new(self.devices.clone())
    }

    fn on_advertisement(
        &mut self,
        advertisement: Advertisement,
        now: Instant,
        commands: &CommandSender,
        resolver: &ModelResolver,
    ) {
        if self.snapshots.is_none() {
            trace!("advertisement received while not scanning, ignoring");
            return;
        }
        let peripheral = advertisement.peripheral().clone();
        if !advertisement.advertises_all(&self.required_services) {
            trace!(%peripheral, "advertisement lacks required services");
            return;
        }

        self.last_seen.insert(peripheral.clone(), now);
        match self.device(&peripheral) {
            Some(device) => device.update_advertisement(advertisement),
            None => match Device::new(advertisement, commands.clone(), resolver) {
                Ok(device) => {
                    debug!(%peripheral, "new device discovered");
                    self.devices.push(device);
                }
                Err(error) => {
                    warn!(%peripheral, %error, "device model could not be resolved");
                    return;
                }
            },
        }

        self.prune(now);
        self.publish();
    }

    /// Drops disconnected devices not seen within the timeout; returns whether any were dropped.
    fn prune(&mut self, now: Instant) -> bool {
        let timeout = self.timeout;
        let last_seen = &mut self.last_seen;
        let before = self.devices.len();

        self.devices.retain(|device| {
            if device.state() != ConnectionState::Disconnected {
                return true;
            }
            let fresh = last_seen
                .get(device.id())
                .is_some_and(|seen| now.saturating_duration_since(*seen) <= timeout);
            if !fresh {
                debug!(peripheral = %device.id(), "pruning stale device");
                last_seen.remove(device.id());
            }
            fresh
        });

        self.devices.len() != before
    }

    /// Prunes while scanning; once stopped, tracked devices stay routable.
    fn prune_tick(&mut self, now: Instant) {
        if self.snapshots.is_some() && self.prune(now) {
            self.publish();
        }
    }

    fn publish(&self) {
        if let Some(sender) = &self.snapshots {
            sender.send_replace(self.snapshot());
        }
    }
}
