use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::attribute::AttributeId;
use crate::error::TransportError;
use crate::hw::{GattTransport, PeripheralEvent, PeripheralId, TransportEvent};

pub(crate) type CommandSender = mpsc::UnboundedSender<TransportCommand>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<TransportCommand>;

/// A request for the transport on behalf of one peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum CommandKind {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    Read(AttributeId),
    Write(AttributeId, Vec<u8>),
    SetNotify(AttributeId, bool),
}

#[derive(Debug)]
pub(crate) struct TransportCommand {
    pub(crate) peripheral: PeripheralId,
    pub(crate) kind: CommandKind,
    /// Connection epoch the command belongs to; cancelled on disconnect.
    pub(crate) epoch: Option<CancellationToken>,
}

/// Live link between bound attributes and the transport for one connection.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    peripheral: PeripheralId,
    commands: CommandSender,
    epoch: CancellationToken,
}

impl Binding {
    pub(crate) fn new(peripheral: PeripheralId, commands: CommandSender) -> Self {
        Self {
            peripheral,
            commands,
            epoch: CancellationToken::new(),
        }
    }

    /// Queues a command; returns `false` once the connection epoch is over.
    pub(crate) fn issue(&self, kind: CommandKind) -> bool {
        if self.epoch.is_cancelled() {
            return false;
        }

        self.commands
            .send(TransportCommand {
                peripheral: self.peripheral.clone(),
                kind,
                epoch: Some(self.epoch.clone()),
            })
            .is_ok()
    }

    /// Abandons every queued or in-flight command of this epoch.
    pub(crate) fn cancel(&self) {
        self.epoch.cancel();
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.epoch.is_cancelled()
    }
}

/// Routes transport commands into one lane per peripheral.
///
/// Each lane executes its commands one at a time, in issue order, so a slow
/// peripheral never delays another. A disconnect request abandons whatever
/// its lane had queued or in flight before it.
#[derive(Debug)]
pub(crate) struct CommandDriver {
    transport: Arc<dyn GattTransport>,
    loopback: mpsc::UnboundedSender<TransportEvent>,
    lanes: HashMap<PeripheralId, Lane>,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct Lane {
    queue: mpsc::UnboundedSender<QueuedCommand>,
    /// Cancelled by the next disconnect request for the peripheral.
    preempt: CancellationToken,
}

#[derive(Debug)]
struct QueuedCommand {
    command: TransportCommand,
    preempt: CancellationToken,
}

impl CommandDriver {
    pub(crate) fn spawn(
        transport: Arc<dyn GattTransport>,
        commands: CommandReceiver,
        loopback: mpsc::UnboundedSender<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let driver = Self {
            transport,
            loopback,
            lanes: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run(commands, shutdown))
    }

    async fn run(mut self, mut commands: CommandReceiver, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.enqueue(command),
                    None => break,
                },
            }
        }
        trace!("command driver stopped");
    }

    fn enqueue(&mut self, command: TransportCommand) {
        let lane = match self.lanes.entry(command.peripheral.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (queue, receiver) = mpsc::unbounded_channel();
                let worker = LaneWorker {
                    transport: Arc::clone(&self.transport),
                    loopback: self.loopback.clone(),
                };
                tokio::spawn(worker.run(receiver, self.shutdown.clone()));
                trace!(peripheral = %command.peripheral, "command lane opened");
                entry.insert(Lane {
                    queue,
                    preempt: CancellationToken::new(),
                })
            }
        };

        if command.kind == CommandKind::Disconnect {
            lane.preempt.cancel();
            lane.preempt = CancellationToken::new();
        }
        let queued = QueuedCommand {
            command,
            preempt: lane.preempt.clone(),
        };
        if let Err(error) = lane.queue.send(queued) {
            debug!(peripheral = %error.0.command.peripheral, "command lane closed, dropping request");
        }
    }
}

/// Executes the commands of one peripheral.
#[derive(Debug)]
struct LaneWorker {
    transport: Arc<dyn GattTransport>,
    loopback: mpsc::UnboundedSender<TransportEvent>,
}

impl LaneWorker {
    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<QueuedCommand>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                queued = commands.recv() => match queued {
                    Some(queued) => self.execute(queued).await,
                    None => break,
                },
            }
        }
    }

    #[instrument(
        skip(self, queued),
        level = "trace",
        fields(peripheral = %queued.command.peripheral, kind = ?queued.command.kind)
    )]
    async fn execute(&self, queued: QueuedCommand) {
        let QueuedCommand { command, preempt } = queued;
        let epoch = command.epoch.as_ref();
        if preempt.is_cancelled() || epoch.is_some_and(CancellationToken::is_cancelled) {
            trace!("dropping command abandoned by disconnect");
            self.report_abandoned(command);
            return;
        }

        let result = tokio::select! {
            () = abandoned(epoch, &preempt) => {
                trace!("abandoning in-flight command after disconnect");
                self.report_abandoned(command);
                return;
            }
            result = self.dispatch(&command) => result,
        };

        if let Err(error) = result {
            debug!(?error, "transport request failed");
            self.report_failure(command);
        }
    }

    async fn dispatch(&self, command: &TransportCommand) -> Result<(), TransportError> {
        let peripheral = &command.peripheral;
        match &command.kind {
            CommandKind::Connect => self.transport.connect(peripheral).await,
            CommandKind::Disconnect => self.transport.disconnect(peripheral).await,
            CommandKind::DiscoverServices => self.transport.discover_services(peripheral).await,
            CommandKind::DiscoverCharacteristics(service) => {
                self.transport
                    .discover_characteristics(peripheral, *service)
                    .await
            }
            CommandKind::Read(characteristic) => {
                self.transport.read_value(peripheral, *characteristic).await
            }
            CommandKind::Write(characteristic, payload) => {
                self.transport
                    .write_value(peripheral, *characteristic, payload)
                    .await
            }
            CommandKind::SetNotify(characteristic, enabled) => {
                self.transport
                    .set_notify(peripheral, *characteristic, *enabled)
                    .await
            }
        }
    }

    /// Turns request failures the bridge must know about into synthetic events.
    fn report_failure(&self, command: TransportCommand) {
        let event = match command.kind {
            CommandKind::Connect => PeripheralEvent::Disconnected,
            CommandKind::Write(characteristic, _payload) => PeripheralEvent::WriteAcknowledged {
                characteristic,
                success: false,
            },
            CommandKind::SetNotify(characteristic, true) => PeripheralEvent::NotifyStateChanged {
                characteristic,
                notifying: false,
            },
            _ => return,
        };

        let _ = self
            .loopback
            .send(TransportEvent::peripheral(command.peripheral, event));
    }

    /// An abandoned connection attempt leaves the peripheral disconnected.
    fn report_abandoned(&self, command: TransportCommand) {
        if command.kind == CommandKind::Connect {
            let _ = self.loopback.send(TransportEvent::peripheral(
                command.peripheral,
                PeripheralEvent::Disconnected,
            ));
        }
    }
}

/// Resolves once either the connection epoch or the lane's pre-emption token is cancelled.
async fn abandoned(epoch: Option<&CancellationToken>, preempt: &CancellationToken) {
    match epoch {
        Some(epoch) => tokio::select! {
            () = epoch.cancelled() => {}
            () = preempt.cancelled() => {}
        },
        None => preempt.cancelled().await,
    }
}
