//! Messenger — one socket, one message table, the retry handshake.
//!
//! [`Messenger`] is a handle. `listen` spawns a router task that owns every
//! piece of mutable state: the table of in-flight messages keyed by
//! identifier, the in-flight retransmission markers and the grace-period
//! cleanup timers. Transmissions, timers and the socket report back to the
//! router over channels, so no state is shared between tasks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use courier_core::{ChunkRecord, MessageId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::inbound::Received;
use crate::{
    InboundMessage, MessengerConfig, MessengerError, MessengerEvent, OutboundMessage, Transport,
};

/// Large enough for any UDP datagram.
const RECV_BUFFER: usize = 65_536;

pub struct Messenger {
    config: MessengerConfig,
    events: mpsc::UnboundedSender<MessengerEvent>,
    state: State,
}

enum State {
    Idle,
    Listening {
        commands: mpsc::UnboundedSender<Command>,
        router: JoinHandle<()>,
        local_addr: SocketAddr,
    },
    Closed,
}

impl Messenger {
    /// Create an idle messenger and the stream its events arrive on. No
    /// socket or task exists until [`Messenger::listen`].
    pub fn new(config: MessengerConfig) -> (Self, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let messenger = Self {
            config,
            events,
            state: State::Idle,
        };
        (messenger, events_rx)
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Listening { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Bind a UDP socket on the configured address and port and start routing.
    pub async fn listen(&mut self) -> Result<SocketAddr, MessengerError> {
        self.ensure_idle()?;
        let socket =
            UdpSocket::bind((self.config.bind_address(), self.config.port())).await?;
        self.listen_on(Arc::new(socket))
    }

    /// Start routing over an already bound transport.
    pub fn listen_on(&mut self, transport: Arc<dyn Transport>) -> Result<SocketAddr, MessengerError> {
        self.ensure_idle()?;
        let local_addr = transport.local_addr()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            self.config.clone(),
            transport,
            self.events.clone(),
            commands_rx,
        );
        let router = tokio::spawn(router.run());

        tracing::info!(%local_addr, "messenger listening");
        let _ = self.events.send(MessengerEvent::Listening { local_addr });

        self.state = State::Listening {
            commands,
            router,
            local_addr,
        };
        Ok(local_addr)
    }

    /// Queue `buffer` for delivery to `target`. Progress is reported as
    /// `Sending`, then `Sent` or `Error`.
    pub fn send(&self, buffer: impl Into<Bytes>, target: SocketAddr) -> Result<(), MessengerError> {
        let buffer = buffer.into();
        if buffer.is_empty() {
            return Err(MessengerError::invalid("message buffer is empty"));
        }
        match &self.state {
            State::Idle => Err(MessengerError::NotListening),
            State::Closed => Err(MessengerError::Closed),
            State::Listening { commands, .. } => commands
                .send(Command::Send { buffer, target })
                .map_err(|_| MessengerError::Closed),
        }
    }

    /// Stop routing, cancel every timer and transmission, release the socket.
    /// Returns once the router has finished.
    pub async fn close(&mut self) -> Result<(), MessengerError> {
        if let State::Listening {
            commands, router, ..
        } = std::mem::replace(&mut self.state, State::Closed)
        {
            let _ = commands.send(Command::Close);
            if let Err(e) = router.await {
                tracing::error!(error = %e, "messenger router failed");
            }
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), MessengerError> {
        match self.state {
            State::Idle => Ok(()),
            State::Listening { .. } => Err(MessengerError::AlreadyListening),
            State::Closed => Err(MessengerError::Closed),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

enum Command {
    Send { buffer: Bytes, target: SocketAddr },
    Close,
}

/// Completions reported by tasks the router spawned.
enum TaskEvent {
    Sent(MessageId),
    TransmitFailed(MessageId, MessengerError),
    Resent(MessageId, u32),
    ResendFailed(MessageId, u32, MessengerError),
    NoticeSent(MessageId),
    NoticeFailed(MessageId, MessengerError),
    Expired(MessageId, u64),
}

/// One identifier namespace for both directions.
enum Entry {
    Outgoing(Arc<OutboundMessage>),
    Incoming(InboundMessage),
}

struct CleanupTimer {
    generation: u64,
    handle: AbortHandle,
}

struct Router {
    config: MessengerConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<MessengerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    stall_tx: mpsc::UnboundedSender<MessageId>,
    stall_rx: mpsc::UnboundedReceiver<MessageId>,
    table: HashMap<MessageId, Entry>,
    // (message, chunk index) retransmissions not yet confirmed by the transport
    retries: HashSet<(MessageId, u32)>,
    transmitting: HashSet<MessageId>,
    cleanups: HashMap<MessageId, CleanupTimer>,
    generation: u64,
    tasks: JoinSet<()>,
}

impl Router {
    fn new(
        config: MessengerConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<MessengerEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (stall_tx, stall_rx) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            events,
            commands,
            task_tx,
            task_rx,
            stall_tx,
            stall_rx,
            table: HashMap::new(),
            retries: HashSet::new(),
            transmitting: HashSet::new(),
            cleanups: HashMap::new(),
            generation: 0,
            tasks: JoinSet::new(),
        }
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { buffer, target }) => self.start_send(buffer, target),
                    Some(Command::Close) | None => break,
                },

                Some(event) = self.task_rx.recv() => self.on_task_event(event),

                Some(id) = self.stall_rx.recv() => self.on_stall(id),

                received = self.transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from),
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        self.emit(MessengerEvent::Error(e.into()));
                    }
                },

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "messenger task panicked");
                        }
                    }
                }
            }
        }

        self.shutdown();
    }

    fn emit(&self, event: MessengerEvent) {
        let _ = self.events.send(event);
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn start_send(&mut self, buffer: Bytes, target: SocketAddr) {
        let id = self.fresh_id();
        let outbound = match OutboundMessage::with_id(
            id,
            buffer,
            self.config.inactivity_timeout(),
            self.config.packet_size(),
        ) {
            Ok(outbound) => Arc::new(outbound),
            Err(e) => {
                tracing::warn!(error = %e, "message rejected");
                self.emit(MessengerEvent::Error(e));
                return;
            }
        };

        self.table.insert(id, Entry::Outgoing(outbound.clone()));
        self.transmitting.insert(id);
        tracing::info!(
            message_id = %id,
            chunks = outbound.chunk_count(),
            %target,
            "sending message"
        );
        self.emit(MessengerEvent::Sending { message_id: id });

        let transport = self.transport.clone();
        let task_tx = self.task_tx.clone();
        self.tasks.spawn(async move {
            let event = match outbound.transmit(transport.as_ref(), target).await {
                Ok(()) => TaskEvent::Sent(id),
                Err(e) => TaskEvent::TransmitFailed(id, e),
            };
            let _ = task_tx.send(event);
        });
    }

    /// A random identifier not currently in the table.
    fn fresh_id(&self) -> MessageId {
        loop {
            let id = MessageId::random();
            if !self.table.contains_key(&id) {
                return id;
            }
            tracing::debug!(message_id = %id, "identifier in use, drawing again");
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let record = match ChunkRecord::decode(datagram) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(%from, len = datagram.len(), error = %e, "undecodable datagram, discarding");
                self.emit(MessengerEvent::Error(e.into()));
                return;
            }
        };
        let id = record.message_id;

        match self.table.get_mut(&id) {
            None if record.is_retry() => {
                tracing::debug!(message_id = %id, %from, "retry for unknown message, dropping");
                self.emit(MessengerEvent::Dropped { message_id: id });
            }
            None => self.begin_inbound(record, from),
            Some(Entry::Outgoing(outbound)) if record.is_retry() => {
                let outbound = Arc::clone(outbound);
                self.on_retry_request(outbound, record.index, from);
            }
            Some(Entry::Incoming(inbound)) if !record.is_retry() => {
                let outcome = inbound.accept(record);
                self.on_accepted(id, outcome);
            }
            Some(_) => {
                tracing::warn!(
                    message_id = %id,
                    %from,
                    retry = record.is_retry(),
                    "identifier collision, discarding"
                );
                self.emit(MessengerEvent::Error(MessengerError::IdCollision(id)));
            }
        }
    }

    fn begin_inbound(&mut self, record: ChunkRecord, from: SocketAddr) {
        let id = record.message_id;
        let mut inbound = match InboundMessage::new(
            from,
            self.config.inactivity_timeout(),
            self.stall_tx.clone(),
        ) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.on_accepted(id, Err(e));
                return;
            }
        };

        match inbound.accept(record) {
            Ok(outcome) => {
                tracing::debug!(message_id = %id, %from, chunks = inbound.length(), "receiving message");
                self.table.insert(id, Entry::Incoming(inbound));
                self.on_accepted(id, Ok(outcome));
            }
            Err(e) => self.on_accepted(id, Err(e)),
        }
    }

    fn on_accepted(&mut self, id: MessageId, outcome: Result<Option<Received>, MessengerError>) {
        match outcome {
            Ok(Some(received)) => {
                tracing::info!(message_id = %id, bytes = received.message.len(), "message received");
                // Stays in the table so late duplicates cannot deliver twice.
                self.schedule_cleanup(id);
                self.emit(MessengerEvent::Message(received.message));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "chunk rejected");
                self.emit(MessengerEvent::Error(e));
            }
        }
    }

    // ── Retry handshake ──────────────────────────────────────────────────────

    fn on_retry_request(&mut self, outbound: Arc<OutboundMessage>, index: u32, from: SocketAddr) {
        let id = outbound.id();
        if outbound.chunk(index).is_none() {
            let e = MessengerError::IndexOutOfRange {
                index,
                length: outbound.chunk_count(),
            };
            tracing::warn!(message_id = %id, %from, error = %e, "retry request rejected");
            self.emit(MessengerEvent::Error(e));
            return;
        }
        if !self.retries.insert((id, index)) {
            tracing::debug!(message_id = %id, index, "retransmission already in flight");
            return;
        }

        self.cancel_cleanup(id);
        tracing::debug!(message_id = %id, index, %from, "retry requested");

        let transport = self.transport.clone();
        let task_tx = self.task_tx.clone();
        self.tasks.spawn(async move {
            let event = match outbound.retransmit_one(transport.as_ref(), from, index).await {
                Ok(()) => TaskEvent::Resent(id, index),
                Err(e) => TaskEvent::ResendFailed(id, index, e),
            };
            let _ = task_tx.send(event);
        });
    }

    fn on_stall(&mut self, id: MessageId) {
        let max_rounds = self.config.max_retry_rounds();
        let Some(Entry::Incoming(inbound)) = self.table.get_mut(&id) else {
            return;
        };
        let Some(failure) = inbound.check_stalled(Instant::now()) else {
            tracing::trace!(message_id = %id, "superseded inactivity timer");
            return;
        };

        if inbound.failure_rounds() >= max_rounds {
            tracing::warn!(
                message_id = %id,
                missing = failure.missing.len(),
                rounds = inbound.failure_rounds(),
                "abandoning incomplete message"
            );
            self.table.remove(&id);
            return;
        }

        inbound.record_failure();
        tracing::info!(
            message_id = %id,
            origin = %failure.origin,
            missing = failure.missing.len(),
            round = inbound.failure_rounds(),
            "message stalled, requesting retransmission"
        );

        let transport = self.transport.clone();
        let task_tx = self.task_tx.clone();
        self.tasks.spawn(async move {
            let event =
                match OutboundMessage::send_failure_notice(&failure, transport.as_ref()).await {
                    Ok(()) => TaskEvent::NoticeSent(failure.message_id),
                    Err(e) => TaskEvent::NoticeFailed(failure.message_id, e),
                };
            let _ = task_tx.send(event);
        });
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Sent(id) => {
                self.transmitting.remove(&id);
                self.retries.retain(|(message, _)| *message != id);
                self.schedule_cleanup(id);
                tracing::info!(message_id = %id, "message sent");
                self.emit(MessengerEvent::Sent { message_id: id });
            }
            TaskEvent::TransmitFailed(id, e) => {
                self.transmitting.remove(&id);
                // Chunks already out can still be completed through retries.
                self.schedule_cleanup(id);
                tracing::warn!(message_id = %id, error = %e, "transmission aborted");
                self.emit(MessengerEvent::Error(e));
            }
            TaskEvent::Resent(id, index) => {
                self.retries.remove(&(id, index));
                self.schedule_cleanup(id);
            }
            TaskEvent::ResendFailed(id, index, e) => {
                self.retries.remove(&(id, index));
                self.schedule_cleanup(id);
                tracing::warn!(message_id = %id, index, error = %e, "retransmission failed");
                self.emit(MessengerEvent::Error(e));
            }
            TaskEvent::NoticeSent(id) => {
                self.emit(MessengerEvent::Failure { message_id: id });
            }
            TaskEvent::NoticeFailed(id, e) => {
                tracing::warn!(message_id = %id, error = %e, "retry requests not sent");
                self.emit(MessengerEvent::Error(e));
            }
            TaskEvent::Expired(id, generation) => self.on_expired(id, generation),
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────────

    /// Forget `id` once the retention period passes without new activity.
    fn schedule_cleanup(&mut self, id: MessageId) {
        self.cancel_cleanup(id);
        self.generation += 1;
        let generation = self.generation;
        let delay = self.config.retention();
        let task_tx = self.task_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = task_tx.send(TaskEvent::Expired(id, generation));
        })
        .abort_handle();
        self.cleanups.insert(id, CleanupTimer { generation, handle });
    }

    fn cancel_cleanup(&mut self, id: MessageId) {
        if let Some(timer) = self.cleanups.remove(&id) {
            timer.handle.abort();
        }
    }

    fn on_expired(&mut self, id: MessageId, generation: u64) {
        match self.cleanups.get(&id) {
            Some(timer) if timer.generation == generation => {
                self.cleanups.remove(&id);
            }
            _ => return,
        }
        // Completion of the pending send or retransmission re-arms cleanup.
        if self.transmitting.contains(&id) || self.retries.iter().any(|(m, _)| *m == id) {
            return;
        }
        if self.table.remove(&id).is_some() {
            tracing::debug!(message_id = %id, "message forgotten");
        }
    }

    fn shutdown(&mut self) {
        self.tasks.abort_all();
        for (_, timer) in self.cleanups.drain() {
            timer.handle.abort();
        }
        let pending = self.table.len();
        // Dropping inbound messages aborts their inactivity timers.
        self.table.clear();
        self.retries.clear();
        self.transmitting.clear();
        tracing::info!(pending, "messenger closed");
    }
}
