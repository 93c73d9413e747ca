//! Message channel for one open conversation at a time.
//!
//! `open` joins the session room, seeds the log from the backend and spawns
//! the room listener, the reconnect watcher and the fallback poller. All
//! three carry the generation they were started under; once `close` (or a
//! later `open`) bumps the generation their results are discarded.

use crate::backend::ChatBackend;
use crate::config::ChannelConfig;
use crate::error::{ChatError, TransportError};
use crate::log::MessageLog;
use crate::realtime::{ConnectionState, RealtimeTransport, RoomEvent};
use crate::types::{CallSignal, LocalEcho, Message, OutgoingMessage, Role, SessionId};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CALL_BUFFER: usize = 64;

/// A confirmed message tagged with the generation that delivered it.
type Delivery = (u64, Message);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Closed,
    /// Room joined; updates are pushed.
    Live,
    /// Room unavailable; updates are polled over REST.
    Degraded,
}

struct State {
    generation: u64,
    log: Option<MessageLog>,
    mode: ChannelMode,
    tasks: Vec<JoinHandle<()>>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

struct Shared {
    state: Mutex<State>,
    calls: broadcast::Sender<CallSignal>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn mode_if_current(&self, generation: u64) -> Option<ChannelMode> {
        let state = self.lock();
        (state.generation == generation).then_some(state.mode)
    }

    fn set_mode(&self, generation: u64, mode: ChannelMode) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        if state.mode != mode {
            info!("channel mode {:?} -> {:?}", state.mode, mode);
            state.mode = mode;
        }
        true
    }

    /// Merges confirmed messages and notifies subscribers of the new ones.
    /// Each delivery carries `generation`; subscriptions discard it once a
    /// later `close` or `open` has moved the generation on.
    fn merge(&self, generation: u64, batch: Vec<Message>) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.generation != generation {
            return 0;
        }
        let Some(log) = state.log.as_mut() else {
            return 0;
        };
        let fresh = log.merge_all(batch);
        if !fresh.is_empty() {
            // Senders whose subscription was dropped are pruned here.
            state.subscribers.retain(|tx| {
                fresh
                    .iter()
                    .all(|message| tx.send((generation, message.clone())).is_ok())
            });
        }
        fresh.len()
    }

    fn relay_call(&self, generation: u64, room_id: &SessionId, signal: CallSignal) {
        let state = self.lock();
        let in_room = state.generation == generation
            && state.log.as_ref().map(|l| l.session_id()) == Some(room_id);
        if in_room {
            let _ = self.calls.send(signal);
        }
    }
}

/// Receives each newly confirmed message of the open session once.
/// The queue is unbounded; deliveries from a session that has since been
/// closed are dropped on receipt. Dropping the handle unsubscribes.
pub struct MessageSubscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Weak<Shared>,
}

impl MessageSubscription {
    fn is_current(&self, generation: u64) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_current(generation))
    }

    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let (generation, message) = self.rx.recv().await?;
            if self.is_current(generation) {
                return Some(message);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            let (generation, message) = self.rx.try_recv().ok()?;
            if self.is_current(generation) {
                return Some(message);
            }
        }
    }
}

pub struct CallSubscription {
    rx: broadcast::Receiver<CallSignal>,
}

impl CallSubscription {
    pub async fn recv(&mut self) -> Option<CallSignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub struct MessageChannel {
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn RealtimeTransport>,
    config: ChannelConfig,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl MessageChannel {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn RealtimeTransport>,
        config: ChannelConfig,
    ) -> Self {
        let (calls, _) = broadcast::channel(CALL_BUFFER);
        Self {
            backend,
            transport,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    generation: 0,
                    log: None,
                    mode: ChannelMode::Closed,
                    tasks: Vec::new(),
                    subscribers: Vec::new(),
                }),
                calls,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared
            .lock()
            .log
            .as_ref()
            .map(|l| l.session_id().clone())
    }

    pub fn mode(&self) -> ChannelMode {
        self.shared.lock().mode
    }

    /// Snapshot of the confirmed log, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.shared
            .lock()
            .log
            .as_ref()
            .map(|l| l.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, viewer: Role) -> u32 {
        self.shared
            .lock()
            .log
            .as_ref()
            .map(|l| l.unread_count(viewer))
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> MessageSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        state.subscribers.retain(|existing| !existing.is_closed());
        state.subscribers.push(tx);
        MessageSubscription {
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscribe_calls(&self) -> CallSubscription {
        CallSubscription {
            rx: self.shared.calls.subscribe(),
        }
    }

    pub async fn open(&self, session_id: SessionId) -> Result<(), ChatError> {
        let _serial = self.lifecycle.lock().await;
        if self.session_id().as_ref() == Some(&session_id) {
            return Ok(());
        }
        self.close_current().await;

        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.log = Some(MessageLog::new(session_id.clone()));
            state.mode = ChannelMode::Degraded;
            state.generation
        };
        info!(session = %session_id, "opening channel");

        // Subscribe before joining so nothing pushed during the fetch is lost.
        let events = self.transport.subscribe();
        let mut connection = self.transport.connection_state();
        connection.borrow_and_update();

        let joined = match self.transport.join_room(&session_id).await {
            Ok(()) => true,
            Err(source) => {
                let err = ChatError::ChannelJoin {
                    room_id: session_id.clone(),
                    source,
                };
                warn!("{err}; polling until the connection returns");
                false
            }
        };

        let fetched = match self.backend.fetch_messages(&session_id).await {
            Ok(messages) => messages,
            Err(source) => {
                if self.abandon(generation, &session_id, joined).await {
                    return Ok(());
                }
                return Err(ChatError::Fetch { session_id, source });
            }
        };

        if !self.shared.is_current(generation) {
            debug!(session = %session_id, "open superseded, discarding fetched log");
            if joined {
                let _ = self.transport.leave_room(&session_id).await;
            }
            return Ok(());
        }

        let mode = if joined {
            ChannelMode::Live
        } else {
            ChannelMode::Degraded
        };
        self.shared.set_mode(generation, mode);
        self.shared.merge(generation, fetched);

        let tasks = vec![
            tokio::spawn(listen_room(
                self.shared.clone(),
                self.backend.clone(),
                generation,
                session_id.clone(),
                events,
            )),
            tokio::spawn(watch_connection(
                self.shared.clone(),
                self.backend.clone(),
                self.transport.clone(),
                generation,
                session_id.clone(),
                connection,
            )),
            tokio::spawn(poll_log(
                self.shared.clone(),
                self.backend.clone(),
                generation,
                session_id.clone(),
                self.config.poll_interval(),
            )),
        ];

        let mut state = self.shared.lock();
        if state.generation == generation {
            state.tasks = tasks;
        } else {
            for task in tasks {
                task.abort();
            }
        }
        Ok(())
    }

    /// Returns true when the open was already superseded, so the failure is moot.
    async fn abandon(&self, generation: u64, session_id: &SessionId, joined: bool) -> bool {
        let superseded = {
            let mut state = self.shared.lock();
            if state.generation != generation {
                true
            } else {
                state.generation += 1;
                state.log = None;
                state.mode = ChannelMode::Closed;
                false
            }
        };
        if joined {
            let _ = self.transport.leave_room(session_id).await;
        }
        superseded
    }

    pub async fn close(&self) {
        self.close_current().await;
    }

    async fn close_current(&self) {
        let (session_id, tasks) = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.mode = ChannelMode::Closed;
            let log = state.log.take();
            (
                log.map(|l| l.session_id().clone()),
                std::mem::take(&mut state.tasks),
            )
        };
        for task in tasks {
            task.abort();
        }
        let Some(session_id) = session_id else {
            return;
        };
        if let Err(err) = self.transport.leave_room(&session_id).await {
            debug!(session = %session_id, "leave_room failed: {err}");
        }
        info!(session = %session_id, "channel closed");
    }

    fn current(&self) -> Result<(u64, SessionId), ChatError> {
        let state = self.shared.lock();
        state
            .log
            .as_ref()
            .map(|l| (state.generation, l.session_id().clone()))
            .ok_or(ChatError::NotOpen)
    }

    /// Records an optimistic echo, assigning `message` a client ref if it lacks one.
    pub fn echo(&self, message: &mut OutgoingMessage) -> Result<LocalEcho, ChatError> {
        let mut state = self.shared.lock();
        let log = state.log.as_mut().ok_or(ChatError::NotOpen)?;
        let client_ref = message
            .client_ref
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let echo = LocalEcho {
            client_ref,
            session_id: log.session_id().clone(),
            sender: message.sender,
            kind: message.kind,
            payload: message.payload.clone(),
            created_at: Utc::now(),
        };
        log.add_echo(echo.clone());
        Ok(echo)
    }

    pub fn rollback_echo(&self, client_ref: &str) -> Option<LocalEcho> {
        self.shared.lock().log.as_mut()?.remove_echo(client_ref)
    }

    pub fn pending_echoes(&self) -> Vec<LocalEcho> {
        self.shared
            .lock()
            .log
            .as_ref()
            .map(|l| l.echoes().to_vec())
            .unwrap_or_default()
    }

    /// Echoes that outlived the configured confirmation window.
    pub fn expired_echoes(&self) -> Vec<LocalEcho> {
        let max_wait = chrono::Duration::from_std(self.config.echo_timeout())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.shared
            .lock()
            .log
            .as_ref()
            .map(|l| l.expired_echoes(Utc::now(), max_wait))
            .unwrap_or_default()
    }

    /// Persists `message`, merges the confirmed copy and pushes it to the room.
    pub async fn send(&self, message: OutgoingMessage) -> Result<Message, ChatError> {
        let (generation, session_id) = self.current()?;
        let confirmed = match self.backend.post_message(&session_id, &message).await {
            Ok(confirmed) => confirmed,
            Err(source) => {
                warn!(session = %session_id, "send failed: {source}");
                return Err(ChatError::Send { session_id, source });
            }
        };

        self.shared.merge(generation, vec![confirmed.clone()]);

        if self.shared.mode_if_current(generation) == Some(ChannelMode::Live) {
            if let Err(err) = self
                .transport
                .emit(RoomEvent::NewMessage(confirmed.clone()))
                .await
            {
                // Persisted already; peers catch up from the backend.
                warn!(session = %session_id, "emit failed: {err}");
            }
        }
        Ok(confirmed)
    }

    /// Echoes, sends, and rolls the echo back if the send fails.
    pub async fn send_with_echo(&self, mut message: OutgoingMessage) -> Result<Message, ChatError> {
        let echo = self.echo(&mut message)?;
        let result = self.send(message).await;
        if result.is_err() {
            self.rollback_echo(&echo.client_ref);
        }
        result
    }

    pub async fn mark_read(&self, session_id: &SessionId, reader: Role) -> Result<(), ChatError> {
        self.backend
            .mark_read(session_id, reader)
            .await
            .map_err(|source| ChatError::MarkRead {
                session_id: session_id.clone(),
                source,
            })?;

        let mut state = self.shared.lock();
        if let Some(log) = state.log.as_mut() {
            if log.session_id() == session_id {
                let changed = log.mark_read_from(reader.counterpart());
                debug!(session = %session_id, "{reader} read {changed} messages");
            }
        }
        Ok(())
    }

    pub async fn signal_call(&self, signal: CallSignal) -> Result<(), ChatError> {
        let (generation, session_id) = self.current()?;
        if self.shared.mode_if_current(generation) != Some(ChannelMode::Live) {
            return Err(ChatError::ChannelJoin {
                room_id: session_id,
                source: TransportError::Disconnected,
            });
        }
        self.transport
            .emit(RoomEvent::Call {
                room_id: session_id.clone(),
                signal,
            })
            .await
            .map_err(|source| ChatError::ChannelJoin {
                room_id: session_id,
                source,
            })
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn reconcile(shared: &Shared, backend: &dyn ChatBackend, generation: u64, session_id: &SessionId) {
    match backend.fetch_messages(session_id).await {
        Ok(messages) => {
            let fresh = shared.merge(generation, messages);
            if fresh > 0 {
                debug!(session = %session_id, "reconciled {fresh} messages");
            }
        }
        Err(err) => warn!(session = %session_id, "reconciliation fetch failed: {err}"),
    }
}

async fn listen_room(
    shared: Arc<Shared>,
    backend: Arc<dyn ChatBackend>,
    generation: u64,
    session_id: SessionId,
    mut events: broadcast::Receiver<RoomEvent>,
) {
    loop {
        match events.recv().await {
            Ok(RoomEvent::NewMessage(message)) => {
                if message.session_id == session_id {
                    shared.merge(generation, vec![message]);
                }
            }
            Ok(RoomEvent::Call { room_id, signal }) => {
                shared.relay_call(generation, &room_id, signal);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(session = %session_id, "room listener lagged by {skipped}, resyncing");
                reconcile(&shared, backend.as_ref(), generation, &session_id).await;
            }
            Err(RecvError::Closed) => return,
        }
        if !shared.is_current(generation) {
            return;
        }
    }
}

async fn watch_connection(
    shared: Arc<Shared>,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn RealtimeTransport>,
    generation: u64,
    session_id: SessionId,
    mut connection: tokio::sync::watch::Receiver<ConnectionState>,
) {
    while connection.changed().await.is_ok() {
        let current = *connection.borrow_and_update();
        match current {
            ConnectionState::Connected => match transport.join_room(&session_id).await {
                Ok(()) => {
                    if !shared.set_mode(generation, ChannelMode::Live) {
                        let _ = transport.leave_room(&session_id).await;
                        return;
                    }
                    // Catch up on whatever was pushed while we were away.
                    reconcile(&shared, backend.as_ref(), generation, &session_id).await;
                }
                Err(err) => warn!(session = %session_id, "rejoin failed: {err}"),
            },
            ConnectionState::Disconnected => {
                if !shared.set_mode(generation, ChannelMode::Degraded) {
                    return;
                }
            }
            ConnectionState::Connecting => {}
        }
    }
}

async fn poll_log(
    shared: Arc<Shared>,
    backend: Arc<dyn ChatBackend>,
    generation: u64,
    session_id: SessionId,
    every: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the log was just fetched.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.mode_if_current(generation) {
            None => return,
            Some(ChannelMode::Degraded) => {
                reconcile(&shared, backend.as_ref(), generation, &session_id).await;
            }
            Some(_) => {}
        }
    }
}
