//! Real-time collaborator: room-scoped pub/sub over a websocket.

use crate::config::RealtimeConfig;
use crate::error::TransportError;
use crate::types::{CallSignal, Message, SessionId};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub const NEW_MESSAGE_EVENT: &str = "new_message";

/// Frame pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<SessionId>,
    #[serde(default)]
    pub payload: Value,
}

/// Frame sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "connect")]
    Connect { token: Option<String> },
    #[serde(rename = "join_room")]
    JoinRoom { room_id: SessionId },
    #[serde(rename = "leave_room")]
    LeaveRoom { room_id: SessionId },
    #[serde(rename = "emit")]
    Emit {
        room_id: SessionId,
        event: String,
        payload: Value,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    NewMessage(Message),
    Call { room_id: SessionId, signal: CallSignal },
}

impl RoomEvent {
    pub fn room_id(&self) -> &SessionId {
        match self {
            RoomEvent::NewMessage(message) => &message.session_id,
            RoomEvent::Call { room_id, .. } => room_id,
        }
    }

    pub fn to_command(&self) -> Result<WsCommand, TransportError> {
        let (event, payload) = match self {
            RoomEvent::NewMessage(message) => {
                (NEW_MESSAGE_EVENT.to_string(), serde_json::to_value(message)?)
            }
            RoomEvent::Call { signal, .. } => {
                (signal.event_name().to_string(), serde_json::to_value(signal)?)
            }
        };
        Ok(WsCommand::Emit {
            room_id: self.room_id().clone(),
            event,
            payload,
        })
    }
}

/// Interprets a server frame. Unknown events and undecodable payloads yield `None`.
pub fn decode_event(evt: WsEvent) -> Option<RoomEvent> {
    match evt.event.as_str() {
        NEW_MESSAGE_EVENT => match serde_json::from_value::<Message>(evt.payload) {
            Ok(message) => Some(RoomEvent::NewMessage(message)),
            Err(err) => {
                debug!("dropping undecodable new_message: {err}");
                None
            }
        },
        "call_user" | "call_accepted" | "call_ended" | "user_left" => {
            let room_id = evt.room_id?;
            let signal = serde_json::from_value::<CallSignal>(evt.payload).ok()?;
            Some(RoomEvent::Call { room_id, signal })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn join_room(&self, room_id: &SessionId) -> Result<(), TransportError>;

    async fn leave_room(&self, room_id: &SessionId) -> Result<(), TransportError>;

    async fn emit(&self, event: RoomEvent) -> Result<(), TransportError>;

    /// Every event the connection receives; consumers filter by room.
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent>;

    /// Connection state; a change to `Connected` is the reconnect signal.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

pub fn compute_backoff(retry_count: u32, base: Duration) -> Duration {
    let exponent = retry_count.max(1).saturating_sub(1).min(8);
    base.saturating_mul(2_u32.pow(exponent)).min(MAX_BACKOFF)
}

pub struct WsTransport {
    commands: mpsc::Sender<WsCommand>,
    events: broadcast::Sender<RoomEvent>,
    state: watch::Receiver<ConnectionState>,
    worker: JoinHandle<()>,
}

impl WsTransport {
    /// Starts the connection loop. Must be called inside a tokio runtime.
    pub fn connect(cfg: &RealtimeConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(EVENT_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let worker = tokio::spawn(run_connection(
            cfg.clone(),
            command_rx,
            events.clone(),
            state_tx,
        ));
        Self {
            commands,
            events,
            state,
            worker,
        }
    }

    async fn send_command(&self, cmd: WsCommand) -> Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::Disconnected);
        }
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn join_room(&self, room_id: &SessionId) -> Result<(), TransportError> {
        self.send_command(WsCommand::JoinRoom {
            room_id: room_id.clone(),
        })
        .await
    }

    async fn leave_room(&self, room_id: &SessionId) -> Result<(), TransportError> {
        self.send_command(WsCommand::LeaveRoom {
            room_id: room_id.clone(),
        })
        .await
    }

    async fn emit(&self, event: RoomEvent) -> Result<(), TransportError> {
        let cmd = event.to_command()?;
        self.send_command(cmd).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

enum SessionEnd {
    /// The transport handle was dropped.
    Shutdown,
    /// The socket went away.
    Lost,
}

async fn run_connection(
    cfg: RealtimeConfig,
    mut commands: mpsc::Receiver<WsCommand>,
    events: broadcast::Sender<RoomEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let mut attempt: u32 = 0;
    loop {
        let _ = state.send(ConnectionState::Connecting);
        match tokio_tungstenite::connect_async(cfg.socket_url.as_str()).await {
            Ok((socket, _)) => {
                info!("realtime connected to {}", cfg.socket_url);
                attempt = 0;
                let end = drive_socket(socket, &cfg, &mut commands, &events, &state).await;
                let _ = state.send(ConnectionState::Disconnected);
                if let SessionEnd::Shutdown = end {
                    return;
                }
                warn!("realtime connection lost");
            }
            Err(err) => {
                let _ = state.send(ConnectionState::Disconnected);
                warn!("realtime connect failed: {err}");
            }
        }

        if !cfg.reconnect {
            return;
        }
        attempt += 1;
        let wait = compute_backoff(attempt, cfg.reconnect_base());
        debug!("reconnecting in {:?} (attempt {attempt})", wait);
        sleep(wait).await;
    }
}

async fn drive_socket<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    cfg: &RealtimeConfig,
    commands: &mut mpsc::Receiver<WsCommand>,
    events: &broadcast::Sender<RoomEvent>,
    state: &watch::Sender<ConnectionState>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = socket.split();

    let hello = WsCommand::Connect {
        token: cfg.auth_token.clone(),
    };
    match serde_json::to_string(&hello) {
        Ok(text) => {
            if sink.send(Frame::Text(text)).await.is_err() {
                return SessionEnd::Lost;
            }
        }
        Err(err) => warn!("could not encode connect frame: {err}"),
    }
    let _ = state.send(ConnectionState::Connected);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    let _ = sink.send(Frame::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("could not encode command: {err}");
                        continue;
                    }
                };
                if sink.send(Frame::Text(text)).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => {
                        if let Ok(evt) = serde_json::from_str::<WsEvent>(&text) {
                            if let Some(room_event) = decode_event(evt) {
                                let _ = events.send(room_event);
                            }
                        }
                    }
                    Some(Ok(Frame::Ping(data))) => {
                        if sink.send(Frame::Pong(data)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Frame::Close(_))) | Some(Err(_)) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// In-process pub/sub hub. Every connected peer sees every event, as on a
/// socket server where all peers share the same rooms.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    events: broadcast::Sender<RoomEvent>,
    state: watch::Sender<ConnectionState>,
    members: Mutex<HashMap<SessionId, HashSet<usize>>>,
    emitted: Mutex<Vec<RoomEvent>>,
    next_peer: Mutex<usize>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            inner: Arc::new(HubInner {
                events,
                state,
                members: Mutex::new(HashMap::new()),
                emitted: Mutex::new(Vec::new()),
                next_peer: Mutex::new(0),
            }),
        }
    }

    pub fn connect(&self) -> MemoryTransport {
        let mut next = self.inner.next_peer.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        MemoryTransport {
            hub: self.clone(),
            peer: *next,
        }
    }

    /// Takes the hub offline or back online, notifying every peer.
    pub fn set_online(&self, online: bool) {
        let next = if online {
            ConnectionState::Connected
        } else {
            // Rooms do not survive a server restart.
            self.inner
                .members
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            ConnectionState::Disconnected
        };
        self.inner.state.send_replace(next);
    }

    pub fn is_online(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Publishes an event as if another participant had emitted it.
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn emitted(&self) -> Vec<RoomEvent> {
        self.inner
            .emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn member_count(&self, room_id: &SessionId) -> usize {
        self.inner
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    peer: usize,
}

impl MemoryTransport {
    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.hub.is_online() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn join_room(&self, room_id: &SessionId) -> Result<(), TransportError> {
        self.ensure_online()?;
        self.hub
            .inner
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(room_id.clone())
            .or_default()
            .insert(self.peer);
        Ok(())
    }

    async fn leave_room(&self, room_id: &SessionId) -> Result<(), TransportError> {
        let mut members = self
            .hub
            .inner
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(room) = members.get_mut(room_id) {
            room.remove(&self.peer);
            if room.is_empty() {
                members.remove(room_id);
            }
        }
        Ok(())
    }

    async fn emit(&self, event: RoomEvent) -> Result<(), TransportError> {
        self.ensure_online()?;
        self.hub
            .inner
            .emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        let _ = self.hub.inner.events.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.hub.inner.events.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.hub.inner.state.subscribe()
    }
}
