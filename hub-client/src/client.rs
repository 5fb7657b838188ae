use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use varme_core::config::HubOptions;

use crate::protocol::{ClientMessage, EntitySnapshot, ServerMessage, StateChangedEvent};

/// Deadline for every request/response exchange with the hub.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("hub rejected the access token: {0}")]
    AuthInvalid(String),
    #[error("request timed out")]
    Timeout,
    #[error("service call failed: {0}")]
    ServiceCall(Value),
    #[error("connection lost")]
    Disconnected,
    #[error("could not decode hub message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}

/// The request surface the rest of the system programs against. The real
/// client implements it; tests substitute recording fakes.
#[async_trait]
pub trait HubApi: Send + Sync {
    async fn entity_state(&self, entity_id: &str) -> Result<Option<EntitySnapshot>, ClientError>;
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), ClientError>;
    fn is_connected(&self) -> bool;
}

enum Command {
    Request { kind: RequestKind, reply: oneshot::Sender<Result<Value, ClientError>> },
    Subscribe { reply: oneshot::Sender<mpsc::Receiver<StateChangedEvent>> },
    Disconnect,
}

#[derive(Debug)]
enum RequestKind {
    GetStates,
    CallService { domain: String, service: String, data: Value },
}

/// Handle to the hub connection. Cheap to clone; all socket state lives in
/// the background task and is reached only through the command queue.
#[derive(Clone, Debug)]
pub struct HubClient {
    cmd_tx: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
    fatal_rx: watch::Receiver<Option<Arc<ClientError>>>,
}

impl HubClient {
    /// Dial the hub, run the auth handshake, and spawn the connection task.
    ///
    /// An invalid token surfaces here as [`ClientError::AuthInvalid`] before
    /// any request is sent.
    pub async fn connect(opts: HubOptions) -> Result<Self, ClientError> {
        let session = Session::open(&opts).await?;
        info!(url = %opts.ws_url, "connected to hub");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let (fatal_tx, fatal_rx) = watch::channel(None);
        tokio::spawn(run(session, opts, cmd_rx, Arc::clone(&connected), fatal_tx));

        Ok(Self { cmd_tx, connected, fatal_rx })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Register a state_changed listener. Events arrive on a buffered
    /// channel the caller drains at its own pace; a full queue drops events
    /// rather than stalling the receive loop.
    pub async fn subscribe_state_changed(
        &self,
    ) -> Result<mpsc::Receiver<StateChangedEvent>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe { reply: tx })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Full `get_states` snapshot, then a linear search. A missing entity is
    /// a successful None, not an error.
    pub async fn get_entity_state(
        &self,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, ClientError> {
        let states = self.request(RequestKind::GetStates).await?;
        let Value::Array(states) = states else {
            return Err(ClientError::Transport("get_states payload was not a list".into()));
        };
        for state in states {
            if state.get("entity_id").and_then(Value::as_str) == Some(entity_id) {
                return Ok(Some(serde_json::from_value(state)?));
            }
        }
        Ok(None)
    }

    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), ClientError> {
        self.request(RequestKind::CallService {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        })
        .await
        .map(|_| ())
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// Resolves when the connection task dies of a fatal error (auth
    /// rejection on reconnect, or retries exhausted).
    pub async fn closed(&self) -> Arc<ClientError> {
        let mut rx = self.fatal_rx.clone();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return Arc::new(ClientError::Disconnected);
            }
        }
    }

    async fn request(&self, kind: RequestKind) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { kind, reply: tx })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

#[async_trait]
impl HubApi for HubClient {
    async fn entity_state(&self, entity_id: &str) -> Result<Option<EntitySnapshot>, ClientError> {
        HubClient::get_entity_state(self, entity_id).await
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), ClientError> {
        HubClient::call_service(self, domain, service, data).await
    }

    fn is_connected(&self) -> bool {
        HubClient::is_connected(self)
    }
}

enum Waiter {
    Caller(oneshot::Sender<Result<Value, ClientError>>),
    Internal(&'static str),
}

/// One authenticated socket session. Request ids restart at 1 with every
/// session; the pending map never outlives it.
struct Session {
    ws: WsStream,
    next_id: u64,
    pending: HashMap<u64, Waiter>,
    events_subscribed: bool,
}

impl Session {
    async fn open(opts: &HubOptions) -> Result<Self, ClientError> {
        let url = url::Url::parse(&opts.ws_url)
            .map_err(|e| ClientError::Transport(format!("invalid ws_url: {e}")))?;
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let mut session =
            Session { ws, next_id: 1, pending: HashMap::new(), events_subscribed: false };
        session.authenticate(&opts.access_token).await?;
        Ok(session)
    }

    /// Server-initiated handshake: auth_required -> auth -> auth_ok.
    async fn authenticate(&mut self, token: &str) -> Result<(), ClientError> {
        loop {
            let frame = self
                .ws
                .next()
                .await
                .ok_or_else(|| ClientError::Transport("connection closed during handshake".into()))?
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let Message::Text(text) = frame else { continue };

            match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::AuthRequired => {
                    self.send(&ClientMessage::Auth { access_token: token.to_string() }).await?;
                }
                ServerMessage::AuthOk => return Ok(()),
                ServerMessage::AuthInvalid { message } => {
                    return Err(ClientError::AuthInvalid(
                        message.unwrap_or_else(|| "invalid access token".into()),
                    ));
                }
                other => debug!(?other, "ignoring message during handshake"),
            }
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(msg)?;
        self.ws
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    fn claim_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn ensure_event_subscription(&mut self) -> Result<(), ClientError> {
        if self.events_subscribed {
            return Ok(());
        }
        let id = self.claim_id();
        self.send(&ClientMessage::SubscribeEvents { id, event_type: "state_changed".into() })
            .await?;
        self.pending.insert(id, Waiter::Internal("subscribe_events"));
        self.events_subscribed = true;
        Ok(())
    }

    /// Complete every in-flight waiter with Disconnected. Runs before any
    /// reconnect attempt sends a new request.
    fn fail_pending(&mut self) {
        for (_, waiter) in self.pending.drain() {
            if let Waiter::Caller(tx) = waiter {
                let _ = tx.send(Err(ClientError::Disconnected));
            }
        }
    }
}

enum SessionEnd {
    Requested,
    Transport(String),
}

async fn run(
    mut session: Session,
    opts: HubOptions,
    mut cmd_rx: mpsc::Receiver<Command>,
    connected: Arc<AtomicBool>,
    fatal_tx: watch::Sender<Option<Arc<ClientError>>>,
) {
    let mut subscribers: Vec<mpsc::Sender<StateChangedEvent>> = Vec::new();

    loop {
        match session_loop(&mut session, &mut cmd_rx, &mut subscribers).await {
            SessionEnd::Requested => {
                session.fail_pending();
                let _ = session.ws.close(None).await;
                info!("hub connection closed");
                return;
            }
            SessionEnd::Transport(reason) => {
                warn!(%reason, "hub connection lost");
                connected.store(false, Ordering::Relaxed);
                session.fail_pending();
                counter!("hub.client.disconnect").increment(1);
            }
        }

        match reconnect(&opts, !subscribers.is_empty()).await {
            Ok(next) => {
                session = next;
                connected.store(true, Ordering::Relaxed);
                info!("reconnected to hub");
            }
            Err(err) => {
                let _ = fatal_tx.send(Some(Arc::new(err)));
                return;
            }
        }
    }
}

async fn session_loop(
    session: &mut Session,
    cmd_rx: &mut mpsc::Receiver<Command>,
    subscribers: &mut Vec<mpsc::Sender<StateChangedEvent>>,
) -> SessionEnd {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Disconnect) => return SessionEnd::Requested,
                Some(Command::Subscribe { reply }) => {
                    if let Err(err) = session.ensure_event_subscription().await {
                        return SessionEnd::Transport(err.to_string());
                    }
                    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
                    subscribers.push(tx);
                    let _ = reply.send(rx);
                }
                Some(Command::Request { kind, reply }) => {
                    let id = session.claim_id();
                    let msg = match kind {
                        RequestKind::GetStates => ClientMessage::GetStates { id },
                        RequestKind::CallService { domain, service, data } => {
                            ClientMessage::CallService { id, domain, service, service_data: data }
                        }
                    };
                    match session.send(&msg).await {
                        Ok(()) => {
                            session.pending.insert(id, Waiter::Caller(reply));
                        }
                        Err(err) => {
                            let reason = err.to_string();
                            let _ = reply.send(Err(err));
                            return SessionEnd::Transport(reason);
                        }
                    }
                }
            },
            frame = session.ws.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_frame(session, subscribers, &text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = session.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    return SessionEnd::Transport("server closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Transport(err.to_string()),
                None => return SessionEnd::Transport("stream ended".into()),
            },
            _ = sweep.tick() => {
                // Reclaims slots whose caller hit the request deadline.
                session.pending.retain(|id, waiter| match waiter {
                    Waiter::Caller(tx) if tx.is_closed() => {
                        debug!(id, "reclaiming abandoned request slot");
                        false
                    }
                    _ => true,
                });
            }
        }
    }
}

fn dispatch_frame(
    session: &mut Session,
    subscribers: &mut Vec<mpsc::Sender<StateChangedEvent>>,
    text: &str,
) {
    let msg = match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => msg,
        Err(err) => {
            counter!("hub.client.decode_error").increment(1);
            warn!(%err, "undecodable hub message");
            return;
        }
    };

    match msg {
        ServerMessage::Result { id, success, result, error } => {
            match session.pending.remove(&id) {
                Some(Waiter::Caller(tx)) => {
                    let outcome = if success {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(ClientError::ServiceCall(error.unwrap_or(Value::Null)))
                    };
                    if tx.send(outcome).is_err() {
                        debug!(id, "caller gave up before the result arrived");
                    }
                }
                Some(Waiter::Internal(what)) => {
                    if success {
                        debug!(id, what, "request acknowledged");
                    } else {
                        warn!(id, what, ?error, "hub rejected request");
                    }
                }
                None => warn!(id, "result for unknown request id, dropping"),
            }
        }
        ServerMessage::Event { event, .. } => {
            let Some(change) = StateChangedEvent::from_event(&event) else { return };
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                if tx.try_send(change.clone()).is_err() {
                    counter!("hub.client.event_dropped").increment(1);
                    warn!(entity_id = %change.entity_id, "subscriber queue full, dropping event");
                }
            }
        }
        ServerMessage::AuthRequired | ServerMessage::AuthOk => {
            debug!("unexpected auth message after handshake");
        }
        ServerMessage::AuthInvalid { message } => {
            warn!(?message, "auth_invalid outside the handshake, ignoring");
        }
        ServerMessage::Unknown => {}
    }
}

/// Bounded reconnect: a fresh handshake per attempt, `retry_delay` apart.
/// An auth rejection stops retrying immediately; exhaustion is fatal to the
/// supervising caller.
async fn reconnect(opts: &HubOptions, resubscribe: bool) -> Result<Session, ClientError> {
    for attempt in 1..=opts.max_retries {
        tokio::time::sleep(opts.retry_delay()).await;
        counter!("hub.client.reconnect_attempt").increment(1);
        match Session::open(opts).await {
            Ok(mut session) => {
                if resubscribe {
                    if let Err(err) = session.ensure_event_subscription().await {
                        warn!(attempt, %err, "failed to replay event subscription");
                        continue;
                    }
                }
                return Ok(session);
            }
            Err(err @ ClientError::AuthInvalid(_)) => return Err(err),
            Err(err) => warn!(attempt, max = opts.max_retries, %err, "reconnect attempt failed"),
        }
    }
    Err(ClientError::RetriesExhausted(opts.max_retries))
}
