use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::envelope::{self, DecodeError, Envelope};
use crate::registry::{PeerRegistry, PeerSender, RegistryError, SendFailure, SessionToken};

/// How long a closing session waits for its writer to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Joining,
    Active,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::Joining => "joining",
            SessionPhase::Active => "active",
            SessionPhase::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join timed out")]
    TimedOut,
    #[error("client closed socket before joining")]
    SocketClosed,
    #[error("socket closed during join: {0:?}")]
    Closed(Option<String>),
    #[error("transport error during join: {0}")]
    Transport(String),
    #[error("invalid join frame: {0}")]
    InvalidFrame(#[from] DecodeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl JoinError {
    fn metric_label(&self) -> &'static str {
        match self {
            JoinError::TimedOut => "timeout",
            JoinError::SocketClosed | JoinError::Closed(_) => "client_closed",
            JoinError::Transport(_) => "transport",
            JoinError::InvalidFrame(_) => "invalid_frame",
            JoinError::Registry(RegistryError::DuplicatePeerId(_)) => "duplicate_id",
            JoinError::Registry(RegistryError::AnnounceFailed(..)) => "announce_failed",
        }
    }

    /// Whether the peer is still listening and deserves a `join_error` frame.
    fn is_reportable(&self) -> bool {
        matches!(
            self,
            JoinError::InvalidFrame(_) | JoinError::Registry(RegistryError::DuplicatePeerId(_))
        )
    }
}

/// Why an active session stopped reading.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("client closed websocket")]
    ClientClosed(Option<String>),
    #[error("stream ended")]
    StreamEnded,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Decode(#[from] DecodeError),
    #[error("idle for {0:?}")]
    IdleTimeout(Duration),
}

/// What happened to one envelope handed to [`route`].
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    NoTarget,
    UnknownTarget,
    Failed(SendFailure),
}

/// Stamps `envelope` with the sender's id and forwards it to its target.
///
/// Misses are not errors: the target may have left a moment ago. Delivery
/// failures only concern the target and never the sender.
pub fn route(registry: &PeerRegistry, sender_id: &str, mut envelope: Envelope) -> RouteOutcome {
    envelope.source_id = Some(sender_id.to_owned());

    let Some(target_id) = envelope.target_id.as_deref() else {
        return RouteOutcome::NoTarget;
    };
    let Some(target) = registry.lookup(target_id) else {
        return RouteOutcome::UnknownTarget;
    };

    match target.try_send(envelope.encode()) {
        Ok(()) => RouteOutcome::Delivered,
        Err(failure) => RouteOutcome::Failed(failure),
    }
}

/// Owns the registry entry of an active session. Dropping it is the single
/// cleanup path: unregister, close the peer's writer, announce departure.
struct Membership {
    registry: PeerRegistry,
    peer_id: String,
    token: SessionToken,
    sender: PeerSender,
    announce_presence: bool,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let departure = self
            .announce_presence
            .then(|| Envelope::presence(envelope::PEER_LEFT, &self.peer_id).encode());
        let removed = self
            .registry
            .leave(&self.peer_id, self.token, departure.as_ref());
        let _ = self.sender.try_send(Message::Close(None));
        gauge!("beach_relay_peers_active").set(self.registry.len() as f64);

        debug!(
            peer_id = %self.peer_id,
            token = %self.token,
            removed,
            "peer unregistered"
        );
    }
}

/// Drives one signaling connection from join to close.
pub async fn run(
    socket: WebSocket,
    registry: PeerRegistry,
    settings: SessionSettings,
    preset_id: Option<String>,
    remote_addr: SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(%remote_addr, phase = %SessionPhase::Joining, "signaling connection upgraded");

    let joined = match preset_id {
        Some(raw) => envelope::validate_peer_id(&raw).map_err(JoinError::from),
        None => await_join(&mut ws_rx, settings.join_timeout).await,
    };
    let peer_id = match joined {
        Ok(peer_id) => peer_id,
        Err(err) => return reject(&mut ws_tx, err, remote_addr).await,
    };

    let (sender, mut outbound) = PeerSender::channel(settings.peer_buffer);
    let arrival = settings
        .announce_presence
        .then(|| Envelope::presence(envelope::PEER_JOINED, &peer_id).encode());
    let admitted = registry.join(
        &peer_id,
        sender.clone(),
        |peers| Envelope::init(&peer_id, peers).encode(),
        arrival.as_ref(),
    );
    let registration = match admitted {
        Ok(registration) => registration,
        Err(err) => return reject(&mut ws_tx, err.into(), remote_addr).await,
    };

    let membership = Membership {
        registry: registry.clone(),
        peer_id: peer_id.clone(),
        token: registration.token,
        sender,
        announce_presence: settings.announce_presence,
    };
    counter!("beach_relay_joins_total").increment(1);
    gauge!("beach_relay_peers_active").set(registry.len() as f64);
    info!(
        peer_id = %peer_id,
        token = %registration.token,
        %remote_addr,
        known_peers = registration.peers.len(),
        phase = %SessionPhase::Active,
        "peer joined"
    );

    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if ws_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(peer_id = %writer_peer, "writer task finished");
    });

    let reason = relay_loop(&mut ws_rx, &registry, &peer_id, settings.idle_timeout).await;
    match &reason {
        CloseReason::ClientClosed(_) | CloseReason::StreamEnded => info!(
            peer_id = %peer_id,
            token = %registration.token,
            %reason,
            phase = %SessionPhase::Closed,
            "peer left"
        ),
        _ => warn!(
            peer_id = %peer_id,
            token = %registration.token,
            %reason,
            phase = %SessionPhase::Closed,
            "peer dropped"
        ),
    }

    drop(membership);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Waits for the first data frame and extracts the peer id from it.
pub async fn await_join<S, E>(ws_rx: &mut S, join_timeout: Duration) -> Result<String, JoinError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let deadline = Instant::now() + join_timeout;
    loop {
        let frame = timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| JoinError::TimedOut)?
            .ok_or(JoinError::SocketClosed)?
            .map_err(|err| JoinError::Transport(err.to_string()))?;

        match frame {
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                return Err(JoinError::Closed(frame.map(|f| f.reason.to_string())));
            }
            data => return Ok(envelope::decode_join(&data)?),
        }
    }
}

/// Receives envelopes until the connection ends, routing each one.
pub async fn relay_loop<S, E>(
    ws_rx: &mut S,
    registry: &PeerRegistry,
    peer_id: &str,
    idle_timeout: Option<Duration>,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = match idle_timeout {
            Some(limit) => match timeout(limit, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => return CloseReason::IdleTimeout(limit),
            },
            None => ws_rx.next().await,
        };

        let frame = match next {
            None => return CloseReason::StreamEnded,
            Some(Err(err)) => return CloseReason::Transport(err.to_string()),
            Some(Ok(frame)) => frame,
        };

        let envelope = match frame {
            Message::Close(frame) => {
                return CloseReason::ClientClosed(frame.map(|f| f.reason.to_string()));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            data => match envelope::decode(&data) {
                Ok(envelope) => envelope,
                Err(err) => return CloseReason::Decode(err),
            },
        };

        let kind = envelope.kind.clone();
        let target = envelope.target_id.clone();
        match route(registry, peer_id, envelope) {
            RouteOutcome::Delivered => {
                counter!("beach_relay_envelopes_forwarded_total").increment(1);
                debug!(from = %peer_id, to = ?target, %kind, "envelope forwarded");
            }
            RouteOutcome::NoTarget | RouteOutcome::UnknownTarget => {
                counter!(
                    "beach_relay_envelopes_dropped_total",
                    "reason" => "unknown_target"
                )
                .increment(1);
                debug!(from = %peer_id, to = ?target, %kind, "no such peer; envelope dropped");
            }
            RouteOutcome::Failed(failure) => {
                counter!(
                    "beach_relay_envelopes_dropped_total",
                    "reason" => "send_failed"
                )
                .increment(1);
                warn!(from = %peer_id, to = ?target, %kind, %failure, "forward failed");
            }
        }
    }
}

async fn reject<W>(ws_tx: &mut W, err: JoinError, remote_addr: SocketAddr)
where
    W: Sink<Message> + Unpin,
{
    counter!("beach_relay_join_failures_total", "reason" => err.metric_label()).increment(1);
    warn!(%remote_addr, error = %err, "join rejected");

    if err.is_reportable() {
        let _ = ws_tx.send(Envelope::join_error(err.to_string()).encode()).await;
    }
    let _ = ws_tx.close().await;
}
