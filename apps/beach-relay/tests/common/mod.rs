#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use beach_relay::{router, serve, RelayState, SessionSettings};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ECHO_PATH: &str = "/echo";
pub const SIGNAL_PATH: &str = "/rtc";

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: RelayState,
    _shutdown: oneshot::Sender<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(SessionSettings::default()).await
    }

    pub async fn start_with(settings: SessionSettings) -> Self {
        Self::start_with_state(RelayState::new(settings)).await
    }

    pub async fn start_with_state(state: RelayState) -> Self {
        let app = router(state.clone(), ECHO_PATH, SIGNAL_PATH);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, stop) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, app, async move {
            let _ = stop.await;
        }));
        Self {
            addr,
            state,
            _shutdown: shutdown,
        }
    }

    pub async fn connect(&self, path_and_query: &str) -> Ws {
        let url = format!("ws://{}{}", self.addr, path_and_query);
        let (ws, _) = connect_async(&url).await.expect("websocket connect");
        ws
    }

    /// Connects to the signaling endpoint, joins as `peer_id`, and returns the init envelope.
    pub async fn join(&self, peer_id: &str) -> (Ws, Value) {
        let mut ws = self.connect(SIGNAL_PATH).await;
        send_json(
            &mut ws,
            &serde_json::json!({ "type": "join", "peer_id": peer_id }),
        )
        .await;
        let init = next_json(&mut ws).await;
        assert_eq!(init["type"], "init", "first frame after join must be init");
        (ws, init)
    }

    /// Waits until the registry no longer lists `peer_id`.
    pub async fn wait_until_gone(&self, peer_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.state.registry.lookup(peer_id).is_some() {
            assert!(Instant::now() < deadline, "{peer_id} was never unregistered");
            sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn send_json(ws: &mut Ws, value: &Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

pub async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("send frame");
}

/// Next data frame parsed as JSON, skipping control frames.
pub async fn next_json(ws: &mut Ws) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).expect("json frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Asserts that no data frame arrives within `window`.
pub async fn assert_silent(ws: &mut Ws, window: Duration) {
    if let Ok(frame) = timeout(window, ws.next()).await {
        panic!("expected silence, got {frame:?}");
    }
}

/// Waits for the relay to close `ws`.
pub async fn expect_closed(ws: &mut Ws) {
    timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("expected close, got {other:?}"),
            }
        }
    })
    .await
    .expect("relay did not close the connection");
}

pub fn ids(value: &Value) -> Vec<String> {
    let mut ids: Vec<String> = value
        .as_array()
        .expect("id list")
        .iter()
        .map(|id| id.as_str().expect("string id").to_string())
        .collect();
    ids.sort();
    ids
}
