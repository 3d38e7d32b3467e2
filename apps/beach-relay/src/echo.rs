use std::fmt;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info};

use crate::envelope::frame_kind;

/// Loops every data frame back to its sender. Never touches the registry.
pub async fn run(socket: WebSocket, remote_addr: SocketAddr) {
    let (mut tx, mut rx) = socket.split();
    info!(%remote_addr, "echo connection opened");
    let echoed = echo_frames(&mut rx, &mut tx).await;
    let _ = tx.close().await;
    info!(%remote_addr, echoed, "echo connection closed");
}

/// Returns the number of frames echoed before the stream ended.
pub async fn echo_frames<R, W, E>(rx: &mut R, tx: &mut W) -> usize
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    W: Sink<Message> + Unpin,
    E: fmt::Display,
{
    let mut echoed = 0usize;
    while let Some(frame) = rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "echo receive failed");
                break;
            }
        };

        match frame {
            Message::Text(_) | Message::Binary(_) => {
                debug!(kind = frame_kind(&frame), "echoing frame");
                if tx.send(frame).await.is_err() {
                    break;
                }
                echoed += 1;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        }
    }
    echoed
}
