//! WebSocket interface speaking JSON text frames.
//!
//! Inbound text frames carry the command meta, e.g.
//! `{"command_type": "set_voltage", "voltage": 1000}`. Outbound frames are
//! reply metas. Binary frames are answered with `INCORRECT_MESSAGE_PARAMS`.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::route_meta;
use crate::coordinator::CoordinatorHandle;
use crate::error::AppResult;
use crate::messages::Reply;
use crate::validation::ValidationError;

/// Accepts WebSocket clients and bridges them to the coordinator.
#[derive(Debug)]
pub struct WsServer {
    listener: TcpListener,
    handle: CoordinatorHandle,
}

impl WsServer {
    /// Binds `addr` (`host:port`, port 0 picks a free one).
    pub async fn bind(addr: &str, handle: CoordinatorHandle) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "WebSocket interface listening");
        Ok(Self { listener, handle })
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `cancel` fires, then closes every connection and waits for them.
    pub async fn run(self, cancel: CancellationToken) {
        let connections = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let handle = self.handle.clone();
                    let token = cancel.child_token();
                    connections.spawn(
                        async move {
                            if let Err(e) = serve_connection(stream, handle, token).await {
                                debug!(error = %e, "WebSocket session ended with error");
                            }
                        }
                        .instrument(tracing::info_span!("ws", %peer)),
                    );
                }
                Err(e) => warn!(error = %e, "WebSocket accept failed"),
            }
        }

        connections.close();
        connections.wait().await;
        info!("WebSocket interface stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    handle: CoordinatorHandle,
    cancel: CancellationToken,
) -> AppResult<()> {
    // A client that never finishes the handshake must not hold up shutdown.
    let ws = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Shutdown during WebSocket handshake");
            return Ok(());
        }
        ws = tokio_tungstenite::accept_async(stream) => ws?,
    };
    debug!("WebSocket connection opened");
    let (mut outgoing, mut incoming) = ws.split();
    let mut subscription = handle.subscribe();
    let id = subscription.id();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = outgoing.send(Message::Close(None)).await;
                break;
            }
            reply = subscription.recv() => {
                let Some(reply) = reply else { break };
                outgoing.send(Message::text(reply.to_meta().to_string())).await?;
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let meta = serde_json::from_str(&text)
                        .map_err(|e| ValidationError::new(format!("message is not valid JSON: {e}")));
                    if !route_meta(&handle, id, meta) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    handle.reply_to(
                        id,
                        Reply::invalid(&ValidationError::new("binary frames are not supported")),
                    );
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    debug!(subscriber = %id, "WebSocket connection closed");
    Ok(())
}
