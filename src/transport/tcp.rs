//! TCP interface speaking binary envelopes.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::envelope::{Envelope, EnvelopeCodec};
use super::route_meta;
use crate::coordinator::CoordinatorHandle;
use crate::error::AppResult;
use crate::validation::ValidationError;

/// Accepts envelope clients and bridges them to the coordinator.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    handle: CoordinatorHandle,
}

impl TcpServer {
    /// Binds `addr` (`host:port`, port 0 picks a free one).
    pub async fn bind(addr: &str, handle: CoordinatorHandle) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "TCP interface listening");
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
                        serve_connection(stream, handle, token)
                            .instrument(tracing::info_span!("tcp", %peer)),
                    );
                }
                Err(e) => warn!(error = %e, "TCP accept failed"),
            }
        }

        connections.close();
        connections.wait().await;
        info!("TCP interface stopped");
    }
}

async fn serve_connection(stream: TcpStream, handle: CoordinatorHandle, cancel: CancellationToken) {
    debug!("Connection opened");
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, EnvelopeCodec);
    let mut sink = FramedWrite::new(write_half, EnvelopeCodec);
    let mut subscription = handle.subscribe();
    let id = subscription.id();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            reply = subscription.recv() => {
                let Some(reply) = reply else { break };
                if let Err(e) = sink.send(Envelope::with_meta(&reply.to_meta())).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(envelope)) => {
                    let meta = envelope
                        .meta_json()
                        .map_err(|e| ValidationError::new(format!("message meta is not valid JSON: {e}")));
                    if !route_meta(&handle, id, meta) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Closing connection on framing error");
                    break;
                }
                None => break,
            },
        }
    }

    // Deliver replies that were already queued, e.g. a rejection of the last frame.
    while let Some(reply) = subscription.try_recv() {
        if sink.send(Envelope::with_meta(&reply.to_meta())).await.is_err() {
            break;
        }
    }
    drop(subscription);
    debug!(subscriber = %id, "Connection closed");
}
