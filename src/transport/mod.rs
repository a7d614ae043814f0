//! Client-facing transports.
//!
//! Each connection registers one hub [`Subscription`](crate::hub::Subscription)
//! for its lifetime, forwards every delivered reply to its client and submits
//! inbound commands with its own subscriber id as origin, so rejections come
//! back on the same connection.
//!
//! - [`tcp::TcpServer`]: binary envelopes ([`envelope::EnvelopeCodec`]).
//! - [`websocket::WsServer`]: JSON text frames.

pub mod envelope;
pub mod tcp;
pub mod websocket;

use serde_json::Value;
use tracing::debug;

use crate::coordinator::CoordinatorHandle;
use crate::hub::SubscriberId;
use crate::messages::{RawCommand, Reply};
use crate::validation::ValidationError;

pub use tcp::TcpServer;
pub use websocket::WsServer;

/// Turns decoded meta into a submission, or answers the sender directly when
/// the meta is not a command. Returns `false` once the coordinator is gone.
pub(crate) fn route_meta(
    handle: &CoordinatorHandle,
    origin: SubscriberId,
    meta: Result<Value, ValidationError>,
) -> bool {
    let raw = meta.and_then(RawCommand::from_meta);
    match raw {
        Ok(raw) => {
            debug!(subscriber = %origin, kind = %raw.kind, "Command received");
            handle.submit(raw, Some(origin)).is_ok()
        }
        Err(e) => {
            debug!(subscriber = %origin, error = %e, "Undecodable message");
            handle.reply_to(origin, Reply::invalid(&e));
            true
        }
    }
}
