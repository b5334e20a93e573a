use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::connection::{Channel, Connection};

/// The event hooks a host application implements to observe the protocol. All methods
/// have no-op defaults (and `on_validate` accepts everything), so an implementation only
/// overrides what it cares about.
///
/// Hooks are invoked from worker tasks; they should return quickly or hand work off,
/// since a stalled hook stalls the connection that invoked it (never its siblings).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolEvents: Send + Sync + 'static {
    /// The mutual connect handshake completed; `payload` is the data carried by the
    /// peer's connect packet.
    async fn on_connect(&self, connection: Arc<Connection>, payload: &[u8]) {
        let _ = (connection, payload);
    }

    /// The connection ended, by either side or by shutdown; `payload` is the data
    /// carried by the disconnect packet, if any.
    async fn on_disconnect(&self, connection: Arc<Connection>, payload: &[u8]) {
        let _ = (connection, payload);
    }

    /// The peer went silent (or its ping exceeded the maximum). `on_disconnect` follows.
    async fn on_timeout(&self, connection: Arc<Connection>) {
        let _ = connection;
    }

    /// Decides whether a connect attempt from `addr` is accepted. Rejected attempts are
    /// counted and dropped without a reply.
    fn on_validate(&self, addr: SocketAddr, payload: &[u8]) -> bool {
        let _ = (addr, payload);
        true
    }

    /// A payload arrived on the given channel.
    async fn on_packet(&self, connection: Arc<Connection>, payload: &[u8], channel: Channel) {
        let _ = (connection, payload, channel);
    }
}

/// Hook implementation that observes nothing.
pub struct NoEvents;

#[async_trait]
impl ProtocolEvents for NoEvents {}
