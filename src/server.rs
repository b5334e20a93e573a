use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::info;

use crate::callbacks::ProtocolEvents;
use crate::config::Config;
use crate::endpoint::{ProtocolCore, ServerSocket};

/// The server role: a dispatcher over an unconnected UDP socket, managing one
/// connection per client.
pub struct Server {
    core: Arc<ProtocolCore>,
}

impl Server {
    /// Binds the listen address and starts the listener workers. The server is
    /// accepting connections when this returns; connect attempts pass through
    /// [`ProtocolEvents::on_validate`] first.
    pub async fn start(
        listen_addr: SocketAddr,
        events: Arc<dyn ProtocolEvents>,
        config: Config,
    ) -> anyhow::Result<Server> {
        config.validate()?;

        let socket = UdpSocket::bind(listen_addr).await?;
        info!(local_addr = ?socket.local_addr(), "server listening");

        let core = ProtocolCore::new(Arc::new(config), Arc::new(ServerSocket::new(socket)), events);
        core.listen();

        Ok(Server { core })
    }

    /// The bound address, useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    /// Disconnects all clients and stops the server. Blocks until all worker tasks
    /// have finished. Invokes no disconnect callbacks.
    pub async fn stop(&self) {
        self.core.destroy().await;
    }
}
