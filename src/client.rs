use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::info;

use crate::callbacks::ProtocolEvents;
use crate::config::Config;
use crate::connection::{Channel, Connection};
use crate::endpoint::{ClientSocket, ProtocolCore};

/// The client role: a dispatcher over a connected UDP socket with a single connection,
/// the one to the server.
pub struct Client {
    core: Arc<ProtocolCore>,
    server: Arc<Connection>,
}

impl Client {
    /// Connects to the server. The call returns as soon as the connect packet is on its
    /// way; the handshake completes asynchronously and is reported through
    /// [`ProtocolEvents::on_connect`]. If the server stays silent, `on_timeout` and
    /// `on_disconnect` follow after the configured timeout threshold.
    pub async fn connect(
        server_addr: SocketAddr,
        events: Arc<dyn ProtocolEvents>,
        config: Config,
    ) -> anyhow::Result<Client> {
        Self::connect_with_data(server_addr, None, events, config).await
    }

    /// Like [`Client::connect`], but the connect packet carries `data`, which the
    /// server sees in its validation and connect hooks.
    pub async fn connect_with_data(
        server_addr: SocketAddr,
        data: Option<&[u8]>,
        events: Arc<dyn ProtocolEvents>,
        config: Config,
    ) -> anyhow::Result<Client> {
        config.validate()?;

        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        info!(%server_addr, local_addr = ?socket.local_addr(), "connecting to server");

        let proxy = Arc::new(ClientEventsProxy {
            inner: events,
            core: RwLock::new(Weak::new()),
        });

        let core = ProtocolCore::new(
            Arc::new(config),
            Arc::new(ClientSocket::new(socket, server_addr)),
            proxy.clone(),
        );
        *proxy.core.write().unwrap() = Arc::downgrade(&core);

        core.listen();
        let server = core.connect_client(server_addr, data);
        server.set_is_server(true);

        Ok(Client { core, server })
    }

    /// The connection to the server.
    pub fn server(&self) -> &Arc<Connection> {
        &self.server
    }

    /// Disconnects from the server and releases all resources. Blocks until all worker
    /// tasks have finished.
    pub async fn disconnect(&self) {
        self.core.destroy().await;
    }
}

/// Forwards events to the application and adds the client-role behavior: inbound
/// connect attempts are never accepted, and a disconnect from the server tears the
/// whole endpoint down.
struct ClientEventsProxy {
    inner: Arc<dyn ProtocolEvents>,
    core: RwLock<Weak<ProtocolCore>>,
}

#[async_trait]
impl ProtocolEvents for ClientEventsProxy {
    async fn on_connect(&self, connection: Arc<Connection>, payload: &[u8]) {
        self.inner.on_connect(connection, payload).await;
    }

    async fn on_disconnect(&self, connection: Arc<Connection>, payload: &[u8]) {
        self.inner.on_disconnect(connection, payload).await;

        if let Some(core) = self.core.read().unwrap().upgrade() {
            tokio::spawn(async move { core.destroy().await });
        }
    }

    async fn on_timeout(&self, connection: Arc<Connection>) {
        self.inner.on_timeout(connection).await;
    }

    fn on_validate(&self, _addr: SocketAddr, _payload: &[u8]) -> bool {
        false
    }

    async fn on_packet(&self, connection: Arc<Connection>, payload: &[u8], channel: Channel) {
        self.inner.on_packet(connection, payload, channel).await;
    }
}
