use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace};

use crate::buffer_pool::{BufferPool, ConnectionPool};
use crate::callbacks::ProtocolEvents;
use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::exec_guard::ExecGuard;
use crate::packet::{self, Descriptor, DESCRIPTOR_OFFSET};
use crate::stats;
use crate::util;

/// Read/write seam over the UDP socket, introduced so the dispatcher can be tested
/// without real I/O. The client role implements it over a connected socket, the server
/// role over an unconnected one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Receives one datagram into `buf`. `None` signals a read error; the listener
    /// drops the read and keeps going.
    async fn recv_datagram(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;

    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Socket of the server role: unconnected, talks to many peers.
pub(crate) struct ServerSocket {
    socket: UdpSocket,
}

impl ServerSocket {
    pub fn new(socket: UdpSocket) -> ServerSocket {
        ServerSocket { socket }
    }
}

#[async_trait]
impl DatagramSocket for ServerSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf).await {
            Ok(received) => Some(received),
            Err(e) => {
                debug!(error = %e, "socket read error");
                None
            }
        }
    }

    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        if let Err(e) = self.socket.send_to(buf, to).await {
            error!(%to, error = %e, "error sending datagram");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// Socket of the client role: connected to the server, so reads carry no sender address
/// and writes ignore the destination.
pub(crate) struct ClientSocket {
    socket: UdpSocket,
    server_addr: SocketAddr,
}

impl ClientSocket {
    pub fn new(socket: UdpSocket, server_addr: SocketAddr) -> ClientSocket {
        ClientSocket {
            socket,
            server_addr,
        }
    }
}

#[async_trait]
impl DatagramSocket for ClientSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv(buf).await {
            Ok(length) => Some((length, self.server_addr)),
            Err(e) => {
                debug!(error = %e, "socket read error");
                None
            }
        }
    }

    async fn send_datagram(&self, _to: SocketAddr, buf: &[u8]) {
        if let Err(e) = self.socket.send(buf).await {
            error!(error = %e, "error sending datagram");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectKind {
    /// requested by either peer
    Default,
    /// the whole dispatcher is going down
    Shutdown,
    /// keep-alive gave up on the peer
    Timeout,
}

/// The dispatcher: owns the socket, demultiplexes datagrams onto connections keyed by
/// the peer's address fingerprint, and orchestrates handshake and teardown. Both roles
/// (client and server) are configurations of this one core.
pub(crate) struct ProtocolCore {
    config: Arc<Config>,
    socket: Arc<dyn DatagramSocket>,
    events: Arc<dyn ProtocolEvents>,

    /// back-reference to the own Arc for handing owned handles to spawned tasks; set
    /// once at construction
    self_ref: RwLock<Weak<ProtocolCore>>,

    connections: RwLock<FxHashMap<u32, Arc<Connection>>>,
    connect_guard: ExecGuard,

    buffer_pool: BufferPool,
    connection_pool: ConnectionPool,

    stop: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    listener_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolCore {
    pub fn new(
        config: Arc<Config>,
        socket: Arc<dyn DatagramSocket>,
        events: Arc<dyn ProtocolEvents>,
    ) -> Arc<ProtocolCore> {
        let (stop, stop_rx) = watch::channel(false);

        let core = Arc::new(ProtocolCore {
            socket,
            events,
            self_ref: RwLock::new(Weak::new()),
            connections: RwLock::new(FxHashMap::default()),
            connect_guard: ExecGuard::new(),
            buffer_pool: BufferPool::new(config.mtu, config.buffer_pool_size),
            connection_pool: ConnectionPool::new(config.connection_pool_size),
            stop,
            stop_rx,
            listener_handles: Mutex::new(Vec::new()),
            config,
        });
        *core.self_ref.write().unwrap() = Arc::downgrade(&core);

        core
    }

    /// An owned handle to this core. The core is only ever accessed through its Arc, so
    /// the upgrade cannot fail.
    fn arc(&self) -> Arc<ProtocolCore> {
        self.self_ref
            .read()
            .unwrap()
            .upgrade()
            .expect("core is always accessed through its Arc")
    }

    pub fn events(&self) -> Arc<dyn ProtocolEvents> {
        self.events.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn write_datagram(&self, to: SocketAddr, buf: &[u8]) {
        self.socket.send_datagram(to, buf).await;
        stats::add_send_bytes(buf.len() as u64);
    }

    /// Launches the listener workers.
    pub fn listen(&self) {
        let mut handles = self.listener_handles.lock().unwrap();

        for _ in 0..self.config.parallel_listener_count {
            let core = self.arc();
            let stop = self.stop_rx.clone();

            handles.push(tokio::spawn(async move {
                util::run_guarded("listener", || {
                    let core = core.clone();
                    let stop = stop.clone();
                    async move { core.listener_loop(stop).await }
                })
                .await;
            }));
        }
    }

    async fn listener_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let mut buffer = self.buffer_pool.get_from_pool();

            // the stop arm must not touch the buffer while the read future borrows it
            let received: Option<Option<(usize, SocketAddr)>> = select! {
                _ = stop.changed() => None,
                received = self.socket.recv_datagram(&mut buffer) => Some(received),
            };

            let Some(received) = received else {
                self.buffer_pool.return_to_pool(buffer);
                return;
            };

            let Some((length, addr)) = received else {
                self.buffer_pool.return_to_pool(buffer);
                if *stop.borrow() {
                    return;
                }
                continue;
            };

            let datagram = &buffer[..length.min(buffer.len())];

            if !packet::validate_header(datagram, self.config.protocol_id) {
                trace!(%addr, "dropping datagram with invalid header");
                self.buffer_pool.return_to_pool(buffer);
                continue;
            }

            let packet = datagram.to_vec();
            self.buffer_pool.return_to_pool(buffer);
            stats::add_received_bytes(packet.len() as u64);

            self.handle_packet(addr, packet).await;
        }
    }

    /// Routes one validated datagram: registry lookup (creating the connection for an
    /// accepted first connect), handshake completion, disconnect, or hand-off to the
    /// connection's receive queue.
    pub async fn handle_packet(&self, addr: SocketAddr, packet: Vec<u8>) {
        let fingerprint = util::addr_fingerprint(&addr);

        let existing = self.connections.read().unwrap().get(&fingerprint).cloned();

        let connection = match existing {
            Some(connection) => connection,
            None => {
                let descriptor = Descriptor::from_bits(packet[DESCRIPTOR_OFFSET]);
                if !descriptor.contains(Descriptor::CONNECT) {
                    trace!(%addr, "dropping packet from unknown sender");
                    return;
                }

                if !self.connect_guard.try_execute(fingerprint) {
                    trace!(%addr, "dropping concurrent connect attempt");
                    return;
                }

                let header = packet::header_size(&packet);
                if !self.events.on_validate(addr, &packet[header..]) {
                    debug!(%addr, "connect attempt rejected");
                    stats::inc_denied_connects();
                    return;
                }

                self.connect_client(addr, None)
            }
        };

        let descriptor = Descriptor::from_bits(packet[DESCRIPTOR_OFFSET]);

        // handled here (not in the connection) so the connect callback also fires on
        // the side that initiated the connection
        if descriptor.contains(Descriptor::CONNECT) {
            if connection.update_state(ConnectionState::Connected) {
                let header = packet::header_size(&packet);

                // the handshake is complete, pre-connect duplicates are superfluous
                if connection.is_server() {
                    connection.send_buffer.reset();
                    connection.send_queue.clear();
                }

                self.events
                    .on_connect(connection.clone(), &packet[header..])
                    .await;
                self.connect_guard.finish(fingerprint);
            }
            return;
        }

        if descriptor.contains(Descriptor::DISCONNECT) {
            let header = packet::header_size(&packet);
            self.disconnect_client(&connection, DisconnectKind::Default, &packet[header..])
                .await;
            return;
        }

        stats::add_processed_bytes(packet.len() as u64);
        connection.receive_queue.push(packet);
    }

    /// Creates a connection record for the peer, registers it, sends the initial
    /// connect packet and starts the worker tasks.
    pub fn connect_client(&self, addr: SocketAddr, payload: Option<&[u8]>) -> Arc<Connection> {
        stats::inc_connects();
        debug!(%addr, "connecting");

        let fingerprint = util::addr_fingerprint(&addr);

        let connection = self.connection_pool.get_from_pool(&self.config);
        connection.init(&self.arc(), addr);

        self.connections
            .write()
            .unwrap()
            .insert(fingerprint, connection.clone());

        connection.send_high_level_packet(
            Descriptor::RELIABLE | Descriptor::CONNECT,
            payload.map(<[u8]>::to_vec).unwrap_or_default(),
        );

        connection.start_workers(&self.arc());

        connection
    }

    /// Tears a connection down: flags it disconnected (idempotently), floods the
    /// disconnect packet, drains, joins the workers, deregisters, notifies and recycles
    /// the record.
    pub async fn disconnect_client(
        &self,
        connection: &Arc<Connection>,
        kind: DisconnectKind,
        payload: &[u8],
    ) {
        if !connection.update_state(ConnectionState::Disconnected) {
            return;
        }

        debug!(addr = %connection.addr(), ?kind, "disconnecting");

        if kind == DisconnectKind::Timeout {
            stats::inc_timeouts();
            self.events.on_timeout(connection.clone()).await;
        }

        stats::inc_disconnects();

        // flood the unreliable disconnect so it survives a lossy link
        for _ in 0..10 {
            connection.send_high_level_packet(Descriptor::DISCONNECT, payload.to_vec());
        }

        // let the send worker drain the queue into the socket
        time::sleep(Duration::from_millis(20)).await;

        connection.stop_workers().await;

        if kind != DisconnectKind::Shutdown {
            let fingerprint = util::addr_fingerprint(&connection.addr());
            self.connections.write().unwrap().remove(&fingerprint);

            self.events.on_disconnect(connection.clone(), payload).await;
        }

        connection.reset();
        self.connection_pool.return_to_pool(connection.clone());
    }

    /// Disconnects every client, stops the listeners and waits for them to finish.
    pub async fn destroy(&self) {
        info!("shutting down");

        let connections: Vec<_> = {
            let mut registry = self.connections.write().unwrap();
            registry.drain().map(|(_, connection)| connection).collect()
        };

        for connection in connections {
            self.disconnect_client(&connection, DisconnectKind::Shutdown, &[])
                .await;
        }

        let _ = self.stop.send(true);

        let handles: Vec<_> = self.listener_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
