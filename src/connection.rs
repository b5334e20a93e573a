use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use crate::chain::OrderedChain;
use crate::config::Config;
use crate::congestion::CongestionHandler;
use crate::drop_channel::DropChannel;
use crate::endpoint::{DisconnectKind, ProtocolCore};
use crate::packet::{Descriptor, Packet};
use crate::send_buffer::{SendBuffer, SendBufferOp};
use crate::sequence_buffer::SequenceBuffer;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The delivery mode selected at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// fast delivery, no guarantee on arrival or order
    Unreliable,
    /// like [`Channel::Unreliable`], but stragglers older than the newest accepted
    /// packet are dropped
    UnreliableOrdered,
    /// arrival guaranteed, order not
    Reliable,
    /// arrival and order guaranteed
    ReliableOrdered,
}

fn channel_of(descriptor: Descriptor) -> Channel {
    match (
        descriptor.contains(Descriptor::RELIABLE),
        descriptor.contains(Descriptor::ORDERED),
    ) {
        (true, true) => Channel::ReliableOrdered,
        (true, false) => Channel::Reliable,
        (false, true) => Channel::UnreliableOrdered,
        (false, false) => Channel::Unreliable,
    }
}

/// sequence assignment state of the outbound direction, owned by the send worker
#[derive(Default)]
struct OutboundSequences {
    local_sequence: u16,
    ordered_sequence: u8,
    local_unreliable_sequence: u16,
}

/// acknowledgement state of the inbound direction, owned by the receive worker and read
/// by the send worker when stamping acks
#[derive(Default)]
struct InboundSequences {
    remote_sequence: u16,
    ack_bits: u32,
    remote_unreliable_sequence: u16,
}

/// The per-peer state machine. A connection is created by the dispatcher (drawn from its
/// pool), runs three worker tasks while alive, and is reset and returned to the pool
/// after teardown.
pub struct Connection {
    config: Arc<Config>,
    core: RwLock<Weak<ProtocolCore>>,

    /// back-reference to the own Arc, so worker tasks and callbacks can be handed an
    /// owned handle; set once when the record is first allocated
    self_ref: RwLock<Weak<Connection>>,

    state: RwLock<ConnectionState>,
    addr: RwLock<SocketAddr>,
    is_server: AtomicBool,

    outbound: Mutex<OutboundSequences>,
    inbound: Mutex<InboundSequences>,

    ordered_chain: OrderedChain,
    pub(crate) send_buffer: SendBuffer,
    receive_buffer: SequenceBuffer,
    congestion: CongestionHandler,

    last_ack_send_time: AtomicI64,
    last_resend_time: AtomicI64,
    last_received_time: AtomicI64,
    last_chain_time: AtomicI64,
    ping_tick: AtomicU8,

    pub(crate) send_queue: DropChannel<Packet>,
    pub(crate) receive_queue: DropChannel<Vec<u8>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,

    values: RwLock<FxHashMap<u8, Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    pub(crate) fn new_arc(config: Arc<Config>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(config));
        *connection.self_ref.write().unwrap() = Arc::downgrade(&connection);
        connection
    }

    fn new(config: Arc<Config>) -> Connection {
        Connection {
            core: RwLock::new(Weak::new()),
            self_ref: RwLock::new(Weak::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            addr: RwLock::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            is_server: AtomicBool::new(false),
            outbound: Mutex::new(OutboundSequences::default()),
            inbound: Mutex::new(InboundSequences::default()),
            ordered_chain: OrderedChain::new(config.max_packet_chain_length),
            send_buffer: SendBuffer::new(),
            receive_buffer: SequenceBuffer::new(config.sequence_buffer_size),
            congestion: CongestionHandler::new(config.clone()),
            last_ack_send_time: AtomicI64::new(0),
            last_resend_time: AtomicI64::new(0),
            last_received_time: AtomicI64::new(0),
            last_chain_time: AtomicI64::new(0),
            ping_tick: AtomicU8::new(0),
            send_queue: DropChannel::new(config.max_send_receive_queue_size),
            receive_queue: DropChannel::new(config.max_send_receive_queue_size),
            stop: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            values: RwLock::new(FxHashMap::default()),
            config,
        }
    }

    pub(crate) fn init(&self, core: &Arc<ProtocolCore>, addr: SocketAddr) {
        *self.core.write().unwrap() = Arc::downgrade(core);
        *self.addr.write().unwrap() = addr;
        *self.state.write().unwrap() = ConnectionState::Connecting;

        let now = util::now_millis();
        self.last_ack_send_time.store(now, Relaxed);
        self.last_resend_time.store(now, Relaxed);
        self.last_received_time.store(now, Relaxed);
    }

    /// Returns the record to its pristine state so the pool can hand it out again.
    pub(crate) fn reset(&self) {
        *self.core.write().unwrap() = Weak::new();
        *self.state.write().unwrap() = ConnectionState::Disconnected;
        *self.addr.write().unwrap() = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        self.is_server.store(false, Relaxed);

        *self.outbound.lock().unwrap() = OutboundSequences::default();
        *self.inbound.lock().unwrap() = InboundSequences::default();

        self.ordered_chain.reset();
        self.send_buffer.reset();
        self.receive_buffer.reset();
        self.congestion.reset();

        self.last_ack_send_time.store(0, Relaxed);
        self.last_resend_time.store(0, Relaxed);
        self.last_received_time.store(0, Relaxed);
        self.last_chain_time.store(0, Relaxed);
        self.ping_tick.store(0, Relaxed);

        self.send_queue.clear();
        self.receive_queue.clear();

        self.values.write().unwrap().clear();
    }

    // ---- state ----------------------------------------------------------------------

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// Transitions to the target state. Returns `true` only for the first successful
    /// transition, which makes connect and disconnect idempotent.
    pub(crate) fn update_state(&self, state: ConnectionState) -> bool {
        let mut current = self.state.write().unwrap();
        if *current != state {
            *current = state;
            true
        }
        else {
            false
        }
    }

    /// The peer's address.
    pub fn addr(&self) -> SocketAddr {
        *self.addr.read().unwrap()
    }

    /// `true` on the client role's connection to the server.
    pub fn is_server(&self) -> bool {
        self.is_server.load(Relaxed)
    }

    pub(crate) fn set_is_server(&self, is_server: bool) {
        self.is_server.store(is_server, Relaxed);
    }

    /// Estimated one-way latency to the peer in milliseconds.
    pub fn ping(&self) -> i16 {
        self.congestion.ping()
    }

    /// An owned handle to this connection. The record is only ever reachable through
    /// its Arc, so the upgrade cannot fail.
    fn arc(&self) -> Arc<Connection> {
        self.self_ref
            .read()
            .unwrap()
            .upgrade()
            .expect("connection is always accessed through its Arc")
    }

    /// Initiates a graceful disconnect carrying `payload`. Returns immediately; the
    /// teardown (including the disconnect callback) runs on its own task.
    pub fn disconnect(&self, payload: Vec<u8>) {
        let Some(core) = self.core.read().unwrap().upgrade() else {
            return;
        };

        let connection = self.arc();
        tokio::spawn(async move {
            core.disconnect_client(&connection, DisconnectKind::Default, &payload)
                .await;
        });
    }

    // ---- worker tasks ---------------------------------------------------------------

    pub(crate) fn start_workers(&self, core: &Arc<ProtocolCore>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop.lock().unwrap() = Some(stop_tx);

        let mut handles = self.worker_handles.lock().unwrap();

        {
            let connection = self.arc();
            let core = core.clone();
            let stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                util::run_guarded("connection-send", || {
                    let connection = connection.clone();
                    let core = core.clone();
                    let stop = stop.clone();
                    async move { connection.send_loop(core, stop).await }
                })
                .await;
            }));
        }

        {
            let connection = self.arc();
            let core = core.clone();
            let stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                util::run_guarded("connection-receive", || {
                    let connection = connection.clone();
                    let core = core.clone();
                    let stop = stop.clone();
                    async move { connection.receive_loop(core, stop).await }
                })
                .await;
            }));
        }

        {
            let connection = self.arc();
            let core = core.clone();
            let stop = stop_rx;
            handles.push(tokio::spawn(async move {
                util::run_guarded("connection-keepalive", || {
                    let connection = connection.clone();
                    let core = core.clone();
                    let stop = stop.clone();
                    async move { connection.keepalive_loop(core, stop).await }
                })
                .await;
            }));
        }
    }

    /// Signals all workers to stop and waits for them to finish.
    pub(crate) async fn stop_workers(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(true);
        }

        let handles: Vec<_> = self.worker_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn send_loop(
        self: Arc<Self>,
        core: Arc<ProtocolCore>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            select! {
                _ = stop.changed() => return,
                _ = time::sleep(self.config.update_loop_timeout) => {}
                packet = self.send_queue.pop() => {
                    self.process_send(&core, packet, false).await;
                }
            }

            let now = util::now_millis();

            if now - self.last_resend_time.load(Relaxed) > self.congestion.resend_timeout() {
                self.last_resend_time.store(now, Relaxed);
                self.resend_sweep(&core, now).await;
            }

            if self.state() != ConnectionState::Connected {
                continue;
            }

            if now - self.last_chain_time.load(Relaxed)
                > self.config.chain_skip_timeout.as_millis() as i64
            {
                self.ordered_chain.skip();
                self.deliver_chained(&core).await;
            }

            if now - self.last_ack_send_time.load(Relaxed) > self.congestion.reack_timeout() {
                self.send_ack_packet();

                // refresh the RTT estimate even when the application is silent
                if self.ping_tick.load(Relaxed) % self.config.auto_ping_interval == 0 {
                    self.send_low_level_packet(Descriptor::RELIABLE | Descriptor::ACK);
                    self.ping_tick.store(0, Relaxed);
                }

                self.ping_tick.fetch_add(1, Relaxed);
            }
        }
    }

    /// Resends the oldest unacknowledged packets, bounded by the congestion handler's
    /// budget; packets unacknowledged for longer than the removal timeout are abandoned.
    async fn resend_sweep(&self, core: &ProtocolCore, now: i64) {
        let max_resends = self.congestion.max_packet_resends();
        let remove_timeout = self.config.send_remove_timeout.as_millis() as i64;

        let mut to_resend = Vec::new();
        self.send_buffer.iterate(|index, sent| {
            if index as i64 >= max_resends {
                return SendBufferOp::Cancel;
            }

            if now - sent.send_time > remove_timeout {
                debug!(sequence = sent.packet.sequence, "abandoning unacknowledged packet");
                return SendBufferOp::Delete;
            }

            to_resend.push(sent.packet.clone());
            SendBufferOp::Continue
        });

        for packet in to_resend {
            trace!(sequence = packet.sequence, "resending packet");
            self.process_send(core, packet, true).await;
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        core: Arc<ProtocolCore>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            select! {
                _ = stop.changed() => return,
                buffer = self.receive_queue.pop() => {
                    self.process_receive(&core, buffer).await;
                }
            }
        }
    }

    async fn keepalive_loop(
        self: Arc<Self>,
        core: Arc<ProtocolCore>,
        mut stop: watch::Receiver<bool>,
    ) {
        let interval = self.config.timeout_threshold / 2;

        loop {
            select! {
                _ = stop.changed() => return,
                _ = time::sleep(interval) => {}
            }

            if self.state() == ConnectionState::Disconnected {
                continue;
            }

            let now = util::now_millis();
            let silent = now - self.last_received_time.load(Relaxed)
                > self.config.timeout_threshold.as_millis() as i64;

            if silent || self.ping() > self.config.max_ping {
                // teardown joins this worker, so it must run on its own task
                let core = core.clone();
                let connection = self.clone();
                tokio::spawn(async move {
                    core.disconnect_client(&connection, DisconnectKind::Timeout, &[])
                        .await;
                });
            }
        }
    }

    // ---- outbound path --------------------------------------------------------------

    pub(crate) async fn process_send(&self, core: &ProtocolCore, mut packet: Packet, resend: bool) {
        if !packet.descriptor.contains(Descriptor::RELIABLE)
            && self.congestion.should_drop_unreliable()
        {
            return;
        }

        packet.protocol_id = self.config.protocol_id;

        if !resend {
            if packet.descriptor.contains(Descriptor::RELIABLE) {
                {
                    let mut outbound = self.outbound.lock().unwrap();
                    packet.sequence = outbound.local_sequence;
                    outbound.local_sequence = outbound.local_sequence.wrapping_add(1);

                    if packet.descriptor.contains(Descriptor::ORDERED) {
                        packet.order = outbound.ordered_sequence;
                        outbound.ordered_sequence = outbound.ordered_sequence.wrapping_add(1);
                    }
                }

                // round trips of handshake-era packets must not pollute the RTT estimate
                let no_rtt = self.state() != ConnectionState::Connected;
                self.send_buffer.add(packet.clone(), no_rtt);
            }
            else if packet.descriptor.contains(Descriptor::ORDERED) {
                let mut outbound = self.outbound.lock().unwrap();
                packet.sequence = outbound.local_unreliable_sequence;
                outbound.local_unreliable_sequence =
                    outbound.local_unreliable_sequence.wrapping_add(1);
            }
        }

        if packet.descriptor.contains(Descriptor::ACK) {
            self.last_ack_send_time.store(util::now_millis(), Relaxed);

            let inbound = self.inbound.lock().unwrap();
            packet.ack = inbound.remote_sequence;
            packet.ack_bits = inbound.ack_bits;
        }

        packet.calculate_hash();
        let mut buf = BytesMut::with_capacity(packet.serialized_len());
        packet.ser(&mut buf);

        core.write_datagram(self.addr(), &buf).await;
    }

    pub(crate) fn send_packet(&self, packet: Packet) {
        self.send_queue.push(packet);
    }

    fn send_low_level_packet(&self, descriptor: Descriptor) {
        self.send_packet(Packet::new(descriptor, Vec::new()));
    }

    pub(crate) fn send_high_level_packet(&self, descriptor: Descriptor, payload: Vec<u8>) {
        self.send_packet(Packet::new(descriptor, payload));
    }

    fn send_ack_packet(&self) {
        self.send_low_level_packet(Descriptor::ACK);
    }

    /// Sends on [`Channel::Unreliable`].
    pub fn send_unreliable(&self, payload: &[u8]) {
        self.send_high_level_packet(Descriptor::default(), payload.to_vec());
    }

    /// Sends on [`Channel::UnreliableOrdered`].
    pub fn send_unreliable_ordered(&self, payload: &[u8]) {
        self.send_high_level_packet(Descriptor::ORDERED, payload.to_vec());
    }

    /// Sends on [`Channel::Reliable`].
    pub fn send_reliable(&self, payload: &[u8]) {
        self.send_high_level_packet(Descriptor::RELIABLE | Descriptor::ACK, payload.to_vec());
    }

    /// Sends on [`Channel::ReliableOrdered`].
    pub fn send_reliable_ordered(&self, payload: &[u8]) {
        self.send_high_level_packet(
            Descriptor::RELIABLE | Descriptor::ACK | Descriptor::ORDERED,
            payload.to_vec(),
        );
    }

    /// Sends on the given channel.
    pub fn send_on_channel(&self, channel: Channel, payload: &[u8]) {
        match channel {
            Channel::Unreliable => self.send_unreliable(payload),
            Channel::UnreliableOrdered => self.send_unreliable_ordered(payload),
            Channel::Reliable => self.send_reliable(payload),
            Channel::ReliableOrdered => self.send_reliable_ordered(payload),
        }
    }

    // ---- inbound path ---------------------------------------------------------------

    pub(crate) async fn process_receive(&self, core: &Arc<ProtocolCore>, buffer: Vec<u8>) {
        self.last_received_time.store(util::now_millis(), Relaxed);

        let mut b: &[u8] = &buffer;
        let packet = match Packet::deser(&mut b) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "dropping undecodable packet");
                return;
            }
        };

        if packet.descriptor.contains(Descriptor::RELIABLE) && !self.handle_reliable_packet(&packet)
        {
            return;
        }

        if packet.descriptor.contains(Descriptor::ACK) {
            self.handle_ack_packet(&packet);
        }

        if packet.descriptor.contains(Descriptor::ORDERED) {
            if packet.descriptor.contains(Descriptor::RELIABLE) {
                self.ordered_chain.chain(packet);
                self.deliver_chained(core).await;
                return;
            }

            if !self.accept_unreliable_ordered(&packet) {
                return;
            }
        }

        let channel = channel_of(packet.descriptor);
        self.dispatch(core, &packet, channel).await;
    }

    /// Duplicate-suppresses the packet, advances the highest-seen remote sequence and
    /// rebuilds the ack bitfield over its 32 predecessors. Returns `false` for
    /// duplicates.
    fn handle_reliable_packet(&self, packet: &Packet) -> bool {
        if self.receive_buffer.get(packet.sequence) {
            trace!(sequence = packet.sequence, "duplicate reliable packet");
            return false;
        }

        self.receive_buffer.set(packet.sequence, true);

        {
            let mut inbound = self.inbound.lock().unwrap();

            if util::greater_than_sequence(packet.sequence, inbound.remote_sequence)
                && util::difference_sequence(packet.sequence, inbound.remote_sequence)
                    <= self.config.max_skipped_packets
            {
                inbound.remote_sequence = packet.sequence;
            }

            inbound.ack_bits = 0;
            for i in 1..=32u16 {
                if self
                    .receive_buffer
                    .get(inbound.remote_sequence.wrapping_sub(i))
                {
                    inbound.ack_bits |= 1 << (i - 1);
                }
            }
        }

        self.send_ack_packet();

        true
    }

    /// Retrieves every acknowledged sequence (the base plus each set bit) from the send
    /// buffer; retrieval is what stops further resends. Round trips of packets sent
    /// after the handshake feed the congestion handler.
    fn handle_ack_packet(&self, packet: &Packet) {
        for i in 0..=32u16 {
            if i == 0 || packet.ack_bits & (1 << (i - 1)) != 0 {
                let sequence = packet.ack.wrapping_sub(i);

                if let Some(sent) = self.send_buffer.retrieve(sequence) {
                    if !sent.no_rtt {
                        self.congestion.check(sent.send_time);
                    }
                }
            }
        }
    }

    fn accept_unreliable_ordered(&self, packet: &Packet) -> bool {
        let mut inbound = self.inbound.lock().unwrap();

        if util::greater_than_sequence(packet.sequence, inbound.remote_unreliable_sequence) {
            inbound.remote_unreliable_sequence = packet.sequence;
            true
        }
        else {
            false
        }
    }

    /// Delivers the now-consecutive prefix of the ordered chain, in order.
    async fn deliver_chained(&self, core: &Arc<ProtocolCore>) {
        self.last_chain_time.store(util::now_millis(), Relaxed);

        for packet in self.ordered_chain.pop_consecutive() {
            self.dispatch(core, &packet, Channel::ReliableOrdered).await;
        }
    }

    async fn dispatch(&self, core: &Arc<ProtocolCore>, packet: &Packet, channel: Channel) {
        if !packet.payload.is_empty() {
            core.events()
                .on_packet(self.arc(), &packet.payload, channel)
                .await;
        }
    }

    // ---- user values ----------------------------------------------------------------

    /// Stores a value under the given key, replacing any previous one.
    pub fn set_value(&self, key: u8, value: Arc<dyn Any + Send + Sync>) {
        self.values.write().unwrap().insert(key, value);
    }

    /// Stores a value only if the key is vacant; reports whether it was stored.
    pub fn try_set_value(&self, key: u8, value: Arc<dyn Any + Send + Sync>) -> bool {
        let mut values = self.values.write().unwrap();
        if values.contains_key(&key) {
            return false;
        }
        values.insert(key, value);
        true
    }

    /// Retrieves the value stored under the given key.
    pub fn value(&self, key: u8) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.read().unwrap().get(&key).cloned()
    }

    /// Retrieves the value stored under the given key, or the fallback.
    pub fn value_or(
        &self,
        key: u8,
        fallback: Arc<dyn Any + Send + Sync>,
    ) -> Arc<dyn Any + Send + Sync> {
        self.value(key).unwrap_or(fallback)
    }

    /// Removes the value stored under the given key.
    pub fn del_value(&self, key: u8) {
        self.values.write().unwrap().remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn remote_sequence(&self) -> u16 {
        self.inbound.lock().unwrap().remote_sequence
    }

    #[cfg(test)]
    pub(crate) fn ack_bits(&self) -> u32 {
        self.inbound.lock().unwrap().ack_bits
    }
}
