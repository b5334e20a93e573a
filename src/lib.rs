//! A connection-oriented transport protocol on top of UDP, built for latency-sensitive
//! interactive applications (e.g. realtime games) where TCP's head-of-line blocking is
//! unacceptable.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data),
//!   each of which must fit into a single MTU-sized datagram
//! * Per message, the application picks one of four delivery channels:
//!   * *unreliable* - fire and forget
//!   * *unreliable ordered* - fire and forget, but stragglers older than the newest
//!     accepted message are dropped (useful when only the most recent state matters)
//!   * *reliable* - acknowledged and resent until acknowledged, arrival order unspecified
//!   * *reliable ordered* - acknowledged, resent, and delivered in send order
//! * Losing an old message must never delay fresh ones beyond the channel's own
//!   guarantee - there is no stream abstraction and no shared ordering across channels
//! * Connections are cheap: a server multiplexes all clients over one socket, keyed by
//!   the peer's address, with a pool of listener workers and pooled per-connection state
//! * The protocol adapts to congestion by observing the round-trip time of acknowledged
//!   packets and stretching its retransmission/ack timers (and shedding a fraction of
//!   unreliable traffic) while the link is bad
//! * Connections are established with a validated connect handshake and torn down by
//!   either side, by keep-alive timeout, or by shutting the endpoint down
//!
//! ## Wire format
//!
//! All multi-byte integers are little-endian:
//!
//! ```ascii
//! offset 0   1 byte   protocol id
//! offset 1   8 bytes  xxhash64 over the packet with these 8 bytes zeroed
//! offset 9   1 byte   descriptor flag bits:
//!                     bit0 reliable, bit1 ack, bit2 ordered, bit3 connect, bit4 disconnect
//! [if reliable OR ordered]   2 bytes  sequence (u16)
//! [if reliable AND ordered]  1 byte   order (u8)
//! [if ack]                   2 bytes  ack sequence (u16) + 4 bytes ack bitfield (u32)
//! [rest]                     payload
//! ```
//!
//! The ack bitfield acknowledges the 32 predecessors of the ack sequence, so a single
//! ack packet acknowledges up to 33 packets.
//!
//! ## Roles
//!
//! [`Server`] and [`Client`] are thin configurations of the same dispatcher core: the
//! server listens on an unconnected socket and manages one [`Connection`] per client,
//! the client drives a single connection over a connected socket. Applications observe
//! both through the [`ProtocolEvents`] hooks and send through [`Connection`].

mod buffer_pool;
mod callbacks;
mod chain;
mod client;
mod config;
mod congestion;
mod connection;
mod drop_channel;
mod endpoint;
mod exec_guard;
mod packet;
mod send_buffer;
mod sequence_buffer;
mod server;
pub mod stats;
mod util;

pub use callbacks::{NoEvents, ProtocolEvents};
pub use client::Client;
pub use config::Config;
pub use connection::{Channel, Connection};
pub use server::Server;
pub use stats::StatsSnapshot;
