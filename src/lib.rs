//! QUIC v1 client transport core.
//!
//! The layers, bottom up: [`varint`] and [`crypto`] (key schedule, AEAD,
//! header protection), [`packet`] and [`frame`] codecs, [`transport`]
//! machinery (packet number spaces, streams, flow and congestion control,
//! loss recovery), the [`tls`] handshake oracle interface, the sans-IO
//! [`Connection`] state machine and the tokio [`Client`] driver on top.

#![forbid(unsafe_code)]

pub mod error;
pub mod varint;

pub mod config;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod tls;
pub mod transport;

pub mod client;
pub mod connection;

pub use client::Client;
pub use config::Config;
pub use connection::{Connection, ConnectionStats, Event, State};
pub use error::{ConnectionError, Error, ErrorKind, Result, TransportError};
pub use packet::ConnectionId;
pub use tls::{TlsSession, TransportParams};
pub use transport::stream::Dir;
pub use transport::{DatagramTransport, Instant, UdpTransport};
