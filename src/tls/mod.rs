//! TLS 1.3 handshake oracle interface for QUIC.
//!
//! QUIC uses TLS 1.3 differently from TCP:
//! - No TLS record layer: QUIC carries raw handshake messages in CRYPTO frames
//! - No TLS content encryption: QUIC does its own packet protection
//! - QUIC transport parameters are exchanged as a TLS extension
//!
//! The handshake engine itself (certificates, cipher negotiation, tickets)
//! lives outside this crate behind [`TlsSession`]. The connection feeds it
//! CRYPTO bytes, sends whatever it produces at the level it names, and
//! installs packet keys from the secrets it exports.

pub mod transport_params;

pub use transport_params::TransportParams;

use crate::crypto::{CipherSuite, Level, Secret};

/// Traffic secrets for one encryption level.
#[derive(Debug, Clone)]
pub struct LevelSecrets {
    pub suite: CipherSuite,
    /// Secret protecting what we send.
    pub local: Secret,
    /// Secret protecting what the server sends. Ignored for 0-RTT, which
    /// is client-to-server only.
    pub remote: Secret,
}

/// Where the handshake stands after processing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the server's first flight.
    Started,
    /// Handshake secrets are available.
    HandshakeKeys,
    /// Our Finished is written; 1-RTT secrets are available.
    Complete,
}

/// Handshake bytes to send, tagged with the level that must carry them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutput {
    pub messages: Vec<(Level, Vec<u8>)>,
}

impl HandshakeOutput {
    pub fn push(&mut self, level: Level, data: Vec<u8>) {
        if !data.is_empty() {
            self.messages.push((level, data));
        }
    }
}

/// A TLS failure. `alert` becomes the CRYPTO_ERROR code `0x100 + alert`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tls alert {alert}: {reason}")]
pub struct TlsError {
    pub alert: u8,
    pub reason: String,
}

impl TlsError {
    pub fn new(alert: u8, reason: impl Into<String>) -> Self {
        Self {
            alert,
            reason: reason.into(),
        }
    }
}

/// What the client asks of the handshake.
#[derive(Debug, Clone)]
pub struct ClientHelloParams<'a> {
    pub server_name: &'a str,
    pub alpn_protocols: &'a [Vec<u8>],
    pub verify_peer: bool,
    /// Offer early data if a session ticket allows it.
    pub enable_early_data: bool,
    /// Encoded quic_transport_parameters extension body.
    pub transport_params: &'a [u8],
}

/// The TLS session interface used by QUIC.
pub trait TlsSession: Send {
    /// Produce the ClientHello.
    fn start_handshake(&mut self, params: &ClientHelloParams<'_>) -> Result<Vec<u8>, TlsError>;

    /// Process CRYPTO bytes received at `level`, in order. Returns the
    /// handshake bytes to send in response and the new state.
    fn process_handshake_data(
        &mut self,
        level: Level,
        data: &[u8],
    ) -> Result<(HandshakeOutput, HandshakeState), TlsError>;

    /// Secrets for `level`, once the handshake has derived them.
    fn export_level_secret(&mut self, level: Level) -> Option<LevelSecrets>;

    /// ALPN protocol chosen by the server (e.g. `b"h3"`).
    fn negotiated_alpn(&self) -> Option<&[u8]>;

    fn is_handshake_complete(&self) -> bool;

    /// Server's quic_transport_parameters extension body.
    fn peer_transport_params(&self) -> Option<&[u8]>;

    /// Transport parameters remembered with the session ticket used for
    /// this handshake. `Some` means 0-RTT keys can be exported right after
    /// [`start_handshake`](Self::start_handshake).
    fn resumed_transport_params(&self) -> Option<&[u8]>;

    /// Whether the server accepted early data; `None` until known.
    fn early_data_accepted(&self) -> Option<bool>;
}
