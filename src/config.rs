//! Client configuration.

use std::time::Duration;

use crate::tls::transport_params::TransportParams;

/// Connection settings chosen by the caller.
///
/// All fields are public; the `with_*` methods exist for chaining.
#[derive(Debug, Clone)]
pub struct Config {
    /// Receive window advertised for every stream.
    pub initial_max_stream_data: u64,
    /// Connection-wide receive window.
    pub initial_max_data: u64,
    /// Peer-initiated bidirectional streams we allow concurrently.
    pub max_concurrent_bidi_streams: u64,
    /// Peer-initiated unidirectional streams we allow concurrently.
    pub max_concurrent_uni_streams: u64,
    pub idle_timeout: Duration,
    /// Connect fails with a retryable error if the handshake has not
    /// completed within this time.
    pub handshake_timeout: Duration,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Forwarded to the TLS oracle; the transport never looks at certificates.
    pub verify_peer: bool,
    pub enable_early_data: bool,
    pub enable_pacing: bool,
    pub max_datagram_size: usize,
    pub initial_rtt: Duration,
    pub active_connection_id_limit: u64,
    /// Length of the source connection IDs we choose.
    pub local_cid_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_max_stream_data: 1024 * 1024,
            initial_max_data: 10 * 1024 * 1024,
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            alpn_protocols: vec![b"h3".to_vec()],
            verify_peer: true,
            enable_early_data: false,
            enable_pacing: true,
            max_datagram_size: 1200,
            initial_rtt: Duration::from_millis(333),
            active_connection_id_limit: 4,
            local_cid_len: 8,
        }
    }
}

impl Config {
    pub fn with_stream_window(mut self, window: u64) -> Self {
        self.initial_max_stream_data = window;
        self
    }

    pub fn with_connection_window(mut self, window: u64) -> Self {
        self.initial_max_data = window;
        self
    }

    pub fn with_max_concurrent_streams(mut self, bidi: u64, uni: u64) -> Self {
        self.max_concurrent_bidi_streams = bidi;
        self.max_concurrent_uni_streams = uni;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ack_delay(mut self, exponent: u8, max_ack_delay: Duration) -> Self {
        self.ack_delay_exponent = exponent;
        self.max_ack_delay = max_ack_delay;
        self
    }

    pub fn with_alpns<I, S>(mut self, alpns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        self.alpn_protocols = alpns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn with_early_data(mut self, enabled: bool) -> Self {
        self.enable_early_data = enabled;
        self
    }

    pub fn with_pacing(mut self, enabled: bool) -> Self {
        self.enable_pacing = enabled;
        self
    }

    /// Transport parameters advertised to the server.
    ///
    /// `initial_source_connection_id` is filled in by the connection.
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            max_idle_timeout: self.idle_timeout.as_millis() as u64,
            max_udp_payload_size: 65527,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data,
            initial_max_stream_data_uni: self.initial_max_stream_data,
            initial_max_streams_bidi: self.max_concurrent_bidi_streams,
            initial_max_streams_uni: self.max_concurrent_uni_streams,
            ack_delay_exponent: u64::from(self.ack_delay_exponent),
            max_ack_delay: self.max_ack_delay.as_millis() as u64,
            active_connection_id_limit: self.active_connection_id_limit,
            ..TransportParams::default()
        }
    }
}
