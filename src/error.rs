use std::fmt;

/// QUIC transport error codes (RFC 9000 §20.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(u64)]
pub enum TransportError {
    #[error("no error")]
    NoError = 0x00,
    #[error("internal error")]
    InternalError = 0x01,
    #[error("connection refused")]
    ConnectionRefused = 0x02,
    #[error("flow control error")]
    FlowControlError = 0x03,
    #[error("stream limit error")]
    StreamLimitError = 0x04,
    #[error("stream state error")]
    StreamStateError = 0x05,
    #[error("final size error")]
    FinalSizeError = 0x06,
    #[error("frame encoding error")]
    FrameEncodingError = 0x07,
    #[error("transport parameter error")]
    TransportParameterError = 0x08,
    #[error("connection id limit error")]
    ConnectionIdLimitError = 0x09,
    #[error("protocol violation")]
    ProtocolViolation = 0x0a,
    #[error("invalid token")]
    InvalidToken = 0x0b,
    #[error("application error")]
    ApplicationError = 0x0c,
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded = 0x0d,
    #[error("key update error")]
    KeyUpdateError = 0x0e,
    #[error("aead limit reached")]
    AeadLimitReached = 0x0f,
    #[error("no viable path")]
    NoViablePath = 0x10,
}

impl TransportError {
    /// Wire code of this error.
    pub const fn to_code(self) -> u64 {
        self as u64
    }

    /// `CRYPTO_ERROR` code for a TLS alert (0x0100 + alert).
    pub const fn crypto_error(alert: u8) -> u64 {
        0x0100 + alert as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x00 => Self::NoError,
            0x01 => Self::InternalError,
            0x02 => Self::ConnectionRefused,
            0x03 => Self::FlowControlError,
            0x04 => Self::StreamLimitError,
            0x05 => Self::StreamStateError,
            0x06 => Self::FinalSizeError,
            0x07 => Self::FrameEncodingError,
            0x08 => Self::TransportParameterError,
            0x09 => Self::ConnectionIdLimitError,
            0x0a => Self::ProtocolViolation,
            0x0b => Self::InvalidToken,
            0x0c => Self::ApplicationError,
            0x0d => Self::CryptoBufferExceeded,
            0x0e => Self::KeyUpdateError,
            0x0f => Self::AeadLimitReached,
            0x10 => Self::NoViablePath,
            _ => return None,
        })
    }
}

/// Errors returned by the crate's operations.
///
/// Packet-level variants (`UnexpectedEnd`, `Malformed`, `Decrypt`) never
/// leave the receive path: the offending packet is dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("packet authentication failed")]
    Decrypt,
    #[error("packet encryption failed")]
    Encrypt,
    #[error("hkdf output of {0} bytes exceeds 255 * hash length")]
    HkdfLength(usize),
    #[error("unsupported QUIC version {0:#010x}")]
    UnsupportedVersion(u32),
    #[error("invalid key material")]
    InvalidKey,
    #[error("tls: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation not allowed in connection state {0:?}")]
    InvalidState(crate::connection::State),
    #[error("stream limit reached")]
    StreamLimit,
    #[error("unknown stream {0}")]
    UnknownStream(u64),
    #[error("stream {0} is not writable")]
    NotWritable(u64),
    #[error("stream {0} is not readable")]
    NotReadable(u64),
    #[error("stream reset by peer with code {0}")]
    StreamReset(u64),
    #[error("stop sending requested by peer with code {0}")]
    Stopped(u64),
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] ConnectionError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification attached to every connection-level failure delivered
/// through the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable by the caller (e.g. the handshake timed out).
    Transient,
    /// One side violated the protocol.
    Protocol,
    /// Local failure that no retry will fix.
    Fatal,
    /// The application on either side closed the connection.
    Application,
    /// The idle timer fired.
    Timeout,
    /// Closed locally without error.
    Local,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Transport-level CONNECTION_CLOSE, sent or received.
    #[error("{} transport error {code:#x}: {reason}", side(.remote))]
    TransportClose {
        code: u64,
        frame_type: Option<u64>,
        reason: String,
        remote: bool,
    },
    /// Application CONNECTION_CLOSE (0x1d), sent or received.
    #[error("{} application close {code:#x}: {reason}", side(.remote))]
    ApplicationClose {
        code: u64,
        reason: String,
        remote: bool,
    },
    #[error("no mutually supported QUIC version (offered {0:x?})")]
    VersionMismatch(Vec<u32>),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("stateless reset")]
    StatelessReset,
    #[error("connection closed locally")]
    LocallyClosed,
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportClose { .. } => ErrorKind::Protocol,
            Self::ApplicationClose { .. } => ErrorKind::Application,
            Self::VersionMismatch(_) | Self::Crypto(_) => ErrorKind::Fatal,
            Self::HandshakeTimeout | Self::StatelessReset => ErrorKind::Transient,
            Self::IdleTimeout => ErrorKind::Timeout,
            Self::LocallyClosed => ErrorKind::Local,
        }
    }

    pub(crate) fn local_transport(error: TransportError, frame_type: Option<u64>, reason: &str) -> Self {
        Self::TransportClose {
            code: error.to_code(),
            frame_type,
            reason: reason.into(),
            remote: false,
        }
    }
}

fn side(remote: &bool) -> &'static str {
    if *remote {
        "peer"
    } else {
        "local"
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Protocol => "protocol",
            Self::Fatal => "fatal",
            Self::Application => "application",
            Self::Timeout => "timeout",
            Self::Local => "local",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_roundtrip() {
        for code in 0x00..=0x10 {
            let err = TransportError::from_code(code).unwrap();
            assert_eq!(err.to_code(), code);
        }
        assert_eq!(TransportError::from_code(0x11), None);
        assert_eq!(TransportError::crypto_error(0x28), 0x0128);
    }

    #[test]
    fn connection_error_kinds() {
        let err = ConnectionError::local_transport(
            TransportError::FrameEncodingError,
            Some(0x1f),
            "unknown frame",
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "local transport error 0x7: unknown frame"
        );
        assert_eq!(ConnectionError::IdleTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            ConnectionError::VersionMismatch(vec![0xff00_001d]).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn error_from_transport() {
        let err: Error = TransportError::FlowControlError.into();
        assert!(matches!(err, Error::Transport(TransportError::FlowControlError)));
        assert_eq!(err.to_string(), "flow control error");
    }
}
