//! QUIC transport parameters (RFC 9000 §18).
//!
//! Encoded as a sequence of `(id: varint, length: varint, value)` entries.
//! Integer values are varints; connection IDs and tokens are raw bytes.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result, TransportError};
use crate::packet::ConnectionId;
use crate::varint::{read_varint, varint_len, write_varint};

const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const MAX_IDLE_TIMEOUT: u64 = 0x01;
const STATELESS_RESET_TOKEN: u64 = 0x02;
const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const INITIAL_MAX_DATA: u64 = 0x04;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ACK_DELAY_EXPONENT: u64 = 0x0a;
const MAX_ACK_DELAY: u64 = 0x0b;
const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PREFERRED_ADDRESS: u64 = 0x0d;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;

/// Transport parameters exchanged in the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Server only: DCID of the client's first Initial.
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds, 0 disables the idle timeout.
    pub max_idle_timeout: u64,
    /// Server only.
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    /// Server only, present iff the server sent a Retry.
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParams {
    /// RFC 9000 defaults for parameters that are absent on the wire.
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

fn put_int<B: BufMut>(buf: &mut B, id: u64, value: u64) {
    write_varint(buf, id);
    write_varint(buf, varint_len(value) as u64);
    write_varint(buf, value);
}

fn put_bytes<B: BufMut>(buf: &mut B, id: u64, value: &[u8]) {
    write_varint(buf, id);
    write_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

fn param_error() -> Error {
    Error::Transport(TransportError::TransportParameterError)
}

impl TransportParams {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        if let Some(cid) = &self.original_destination_connection_id {
            put_bytes(buf, ORIGINAL_DESTINATION_CONNECTION_ID, cid);
        }
        if self.max_idle_timeout != 0 {
            put_int(buf, MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_bytes(buf, STATELESS_RESET_TOKEN, token);
        }
        for (id, value) in [
            (MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size),
            (INITIAL_MAX_DATA, self.initial_max_data),
            (INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, self.initial_max_stream_data_bidi_local),
            (INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, self.initial_max_stream_data_bidi_remote),
            (INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni),
            (INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi),
            (INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni),
            (ACK_DELAY_EXPONENT, self.ack_delay_exponent),
            (MAX_ACK_DELAY, self.max_ack_delay),
            (ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit),
        ] {
            put_int(buf, id, value);
        }
        if self.disable_active_migration {
            write_varint(buf, DISABLE_ACTIVE_MIGRATION);
            write_varint(buf, 0);
        }
        if let Some(cid) = &self.initial_source_connection_id {
            put_bytes(buf, INITIAL_SOURCE_CONNECTION_ID, cid);
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_bytes(buf, RETRY_SOURCE_CONNECTION_ID, cid);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        self.encode(&mut out);
        out
    }

    /// Decode and validate a parameter block; violations map to
    /// TRANSPORT_PARAMETER_ERROR.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut params = Self::default();
        let mut seen: u32 = 0;

        while buf.has_remaining() {
            let id = read_varint(&mut buf).map_err(|_| param_error())?;
            let len = read_varint(&mut buf).map_err(|_| param_error())? as usize;
            if buf.len() < len {
                return Err(param_error());
            }
            let (mut value, rest) = buf.split_at(len);
            buf = rest;

            if id <= RETRY_SOURCE_CONNECTION_ID {
                let bit = 1u32 << id;
                if seen & bit != 0 {
                    return Err(param_error());
                }
                seen |= bit;
            }

            match id {
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(cid_param(value)?)
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(cid_param(value)?)
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(cid_param(value)?)
                }
                STATELESS_RESET_TOKEN => {
                    let token: [u8; 16] = value.try_into().map_err(|_| param_error())?;
                    params.stateless_reset_token = Some(token);
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(param_error());
                    }
                    params.disable_active_migration = true;
                }
                // Migration is not supported, so the server's preferred
                // address is ignored.
                PREFERRED_ADDRESS => {}
                MAX_IDLE_TIMEOUT..=ACTIVE_CONNECTION_ID_LIMIT => {
                    let v = read_varint(&mut value).map_err(|_| param_error())?;
                    if value.has_remaining() {
                        return Err(param_error());
                    }
                    match id {
                        MAX_IDLE_TIMEOUT => params.max_idle_timeout = v,
                        MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = v,
                        INITIAL_MAX_DATA => params.initial_max_data = v,
                        INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                            params.initial_max_stream_data_bidi_local = v
                        }
                        INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                            params.initial_max_stream_data_bidi_remote = v
                        }
                        INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = v,
                        INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = v,
                        INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = v,
                        ACK_DELAY_EXPONENT => params.ack_delay_exponent = v,
                        MAX_ACK_DELAY => params.max_ack_delay = v,
                        ACTIVE_CONNECTION_ID_LIMIT => params.active_connection_id_limit = v,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        let stream_limit = 1u64 << 60;
        if self.max_udp_payload_size < 1200
            || self.ack_delay_exponent > 20
            || self.max_ack_delay >= 1 << 14
            || self.active_connection_id_limit < 2
            || self.initial_max_streams_bidi > stream_limit
            || self.initial_max_streams_uni > stream_limit
        {
            return Err(param_error());
        }
        Ok(())
    }
}

fn cid_param(value: &[u8]) -> Result<ConnectionId> {
    ConnectionId::from_slice(value).ok_or_else(param_error)
}
