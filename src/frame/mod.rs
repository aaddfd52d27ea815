//! QUIC frame codec (RFC 9000 sections 12.4, 19).
//!
//! Pure encode/decode, no I/O and no state machines. Frame data fields borrow
//! from the decrypted packet payload (zero-copy).

use std::ops::Range;

use bytes::BufMut;

use crate::crypto::Level;
use crate::error::{Error, Result, TransportError};
use crate::varint::{read_varint as read_raw_varint, varint_len, write_varint};

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

pub mod ty {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const NEW_TOKEN: u64 = 0x07;
    pub const STREAM: u64 = 0x08;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    pub const APPLICATION_CLOSE: u64 = 0x1d;
    pub const HANDSHAKE_DONE: u64 = 0x1e;
}

// ---------------------------------------------------------------------------
// Sub-structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame<'a> {
    pub largest_ack: u64,
    /// Raw ack delay; scale by the peer's ack_delay_exponent.
    pub ack_delay: u64,
    pub first_ack_range: u64,
    /// Raw (gap, range) varint pairs following the first range. Validated
    /// at decode time so [`AckFrame::ranges`] never underflows.
    pub ack_ranges: &'a [u8],
    pub ecn: Option<EcnCounts>,
}

impl<'a> AckFrame<'a> {
    /// Acknowledged packet numbers, largest range first, as half-open ranges.
    pub fn ranges(&self) -> AckRanges<'a> {
        AckRanges {
            raw: self.ack_ranges,
            next: self
                .largest_ack
                .checked_sub(self.first_ack_range)
                .map(|smallest| smallest..self.largest_ack + 1),
        }
    }
}

/// Iterator produced by [`AckFrame::ranges`].
pub struct AckRanges<'a> {
    raw: &'a [u8],
    next: Option<Range<u64>>,
}

impl Iterator for AckRanges<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let current = self.next.take()?;
        if !self.raw.is_empty() {
            let gap = read_raw_varint(&mut self.raw).ok()?;
            let len = read_raw_varint(&mut self.raw).ok()?;
            self.next = current
                .start
                .checked_sub(gap + 2)
                .and_then(|largest| largest.checked_sub(len).map(|smallest| smallest..largest + 1));
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ecn_ce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: u64,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: u64,
    pub error_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: u64,
    pub offset: u64,
    pub data: &'a [u8],
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: u64,
    pub max_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub bidirectional: bool,
    pub max_streams: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: u64,
    pub data_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame<'a> {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: &'a [u8],
    pub stateless_reset_token: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame<'a> {
    /// `true` for application close (0x1d), `false` for transport close (0x1c).
    pub is_application: bool,
    pub error_code: u64,
    /// Only meaningful for transport close (0x1c).
    pub frame_type: u64,
    pub reason: &'a [u8],
}

// ---------------------------------------------------------------------------
// Frame enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding,                                   // 0x00
    Ping,                                      // 0x01
    Ack(AckFrame<'a>),                         // 0x02-0x03
    ResetStream(ResetStreamFrame),             // 0x04
    StopSending(StopSendingFrame),             // 0x05
    Crypto(CryptoFrame<'a>),                   // 0x06
    NewToken(&'a [u8]),                        // 0x07
    Stream(StreamFrame<'a>),                   // 0x08-0x0f
    MaxData(u64),                              // 0x10
    MaxStreamData(MaxStreamDataFrame),         // 0x11
    MaxStreams(MaxStreamsFrame),               // 0x12-0x13
    DataBlocked(u64),                          // 0x14
    StreamDataBlocked(StreamDataBlockedFrame), // 0x15
    StreamsBlocked(MaxStreamsFrame),           // 0x16-0x17
    NewConnectionId(NewConnectionIdFrame<'a>), // 0x18
    RetireConnectionId(u64),                   // 0x19
    PathChallenge([u8; 8]),                    // 0x1a
    PathResponse([u8; 8]),                     // 0x1b
    ConnectionClose(ConnectionCloseFrame<'a>), // 0x1c-0x1d
    HandshakeDone,                             // 0x1e
}

impl Frame<'_> {
    /// Wire type, as reported in a CONNECTION_CLOSE frame_type field.
    pub fn ty(&self) -> u64 {
        match self {
            Self::Padding => ty::PADDING,
            Self::Ping => ty::PING,
            Self::Ack(ack) if ack.ecn.is_some() => ty::ACK_ECN,
            Self::Ack(_) => ty::ACK,
            Self::ResetStream(_) => ty::RESET_STREAM,
            Self::StopSending(_) => ty::STOP_SENDING,
            Self::Crypto(_) => ty::CRYPTO,
            Self::NewToken(_) => ty::NEW_TOKEN,
            Self::Stream(_) => ty::STREAM,
            Self::MaxData(_) => ty::MAX_DATA,
            Self::MaxStreamData(_) => ty::MAX_STREAM_DATA,
            Self::MaxStreams(f) if f.bidirectional => ty::MAX_STREAMS_BIDI,
            Self::MaxStreams(_) => ty::MAX_STREAMS_UNI,
            Self::DataBlocked(_) => ty::DATA_BLOCKED,
            Self::StreamDataBlocked(_) => ty::STREAM_DATA_BLOCKED,
            Self::StreamsBlocked(f) if f.bidirectional => ty::STREAMS_BLOCKED_BIDI,
            Self::StreamsBlocked(_) => ty::STREAMS_BLOCKED_UNI,
            Self::NewConnectionId(_) => ty::NEW_CONNECTION_ID,
            Self::RetireConnectionId(_) => ty::RETIRE_CONNECTION_ID,
            Self::PathChallenge(_) => ty::PATH_CHALLENGE,
            Self::PathResponse(_) => ty::PATH_RESPONSE,
            Self::ConnectionClose(f) if f.is_application => ty::APPLICATION_CLOSE,
            Self::ConnectionClose(_) => ty::CONNECTION_CLOSE,
            Self::HandshakeDone => ty::HANDSHAKE_DONE,
        }
    }

    /// Everything except ACK, PADDING and CONNECTION_CLOSE elicits an ACK.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::Padding | Self::Ack(_) | Self::ConnectionClose(_))
    }

    /// Whether this frame may appear in a packet of `level` (RFC 9000 §12.4).
    pub fn allowed_at(&self, level: Level) -> bool {
        match level {
            Level::Initial | Level::Handshake => matches!(
                self,
                Self::Padding
                    | Self::Ping
                    | Self::Ack(_)
                    | Self::Crypto(_)
                    | Self::ConnectionClose(ConnectionCloseFrame {
                        is_application: false,
                        ..
                    })
            ),
            Level::ZeroRtt => !matches!(
                self,
                Self::Ack(_)
                    | Self::Crypto(_)
                    | Self::NewToken(_)
                    | Self::PathResponse(_)
                    | Self::RetireConnectionId(_)
                    | Self::HandshakeDone
            ),
            Level::OneRtt => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Frame-encoding error for malformed wire data.
fn frame_encoding_error() -> Error {
    Error::Transport(TransportError::FrameEncodingError)
}

fn read_varint(cur: &mut &[u8]) -> Result<u64> {
    read_raw_varint(cur).map_err(|_| frame_encoding_error())
}

fn read_bytes<'a>(cur: &mut &'a [u8], len: u64) -> Result<&'a [u8]> {
    let len = usize::try_from(len).map_err(|_| frame_encoding_error())?;
    if cur.len() < len {
        return Err(frame_encoding_error());
    }
    let (bytes, rest) = cur.split_at(len);
    *cur = rest;
    Ok(bytes)
}

fn read_array<const N: usize>(cur: &mut &[u8]) -> Result<[u8; N]> {
    let bytes = read_bytes(cur, N as u64)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one QUIC frame from `buf`.
///
/// Returns the decoded frame and the number of bytes consumed. Unknown frame
/// types and truncated fields are FRAME_ENCODING_ERROR.
pub fn decode(buf: &[u8]) -> Result<(Frame<'_>, usize)> {
    let mut cur = buf;
    let frame_type = read_varint(&mut cur)?;

    let frame = match frame_type {
        ty::PADDING => Frame::Padding,

        ty::PING => Frame::Ping,

        ty::ACK | ty::ACK_ECN => {
            let largest_ack = read_varint(&mut cur)?;
            let ack_delay = read_varint(&mut cur)?;
            let range_count = read_varint(&mut cur)?;
            let first_ack_range = read_varint(&mut cur)?;
            let mut smallest = largest_ack
                .checked_sub(first_ack_range)
                .ok_or_else(frame_encoding_error)?;

            let ranges_start = cur;
            for _ in 0..range_count {
                let gap = read_varint(&mut cur)?;
                let len = read_varint(&mut cur)?;
                smallest = smallest
                    .checked_sub(gap + 2)
                    .and_then(|largest| largest.checked_sub(len))
                    .ok_or_else(frame_encoding_error)?;
            }
            let ack_ranges = &ranges_start[..ranges_start.len() - cur.len()];

            let ecn = if frame_type == ty::ACK_ECN {
                Some(EcnCounts {
                    ect0: read_varint(&mut cur)?,
                    ect1: read_varint(&mut cur)?,
                    ecn_ce: read_varint(&mut cur)?,
                })
            } else {
                None
            };

            Frame::Ack(AckFrame {
                largest_ack,
                ack_delay,
                first_ack_range,
                ack_ranges,
                ecn,
            })
        }

        ty::RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
            stream_id: read_varint(&mut cur)?,
            error_code: read_varint(&mut cur)?,
            final_size: read_varint(&mut cur)?,
        }),

        ty::STOP_SENDING => Frame::StopSending(StopSendingFrame {
            stream_id: read_varint(&mut cur)?,
            error_code: read_varint(&mut cur)?,
        }),

        ty::CRYPTO => {
            let offset = read_varint(&mut cur)?;
            let length = read_varint(&mut cur)?;
            let data = read_bytes(&mut cur, length)?;
            Frame::Crypto(CryptoFrame { offset, data })
        }

        ty::NEW_TOKEN => {
            let length = read_varint(&mut cur)?;
            if length == 0 {
                return Err(frame_encoding_error());
            }
            Frame::NewToken(read_bytes(&mut cur, length)?)
        }

        0x08..=0x0f => {
            let has_offset = frame_type & 0x04 != 0;
            let has_length = frame_type & 0x02 != 0;
            let fin = frame_type & 0x01 != 0;

            let stream_id = read_varint(&mut cur)?;
            let offset = if has_offset { read_varint(&mut cur)? } else { 0 };
            let data = if has_length {
                let length = read_varint(&mut cur)?;
                read_bytes(&mut cur, length)?
            } else {
                // Data extends to end of packet.
                std::mem::take(&mut cur)
            };
            if offset + data.len() as u64 > crate::varint::MAX_VARINT {
                return Err(frame_encoding_error());
            }

            Frame::Stream(StreamFrame {
                stream_id,
                offset,
                data,
                fin,
            })
        }

        ty::MAX_DATA => Frame::MaxData(read_varint(&mut cur)?),

        ty::MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id: read_varint(&mut cur)?,
            max_data: read_varint(&mut cur)?,
        }),

        ty::MAX_STREAMS_BIDI | ty::MAX_STREAMS_UNI => Frame::MaxStreams(MaxStreamsFrame {
            bidirectional: frame_type == ty::MAX_STREAMS_BIDI,
            max_streams: read_varint(&mut cur)?,
        }),

        ty::DATA_BLOCKED => Frame::DataBlocked(read_varint(&mut cur)?),

        ty::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: read_varint(&mut cur)?,
            data_limit: read_varint(&mut cur)?,
        }),

        ty::STREAMS_BLOCKED_BIDI | ty::STREAMS_BLOCKED_UNI => {
            Frame::StreamsBlocked(MaxStreamsFrame {
                bidirectional: frame_type == ty::STREAMS_BLOCKED_BIDI,
                max_streams: read_varint(&mut cur)?,
            })
        }

        ty::NEW_CONNECTION_ID => {
            let sequence_number = read_varint(&mut cur)?;
            let retire_prior_to = read_varint(&mut cur)?;
            let cid_len = read_varint(&mut cur)?;
            if !(1..=20).contains(&cid_len) || retire_prior_to > sequence_number {
                return Err(frame_encoding_error());
            }
            let connection_id = read_bytes(&mut cur, cid_len)?;
            let stateless_reset_token = read_array::<16>(&mut cur)?;
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            })
        }

        ty::RETIRE_CONNECTION_ID => Frame::RetireConnectionId(read_varint(&mut cur)?),

        ty::PATH_CHALLENGE => Frame::PathChallenge(read_array(&mut cur)?),

        ty::PATH_RESPONSE => Frame::PathResponse(read_array(&mut cur)?),

        ty::CONNECTION_CLOSE | ty::APPLICATION_CLOSE => {
            let is_application = frame_type == ty::APPLICATION_CLOSE;
            let error_code = read_varint(&mut cur)?;
            let frame_type = if is_application { 0 } else { read_varint(&mut cur)? };
            let reason_len = read_varint(&mut cur)?;
            let reason = read_bytes(&mut cur, reason_len)?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                is_application,
                error_code,
                frame_type,
                reason,
            })
        }

        ty::HANDSHAKE_DONE => Frame::HandshakeDone,

        _ => return Err(frame_encoding_error()),
    };

    Ok((frame, buf.len() - cur.len()))
}

/// Iterator over all frames of a decrypted payload. Stops after the first
/// error.
pub struct Frames<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Frames<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            failed: false,
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match decode(self.buf) {
            Ok((frame, used)) => {
                self.buf = &self.buf[used..];
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Append one QUIC frame to `buf`.
///
/// STREAM frames always carry an explicit length, and an offset when non-zero.
pub fn encode<B: BufMut>(frame: &Frame<'_>, buf: &mut B) {
    match frame {
        Frame::Padding => buf.put_u8(0x00),

        Frame::Ping => write_varint(buf, ty::PING),

        Frame::Ack(ack) => {
            write_varint(buf, frame.ty());
            write_varint(buf, ack.largest_ack);
            write_varint(buf, ack.ack_delay);
            let mut raw = ack.ack_ranges;
            let mut count = 0u64;
            while read_raw_varint(&mut raw).is_ok() && read_raw_varint(&mut raw).is_ok() {
                count += 1;
            }
            write_varint(buf, count);
            write_varint(buf, ack.first_ack_range);
            buf.put_slice(ack.ack_ranges);
            if let Some(ecn) = &ack.ecn {
                write_varint(buf, ecn.ect0);
                write_varint(buf, ecn.ect1);
                write_varint(buf, ecn.ecn_ce);
            }
        }

        Frame::ResetStream(f) => {
            write_varint(buf, ty::RESET_STREAM);
            write_varint(buf, f.stream_id);
            write_varint(buf, f.error_code);
            write_varint(buf, f.final_size);
        }

        Frame::StopSending(f) => {
            write_varint(buf, ty::STOP_SENDING);
            write_varint(buf, f.stream_id);
            write_varint(buf, f.error_code);
        }

        Frame::Crypto(f) => {
            write_varint(buf, ty::CRYPTO);
            write_varint(buf, f.offset);
            write_varint(buf, f.data.len() as u64);
            buf.put_slice(f.data);
        }

        Frame::NewToken(token) => {
            write_varint(buf, ty::NEW_TOKEN);
            write_varint(buf, token.len() as u64);
            buf.put_slice(token);
        }

        Frame::Stream(f) => {
            let mut type_byte = ty::STREAM | 0x02;
            if f.offset > 0 {
                type_byte |= 0x04;
            }
            if f.fin {
                type_byte |= 0x01;
            }
            write_varint(buf, type_byte);
            write_varint(buf, f.stream_id);
            if f.offset > 0 {
                write_varint(buf, f.offset);
            }
            write_varint(buf, f.data.len() as u64);
            buf.put_slice(f.data);
        }

        Frame::MaxData(v) | Frame::DataBlocked(v) | Frame::RetireConnectionId(v) => {
            write_varint(buf, frame.ty());
            write_varint(buf, *v);
        }

        Frame::MaxStreamData(f) => {
            write_varint(buf, ty::MAX_STREAM_DATA);
            write_varint(buf, f.stream_id);
            write_varint(buf, f.max_data);
        }

        Frame::MaxStreams(f) | Frame::StreamsBlocked(f) => {
            write_varint(buf, frame.ty());
            write_varint(buf, f.max_streams);
        }

        Frame::StreamDataBlocked(f) => {
            write_varint(buf, ty::STREAM_DATA_BLOCKED);
            write_varint(buf, f.stream_id);
            write_varint(buf, f.data_limit);
        }

        Frame::NewConnectionId(f) => {
            write_varint(buf, ty::NEW_CONNECTION_ID);
            write_varint(buf, f.sequence_number);
            write_varint(buf, f.retire_prior_to);
            write_varint(buf, f.connection_id.len() as u64);
            buf.put_slice(f.connection_id);
            buf.put_slice(&f.stateless_reset_token);
        }

        Frame::PathChallenge(data) | Frame::PathResponse(data) => {
            write_varint(buf, frame.ty());
            buf.put_slice(data);
        }

        Frame::ConnectionClose(f) => {
            write_varint(buf, frame.ty());
            write_varint(buf, f.error_code);
            if !f.is_application {
                write_varint(buf, f.frame_type);
            }
            write_varint(buf, f.reason.len() as u64);
            buf.put_slice(f.reason);
        }

        Frame::HandshakeDone => write_varint(buf, ty::HANDSHAKE_DONE),
    }
}

/// Append an ACK frame for `ranges`: ascending, disjoint, non-adjacent,
/// half-open packet number ranges. Nothing is written if `ranges` is empty.
pub fn encode_ack<B: BufMut>(buf: &mut B, ranges: &[Range<u64>], ack_delay: u64, ecn: Option<EcnCounts>) {
    let Some((top, rest)) = ranges.split_last() else {
        return;
    };
    write_varint(buf, if ecn.is_some() { ty::ACK_ECN } else { ty::ACK });
    write_varint(buf, top.end - 1);
    write_varint(buf, ack_delay);
    write_varint(buf, rest.len() as u64);
    write_varint(buf, top.end - 1 - top.start);
    let mut smallest = top.start;
    for range in rest.iter().rev() {
        write_varint(buf, smallest - range.end - 1);
        write_varint(buf, range.end - 1 - range.start);
        smallest = range.start;
    }
    if let Some(ecn) = ecn {
        write_varint(buf, ecn.ect0);
        write_varint(buf, ecn.ect1);
        write_varint(buf, ecn.ecn_ce);
    }
}

/// Bytes taken by a STREAM frame's header (type, id, offset, length).
pub fn stream_header_len(stream_id: u64, offset: u64, len: usize) -> usize {
    let offset_len = if offset > 0 { varint_len(offset) } else { 0 };
    1 + varint_len(stream_id) + offset_len + varint_len(len as u64)
}

/// Bytes taken by a CRYPTO frame's header.
pub fn crypto_header_len(offset: u64, len: usize) -> usize {
    1 + varint_len(offset) + varint_len(len as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn encoded(frame: &Frame<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(frame, &mut buf);
        buf
    }

    fn roundtrip(frame: &Frame<'_>) {
        let buf = encoded(frame);
        let (decoded, consumed) = decode(&buf).unwrap();
        assert_eq!(consumed, buf.len(), "consumed != written for {frame:?}");
        assert_eq!(&decoded, frame);
    }

    fn is_frame_encoding_error(result: Result<(Frame<'_>, usize)>) -> bool {
        matches!(result, Err(Error::Transport(TransportError::FrameEncodingError)))
    }

    // -- ACK ----------------------------------------------------------------

    #[test]
    fn ack_ranges_walk_backwards() {
        // Acks 95..=100, 80..=90, 2..=3.
        let ranges = [2..4, 80..91, 95..101];
        let mut buf = Vec::new();
        encode_ack(&mut buf, &ranges, 7, None);

        let (frame, used) = decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        let Frame::Ack(ack) = frame else { panic!("not an ack") };
        assert_eq!(ack.largest_ack, 100);
        assert_eq!(ack.ack_delay, 7);
        assert_eq!(ack.first_ack_range, 5);
        assert_eq!(ack.ranges().collect::<Vec<_>>(), vec![95..101, 80..91, 2..4]);
        // Re-encoding the borrowed frame reproduces the bytes.
        assert_eq!(encoded(&Frame::Ack(ack)), buf);
    }

    #[test]
    fn ack_with_ecn_counts() {
        let mut buf = Vec::new();
        let ecn = EcnCounts { ect0: 10, ect1: 0, ecn_ce: 2 };
        encode_ack(&mut buf, &[0..1], 0, Some(ecn));
        assert_eq!(buf[0], 0x03);
        let (Frame::Ack(ack), _) = decode(&buf).unwrap() else { panic!() };
        assert_eq!(ack.ecn, Some(ecn));
        assert_eq!(ack.ranges().collect::<Vec<_>>(), vec![0..1]);
    }

    #[test]
    fn ack_range_underflow_is_rejected() {
        // largest 3, first range 4.
        assert!(is_frame_encoding_error(decode(&[0x02, 3, 0, 0, 4])));
        // largest 5, first range 0, then gap 4 underflows.
        assert!(is_frame_encoding_error(decode(&[0x02, 5, 0, 1, 0, 4, 0])));
    }

    #[test]
    fn empty_ack_range_list_writes_nothing() {
        let mut buf = Vec::new();
        encode_ack(&mut buf, &[], 0, None);
        assert!(buf.is_empty());
    }

    // -- Stream & crypto ----------------------------------------------------

    #[test]
    fn stream_flag_bits() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 1000,
            data: b"abc",
            fin: true,
        });
        let buf = encoded(&frame);
        assert_eq!(buf[0], 0x0f);
        assert_eq!(buf.len(), stream_header_len(4, 1000, 3) + 3);
        roundtrip(&frame);

        let at_zero = Frame::Stream(StreamFrame {
            stream_id: 0,
            offset: 0,
            data: b"",
            fin: false,
        });
        assert_eq!(encoded(&at_zero), [0x0a, 0x00, 0x00]);
    }

    #[test]
    fn stream_without_length_runs_to_end() {
        let buf = [0x0c, 0x01, 0x05, b'h', b'i'];
        let (frame, used) = decode(&buf).unwrap();
        assert_eq!(used, 5);
        assert_eq!(
            frame,
            Frame::Stream(StreamFrame {
                stream_id: 1,
                offset: 5,
                data: b"hi",
                fin: false,
            })
        );
    }

    #[test]
    fn crypto_frame_header_len() {
        let frame = Frame::Crypto(CryptoFrame { offset: 70, data: &[1; 300] });
        assert_eq!(encoded(&frame).len(), crypto_header_len(70, 300) + 300);
        roundtrip(&frame);
    }

    // -- Control frames -----------------------------------------------------

    #[test]
    fn control_frames() {
        roundtrip(&Frame::ResetStream(ResetStreamFrame {
            stream_id: 8,
            error_code: 0x101,
            final_size: 1 << 20,
        }));
        roundtrip(&Frame::StopSending(StopSendingFrame { stream_id: 3, error_code: 9 }));
        roundtrip(&Frame::MaxStreams(MaxStreamsFrame { bidirectional: false, max_streams: 150 }));
        roundtrip(&Frame::StreamsBlocked(MaxStreamsFrame { bidirectional: true, max_streams: 100 }));
        roundtrip(&Frame::NewToken(b"resumption"));
        roundtrip(&Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number: 2,
            retire_prior_to: 1,
            connection_id: &[0xab; 8],
            stateless_reset_token: [0x55; 16],
        }));
        roundtrip(&Frame::PathChallenge(*b"12345678"));
        roundtrip(&Frame::ConnectionClose(ConnectionCloseFrame {
            is_application: false,
            error_code: 0x0a,
            frame_type: 0x08,
            reason: b"bad stream",
        }));
    }

    #[test]
    fn application_close_has_no_frame_type() {
        let buf = encoded(&Frame::ConnectionClose(ConnectionCloseFrame {
            is_application: true,
            error_code: 0x10,
            frame_type: 0,
            reason: b"bye",
        }));
        assert_eq!(buf, hex!("1d1003627965"));
    }

    #[test]
    fn multiple_frames_in_payload() {
        let payload = hex!("01000006000568656c6c6f1e");
        let frames: Vec<_> = Frames::new(&payload).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], Frame::Ping);
        assert_eq!(frames[1], Frame::Padding);
        assert_eq!(frames[3], Frame::Crypto(CryptoFrame { offset: 0, data: b"hello" }));
        assert_eq!(frames[4], Frame::HandshakeDone);
    }

    // -- Errors -------------------------------------------------------------

    #[test]
    fn malformed_frames() {
        assert!(is_frame_encoding_error(decode(&[])));
        assert!(is_frame_encoding_error(decode(&[0x1f])));
        assert!(is_frame_encoding_error(decode(&[0x04, 0x01, 0x02])));
        // CRYPTO length past end of payload.
        assert!(is_frame_encoding_error(decode(&[0x06, 0x00, 0x10, 1, 2])));
        // NEW_CONNECTION_ID with 21-byte CID, and with retire_prior_to > seq.
        assert!(is_frame_encoding_error(decode(&[0x18, 1, 0, 21])));
        assert!(is_frame_encoding_error(decode(&[0x18, 1, 2, 8])));
        // Empty NEW_TOKEN.
        assert!(is_frame_encoding_error(decode(&[0x07, 0x00])));
    }

    #[test]
    fn frames_iterator_stops_on_error() {
        let payload = [0x01, 0x1f, 0x01];
        let mut frames = Frames::new(&payload);
        assert!(frames.next().unwrap().is_ok());
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    // -- Classification -----------------------------------------------------

    #[test]
    fn ack_eliciting_and_levels() {
        let crypto = Frame::Crypto(CryptoFrame { offset: 0, data: b"" });
        let stream = Frame::Stream(StreamFrame { stream_id: 0, offset: 0, data: b"", fin: true });
        let ack = Frame::Ack(AckFrame {
            largest_ack: 0,
            ack_delay: 0,
            first_ack_range: 0,
            ack_ranges: &[],
            ecn: None,
        });

        assert!(crypto.is_ack_eliciting());
        assert!(!ack.is_ack_eliciting());
        assert!(!Frame::Padding.is_ack_eliciting());

        assert!(crypto.allowed_at(Level::Initial));
        assert!(ack.allowed_at(Level::Handshake));
        assert!(!stream.allowed_at(Level::Handshake));
        assert!(!Frame::HandshakeDone.allowed_at(Level::Initial));
        assert!(stream.allowed_at(Level::ZeroRtt));
        assert!(!ack.allowed_at(Level::ZeroRtt));
        assert!(Frame::HandshakeDone.allowed_at(Level::OneRtt));
        assert_eq!(stream.ty(), ty::STREAM);
    }
}
