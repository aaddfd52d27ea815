//! Stream multiplexer (RFC 9000 §2, §3).
//!
//! Every stream has up to two halves: a [`SendStream`] backed by a
//! retransmittable [`SendBuffer`] and a [`RecvStream`] backed by an
//! [`Assembler`]. [`StreamMap`] owns them and enforces stream-count limits.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result, TransportError};
use crate::tls::transport_params::TransportParams;
use crate::transport::assembler::Assembler;
use crate::transport::flow_control::{RecvWindow, SendWindow};
use crate::transport::range_set::RangeSet;
use crate::transport::Instant;

// ---------------------------------------------------------------------------
// Stream ID helpers
// ---------------------------------------------------------------------------

pub fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 0
}

pub fn is_bidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 == 0
}

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    Bi = 0,
    Uni = 1,
}

impl Dir {
    pub fn of(stream_id: u64) -> Self {
        if is_bidirectional(stream_id) {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// ID of the `n`th client-initiated stream in this direction.
    pub fn client_stream_id(self, n: u64) -> u64 {
        n * 4 + 2 * self as u64
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Whether our (client) side may send on `stream_id`.
pub fn client_can_send(stream_id: u64) -> bool {
    is_bidirectional(stream_id) || is_client_initiated(stream_id)
}

/// Whether our (client) side may receive on `stream_id`.
pub fn client_can_recv(stream_id: u64) -> bool {
    is_bidirectional(stream_id) || !is_client_initiated(stream_id)
}

// ---------------------------------------------------------------------------
// Stream states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStreamState {
    Ready,
    Send,
    DataSent,
    ResetSent,
    DataRecvd,
    ResetRecvd,
}

impl SendStreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStreamState {
    Recv,
    SizeKnown,
    DataRecvd,
    ResetRecvd,
    DataRead,
    ResetRead,
}

impl RecvStreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRead | Self::ResetRead)
    }
}

/// Combined view of both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ready,
    Open,
    /// We sent fin on a bidirectional stream.
    HalfClosedLocal,
    /// The peer's fin arrived on a bidirectional stream.
    HalfClosedRemote,
    /// All data sent on a unidirectional stream.
    DataSent,
    /// All data received on a unidirectional stream.
    DataRecvd,
    ResetSent,
    ResetRecvd,
    Closed,
}

// ---------------------------------------------------------------------------
// SendBuffer
// ---------------------------------------------------------------------------

/// Outgoing bytes kept until acknowledged, with lost ranges queued for
/// retransmission ahead of new data. Shared by STREAM and CRYPTO.
#[derive(Debug, Default)]
pub struct SendBuffer {
    data: BytesMut,
    /// Stream offset of `data[0]`; everything below is acknowledged.
    base: u64,
    /// Next never-sent offset.
    sent: u64,
    acked: RangeSet,
    lost: RangeSet,
    fin: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(self.fin.is_none(), "write after finish");
        self.data.extend_from_slice(bytes);
    }

    /// Mark the current end as the final size.
    pub fn finish(&mut self) {
        self.fin.get_or_insert(self.end());
    }

    /// Offset one past the last written byte.
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn is_finished(&self) -> bool {
        self.fin.is_some()
    }

    /// Anything (new data, lost data or a bare fin) waiting to be sent.
    pub fn has_pending(&self) -> bool {
        !self.lost.is_empty() || self.sent < self.end() || (self.fin.is_some() && !self.fin_sent)
    }

    /// Bytes not yet sent once.
    pub fn unsent(&self) -> u64 {
        self.end() - self.sent
    }

    /// Next chunk of at most `max_len` bytes: lost data first, then new data.
    /// Returns `(offset, bytes, fin)`.
    pub fn poll_transmit(&mut self, max_len: usize) -> Option<(u64, Bytes, bool)> {
        if let Some(range) = self.lost.pop_min() {
            let end = range.end.min(range.start + max_len as u64);
            if end < range.end {
                self.lost.insert(end..range.end);
            }
            let fin = self.fin == Some(end);
            if fin {
                self.fin_sent = true;
            }
            return Some((range.start, self.slice(range.start..end), fin));
        }

        let end = self.end().min(self.sent + max_len as u64);
        let fin = self.fin == Some(end) && !self.fin_sent;
        if end == self.sent && !fin {
            return None;
        }
        let offset = self.sent;
        self.sent = end;
        if fin {
            self.fin_sent = true;
        }
        Some((offset, self.slice(offset..end), fin))
    }

    fn slice(&self, range: Range<u64>) -> Bytes {
        let start = (range.start - self.base) as usize;
        let end = (range.end - self.base) as usize;
        Bytes::copy_from_slice(&self.data[start..end])
    }

    pub fn on_acked(&mut self, range: Range<u64>, fin: bool) {
        self.lost.remove(range.clone());
        self.acked.insert(range);
        self.fin_acked |= fin;
        if let Some(first) = self.acked.iter().next() {
            if first.start <= self.base && first.end > self.base {
                let advance = ((first.end - self.base) as usize).min(self.data.len());
                let _ = self.data.split_to(advance);
                self.base += advance as u64;
            }
        }
    }

    pub fn on_lost(&mut self, range: Range<u64>, fin: bool) {
        for gap in self.acked.gaps_in(range.start.max(self.base)..range.end) {
            self.lost.insert(gap);
        }
        if fin && !self.fin_acked {
            self.fin_sent = false;
        }
    }

    /// Every byte and the fin were acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.fin_acked && Some(self.base) == self.fin && self.data.is_empty()
    }

    /// Bytes written but not yet acknowledged.
    pub fn buffered(&self) -> usize {
        self.data.len()
    }
}

// ---------------------------------------------------------------------------
// Stream halves
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SendStream {
    pub state: SendStreamState,
    pub buf: SendBuffer,
    pub window: SendWindow,
    /// (error code, final size) once reset.
    pub reset: Option<(u64, u64)>,
    /// RESET_STREAM still has to be (re)sent.
    pub reset_pending: bool,
    /// Code from a received STOP_SENDING.
    pub stopped: Option<u64>,
}

impl SendStream {
    fn new(max_data: u64) -> Self {
        Self {
            state: SendStreamState::Ready,
            buf: SendBuffer::new(),
            window: SendWindow::new(max_data),
            reset: None,
            reset_pending: false,
            stopped: None,
        }
    }

    /// Bytes the peer's window still allows beyond what is buffered.
    pub fn credit(&self) -> u64 {
        self.window.credit()
    }

    /// Abandon the send side with `code`. Returns false if already reset or
    /// fully delivered.
    pub fn reset(&mut self, code: u64) -> bool {
        if self.reset.is_some() || self.state == SendStreamState::DataRecvd {
            return false;
        }
        self.reset = Some((code, self.buf.end()));
        self.reset_pending = true;
        self.state = SendStreamState::ResetSent;
        self.buf = SendBuffer::new();
        true
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.state, SendStreamState::Ready | SendStreamState::Send) && !self.buf.is_finished()
    }
}

#[derive(Debug)]
pub struct RecvStream {
    pub state: RecvStreamState,
    pub asm: Assembler,
    pub window: RecvWindow,
    /// Application error code from RESET_STREAM.
    pub reset_code: Option<u64>,
    /// STOP_SENDING code still to be sent.
    pub stop_pending: Option<u64>,
    pub stop_sent: bool,
}

impl RecvStream {
    fn new(window: u64, now: Instant) -> Self {
        Self {
            state: RecvStreamState::Recv,
            asm: Assembler::new(),
            window: RecvWindow::new(window, now),
            reset_code: None,
            stop_pending: None,
            stop_sent: false,
        }
    }

    /// Accept STREAM data. Returns by how much the highest received offset
    /// grew (for connection-level accounting).
    pub fn on_data(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64> {
        if matches!(self.state, RecvStreamState::ResetRecvd | RecvStreamState::ResetRead) {
            return Ok(0);
        }
        let grown = self.asm.insert(offset, data, fin)?;
        self.window.on_received(grown)?;
        if self.state == RecvStreamState::Recv && self.asm.final_size().is_some() {
            self.state = RecvStreamState::SizeKnown;
        }
        if self.state == RecvStreamState::SizeKnown && self.asm.is_complete() {
            self.state = RecvStreamState::DataRecvd;
        }
        Ok(grown)
    }

    /// Accept RESET_STREAM. Returns by how much the final size exceeds the
    /// highest offset seen so far.
    pub fn on_reset(&mut self, code: u64, final_size: u64) -> Result<u64> {
        if let Some(known) = self.asm.final_size() {
            if known != final_size {
                return Err(Error::Transport(TransportError::FinalSizeError));
            }
        }
        if final_size < self.asm.highest() {
            return Err(Error::Transport(TransportError::FinalSizeError));
        }
        if matches!(
            self.state,
            RecvStreamState::ResetRecvd | RecvStreamState::ResetRead | RecvStreamState::DataRead
        ) {
            return Ok(0);
        }
        let grown = final_size - self.asm.highest();
        self.window.on_received(grown)?;
        self.reset_code = Some(code);
        self.state = RecvStreamState::ResetRecvd;
        self.asm.clear();
        Ok(grown)
    }

    /// Read up to `max` bytes. Returns the data and whether the stream end
    /// was reached.
    pub fn read(&mut self, max: usize) -> Result<(Bytes, bool)> {
        if let Some(code) = self.reset_code {
            self.state = RecvStreamState::ResetRead;
            return Err(Error::StreamReset(code));
        }
        let data = self.asm.read(max);
        self.window.on_consumed(data.len() as u64);
        let fin = self.asm.is_finished();
        if fin {
            self.state = RecvStreamState::DataRead;
        }
        Ok((data, fin))
    }

    pub fn is_readable(&self) -> bool {
        self.asm.has_contiguous()
            || self.reset_code.is_some() && self.state == RecvStreamState::ResetRecvd
            || self.asm.is_finished() && self.state != RecvStreamState::DataRead
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Stream {
    pub id: u64,
    pub send: Option<SendStream>,
    pub recv: Option<RecvStream>,
}

impl Stream {
    pub fn state(&self) -> StreamState {
        let send = self.send.as_ref().map(|s| s.state);
        let recv = self.recv.as_ref().map(|r| r.state);
        let send_done = send.map_or(true, SendStreamState::is_terminal);
        let recv_done = recv.map_or(true, RecvStreamState::is_terminal);
        if send_done && recv_done {
            return StreamState::Closed;
        }
        if matches!(recv, Some(RecvStreamState::ResetRecvd | RecvStreamState::ResetRead)) {
            return StreamState::ResetRecvd;
        }
        if matches!(send, Some(SendStreamState::ResetSent | SendStreamState::ResetRecvd)) {
            return StreamState::ResetSent;
        }
        let local_fin = matches!(send, Some(SendStreamState::DataSent | SendStreamState::DataRecvd));
        let remote_fin = matches!(
            recv,
            Some(RecvStreamState::SizeKnown | RecvStreamState::DataRecvd | RecvStreamState::DataRead)
        );
        match (send, recv) {
            (Some(_), Some(_)) if local_fin => StreamState::HalfClosedLocal,
            (Some(_), Some(_)) if remote_fin => StreamState::HalfClosedRemote,
            (Some(SendStreamState::Ready), _) => StreamState::Ready,
            (Some(_), None) if local_fin => StreamState::DataSent,
            (None, Some(_)) if remote_fin => StreamState::DataRecvd,
            _ => StreamState::Open,
        }
    }

    fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }
}

// ---------------------------------------------------------------------------
// StreamMap
// ---------------------------------------------------------------------------

/// Newly referenced peer-initiated streams.
pub type Opened = Vec<u64>;

#[derive(Debug)]
pub struct StreamMap {
    streams: BTreeMap<u64, Stream>,
    /// Client-initiated streams opened so far, per direction.
    opened_local: [u64; 2],
    /// Peer's limit on our streams (its MAX_STREAMS).
    max_local: [u64; 2],
    /// An open failed at the current limit.
    open_blocked: [bool; 2],
    streams_blocked_reported: [Option<u64>; 2],
    /// Peer-initiated streams referenced so far.
    opened_remote: [u64; 2],
    /// Our advertised limit on peer streams.
    max_remote: [u64; 2],
    max_concurrent_remote: [u64; 2],
    closed_remote: [u64; 2],

    /// Our receive window for every new stream.
    local_window: u64,
    /// Peer's initial windows: our bidi streams, its bidi streams, uni.
    peer_bidi_remote: u64,
    peer_bidi_local: u64,
    peer_uni: u64,
}

impl StreamMap {
    pub fn new(local_window: u64, max_bidi: u64, max_uni: u64) -> Self {
        Self {
            streams: BTreeMap::new(),
            opened_local: [0; 2],
            max_local: [0; 2],
            open_blocked: [false; 2],
            streams_blocked_reported: [None; 2],
            opened_remote: [0; 2],
            max_remote: [max_bidi, max_uni],
            max_concurrent_remote: [max_bidi, max_uni],
            closed_remote: [0; 2],
            local_window,
            peer_bidi_remote: 0,
            peer_bidi_local: 0,
            peer_uni: 0,
        }
    }

    /// Apply the peer's transport parameters (or remembered ones for 0-RTT).
    /// Limits only grow.
    pub fn apply_peer_params(&mut self, params: &TransportParams) {
        self.max_local[0] = self.max_local[0].max(params.initial_max_streams_bidi);
        self.max_local[1] = self.max_local[1].max(params.initial_max_streams_uni);
        self.peer_bidi_remote = params.initial_max_stream_data_bidi_remote;
        self.peer_bidi_local = params.initial_max_stream_data_bidi_local;
        self.peer_uni = params.initial_max_stream_data_uni;
        for stream in self.streams.values_mut() {
            let Some(send) = stream.send.as_mut() else { continue };
            let window = if !is_bidirectional(stream.id) {
                self.peer_uni
            } else if is_client_initiated(stream.id) {
                self.peer_bidi_remote
            } else {
                self.peer_bidi_local
            };
            send.window.raise(window);
        }
    }

    /// Open a client-initiated stream.
    pub fn open(&mut self, dir: Dir, now: Instant) -> Result<u64> {
        let i = dir.index();
        if self.opened_local[i] >= self.max_local[i] {
            self.open_blocked[i] = true;
            return Err(Error::StreamLimit);
        }
        let id = dir.client_stream_id(self.opened_local[i]);
        self.opened_local[i] += 1;
        let (send_window, recv) = match dir {
            Dir::Bi => (self.peer_bidi_remote, Some(RecvStream::new(self.local_window, now))),
            Dir::Uni => (self.peer_uni, None),
        };
        self.streams.insert(
            id,
            Stream {
                id,
                send: Some(SendStream::new(send_window)),
                recv,
            },
        );
        Ok(id)
    }

    /// Limit to report in STREAMS_BLOCKED after a failed open, once per limit.
    pub fn poll_streams_blocked(&mut self, dir: Dir) -> Option<u64> {
        let i = dir.index();
        let limit = self.max_local[i];
        if self.open_blocked[i] && self.streams_blocked_reported[i] != Some(limit) {
            self.streams_blocked_reported[i] = Some(limit);
            Some(limit)
        } else {
            None
        }
    }

    /// Peer sent MAX_STREAMS.
    pub fn on_max_streams(&mut self, dir: Dir, max: u64) -> bool {
        let i = dir.index();
        if max > self.max_local[i] {
            self.max_local[i] = max;
            self.open_blocked[i] = false;
            true
        } else {
            false
        }
    }

    /// Look up a stream referenced by a received frame, creating
    /// peer-initiated streams (and all lower ones of the same type) on first
    /// reference.
    ///
    /// `Ok(None)` means the stream existed and was already closed.
    pub fn get_or_open_remote(
        &mut self,
        id: u64,
        now: Instant,
        opened: &mut Opened,
    ) -> Result<Option<&mut Stream>> {
        if is_client_initiated(id) {
            let index = id >> 2;
            if index >= self.opened_local[Dir::of(id).index()] {
                return Err(Error::Transport(TransportError::StreamStateError));
            }
            return Ok(self.streams.get_mut(&id));
        }

        let dir = Dir::of(id);
        let i = dir.index();
        let index = id >> 2;
        if index >= self.max_remote[i] {
            return Err(Error::Transport(TransportError::StreamLimitError));
        }
        while self.opened_remote[i] <= index {
            let new_id = self.opened_remote[i] * 4 + 1 + 2 * i as u64;
            self.opened_remote[i] += 1;
            let send = match dir {
                Dir::Bi => Some(SendStream::new(self.peer_bidi_local)),
                Dir::Uni => None,
            };
            self.streams.insert(
                new_id,
                Stream {
                    id: new_id,
                    send,
                    recv: Some(RecvStream::new(self.local_window, now)),
                },
            );
            opened.push(new_id);
        }
        Ok(self.streams.get_mut(&id))
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.streams.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop streams whose halves are all terminal, crediting closed
    /// peer-initiated streams toward a MAX_STREAMS update.
    pub fn collect_closed(&mut self) -> Vec<u64> {
        let closed: Vec<u64> = self
            .streams
            .values()
            .filter(|s| s.is_closed())
            .map(|s| s.id)
            .collect();
        for id in &closed {
            self.streams.remove(id);
            if !is_client_initiated(*id) {
                self.closed_remote[Dir::of(*id).index()] += 1;
            }
        }
        closed
    }

    /// New MAX_STREAMS limit once half of the peer's credit was used up.
    pub fn poll_max_streams(&mut self, dir: Dir) -> Option<u64> {
        let i = dir.index();
        if self.closed_remote[i] * 2 < self.max_concurrent_remote[i].max(1) {
            return None;
        }
        self.max_remote[i] += self.closed_remote[i];
        self.closed_remote[i] = 0;
        Some(self.max_remote[i])
    }

    pub fn max_local(&self, dir: Dir) -> u64 {
        self.max_local[dir.index()]
    }

    /// Our current limit on peer-initiated streams.
    pub fn max_remote(&self, dir: Dir) -> u64 {
        self.max_remote[dir.index()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
