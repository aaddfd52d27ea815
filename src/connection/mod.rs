//! QUIC client connection state machine.
//!
//! [`Connection`] ties the crypto, packet, frame and transport modules into
//! one client connection. It performs no I/O and reads no clock: the driver
//! feeds it datagrams ([`Connection::handle_datagram`]) and timer expiries
//! ([`Connection::handle_timeout`]) and drains datagrams to send
//! ([`Connection::poll_transmit`]) and events ([`Connection::poll_event`]).
//! [`crate::client`] is that driver on tokio.

mod cid;
mod handshake;
mod keys;
mod recv;
mod transmit;

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::Level;
use crate::error::{ConnectionError, Error, Result, TransportError};
use crate::packet::{ConnectionId, QUIC_VERSION_1};
use crate::tls::{TlsSession, TransportParams};
use crate::transport::congestion::{CongestionController, Pacer};
use crate::transport::flow_control::FlowController;
use crate::transport::loss::{LossDetector, Timeout};
use crate::transport::recovery::{SentFrame, SentPacket};
use crate::transport::space::{PacketNumberSpace, SpaceId};
use crate::transport::stream::{Dir, SendStreamState, StreamMap};
use crate::transport::Instant;

use self::cid::CidState;
use self::keys::ConnectionKeys;

/// Length of the random DCID of our first Initial (RFC 9000 §7.2).
const INITIAL_DCID_LEN: usize = 8;

/// Lower bound of the draining period.
const MIN_DRAIN_PERIOD: u64 = 300_000;

/// Ack-eliciting packets sent per probe timeout.
const PROBE_PACKETS: u8 = 2;

/// Longest reason phrase put in a CONNECTION_CLOSE.
const MAX_REASON_LEN: usize = 256;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, nothing sent yet.
    Idle,
    /// ClientHello sent; waiting for HANDSHAKE_DONE.
    Handshaking,
    /// Handshake confirmed.
    Connected,
    /// CONNECTION_CLOSE queued but not yet sent.
    Closing,
    /// Close sent or received; packets are no longer processed.
    Draining,
    /// All resources released.
    Closed,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Events produced by the connection for the application, in processing
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// HANDSHAKE_DONE received; the connection is usable.
    Connected {
        alpn: Option<Vec<u8>>,
        early_data_accepted: bool,
    },
    /// The server opened a stream.
    StreamOpened(u64),
    /// Stream has data (or its end, or a reset) to read.
    StreamReadable(u64),
    /// Flow control credit returned to a stream a write was short on.
    StreamWritable(u64),
    /// Everything written on the stream, fin included, was acknowledged.
    StreamFinished(u64),
    /// Peer reset the receive side of a stream.
    StreamReset { stream_id: u64, error_code: u64 },
    /// Peer asked us to stop sending; the send side is reset with the same
    /// code.
    StopSending { stream_id: u64, error_code: u64 },
    /// The server raised our limit on streams in `Dir`.
    StreamsAvailable(Dir),
    /// A PATH_RESPONSE matched our PATH_CHALLENGE.
    PathValidated,
    /// The connection ended. No event follows.
    ConnectionClosed(ConnectionError),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    /// Packets dropped because they could not be decrypted or parsed.
    pub packets_dropped: u64,
    pub congestion_window: u64,
    pub bytes_in_flight: u64,
    pub smoothed_rtt: Duration,
    pub key_updates: u64,
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EarlyData {
    NotAttempted,
    Sending,
    Accepted,
    Rejected,
}

/// CONNECTION_CLOSE waiting to be sent.
#[derive(Debug, Clone)]
pub(crate) struct CloseFrame {
    pub is_application: bool,
    pub code: u64,
    pub frame_type: u64,
    pub reason: String,
}

/// Control frames to (re)send whose content is derived from current state.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub max_data: bool,
    pub max_stream_data: BTreeSet<u64>,
    pub max_streams: [bool; 2],
    pub path_responses: VecDeque<[u8; 8]>,
    pub path_challenge: Option<[u8; 8]>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A QUIC v1 client connection.
pub struct Connection {
    pub(crate) config: Config,
    pub(crate) server_name: String,
    pub(crate) state: State,
    pub(crate) version: u32,
    pub(crate) tls: Box<dyn TlsSession>,
    pub(crate) keys: ConnectionKeys,
    pub(crate) spaces: [PacketNumberSpace; 3],
    pub(crate) streams: StreamMap,
    pub(crate) flow: FlowController,
    pub(crate) loss: LossDetector,
    pub(crate) congestion: CongestionController,
    pub(crate) pacer: Option<Pacer>,
    pub(crate) pacing_deadline: Option<Instant>,
    pub(crate) cids: CidState,
    pub(crate) rng: StdRng,

    // Handshake
    pub(crate) original_dcid: ConnectionId,
    /// SCID of the server's first Initial.
    pub(crate) server_scid: Option<ConnectionId>,
    pub(crate) retry_scid: Option<ConnectionId>,
    /// Token carried in our Initial packets.
    pub(crate) token: Bytes,
    pub(crate) new_token: Option<Bytes>,
    pub(crate) peer_params: Option<TransportParams>,
    pub(crate) alpn: Option<Vec<u8>>,
    pub(crate) early_data: EarlyData,
    pub(crate) handshake_complete: bool,
    pub(crate) handshake_confirmed: bool,
    /// The server can no longer be blocked by its amplification limit.
    pub(crate) peer_validated: bool,
    pub(crate) received_valid_packet: bool,

    // Sending
    pub(crate) pending: Pending,
    pub(crate) probes: [u8; 3],
    pub(crate) blocked_writers: BTreeSet<u64>,
    pub(crate) stream_cursor: u64,
    pub(crate) path_challenge: Option<[u8; 8]>,

    // Closing
    pub(crate) close_frame: Option<CloseFrame>,
    pub(crate) close_datagram: Option<Vec<u8>>,
    pub(crate) close_resends: u8,
    pub(crate) close_resend_due: bool,
    pub(crate) error: Option<ConnectionError>,

    // Timers
    pub(crate) last_activity: Instant,
    pub(crate) eliciting_since_recv: bool,
    pub(crate) handshake_deadline: Option<Instant>,
    pub(crate) draining_deadline: Option<Instant>,

    pub(crate) events: VecDeque<Event>,
    pub(crate) stats: ConnectionStats,
}

impl Connection {
    /// Create a client connection to `server_name`. Nothing is sent until
    /// [`connect`](Self::connect).
    pub fn new<R: RngCore + ?Sized>(
        config: Config,
        server_name: &str,
        tls: Box<dyn TlsSession>,
        rng: &mut R,
        now: Instant,
    ) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let mut rng = StdRng::from_seed(seed);
        let local_cid = ConnectionId::random(&mut rng, config.local_cid_len);
        let original_dcid = ConnectionId::random(&mut rng, INITIAL_DCID_LEN);
        let mds = config.max_datagram_size as u64;
        let initial_rtt = config.initial_rtt.as_micros() as u64;

        Self {
            server_name: server_name.into(),
            state: State::Idle,
            version: QUIC_VERSION_1,
            tls,
            keys: ConnectionKeys::default(),
            spaces: Default::default(),
            streams: StreamMap::new(
                config.initial_max_stream_data,
                config.max_concurrent_bidi_streams,
                config.max_concurrent_uni_streams,
            ),
            flow: FlowController::new(config.initial_max_data, now),
            // Until the server says otherwise (RFC 9000 §18.2).
            loss: LossDetector::new(initial_rtt, 25_000),
            congestion: CongestionController::new(mds),
            pacer: config.enable_pacing.then(|| Pacer::new(mds, now)),
            pacing_deadline: None,
            cids: CidState::new(local_cid, original_dcid.clone(), config.active_connection_id_limit),
            rng,
            original_dcid,
            server_scid: None,
            retry_scid: None,
            token: Bytes::new(),
            new_token: None,
            peer_params: None,
            alpn: None,
            early_data: EarlyData::NotAttempted,
            handshake_complete: false,
            handshake_confirmed: false,
            peer_validated: false,
            received_valid_packet: false,
            pending: Pending::default(),
            probes: [0; 3],
            blocked_writers: BTreeSet::new(),
            stream_cursor: 0,
            path_challenge: None,
            close_frame: None,
            close_datagram: None,
            close_resends: 1,
            close_resend_due: false,
            error: None,
            last_activity: now,
            eliciting_since_recv: false,
            handshake_deadline: None,
            draining_deadline: None,
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Why the connection ended, once it has.
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    /// Whether the server accepted our 0-RTT data; `None` if none was sent
    /// or the answer is not known yet.
    pub fn early_data_accepted(&self) -> Option<bool> {
        match self.early_data {
            EarlyData::Accepted => Some(true),
            EarlyData::Rejected => Some(false),
            EarlyData::NotAttempted | EarlyData::Sending => None,
        }
    }

    /// Latest NEW_TOKEN from the server, for a future connection.
    pub fn new_token(&self) -> Option<&Bytes> {
        self.new_token.as_ref()
    }

    /// Use a token from an earlier connection in our Initial packets.
    pub fn set_token(&mut self, token: Bytes) {
        if self.state == State::Idle {
            self.token = token;
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            congestion_window: self.congestion.cwnd(),
            bytes_in_flight: self.congestion.bytes_in_flight(),
            smoothed_rtt: Duration::from_micros(self.loss.rtt.get()),
            ..self.stats.clone()
        }
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Streams are usable once connected, or earlier during a 0-RTT attempt.
    fn check_stream_io(&self) -> Result<()> {
        match self.state {
            State::Connected => Ok(()),
            // Settled 0-RTT streams carry on over 1-RTT until HANDSHAKE_DONE.
            State::Handshaking if self.early_data != EarlyData::NotAttempted => Ok(()),
            _ => Err(self.state_error()),
        }
    }

    fn state_error(&self) -> Error {
        match &self.error {
            Some(error) => Error::ConnectionLost(error.clone()),
            None => Error::InvalidState(self.state),
        }
    }

    /// Open a client-initiated stream. Past the server's limit this fails
    /// with [`Error::StreamLimit`] and a STREAMS_BLOCKED is queued.
    pub fn open_stream(&mut self, dir: Dir, now: Instant) -> Result<u64> {
        self.check_stream_io()?;
        let id = self.streams.open(dir, now)?;
        debug!(stream_id = id, ?dir, "stream opened");
        Ok(id)
    }

    /// Queue `data` on a stream. Returns how much was accepted, bounded by
    /// stream and connection credit; `fin` applies only if all of `data`
    /// was accepted. A short write is followed by
    /// [`Event::StreamWritable`] when credit returns.
    pub fn write(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize> {
        self.check_stream_io()?;
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let send = stream.send.as_mut().ok_or(Error::NotWritable(stream_id))?;
        if let Some(code) = send.stopped {
            return Err(Error::Stopped(code));
        }
        if !send.is_writable() {
            return Err(Error::NotWritable(stream_id));
        }

        let len = (data.len() as u64)
            .min(send.credit())
            .min(self.flow.send.credit()) as usize;
        send.window.consume(len as u64)?;
        self.flow.send.consume(len as u64)?;
        send.buf.write(&data[..len]);
        if send.state == SendStreamState::Ready {
            send.state = SendStreamState::Send;
        }
        if len == data.len() {
            if fin {
                send.buf.finish();
            }
        } else {
            self.blocked_writers.insert(stream_id);
        }
        Ok(len)
    }

    /// Read up to `max` bytes in order. An empty result without fin means
    /// nothing is available yet; wait for [`Event::StreamReadable`].
    pub fn read(&mut self, stream_id: u64, max: usize) -> Result<(Bytes, bool)> {
        if matches!(self.state, State::Idle | State::Closed) {
            return Err(self.state_error());
        }
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let recv = stream.recv.as_mut().ok_or(Error::NotReadable(stream_id))?;
        let (data, fin) = recv.read(max)?;
        self.flow.recv.on_consumed(data.len() as u64);
        Ok((data, fin))
    }

    /// Abandon the send side of a stream with an application error code.
    pub fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> Result<()> {
        self.check_stream_io()?;
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let send = stream.send.as_mut().ok_or(Error::NotWritable(stream_id))?;
        if send.reset(error_code) {
            debug!(stream_id, error_code, "stream reset");
        }
        self.blocked_writers.remove(&stream_id);
        Ok(())
    }

    /// Ask the server to stop sending on a stream.
    pub fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<()> {
        self.check_stream_io()?;
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        let recv = stream.recv.as_mut().ok_or(Error::NotReadable(stream_id))?;
        if recv.stop_pending.is_none() && !recv.state.is_terminal() {
            recv.stop_pending = Some(error_code);
        }
        Ok(())
    }

    /// Send a PATH_CHALLENGE on the current path.
    pub fn probe_path(&mut self) -> Result<()> {
        if self.state != State::Connected {
            return Err(Error::InvalidState(self.state));
        }
        let mut data = [0u8; 8];
        self.rng.fill_bytes(&mut data);
        self.path_challenge = Some(data);
        self.pending.path_challenge = Some(data);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close with an application error code. Code 0 is a plain local close.
    pub fn close(&mut self, error_code: u64, reason: &str, now: Instant) {
        match self.state {
            State::Idle => {
                self.emit_closed(ConnectionError::LocallyClosed);
                self.enter_closed();
            }
            State::Handshaking | State::Connected => {
                let error = if error_code == 0 {
                    ConnectionError::LocallyClosed
                } else {
                    ConnectionError::ApplicationClose {
                        code: error_code,
                        reason: reason.into(),
                        remote: false,
                    }
                };
                let frame = CloseFrame {
                    is_application: true,
                    code: error_code,
                    frame_type: 0,
                    reason: reason.into(),
                };
                self.start_close(frame, error, now);
            }
            State::Closing | State::Draining | State::Closed => {}
        }
    }

    /// Close after a protocol violation detected locally.
    pub(crate) fn fail(&mut self, error: TransportError, frame_type: Option<u64>, reason: &str, now: Instant) {
        if !matches!(self.state, State::Handshaking | State::Connected) {
            return;
        }
        warn!(%error, ?frame_type, reason, "closing connection");
        let frame = CloseFrame {
            is_application: false,
            code: error.to_code(),
            frame_type: frame_type.unwrap_or(0),
            reason: reason.into(),
        };
        self.start_close(frame, ConnectionError::local_transport(error, frame_type, reason), now);
    }

    /// [`fail`](Self::fail) for an error raised while processing a frame.
    pub(crate) fn fail_on(&mut self, error: Error, frame_type: Option<u64>, now: Instant) {
        match error {
            Error::Transport(e) => self.fail(e, frame_type, &e.to_string(), now),
            other => self.fail(TransportError::InternalError, frame_type, &other.to_string(), now),
        }
    }

    fn start_close(&mut self, frame: CloseFrame, error: ConnectionError, _now: Instant) {
        debug!(from = ?self.state, %error, "closing");
        self.emit_closed(error);
        self.close_frame = Some(frame);
        self.state = State::Closing;
        self.pending = Pending::default();
    }

    pub(crate) fn emit_closed(&mut self, error: ConnectionError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
            self.events.push_back(Event::ConnectionClosed(error));
        }
    }

    pub(crate) fn enter_draining(&mut self, now: Instant) {
        let period = (3 * self.loss.rtt.get()).max(MIN_DRAIN_PERIOD);
        self.state = State::Draining;
        self.draining_deadline = Some(now + period);
        debug!(period_us = period, "draining");
    }

    /// Release every stream and key.
    pub(crate) fn enter_closed(&mut self) {
        debug!(from = ?self.state, "closed");
        self.state = State::Closed;
        self.keys.discard_all();
        self.streams = StreamMap::new(0, 0, 0);
        for space in SpaceId::ALL {
            let bytes = self.loss.discard_space(space);
            self.congestion.on_packets_discarded(bytes);
            self.spaces[space.index()].discard();
        }
        self.blocked_writers.clear();
        self.close_frame = None;
        self.close_datagram = None;
        self.handshake_deadline = None;
        self.draining_deadline = None;
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Effective idle timeout: the smaller non-zero of both sides, and no
    /// less than three PTOs.
    fn idle_timeout(&self) -> Option<u64> {
        let local = self.config.idle_timeout.as_micros() as u64;
        let peer = self.peer_params.as_ref().map_or(0, |p| p.max_idle_timeout * 1000);
        let timeout = match (local, peer) {
            (0, 0) => return None,
            (0, t) | (t, 0) => t,
            (a, b) => a.min(b),
        };
        let max_ack_delay = self.peer_params.as_ref().map_or(25, |p| p.max_ack_delay) * 1000;
        Some(timeout.max(3 * (self.loss.rtt.pto_base() + max_ack_delay)))
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.idle_timeout().map(|t| self.last_activity + t)
    }

    /// Earliest time [`handle_timeout`](Self::handle_timeout) has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            State::Idle | State::Closed => None,
            State::Closing | State::Draining => self.draining_deadline,
            State::Handshaking | State::Connected => {
                let acks = SpaceId::ALL
                    .into_iter()
                    .filter_map(|s| self.spaces[s.index()].ack_deadline());
                [
                    self.loss.timer(),
                    self.idle_deadline(),
                    self.handshake_deadline,
                    self.pacing_deadline,
                ]
                .into_iter()
                .flatten()
                .chain(acks)
                .min()
            }
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            State::Idle | State::Closed => return,
            State::Closing | State::Draining => {
                if self.draining_deadline.is_some_and(|d| now >= d) {
                    self.enter_closed();
                }
                return;
            }
            State::Handshaking | State::Connected => {}
        }

        if self.idle_deadline().is_some_and(|d| now >= d) {
            debug!("idle timeout");
            self.emit_closed(ConnectionError::IdleTimeout);
            self.enter_closed();
            return;
        }
        if self.state == State::Handshaking && self.handshake_deadline.is_some_and(|d| now >= d) {
            warn!("handshake timed out");
            self.emit_closed(ConnectionError::HandshakeTimeout);
            self.enter_closed();
            return;
        }
        if self.pacing_deadline.is_some_and(|d| now >= d) {
            self.pacing_deadline = None;
        }

        match self.loss.on_timeout(now) {
            Some(Timeout::Lost { space, lost }) => self.on_packets_lost(space, lost, now),
            Some(Timeout::Probe(space)) => self.on_probe_timeout(space),
            None => {}
        }
        self.set_loss_timer(now);
    }

    pub(crate) fn set_loss_timer(&mut self, now: Instant) {
        self.loss.set_timer(
            now,
            self.handshake_confirmed,
            self.keys.has(Level::Handshake),
            self.peer_validated,
        );
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    fn on_probe_timeout(&mut self, space: SpaceId) {
        let frames = self
            .loss
            .space(space)
            .oldest_ack_eliciting()
            .map(|p| p.frames.clone())
            .unwrap_or_default();
        for frame in &frames {
            self.requeue_frame(space, frame);
        }
        self.probes[space.index()] = PROBE_PACKETS;
    }

    pub(crate) fn on_packets_lost(&mut self, space: SpaceId, lost: Vec<SentPacket>, now: Instant) {
        for packet in lost {
            self.stats.packets_lost += 1;
            if packet.in_flight {
                self.congestion.on_packet_lost(packet.size, packet.time_sent, now);
            }
            for frame in &packet.frames {
                self.requeue_frame(space, frame);
            }
        }
    }

    /// Packets whose content must be resent although they were never
    /// declared lost (0-RTT rejected, Retry).
    pub(crate) fn resend_all(&mut self, space: SpaceId) {
        for packet in self.loss.drain_space(space) {
            if packet.in_flight {
                self.congestion.on_packets_discarded(packet.size);
            }
            for frame in &packet.frames {
                self.requeue_frame(space, frame);
            }
        }
    }

    pub(crate) fn requeue_frame(&mut self, space: SpaceId, frame: &SentFrame) {
        match *frame {
            SentFrame::Crypto { offset, len } => {
                self.spaces[space.index()]
                    .crypto_send
                    .on_lost(SentFrame::stream_range(offset, len), false);
            }
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) {
                    if send.reset.is_none() {
                        send.buf.on_lost(SentFrame::stream_range(offset, len), fin);
                    }
                }
            }
            SentFrame::ResetStream { id } => {
                if let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) {
                    if send.state == SendStreamState::ResetSent {
                        send.reset_pending = true;
                    }
                }
            }
            SentFrame::StopSending { id } => {
                if let Some(recv) = self.streams.get_mut(id).and_then(|s| s.recv.as_mut()) {
                    if !recv.state.is_terminal() {
                        recv.stop_sent = false;
                    }
                }
            }
            SentFrame::MaxData => self.pending.max_data = true,
            SentFrame::MaxStreamData { id } => {
                self.pending.max_stream_data.insert(id);
            }
            SentFrame::MaxStreams(dir) => self.pending.max_streams[dir.index()] = true,
            SentFrame::RetireConnectionId(seq) => self.cids.requeue_retire(seq),
            SentFrame::DataBlocked
            | SentFrame::StreamDataBlocked { .. }
            | SentFrame::StreamsBlocked(_)
            | SentFrame::Ping => {}
        }
    }

    pub(crate) fn on_frame_acked(&mut self, space: SpaceId, frame: &SentFrame) {
        match *frame {
            SentFrame::Crypto { offset, len } => {
                self.spaces[space.index()]
                    .crypto_send
                    .on_acked(SentFrame::stream_range(offset, len), false);
            }
            SentFrame::Stream { id, offset, len, fin } => {
                let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) else {
                    return;
                };
                if send.reset.is_some() {
                    return;
                }
                send.buf.on_acked(SentFrame::stream_range(offset, len), fin);
                if send.state == SendStreamState::DataSent && send.buf.is_fully_acked() {
                    send.state = SendStreamState::DataRecvd;
                    self.events.push_back(Event::StreamFinished(id));
                }
            }
            SentFrame::ResetStream { id } => {
                if let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) {
                    send.state = SendStreamState::ResetRecvd;
                    send.reset_pending = false;
                }
            }
            _ => {}
        }
    }

    /// Retire Initial or Handshake: keys, sent packets and the space.
    pub(crate) fn discard_space(&mut self, level: Level) {
        let space = level.space();
        if self.spaces[space.index()].is_discarded() {
            return;
        }
        self.keys.discard(level);
        let bytes = self.loss.discard_space(space);
        self.congestion.on_packets_discarded(bytes);
        self.spaces[space.index()].discard();
        self.probes[space.index()] = 0;
    }
}
