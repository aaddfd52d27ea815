//! Receive path: datagram → packets → frames.

use std::ops::Range;

use bytes::Bytes;
use tracing::{debug, info, trace};

use super::{Connection, Event, State};
use crate::crypto::Level;
use crate::error::{ConnectionError, Error, Result, TransportError};
use crate::frame::{
    AckFrame, ConnectionCloseFrame, Frame, Frames, MaxStreamDataFrame, ResetStreamFrame, StopSendingFrame,
    StreamFrame,
};
use crate::packet::protect::{self, Opened};
use crate::packet::short_header::KEY_PHASE_BIT;
use crate::packet::{decode_pn, CoalescedPackets, Header, PartialDecode};
use crate::transport::space::SpaceId;
use crate::transport::stream::{client_can_recv, client_can_send, Dir};
use crate::transport::Instant;
use crate::varint::MAX_VARINT;

/// PATH_RESPONSE frames owed at once; further challenges are dropped.
const MAX_PATH_RESPONSES: usize = 4;

impl Connection {
    /// Process one received UDP datagram.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        match self.state {
            State::Idle | State::Closed => return,
            State::Closing | State::Draining => {
                // Answer the peer's retransmissions with our close, once.
                if self.close_datagram.is_some() && self.close_resends > 0 {
                    self.close_resends -= 1;
                    self.close_resend_due = true;
                }
                return;
            }
            State::Handshaking | State::Connected => {}
        }
        self.stats.bytes_received += datagram.len() as u64;

        let mut authenticated = false;
        for item in CoalescedPackets::new(datagram, self.config.local_cid_len) {
            let (partial, packet) = match item {
                Ok(item) => item,
                Err(e) => {
                    trace!(error = %e, "undecodable packet header");
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            authenticated |= self.handle_packet(partial, packet, now);
            if !matches!(self.state, State::Handshaking | State::Connected) {
                return;
            }
        }

        if !authenticated && self.cids.is_stateless_reset(datagram) {
            info!("stateless reset");
            self.emit_closed(ConnectionError::StatelessReset);
            self.enter_draining(now);
        }
    }

    /// Returns whether the packet authenticated.
    fn handle_packet(&mut self, partial: PartialDecode, packet: &[u8], now: Instant) -> bool {
        match &partial.header {
            Header::VersionNegotiation { dcid, versions, .. } => {
                if *dcid == self.cids.local {
                    self.on_version_negotiation(versions);
                }
                return false;
            }
            Header::Retry { scid, token, .. } => {
                self.on_retry(scid, token, packet);
                return false;
            }
            Header::Initial { version, .. } | Header::Long { version, .. } if *version != self.version => {
                trace!(version, "dropping packet with other version");
                return false;
            }
            _ => {}
        }
        if *partial.header.dcid() != self.cids.local {
            trace!(dcid = ?partial.header.dcid(), "dropping packet for other connection id");
            self.stats.packets_dropped += 1;
            return false;
        }
        let level = match partial.header.level() {
            Some(level @ (Level::Initial | Level::Handshake | Level::OneRtt)) => level,
            _ => return false,
        };
        if let Header::Initial { token, .. } = &partial.header {
            if !token.is_empty() {
                trace!("dropping server initial with token");
                return false;
            }
        }
        if let (Header::Initial { scid, .. } | Header::Long { scid, .. }, Some(server)) =
            (&partial.header, &self.server_scid)
        {
            if scid != server {
                trace!(?scid, "dropping packet from other server connection id");
                return false;
            }
        }

        let space = level.space();
        if self.spaces[space.index()].is_discarded() {
            return false;
        }

        let mut buf = packet.to_vec();
        let opened = match self.open_packet(level, &mut buf, partial.pn_offset) {
            Ok(opened) => opened,
            Err(e) => {
                trace!(?level, error = %e, "dropping undecryptable packet");
                self.stats.packets_dropped += 1;
                return false;
            }
        };
        if self.spaces[space.index()].is_duplicate(opened.pn) {
            trace!(?level, pn = opened.pn, "duplicate packet");
            return true;
        }
        if !opened.reserved_bits_valid() {
            self.fail(TransportError::ProtocolViolation, None, "reserved bits set", now);
            return true;
        }

        if self.server_scid.is_none() {
            if let Header::Initial { scid, .. } = &partial.header {
                self.server_scid = Some(scid.clone());
                self.cids.set_remote(scid.clone());
            }
        }
        self.received_valid_packet = true;
        self.last_activity = now;
        self.eliciting_since_recv = false;
        self.stats.packets_received += 1;
        trace!(?level, pn = opened.pn, len = packet.len(), "packet received");

        let payload = &buf[opened.header_len..opened.header_len + opened.payload_len];
        let mut ack_eliciting = false;
        for frame in Frames::new(payload) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.fail_on(e, None, now);
                    return true;
                }
            };
            let frame_type = frame.ty();
            if !frame.allowed_at(level) {
                self.fail(
                    TransportError::ProtocolViolation,
                    Some(frame_type),
                    "frame not allowed at this encryption level",
                    now,
                );
                return true;
            }
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(e) = self.handle_frame(level, frame, now) {
                self.fail_on(e, Some(frame_type), now);
                return true;
            }
            if !matches!(self.state, State::Handshaking | State::Connected) {
                return true;
            }
        }

        let space = &mut self.spaces[space.index()];
        if !space.is_discarded() {
            space.on_packet_received(
                opened.pn,
                ack_eliciting,
                level != Level::OneRtt,
                self.config.max_ack_delay,
                now,
            );
        }
        true
    }

    /// Remove packet protection. 1-RTT packets with a flipped key phase are
    /// tried with the next generation of keys and, if they authenticate,
    /// complete the peer's key update.
    fn open_packet(&mut self, level: Level, buf: &mut [u8], pn_offset: usize) -> Result<Opened> {
        let largest = self.spaces[level.space().index()].largest_received();
        if level != Level::OneRtt {
            let keys = self.keys.remote(level).ok_or(Error::InvalidKey)?;
            return protect::open(keys, buf, pn_offset, largest);
        }

        let keys = self.keys.one_rtt.as_mut().ok_or(Error::InvalidKey)?;
        let unprotected = protect::remove_header_protection(&*keys.remote.header, buf, pn_offset)?;
        let pn = decode_pn(unprotected.truncated_pn, unprotected.pn_len, largest);
        let header_len = unprotected.header_len(pn_offset);
        let phase = unprotected.first_byte & KEY_PHASE_BIT != 0;
        let payload_len = if phase == keys.key_phase {
            protect::decrypt_payload(&keys.remote.packet, pn, buf, header_len)?
        } else {
            let len = protect::decrypt_payload(keys.next_remote()?, pn, buf, header_len)?;
            keys.promote()?;
            self.stats.key_updates += 1;
            len
        };
        Ok(Opened {
            pn,
            first_byte: unprotected.first_byte,
            header_len,
            payload_len,
        })
    }

    fn handle_frame(&mut self, level: Level, frame: Frame<'_>, now: Instant) -> Result<()> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_frame(level.space(), &ack, now)?,
            Frame::Crypto(crypto) => self.on_crypto_frame(level, &crypto, now)?,
            Frame::Stream(stream) => self.on_stream_frame(&stream, now)?,
            Frame::ResetStream(reset) => self.on_reset_stream(&reset, now)?,
            Frame::StopSending(stop) => self.on_stop_sending(&stop, now)?,
            Frame::MaxData(max) => {
                if self.flow.send.raise(max) {
                    self.wake_writers();
                }
            }
            Frame::MaxStreamData(max) => self.on_max_stream_data(&max, now)?,
            Frame::MaxStreams(max) => {
                if max.max_streams > 1 << 60 {
                    return Err(TransportError::FrameEncodingError.into());
                }
                let dir = if max.bidirectional { Dir::Bi } else { Dir::Uni };
                if self.streams.on_max_streams(dir, max.max_streams) {
                    debug!(?dir, max = max.max_streams, "stream limit raised");
                    self.events.push_back(Event::StreamsAvailable(dir));
                }
            }
            Frame::DataBlocked(limit) => trace!(limit, "peer blocked on connection flow control"),
            Frame::StreamDataBlocked(blocked) => {
                if !client_can_recv(blocked.stream_id) {
                    return Err(TransportError::StreamStateError.into());
                }
                trace!(stream_id = blocked.stream_id, limit = blocked.data_limit, "peer blocked on stream");
            }
            Frame::StreamsBlocked(blocked) => {
                trace!(bidirectional = blocked.bidirectional, limit = blocked.max_streams, "peer blocked on streams");
            }
            Frame::NewConnectionId(new_cid) => self.cids.on_new_connection_id(&new_cid)?,
            Frame::RetireConnectionId(seq) => {
                // We never issue more than the handshake connection ID.
                if seq != 0 {
                    return Err(TransportError::ProtocolViolation.into());
                }
            }
            Frame::PathChallenge(data) => {
                if self.pending.path_responses.len() < MAX_PATH_RESPONSES {
                    self.pending.path_responses.push_back(data);
                }
            }
            Frame::PathResponse(data) => {
                if self.path_challenge == Some(data) {
                    debug!("path validated");
                    self.path_challenge = None;
                    self.pending.path_challenge = None;
                    self.events.push_back(Event::PathValidated);
                }
            }
            Frame::NewToken(token) => {
                if token.is_empty() {
                    return Err(TransportError::FrameEncodingError.into());
                }
                debug!(len = token.len(), "new token");
                self.new_token = Some(Bytes::copy_from_slice(token));
            }
            Frame::ConnectionClose(close) => self.on_connection_close(&close, now),
            Frame::HandshakeDone => self.on_handshake_done()?,
        }
        Ok(())
    }

    fn on_ack_frame(&mut self, space: SpaceId, ack: &AckFrame<'_>, now: Instant) -> Result<()> {
        let mut ranges: Vec<Range<u64>> = ack.ranges().collect();
        ranges.reverse();
        let Some(end) = ranges.last().map(|r| r.end) else {
            return Ok(());
        };
        if end > self.spaces[space.index()].peek_pn() {
            return Err(TransportError::ProtocolViolation.into());
        }
        self.spaces[space.index()].on_ack_received(end - 1);

        let exponent = self.peer_params.as_ref().map_or(3, |p| p.ack_delay_exponent).min(20);
        let ack_delay = ack.ack_delay.saturating_mul(1 << exponent);
        let outcome = self
            .loss
            .on_ack_received(space, &ranges, ack_delay, self.handshake_confirmed, now);
        for packet in &outcome.acked {
            if packet.in_flight {
                self.congestion.on_packet_acked(packet.size, packet.time_sent);
            }
            for frame in &packet.frames {
                self.on_frame_acked(space, frame);
            }
        }
        self.on_packets_lost(space, outcome.lost, now);
        if outcome.persistent_congestion {
            debug!("persistent congestion");
            self.congestion.on_persistent_congestion();
        }
        if space == SpaceId::Handshake {
            self.peer_validated = true;
        }
        self.set_loss_timer(now);
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: &StreamFrame<'_>, now: Instant) -> Result<()> {
        let id = frame.stream_id;
        if !client_can_recv(id) {
            return Err(TransportError::StreamStateError.into());
        }
        if frame.offset + frame.data.len() as u64 > MAX_VARINT {
            return Err(TransportError::FrameEncodingError.into());
        }
        let mut opened = Vec::new();
        let (grown, readable) = match self.streams.get_or_open_remote(id, now, &mut opened)? {
            Some(stream) => {
                let recv = stream.recv.as_mut().ok_or(TransportError::StreamStateError)?;
                let grown = recv.on_data(frame.offset, frame.data, frame.fin)?;
                (grown, recv.is_readable())
            }
            None => (0, false),
        };
        self.flow.recv.on_received(grown)?;
        self.events.extend(opened.into_iter().map(Event::StreamOpened));
        if readable {
            self.events.push_back(Event::StreamReadable(id));
        }
        Ok(())
    }

    fn on_reset_stream(&mut self, frame: &ResetStreamFrame, now: Instant) -> Result<()> {
        let id = frame.stream_id;
        if !client_can_recv(id) {
            return Err(TransportError::StreamStateError.into());
        }
        let mut opened = Vec::new();
        let (grown, released) = match self.streams.get_or_open_remote(id, now, &mut opened)? {
            Some(stream) => {
                let recv = stream.recv.as_mut().ok_or(TransportError::StreamStateError)?;
                let was_reset = recv.reset_code.is_some();
                let read_offset = recv.asm.read_offset();
                let grown = recv.on_reset(frame.error_code, frame.final_size)?;
                let newly_reset = !was_reset && recv.reset_code.is_some();
                (grown, newly_reset.then(|| frame.final_size - read_offset))
            }
            None => (0, None),
        };
        self.flow.recv.on_received(grown)?;
        self.events.extend(opened.into_iter().map(Event::StreamOpened));
        if let Some(unread) = released {
            // Unread bytes of a reset stream no longer hold connection credit.
            self.flow.recv.on_consumed(unread);
            debug!(stream_id = id, error_code = frame.error_code, "stream reset by peer");
            self.events.push_back(Event::StreamReset {
                stream_id: id,
                error_code: frame.error_code,
            });
        }
        Ok(())
    }

    fn on_stop_sending(&mut self, frame: &StopSendingFrame, now: Instant) -> Result<()> {
        let id = frame.stream_id;
        if !client_can_send(id) {
            return Err(TransportError::StreamStateError.into());
        }
        let mut opened = Vec::new();
        let stopped = match self.streams.get_or_open_remote(id, now, &mut opened)? {
            Some(stream) => {
                let send = stream.send.as_mut().ok_or(TransportError::StreamStateError)?;
                if send.stopped.is_none() {
                    send.stopped = Some(frame.error_code);
                    send.reset(frame.error_code);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.events.extend(opened.into_iter().map(Event::StreamOpened));
        if stopped {
            debug!(stream_id = id, error_code = frame.error_code, "peer sent stop sending");
            self.blocked_writers.remove(&id);
            self.events.push_back(Event::StopSending {
                stream_id: id,
                error_code: frame.error_code,
            });
        }
        Ok(())
    }

    fn on_max_stream_data(&mut self, frame: &MaxStreamDataFrame, now: Instant) -> Result<()> {
        let id = frame.stream_id;
        if !client_can_send(id) {
            return Err(TransportError::StreamStateError.into());
        }
        let mut opened = Vec::new();
        let raised = match self.streams.get_or_open_remote(id, now, &mut opened)? {
            Some(stream) => stream
                .send
                .as_mut()
                .ok_or(TransportError::StreamStateError)?
                .window
                .raise(frame.max_data),
            None => false,
        };
        self.events.extend(opened.into_iter().map(Event::StreamOpened));
        if raised && self.blocked_writers.contains(&id) {
            self.wake_writers();
        }
        Ok(())
    }

    fn on_connection_close(&mut self, frame: &ConnectionCloseFrame<'_>, now: Instant) {
        let reason = String::from_utf8_lossy(frame.reason).into_owned();
        let error = if frame.is_application {
            ConnectionError::ApplicationClose {
                code: frame.error_code,
                reason,
                remote: true,
            }
        } else {
            ConnectionError::TransportClose {
                code: frame.error_code,
                frame_type: (frame.frame_type != 0).then_some(frame.frame_type),
                reason,
                remote: true,
            }
        };
        info!(%error, "connection closed by peer");
        self.emit_closed(error);
        self.close_frame = None;
        self.enter_draining(now);
    }
}
