//! Transmit path: frames → packets → one datagram per call.

use tracing::{trace, warn};

use super::{Connection, State, MAX_REASON_LEN};
use crate::crypto::{Level, TAG_LEN};
use crate::error::{Error, Result, TransportError};
use crate::frame::{
    crypto_header_len, encode, encode_ack, stream_header_len, ConnectionCloseFrame, CryptoFrame, Frame,
    MaxStreamDataFrame, MaxStreamsFrame, ResetStreamFrame, StopSendingFrame, StreamDataBlockedFrame,
    StreamFrame,
};
use crate::packet::long_header::{long_header_len, LongHeader};
use crate::packet::protect::{self, MIN_PN_AND_PAYLOAD};
use crate::packet::{write_long_header, write_short_header, LongType, MIN_INITIAL_SIZE};
use crate::transport::recovery::{SentFrame, SentPacket};
use crate::transport::space::SpaceId;
use crate::transport::stream::{Dir, SendStreamState};
use crate::transport::Instant;

/// Below this much room left in a datagram no further packet is started.
const MIN_PACKET_ROOM: usize = 64;

/// One packet's plaintext, ready to be numbered and sealed.
struct PacketBuilder {
    level: Level,
    pn: u64,
    pn_len: usize,
    header_len: usize,
    payload: Vec<u8>,
    frames: Vec<SentFrame>,
    ack_eliciting: bool,
    /// Payload bytes the packet may hold (tag excluded).
    limit: usize,
    padded: bool,
}

impl PacketBuilder {
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.payload.len())
    }

    /// Append `frame` if it fits. `sent` is what to remember for loss
    /// recovery.
    fn push(&mut self, frame: &Frame<'_>, sent: Option<SentFrame>) -> bool {
        if !frame.allowed_at(self.level) {
            return false;
        }
        let mark = self.payload.len();
        encode(frame, &mut self.payload);
        if self.payload.len() > self.limit {
            self.payload.truncate(mark);
            return false;
        }
        self.ack_eliciting |= frame.is_ack_eliciting();
        self.frames.extend(sent);
        true
    }

    fn pad_to(&mut self, payload_len: usize) {
        if self.payload.len() < payload_len {
            self.payload.resize(payload_len, 0);
            self.padded = true;
        }
    }

    fn sealed_len(&self) -> usize {
        self.header_len + self.payload.len() + TAG_LEN
    }
}

fn long_type(level: Level) -> LongType {
    match level {
        Level::Initial => LongType::Initial,
        Level::ZeroRtt => LongType::ZeroRtt,
        Level::Handshake | Level::OneRtt => LongType::Handshake,
    }
}

/// Cut `reason` to at most `max` bytes on a char boundary.
fn truncate_reason(reason: &str, max: usize) -> &str {
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

impl Connection {
    /// Next datagram to send, if any. Call until it returns `None` after
    /// every input (datagram, timeout or API call).
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.state {
            State::Idle | State::Closed => None,
            State::Draining => {
                if self.close_resend_due {
                    self.close_resend_due = false;
                    return self.close_datagram.clone();
                }
                None
            }
            State::Closing => self.transmit_close(now),
            State::Handshaking | State::Connected => self.transmit_data(now),
        }
    }

    fn header_len(&self, level: Level, pn_len: usize) -> usize {
        match level {
            Level::OneRtt => 1 + self.cids.remote().len() + pn_len,
            _ => long_header_len(&self.long_header(level), pn_len),
        }
    }

    fn long_header(&self, level: Level) -> LongHeader<'_> {
        LongHeader {
            ty: long_type(level),
            version: self.version,
            dcid: self.cids.remote(),
            scid: &self.cids.local,
            token: if level == Level::Initial { &self.token[..] } else { &[] },
        }
    }

    fn builder(&self, level: Level, room: usize) -> Option<PacketBuilder> {
        let space = &self.spaces[level.space().index()];
        let pn = space.peek_pn();
        let pn_len = space.pn_len(pn);
        let header_len = self.header_len(level, pn_len);
        let limit = room.checked_sub(header_len + TAG_LEN)?;
        Some(PacketBuilder {
            level,
            pn,
            pn_len,
            header_len,
            payload: Vec::with_capacity(limit),
            frames: Vec::new(),
            ack_eliciting: false,
            limit,
            padded: false,
        })
    }

    /// Level carrying application data: 1-RTT once available, 0-RTT before.
    fn data_level(&self) -> Option<Level> {
        if self.keys.has(Level::OneRtt) {
            Some(Level::OneRtt)
        } else if self.keys.has(Level::ZeroRtt) {
            Some(Level::ZeroRtt)
        } else {
            None
        }
    }

    fn transmit_data(&mut self, now: Instant) -> Option<Vec<u8>> {
        let mds = self.config.max_datagram_size;
        for id in self.streams.collect_closed() {
            self.blocked_writers.remove(&id);
        }

        let mut can_send = self.congestion.can_send(mds as u64);
        if can_send {
            if let Some(pacer) = self.pacer.as_mut() {
                self.pacing_deadline = pacer.delay(mds as u64, self.congestion.cwnd(), self.loss.rtt.get(), now);
                can_send = self.pacing_deadline.is_none();
            }
        }

        let levels = [Some(Level::Initial), Some(Level::Handshake), self.data_level()];
        let mut packets: Vec<PacketBuilder> = Vec::new();
        let mut size = 0;
        for level in levels.into_iter().flatten() {
            let space = &self.spaces[level.space().index()];
            if space.is_discarded() || !self.keys.has(level) {
                continue;
            }
            let room = mds.saturating_sub(size);
            if room < MIN_PACKET_ROOM {
                break;
            }
            if let Some(packet) = self.build_packet(level, room, can_send, now) {
                size += packet.sealed_len();
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            return None;
        }

        for packet in &mut packets {
            let min = MIN_PN_AND_PAYLOAD.saturating_sub(packet.pn_len);
            packet.pad_to(min);
        }
        // Datagrams carrying an Initial are padded to 1200 bytes
        // (RFC 9000 §14.1).
        if packets.iter().any(|p| p.level == Level::Initial) {
            let total: usize = packets.iter().map(PacketBuilder::sealed_len).sum();
            if let Some(last) = packets.last_mut() {
                if total < MIN_INITIAL_SIZE {
                    let len = last.payload.len() + MIN_INITIAL_SIZE - total;
                    last.pad_to(len);
                }
            }
        }

        let mut datagram = Vec::with_capacity(mds.max(MIN_INITIAL_SIZE));
        let mut sent_handshake = false;
        for packet in packets {
            let (pn, sealed) = match self.seal_packet(&packet) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(error = %e, "packet protection failed");
                    self.fail(TransportError::InternalError, None, "packet protection failed", now);
                    return None;
                }
            };
            let space = packet.level.space();
            let in_flight = packet.ack_eliciting || packet.padded;
            let size = sealed.len() as u64;
            trace!(level = ?packet.level, pn, size, ack_eliciting = packet.ack_eliciting, "packet sent");
            self.loss.on_packet_sent(
                space,
                SentPacket {
                    pn,
                    time_sent: now,
                    size,
                    ack_eliciting: packet.ack_eliciting,
                    in_flight,
                    frames: packet.frames,
                },
            );
            if in_flight {
                self.congestion.on_packet_sent(size);
            }
            if packet.ack_eliciting && !self.eliciting_since_recv {
                // The idle timer restarts on the first ack-eliciting packet
                // sent after a receive (RFC 9000 §10.1).
                self.last_activity = now;
                self.eliciting_since_recv = true;
            }
            sent_handshake |= packet.level == Level::Handshake;
            self.stats.packets_sent += 1;
            datagram.extend_from_slice(&sealed);
        }

        // A client drops Initial keys once it sends its first Handshake
        // packet (RFC 9001 §4.9.1).
        if sent_handshake {
            self.discard_space(Level::Initial);
        }
        self.stats.bytes_sent += datagram.len() as u64;
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.on_sent(datagram.len() as u64);
        }
        self.set_loss_timer(now);
        Some(datagram)
    }

    /// Fill one packet for `level`. `None` if there is nothing worth
    /// sending.
    fn build_packet(&mut self, level: Level, room: usize, can_send: bool, now: Instant) -> Option<PacketBuilder> {
        let mut packet = self.builder(level, room)?;
        let idx = level.space().index();
        let probe = self.probes[idx] > 0;

        let mut has_ack = false;
        let space = &self.spaces[idx];
        if level != Level::ZeroRtt && space.wants_ack() && space.has_ack_ranges() {
            let mut ack = Vec::new();
            let delay = space.ack_delay(now, self.config.ack_delay_exponent);
            encode_ack(&mut ack, &space.ack_ranges(), delay, None);
            if ack.len() <= packet.remaining() {
                packet.payload.extend_from_slice(&ack);
                has_ack = true;
            }
        }
        let ack_due = self.spaces[idx].ack_due(now);

        if can_send || probe {
            self.push_crypto(&mut packet);
            if level.space() == SpaceId::Data {
                self.push_control(&mut packet, now);
                self.push_streams(&mut packet);
            }
            if probe && !packet.ack_eliciting {
                packet.push(&Frame::Ping, Some(SentFrame::Ping));
            }
        }

        if !packet.ack_eliciting && !(has_ack && ack_due) {
            return None;
        }
        if probe && packet.ack_eliciting {
            self.probes[idx] -= 1;
        }
        if has_ack {
            self.spaces[idx].on_ack_sent();
        }
        Some(packet)
    }

    fn push_crypto(&mut self, packet: &mut PacketBuilder) {
        if packet.level == Level::ZeroRtt {
            return;
        }
        let crypto = &mut self.spaces[packet.level.space().index()].crypto_send;
        while crypto.has_pending() {
            let overhead = crypto_header_len(crypto.end(), packet.remaining());
            if packet.remaining() <= overhead {
                break;
            }
            let Some((offset, data, _)) = crypto.poll_transmit(packet.remaining() - overhead) else {
                break;
            };
            let len = data.len() as u64;
            let frame = Frame::Crypto(CryptoFrame { offset, data: &data });
            if !packet.push(&frame, Some(SentFrame::Crypto { offset, len })) {
                crypto.on_lost(SentFrame::stream_range(offset, len), false);
                break;
            }
        }
    }

    /// Flow control, stream limit and path frames, then resets.
    fn push_control(&mut self, packet: &mut PacketBuilder, now: Instant) {
        let srtt = self.loss.rtt.get();

        if packet.level == Level::OneRtt {
            while let Some(&data) = self.pending.path_responses.front() {
                if !packet.push(&Frame::PathResponse(data), None) {
                    break;
                }
                self.pending.path_responses.pop_front();
            }
            if let Some(data) = self.pending.path_challenge {
                if packet.push(&Frame::PathChallenge(data), None) {
                    self.pending.path_challenge = None;
                }
            }
            while let Some(seq) = self.cids.poll_retire() {
                if !packet.push(&Frame::RetireConnectionId(seq), Some(SentFrame::RetireConnectionId(seq))) {
                    self.cids.requeue_retire(seq);
                    break;
                }
            }
        }

        let max_data = self
            .flow
            .recv
            .poll_update(now, srtt)
            .or_else(|| self.pending.max_data.then(|| self.flow.recv.advertised()));
        if let Some(limit) = max_data {
            if packet.push(&Frame::MaxData(limit), Some(SentFrame::MaxData)) {
                self.flow.recv.on_update_sent(limit, now);
                self.pending.max_data = false;
            } else {
                self.pending.max_data = true;
            }
        }

        for id in self.streams.ids() {
            let forced = self.pending.max_stream_data.contains(&id);
            let Some(recv) = self.streams.get_mut(id).and_then(|s| s.recv.as_mut()) else {
                continue;
            };
            if recv.asm.final_size().is_some() || recv.reset_code.is_some() {
                continue;
            }
            let Some(limit) = recv
                .window
                .poll_update(now, srtt)
                .or_else(|| forced.then(|| recv.window.advertised()))
            else {
                continue;
            };
            let frame = Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: id,
                max_data: limit,
            });
            if !packet.push(&frame, Some(SentFrame::MaxStreamData { id })) {
                self.pending.max_stream_data.insert(id);
                break;
            }
            recv.window.on_update_sent(limit, now);
            self.pending.max_stream_data.remove(&id);
        }

        for dir in [Dir::Bi, Dir::Uni] {
            let i = dir.index();
            let Some(max_streams) = self
                .streams
                .poll_max_streams(dir)
                .or_else(|| self.pending.max_streams[i].then(|| self.streams.max_remote(dir)))
            else {
                continue;
            };
            let frame = Frame::MaxStreams(MaxStreamsFrame {
                bidirectional: dir == Dir::Bi,
                max_streams,
            });
            self.pending.max_streams[i] = !packet.push(&frame, Some(SentFrame::MaxStreams(dir)));
        }

        if !self.blocked_writers.is_empty() {
            if let Some(limit) = self.flow.send.poll_blocked() {
                packet.push(&Frame::DataBlocked(limit), Some(SentFrame::DataBlocked));
            }
        }
        for &id in &self.blocked_writers {
            let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) else {
                continue;
            };
            if let Some(limit) = send.window.poll_blocked() {
                let frame = Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: id,
                    data_limit: limit,
                });
                packet.push(&frame, Some(SentFrame::StreamDataBlocked { id }));
            }
        }
        for dir in [Dir::Bi, Dir::Uni] {
            if let Some(limit) = self.streams.poll_streams_blocked(dir) {
                let frame = Frame::StreamsBlocked(MaxStreamsFrame {
                    bidirectional: dir == Dir::Bi,
                    max_streams: limit,
                });
                packet.push(&frame, Some(SentFrame::StreamsBlocked(dir)));
            }
        }

        for stream in self.streams.iter_mut() {
            let id = stream.id;
            if let Some(send) = stream.send.as_mut() {
                if let (true, Some((error_code, final_size))) = (send.reset_pending, send.reset) {
                    let frame = Frame::ResetStream(ResetStreamFrame {
                        stream_id: id,
                        error_code,
                        final_size,
                    });
                    if packet.push(&frame, Some(SentFrame::ResetStream { id })) {
                        send.reset_pending = false;
                    }
                }
            }
            if let Some(recv) = stream.recv.as_mut() {
                if let (false, Some(error_code)) = (recv.stop_sent, recv.stop_pending) {
                    if recv.state.is_terminal() {
                        continue;
                    }
                    let frame = Frame::StopSending(StopSendingFrame { stream_id: id, error_code });
                    if packet.push(&frame, Some(SentFrame::StopSending { id })) {
                        recv.stop_sent = true;
                    }
                }
            }
        }
    }

    /// Stream data, round robin starting after the last stream served.
    fn push_streams(&mut self, packet: &mut PacketBuilder) {
        let mut ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|s| {
                s.send
                    .as_ref()
                    .is_some_and(|send| send.reset.is_none() && send.buf.has_pending())
            })
            .map(|s| s.id)
            .collect();
        let split = ids.partition_point(|&id| id <= self.stream_cursor);
        ids.rotate_left(split);

        for id in ids {
            let remaining = packet.remaining();
            let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) else {
                continue;
            };
            let overhead = stream_header_len(id, send.buf.end(), remaining);
            if remaining <= overhead {
                break;
            }
            let Some((offset, data, fin)) = send.buf.poll_transmit(remaining - overhead) else {
                continue;
            };
            let len = data.len() as u64;
            let frame = Frame::Stream(StreamFrame {
                stream_id: id,
                offset,
                data: &data,
                fin,
            });
            if !packet.push(&frame, Some(SentFrame::Stream { id, offset, len, fin })) {
                send.buf.on_lost(SentFrame::stream_range(offset, len), fin);
                break;
            }
            if fin && send.state == SendStreamState::Send {
                send.state = SendStreamState::DataSent;
            }
            self.stream_cursor = id;
        }
    }

    /// Number, protect and serialize one packet.
    fn seal_packet(&mut self, packet: &PacketBuilder) -> Result<(u64, Vec<u8>)> {
        let pn = self.spaces[packet.level.space().index()].take_pn();
        let mut out = Vec::with_capacity(packet.sealed_len());
        let header_len = match packet.level {
            Level::OneRtt => {
                let key_phase = self.keys.one_rtt.as_ref().is_some_and(|k| k.key_phase);
                write_short_header(&mut out, self.cids.remote(), key_phase, pn, packet.pn_len)
            }
            level => write_long_header(
                &mut out,
                &self.long_header(level),
                pn,
                packet.pn_len,
                packet.payload.len() + TAG_LEN,
            ),
        };
        debug_assert_eq!(header_len, packet.header_len);
        out.extend_from_slice(&packet.payload);
        let keys = self.keys.local(packet.level).ok_or(Error::InvalidKey)?;
        protect::seal(keys, pn, &mut out, header_len, packet.pn_len)?;
        Ok((pn, out))
    }

    /// Send the pending CONNECTION_CLOSE at the highest level available,
    /// then drain.
    fn transmit_close(&mut self, now: Instant) -> Option<Vec<u8>> {
        let close = self.close_frame.take()?;
        let level = [Level::OneRtt, Level::Handshake, Level::Initial]
            .into_iter()
            .find(|&l| self.keys.has(l) && !self.spaces[l.space().index()].is_discarded());
        let Some(level) = level else {
            self.enter_closed();
            return None;
        };

        // An application close must not reveal application state before
        // 1-RTT (RFC 9000 §10.2.3).
        let (is_application, code, reason) = if close.is_application && level != Level::OneRtt {
            (false, TransportError::ApplicationError.to_code(), "")
        } else {
            (close.is_application, close.code, truncate_reason(&close.reason, MAX_REASON_LEN))
        };
        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            is_application,
            error_code: code,
            frame_type: close.frame_type,
            reason: reason.as_bytes(),
        });

        let mds = self.config.max_datagram_size;
        let Some(mut packet) = self.builder(level, mds) else {
            self.enter_draining(now);
            return None;
        };
        if !packet.push(&frame, None) {
            self.enter_draining(now);
            return None;
        }
        packet.pad_to(MIN_PN_AND_PAYLOAD.saturating_sub(packet.pn_len));
        if level == Level::Initial {
            let len = packet.payload.len() + MIN_INITIAL_SIZE.saturating_sub(packet.sealed_len());
            packet.pad_to(len);
        }
        let datagram = match self.seal_packet(&packet) {
            Ok((_, datagram)) => datagram,
            Err(e) => {
                warn!(error = %e, "cannot protect connection close");
                self.enter_closed();
                return None;
            }
        };
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        self.close_datagram = Some(datagram.clone());
        self.enter_draining(now);
        Some(datagram)
    }
}
