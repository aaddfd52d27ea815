//! Handshake orchestration: ClientHello, CRYPTO reassembly into the TLS
//! session, key installation, transport parameter checks, 0-RTT, Retry and
//! Version Negotiation.

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{CloseFrame, Connection, EarlyData, Event, State};
use crate::crypto::Level;
use crate::error::{ConnectionError, Error, Result, TransportError};
use crate::frame::{ty, CryptoFrame};
use crate::packet::{retry, ConnectionId};
use crate::tls::{ClientHelloParams, HandshakeState, TlsError, TransportParams};
use crate::transport::space::SpaceId;
use crate::transport::Instant;

/// Out-of-order CRYPTO data buffered per level before the connection fails
/// with CRYPTO_BUFFER_EXCEEDED.
const MAX_CRYPTO_BUFFER: u64 = 64 * 1024;

impl Connection {
    /// Start the handshake: derive Initial keys, queue the ClientHello and,
    /// when a resumed session allows it, install 0-RTT keys.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState(self.state));
        }
        self.keys.set_initial(&self.original_dcid, self.version)?;

        let mut params = self.config.transport_params();
        params.initial_source_connection_id = Some(self.cids.local.clone());
        let encoded = params.to_vec();
        let hello = self
            .tls
            .start_handshake(&ClientHelloParams {
                server_name: &self.server_name,
                alpn_protocols: &self.config.alpn_protocols,
                verify_peer: self.config.verify_peer,
                enable_early_data: self.config.enable_early_data,
                transport_params: &encoded,
            })
            .map_err(|e| Error::Tls(e.to_string()))?;
        self.spaces[SpaceId::Initial.index()].crypto_send.write(&hello);

        self.state = State::Handshaking;
        self.last_activity = now;
        let timeout = self.config.handshake_timeout.as_micros() as u64;
        if timeout > 0 {
            self.handshake_deadline = Some(now + timeout);
        }
        self.start_early_data()?;
        info!(
            server_name = %self.server_name,
            dcid = ?self.original_dcid,
            scid = ?self.cids.local,
            early_data = self.early_data == EarlyData::Sending,
            "connecting"
        );
        Ok(())
    }

    fn start_early_data(&mut self) -> Result<()> {
        if !self.config.enable_early_data {
            return Ok(());
        }
        let params = match self.tls.resumed_transport_params().map(TransportParams::decode) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                debug!(error = %e, "ignoring unusable remembered transport parameters");
                return Ok(());
            }
            None => return Ok(()),
        };
        let Some(secrets) = self.tls.export_level_secret(Level::ZeroRtt) else {
            return Ok(());
        };
        self.keys.install(Level::ZeroRtt, &secrets)?;
        self.streams.apply_peer_params(&params);
        self.flow.send.raise(params.initial_max_data);
        self.early_data = EarlyData::Sending;
        Ok(())
    }

    /// Reassemble CRYPTO data and feed whatever is contiguous to TLS.
    pub(crate) fn on_crypto_frame(&mut self, level: Level, frame: &CryptoFrame<'_>, now: Instant) -> Result<()> {
        let space = &mut self.spaces[level.space().index()];
        let end = frame.offset + frame.data.len() as u64;
        if end.saturating_sub(space.crypto_recv.read_offset()) > MAX_CRYPTO_BUFFER {
            return Err(TransportError::CryptoBufferExceeded.into());
        }
        space.crypto_recv.insert(frame.offset, frame.data, false)?;
        if !space.crypto_recv.has_contiguous() {
            return Ok(());
        }
        let data = space.crypto_recv.read(usize::MAX);

        let (output, tls_state) = match self.tls.process_handshake_data(level, &data) {
            Ok(result) => result,
            Err(e) => {
                self.close_tls_error(e, now);
                return Ok(());
            }
        };
        for (out_level, message) in output.messages {
            self.spaces[out_level.space().index()].crypto_send.write(&message);
        }

        if tls_state != HandshakeState::Started
            && !self.keys.has(Level::Handshake)
            && !self.spaces[SpaceId::Handshake.index()].is_discarded()
        {
            if let Some(secrets) = self.tls.export_level_secret(Level::Handshake) {
                self.keys.install(Level::Handshake, &secrets)?;
            }
        }
        if tls_state == HandshakeState::Complete && !self.handshake_complete {
            let secrets = self
                .tls
                .export_level_secret(Level::OneRtt)
                .ok_or_else(|| Error::Tls("handshake complete without 1-RTT secrets".into()))?;
            self.keys.install(Level::OneRtt, &secrets)?;
            self.on_handshake_complete()?;
        }
        Ok(())
    }

    fn close_tls_error(&mut self, e: TlsError, now: Instant) {
        if !matches!(self.state, State::Handshaking | State::Connected) {
            return;
        }
        warn!(alert = e.alert, reason = %e.reason, "tls handshake failed");
        let frame = CloseFrame {
            is_application: false,
            code: TransportError::crypto_error(e.alert),
            frame_type: ty::CRYPTO,
            reason: e.reason.clone(),
        };
        self.start_close(frame, ConnectionError::Crypto(e.reason), now);
    }

    /// TLS finished: check and apply the server's transport parameters and
    /// settle 0-RTT.
    fn on_handshake_complete(&mut self) -> Result<()> {
        let params = self
            .tls
            .peer_transport_params()
            .ok_or(TransportError::TransportParameterError)
            .and_then(|raw| TransportParams::decode(raw).map_err(|_| TransportError::TransportParameterError))?;
        self.validate_peer_params(&params)?;

        self.streams.apply_peer_params(&params);
        self.flow.send.raise(params.initial_max_data);
        self.loss.set_max_ack_delay(params.max_ack_delay * 1000);
        if let Some(token) = params.stateless_reset_token {
            self.cids.set_reset_token(token);
        }
        self.alpn = self.tls.negotiated_alpn().map(<[u8]>::to_vec);
        self.peer_params = Some(params);
        self.handshake_complete = true;

        if self.early_data == EarlyData::Sending {
            if self.tls.early_data_accepted() == Some(true) {
                self.early_data = EarlyData::Accepted;
            } else {
                self.early_data = EarlyData::Rejected;
                let lost = self.loss.space(SpaceId::Data).iter().count();
                info!(packets = lost, "0-RTT rejected, resending as 1-RTT");
                self.resend_all(SpaceId::Data);
            }
        }
        self.keys.discard(Level::ZeroRtt);
        self.wake_writers();
        info!(alpn = ?self.alpn.as_deref().map(String::from_utf8_lossy), "handshake complete");
        Ok(())
    }

    /// RFC 9000 §7.3: the server must echo the connection IDs it saw.
    fn validate_peer_params(&self, params: &TransportParams) -> Result<(), TransportError> {
        let odcid_ok = params.original_destination_connection_id.as_ref() == Some(&self.original_dcid);
        let iscid_ok = params.initial_source_connection_id.is_some()
            && params.initial_source_connection_id == self.server_scid;
        let retry_ok = params.retry_source_connection_id == self.retry_scid;
        if odcid_ok && iscid_ok && retry_ok {
            Ok(())
        } else {
            warn!(odcid_ok, iscid_ok, retry_ok, "server transport parameters do not match");
            Err(TransportError::TransportParameterError)
        }
    }

    /// Streams that ran out of credit may have some again.
    pub(crate) fn wake_writers(&mut self) {
        let conn_credit = self.flow.send.credit();
        if conn_credit == 0 {
            return;
        }
        let writable: Vec<u64> = self
            .blocked_writers
            .iter()
            .copied()
            .filter(|&id| {
                self.streams
                    .get(id)
                    .and_then(|s| s.send.as_ref())
                    .is_some_and(|s| s.credit() > 0)
            })
            .collect();
        for id in writable {
            self.blocked_writers.remove(&id);
            self.events.push_back(Event::StreamWritable(id));
        }
    }

    /// HANDSHAKE_DONE: the handshake is confirmed (RFC 9001 §4.1.2).
    pub(crate) fn on_handshake_done(&mut self) -> Result<()> {
        if !self.handshake_complete {
            return Err(TransportError::ProtocolViolation.into());
        }
        if self.handshake_confirmed {
            return Ok(());
        }
        self.handshake_confirmed = true;
        self.peer_validated = true;
        self.handshake_deadline = None;
        self.discard_space(Level::Handshake);
        self.state = State::Connected;
        let early_data_accepted = self.early_data == EarlyData::Accepted;
        info!(early_data_accepted, "connected");
        self.events.push_back(Event::Connected {
            alpn: self.alpn.clone(),
            early_data_accepted,
        });
        Ok(())
    }

    /// A Retry packet (RFC 9000 §17.2.5). Accepted once, before any other
    /// packet from the server.
    pub(crate) fn on_retry(&mut self, scid: &ConnectionId, token: &Bytes, packet: &[u8]) {
        if self.state != State::Handshaking || self.received_valid_packet || self.retry_scid.is_some() {
            debug!("ignoring unexpected retry");
            return;
        }
        if token.is_empty() || scid == self.cids.remote() {
            debug!("ignoring invalid retry");
            return;
        }
        if !retry::verify(&self.original_dcid, packet) {
            debug!("retry integrity check failed");
            self.stats.packets_dropped += 1;
            return;
        }
        if let Err(e) = self.keys.set_initial(scid, self.version) {
            warn!(error = %e, "cannot derive initial keys after retry");
            return;
        }
        info!(?scid, token_len = token.len(), "retry");
        self.retry_scid = Some(scid.clone());
        self.cids.set_remote(scid.clone());
        self.token = token.clone();
        self.resend_all(SpaceId::Initial);
        self.resend_all(SpaceId::Data);
    }

    /// A Version Negotiation packet: fatal unless it lists our version or
    /// arrives after the server already answered (RFC 9000 §6.2).
    pub(crate) fn on_version_negotiation(&mut self, versions: &[u32]) {
        if self.state != State::Handshaking || self.received_valid_packet || self.retry_scid.is_some() {
            return;
        }
        if versions.contains(&self.version) {
            debug!("ignoring version negotiation listing our version");
            return;
        }
        warn!(?versions, "server does not support QUIC v1");
        self.emit_closed(ConnectionError::VersionMismatch(versions.to_vec()));
        self.enter_closed();
    }
}
