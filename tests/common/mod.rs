//! In-process test harness: a scripted handshake oracle, a scripted QUIC
//! server assembled from the crate's own codecs, and an in-memory datagram
//! link between the two.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quic_client_core::crypto::key_schedule::{derive_directional_keys, initial_secrets};
use quic_client_core::crypto::{CipherSuite, DirectionalKeys, Level, Secret, TAG_LEN};
use quic_client_core::frame::{encode, encode_ack, ConnectionCloseFrame, Frame, Frames, MaxStreamDataFrame, StreamFrame};
use quic_client_core::packet::long_header::{write_version_negotiation, LongHeader};
use quic_client_core::packet::{
    protect, retry, write_long_header, write_short_header, CoalescedPackets, ConnectionId, Header, LongType,
    QUIC_VERSION_1,
};
use quic_client_core::tls::{
    ClientHelloParams, HandshakeOutput, HandshakeState, LevelSecrets, TlsError, TlsSession, TransportParams,
};
use quic_client_core::transport::range_set::RangeSet;
use quic_client_core::DatagramTransport;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const ENCRYPTED_EXTENSIONS: u8 = 8;
const FINISHED: u8 = 20;

const SUITE: CipherSuite = CipherSuite::Aes128GcmSha256;
const HS_CLIENT: [u8; 32] = [0x11; 32];
const HS_SERVER: [u8; 32] = [0x22; 32];
const APP_CLIENT: [u8; 32] = [0x33; 32];
const APP_SERVER: [u8; 32] = [0x44; 32];
const EARLY: [u8; 32] = [0x55; 32];

pub const SERVER_CID: [u8; 8] = [0x53; 8];
pub const RETRY_CID: [u8; 8] = [0x52; 8];
pub const RESET_TOKEN: [u8; 16] = [0x5e; 16];

fn message(ty: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![ty];
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Pop one complete message off the front of `buf`.
fn take_message(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 3 {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < 3 + len {
        return None;
    }
    let ty = buf[0];
    let body = buf[3..3 + len].to_vec();
    buf.drain(..3 + len);
    Some((ty, body))
}

fn level_secrets(local: &[u8], remote: &[u8]) -> LevelSecrets {
    LevelSecrets {
        suite: SUITE,
        local: Secret::new(local),
        remote: Secret::new(remote),
    }
}

fn keys(secret: &[u8]) -> DirectionalKeys {
    derive_directional_keys(SUITE, &Secret::new(secret)).expect("derive keys")
}

// ---------------------------------------------------------------------------
// Client oracle
// ---------------------------------------------------------------------------

/// Client side of the scripted handshake: ClientHello at Initial, then
/// ServerHello, EncryptedExtensions and Finished from the server, answered
/// with our Finished.
pub struct MockTls {
    resumed: Option<Vec<u8>>,
    inbox: [Vec<u8>; 4],
    state: HandshakeState,
    alpn: Option<Vec<u8>>,
    peer_params: Option<Vec<u8>>,
    early_offered: bool,
    early_accepted: Option<bool>,
}

impl MockTls {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            resumed: None,
            inbox: Default::default(),
            state: HandshakeState::Started,
            alpn: None,
            peer_params: None,
            early_offered: false,
            early_accepted: None,
        })
    }

    /// A session resumed from a ticket that remembered `params`.
    pub fn resuming(params: &TransportParams) -> Box<Self> {
        let mut tls = Self::new();
        tls.resumed = Some(params.to_vec());
        tls
    }
}

fn slot(level: Level) -> usize {
    match level {
        Level::Initial => 0,
        Level::ZeroRtt => 1,
        Level::Handshake => 2,
        Level::OneRtt => 3,
    }
}

impl TlsSession for MockTls {
    fn start_handshake(&mut self, params: &ClientHelloParams<'_>) -> Result<Vec<u8>, TlsError> {
        self.early_offered = params.enable_early_data && self.resumed.is_some();
        let mut body = vec![u8::from(self.early_offered)];
        body.extend_from_slice(params.transport_params);
        Ok(message(CLIENT_HELLO, &body))
    }

    fn process_handshake_data(
        &mut self,
        level: Level,
        data: &[u8],
    ) -> Result<(HandshakeOutput, HandshakeState), TlsError> {
        self.inbox[slot(level)].extend_from_slice(data);
        let mut output = HandshakeOutput::default();
        while let Some((ty, body)) = take_message(&mut self.inbox[slot(level)]) {
            match (level, ty) {
                (Level::Initial, SERVER_HELLO) => self.state = HandshakeState::HandshakeKeys,
                (Level::Handshake, ENCRYPTED_EXTENSIONS) => {
                    let alpn_len = *body.first().ok_or_else(|| TlsError::new(50, "decode error"))? as usize;
                    if body.len() < 2 + alpn_len {
                        return Err(TlsError::new(50, "decode error"));
                    }
                    self.alpn = Some(body[1..1 + alpn_len].to_vec());
                    self.early_accepted = Some(body[1 + alpn_len] == 1);
                    self.peer_params = Some(body[2 + alpn_len..].to_vec());
                }
                (Level::Handshake, FINISHED) => {
                    output.push(Level::Handshake, message(FINISHED, &[]));
                    self.state = HandshakeState::Complete;
                }
                _ => return Err(TlsError::new(10, "unexpected message")),
            }
        }
        Ok((output, self.state))
    }

    fn export_level_secret(&mut self, level: Level) -> Option<LevelSecrets> {
        match level {
            Level::Initial => None,
            Level::ZeroRtt => self.early_offered.then(|| level_secrets(&EARLY, &EARLY)),
            Level::Handshake => (self.state != HandshakeState::Started).then(|| level_secrets(&HS_CLIENT, &HS_SERVER)),
            Level::OneRtt => {
                (self.state == HandshakeState::Complete).then(|| level_secrets(&APP_CLIENT, &APP_SERVER))
            }
        }
    }

    fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn is_handshake_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    fn peer_transport_params(&self) -> Option<&[u8]> {
        self.peer_params.as_deref()
    }

    fn resumed_transport_params(&self) -> Option<&[u8]> {
        self.resumed.as_deref()
    }

    fn early_data_accepted(&self) -> Option<bool> {
        if self.early_offered {
            self.early_accepted
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory link
// ---------------------------------------------------------------------------

/// One end of a lossless in-memory datagram link.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

pub fn link() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        },
        MemoryTransport {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(datagram))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
    }

    async fn recv(&self) -> io::Result<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "link closed"))
    }
}

// ---------------------------------------------------------------------------
// Scripted server
// ---------------------------------------------------------------------------

pub struct ServerOptions {
    pub params: TransportParams,
    pub alpn: Vec<u8>,
    pub accept_early_data: bool,
    pub retry_token: Option<Vec<u8>>,
    pub version_negotiation: Option<Vec<u32>>,
    /// Sent on a client bidi stream once its request is complete.
    pub response: Vec<u8>,
    /// Send the response tail before its head, in separate datagrams.
    pub reverse_response: bool,
    /// Flow-control credit granted as the client's data arrives; 0 never
    /// raises the initial limits.
    pub window_step: u64,
    pub new_token: Option<Vec<u8>>,
    /// Move to the next key phase before sending the response.
    pub key_update: bool,
    pub close_after_response: Option<(u64, String)>,
    pub reset_after_response: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            params: TransportParams {
                max_idle_timeout: 30_000,
                stateless_reset_token: Some(RESET_TOKEN),
                initial_max_data: 1 << 20,
                initial_max_stream_data_bidi_local: 1 << 18,
                initial_max_stream_data_bidi_remote: 1 << 18,
                initial_max_stream_data_uni: 1 << 18,
                initial_max_streams_bidi: 16,
                initial_max_streams_uni: 16,
                active_connection_id_limit: 4,
                ..TransportParams::default()
            },
            alpn: b"h3".to_vec(),
            accept_early_data: false,
            retry_token: None,
            version_negotiation: None,
            response: b"hello from server".to_vec(),
            reverse_response: false,
            window_step: 0,
            new_token: None,
            key_update: false,
            close_after_response: None,
            reset_after_response: false,
        }
    }
}

/// What the server observed, for assertions.
#[derive(Debug, Default)]
pub struct ServerLog {
    pub datagrams: usize,
    pub client_params: Option<TransportParams>,
    pub initial_tokens: Vec<Vec<u8>>,
    pub zero_rtt_accepted: usize,
    pub zero_rtt_dropped: usize,
    /// Complete requests by stream.
    pub requests: BTreeMap<u64, Vec<u8>>,
    /// STREAM payload bytes received in 1-RTT packets.
    pub one_rtt_stream_bytes: u64,
    pub flow_violations: usize,
    pub client_close: Option<(bool, u64, Vec<u8>)>,
    pub client_key_phase: bool,
}

#[derive(Default)]
struct RxStream {
    chunks: BTreeMap<u64, Vec<u8>>,
    limit: u64,
    highest: u64,
    fin: Option<u64>,
    done: bool,
}

impl RxStream {
    fn contiguous(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (&offset, data) in &self.chunks {
            let offset = offset as usize;
            if offset > out.len() {
                break;
            }
            let end = offset + data.len();
            if end > out.len() {
                out.extend_from_slice(&data[out.len() - offset..]);
            }
        }
        out
    }
}

struct Directional {
    open: DirectionalKeys,
    seal: DirectionalKeys,
}

const INITIAL: usize = 0;
const HANDSHAKE: usize = 1;
const APP: usize = 2;

pub struct ScriptedServer {
    opts: ServerOptions,
    log: Arc<Mutex<ServerLog>>,
    cid: ConnectionId,
    client_cid: ConnectionId,
    odcid: Option<ConnectionId>,
    retried: bool,
    initial: Option<Directional>,
    handshake: Option<Directional>,
    one_rtt: Option<Directional>,
    early: Option<DirectionalKeys>,
    key_phase: bool,
    crypto_in: [(BTreeMap<u64, Vec<u8>>, u64); 3],
    crypto_buf: [Vec<u8>; 3],
    crypto_out: [u64; 3],
    pn: [u64; 3],
    received: [RangeSet; 3],
    largest: [Option<u64>; 3],
    ack_pending: [bool; 3],
    queued: [Vec<u8>; 3],
    streams: BTreeMap<u64, RxStream>,
    conn_limit: u64,
    closed: bool,
}

impl ScriptedServer {
    pub fn new(opts: ServerOptions, log: Arc<Mutex<ServerLog>>) -> Self {
        let conn_limit = opts.params.initial_max_data;
        Self {
            opts,
            log,
            cid: ConnectionId::from_slice(&SERVER_CID).expect("cid"),
            client_cid: ConnectionId::from_slice(&[]).expect("cid"),
            odcid: None,
            retried: false,
            initial: None,
            handshake: None,
            one_rtt: None,
            early: None,
            key_phase: false,
            crypto_in: Default::default(),
            crypto_buf: Default::default(),
            crypto_out: [0; 3],
            pn: [0; 3],
            received: Default::default(),
            largest: [None; 3],
            ack_pending: [false; 3],
            queued: Default::default(),
            streams: BTreeMap::new(),
            conn_limit,
            closed: false,
        }
    }

    fn log(&self) -> std::sync::MutexGuard<'_, ServerLog> {
        self.log.lock().expect("server log")
    }

    /// Process one datagram from the client and return the datagrams to
    /// send back, in order.
    pub fn handle(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.log().datagrams += 1;
        if self.closed {
            return out;
        }
        for packet in CoalescedPackets::new(datagram, SERVER_CID.len()) {
            let Ok((partial, bytes)) = packet else { break };
            let mut bytes = bytes.to_vec();
            let pn_offset = partial.pn_offset;
            let (space, zero_rtt, keys) = match partial.header {
                Header::Initial { dcid, scid, token, .. } => {
                    if let Some(reply) = self.on_initial_header(&dcid, &scid, &token) {
                        out.push(reply);
                        return out;
                    }
                    (INITIAL, false, self.initial.as_ref().map(|k| &k.open))
                }
                Header::Long { ty: LongType::ZeroRtt, .. } => (APP, true, self.early.as_ref()),
                Header::Long { .. } => (HANDSHAKE, false, self.handshake.as_ref().map(|k| &k.open)),
                Header::Short { .. } => (APP, false, self.one_rtt.as_ref().map(|k| &k.open)),
                Header::Retry { .. } | Header::VersionNegotiation { .. } => continue,
            };
            let Some((pn, payload)) = open(keys, &mut bytes, pn_offset, self.largest[space]) else {
                if zero_rtt {
                    self.log().zero_rtt_dropped += 1;
                }
                continue;
            };
            self.largest[space] = Some(self.largest[space].map_or(pn, |l| l.max(pn)));
            self.received[space].insert_one(pn);
            if zero_rtt {
                self.log().zero_rtt_accepted += 1;
            }
            if space == APP && !zero_rtt && bytes[0] & 0x04 != 0 {
                self.log().client_key_phase = true;
            }
            self.on_packet(space, zero_rtt, &payload, &mut out);
            if self.closed {
                return out;
            }
        }
        self.flush(&mut out);
        out
    }

    /// First sight of the client: answer with VN or Retry if scripted.
    fn on_initial_header(&mut self, dcid: &ConnectionId, scid: &ConnectionId, token: &[u8]) -> Option<Vec<u8>> {
        if self.odcid.is_none() {
            self.odcid = Some(dcid.clone());
            self.client_cid = scid.clone();
            if let Some(versions) = &self.opts.version_negotiation {
                let mut vn = Vec::new();
                write_version_negotiation(&mut vn, scid, dcid, versions);
                return Some(vn);
            }
        }
        self.log().initial_tokens.push(token.to_vec());
        if let Some(retry_token) = self.opts.retry_token.clone() {
            if !self.retried {
                self.retried = true;
                let retry_cid = ConnectionId::from_slice(&RETRY_CID).expect("cid");
                let odcid = self.odcid.clone().expect("odcid");
                let mut packet = Vec::new();
                retry::write_retry(&mut packet, QUIC_VERSION_1, scid, &retry_cid, &retry_token, &odcid)
                    .expect("retry");
                return Some(packet);
            }
            if token != retry_token.as_slice() {
                return None;
            }
        }
        if self.initial.is_none() {
            let secrets = initial_secrets(dcid, QUIC_VERSION_1).expect("initial secrets");
            self.initial = Some(Directional {
                open: derive_directional_keys(SUITE, &secrets.client).expect("keys"),
                seal: derive_directional_keys(SUITE, &secrets.server).expect("keys"),
            });
        }
        None
    }

    fn on_packet(&mut self, space: usize, zero_rtt: bool, payload: &[u8], out: &mut Vec<Vec<u8>>) {
        let mut eliciting = false;
        for frame in Frames::new(payload) {
            let Ok(frame) = frame else { return };
            eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Crypto(crypto) => {
                    let (chunks, _) = &mut self.crypto_in[space];
                    chunks.insert(crypto.offset, crypto.data.to_vec());
                    self.on_crypto(space);
                }
                Frame::Stream(stream) => self.on_stream(zero_rtt, &stream, out),
                Frame::PathChallenge(data) => encode(&Frame::PathResponse(data), &mut self.queued[APP]),
                Frame::ConnectionClose(close) => {
                    self.log().client_close = Some((close.is_application, close.error_code, close.reason.to_vec()));
                    self.closed = true;
                    return;
                }
                _ => {}
            }
        }
        if eliciting {
            self.ack_pending[space] = true;
        }
    }

    fn on_crypto(&mut self, space: usize) {
        let (chunks, read) = &mut self.crypto_in[space];
        while let Some(data) = chunks.remove(&*read) {
            *read += data.len() as u64;
            self.crypto_buf[space].extend_from_slice(&data);
        }
        while let Some((ty, body)) = take_message(&mut self.crypto_buf[space]) {
            match (space, ty) {
                (INITIAL, CLIENT_HELLO) => self.on_client_hello(&body),
                (HANDSHAKE, FINISHED) => self.on_client_finished(),
                _ => {}
            }
        }
    }

    fn on_client_hello(&mut self, body: &[u8]) {
        let early = body.first() == Some(&1);
        let client_params = TransportParams::decode(&body[1..]).ok();
        self.log().client_params = client_params;

        self.handshake = Some(Directional {
            open: keys(&HS_CLIENT),
            seal: keys(&HS_SERVER),
        });
        self.one_rtt = Some(Directional {
            open: keys(&APP_CLIENT),
            seal: keys(&APP_SERVER),
        });
        let accepted = early && self.opts.accept_early_data;
        if accepted {
            self.early = Some(keys(&EARLY));
        }

        let mut params = self.opts.params.clone();
        params.original_destination_connection_id = self.odcid.clone();
        params.initial_source_connection_id = Some(self.cid.clone());
        if self.retried {
            params.retry_source_connection_id = ConnectionId::from_slice(&RETRY_CID);
        }
        let mut ee = vec![self.opts.alpn.len() as u8];
        ee.extend_from_slice(&self.opts.alpn);
        ee.push(u8::from(accepted));
        ee.extend_from_slice(&params.to_vec());

        self.queue_crypto(INITIAL, &message(SERVER_HELLO, &[]));
        let mut flight = message(ENCRYPTED_EXTENSIONS, &ee);
        flight.extend_from_slice(&message(FINISHED, &[]));
        self.queue_crypto(HANDSHAKE, &flight);
    }

    fn on_client_finished(&mut self) {
        encode(&Frame::HandshakeDone, &mut self.queued[APP]);
        if let Some(token) = self.opts.new_token.clone() {
            encode(&Frame::NewToken(&token), &mut self.queued[APP]);
        }
    }

    fn queue_crypto(&mut self, space: usize, data: &[u8]) {
        let frame = Frame::Crypto(quic_client_core::frame::CryptoFrame {
            offset: self.crypto_out[space],
            data,
        });
        encode(&frame, &mut self.queued[space]);
        self.crypto_out[space] += data.len() as u64;
    }

    fn on_stream(&mut self, zero_rtt: bool, frame: &StreamFrame<'_>, out: &mut Vec<Vec<u8>>) {
        let initial_limit = self.opts.params.initial_max_stream_data_bidi_remote;
        let stream = self.streams.entry(frame.stream_id).or_insert_with(|| RxStream {
            limit: initial_limit,
            ..RxStream::default()
        });
        let end = frame.offset + frame.data.len() as u64;
        stream.highest = stream.highest.max(end);
        stream.chunks.insert(frame.offset, frame.data.to_vec());
        if frame.fin {
            stream.fin = Some(end);
        }
        let mut violation = stream.highest > stream.limit;
        let total: u64 = self.streams.values().map(|s| s.highest).sum();
        violation |= total > self.conn_limit;

        let mut log = self.log.lock().expect("server log");
        if !zero_rtt {
            log.one_rtt_stream_bytes += frame.data.len() as u64;
        }
        if violation {
            log.flow_violations += 1;
        }
        drop(log);

        self.grant_credit(frame.stream_id, total);
        self.maybe_respond(frame.stream_id, out);
    }

    fn grant_credit(&mut self, stream_id: u64, total: u64) {
        let step = self.opts.window_step;
        if step == 0 {
            return;
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else { return };
        let received = stream.contiguous().len() as u64;
        if received + step / 2 > stream.limit {
            stream.limit = received + step;
            encode(
                &Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id,
                    max_data: stream.limit,
                }),
                &mut self.queued[APP],
            );
        }
        if total + step / 2 > self.conn_limit {
            self.conn_limit = total + step;
            encode(&Frame::MaxData(self.conn_limit), &mut self.queued[APP]);
        }
    }

    fn maybe_respond(&mut self, stream_id: u64, out: &mut Vec<Vec<u8>>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else { return };
        let Some(fin) = stream.fin else { return };
        let data = stream.contiguous();
        if stream.done || data.len() as u64 != fin {
            return;
        }
        stream.done = true;
        self.log().requests.insert(stream_id, data);
        if stream_id % 4 != 0 {
            return;
        }

        if self.opts.key_update && !self.key_phase {
            if let Some(keys) = self.one_rtt.as_mut() {
                keys.open.packet = keys.open.packet.next_generation().expect("next keys");
                keys.seal.packet = keys.seal.packet.next_generation().expect("next keys");
                self.key_phase = true;
            }
        }

        let response = self.opts.response.clone();
        let mid = response.len() / 2;
        let (head, tail) = response.split_at(mid);
        let head_frame = Frame::Stream(StreamFrame {
            stream_id,
            offset: 0,
            data: head,
            fin: false,
        });
        let tail_frame = Frame::Stream(StreamFrame {
            stream_id,
            offset: mid as u64,
            data: tail,
            fin: true,
        });
        if self.opts.reverse_response {
            for frame in [tail_frame, head_frame] {
                let mut payload = Vec::new();
                encode(&frame, &mut payload);
                out.push(self.seal_short(&payload));
            }
        } else {
            let mut payload = Vec::new();
            encode(&head_frame, &mut payload);
            encode(&tail_frame, &mut payload);
            out.push(self.seal_short(&payload));
        }

        if let Some((code, reason)) = self.opts.close_after_response.clone() {
            let mut payload = Vec::new();
            encode(
                &Frame::ConnectionClose(ConnectionCloseFrame {
                    is_application: true,
                    error_code: code,
                    frame_type: 0,
                    reason: reason.as_bytes(),
                }),
                &mut payload,
            );
            out.push(self.seal_short(&payload));
            self.closed = true;
        }
        if self.opts.reset_after_response {
            let mut reset = vec![0x4b; 24];
            reset.extend_from_slice(&RESET_TOKEN);
            out.push(reset);
            self.closed = true;
        }
    }

    /// Send queued frames and ACKs: Initial and Handshake coalesced in one
    /// datagram, 1-RTT in another.
    fn flush(&mut self, out: &mut Vec<Vec<u8>>) {
        let mut long = Vec::new();
        for space in [INITIAL, HANDSHAKE] {
            if let Some(payload) = self.take_payload(space) {
                let ty = if space == INITIAL { LongType::Initial } else { LongType::Handshake };
                long.extend_from_slice(&self.seal_long(space, ty, &payload));
            }
        }
        if !long.is_empty() {
            out.push(long);
        }
        if self.one_rtt.is_some() {
            if let Some(payload) = self.take_payload(APP) {
                out.push(self.seal_short(&payload));
            }
        }
    }

    fn take_payload(&mut self, space: usize) -> Option<Vec<u8>> {
        let mut payload = Vec::new();
        if std::mem::take(&mut self.ack_pending[space]) {
            let ranges: Vec<_> = self.received[space].iter().collect();
            encode_ack(&mut payload, &ranges, 0, None);
        }
        payload.append(&mut self.queued[space]);
        (!payload.is_empty()).then_some(payload)
    }

    fn next_pn(&mut self, space: usize) -> u64 {
        let pn = self.pn[space];
        self.pn[space] += 1;
        pn
    }

    fn seal_long(&mut self, space: usize, ty: LongType, payload: &[u8]) -> Vec<u8> {
        let pn = self.next_pn(space);
        let mut payload = payload.to_vec();
        payload.resize(payload.len().max(4), 0);
        let header = LongHeader {
            ty,
            version: QUIC_VERSION_1,
            dcid: &self.client_cid,
            scid: &self.cid,
            token: &[],
        };
        let mut packet = Vec::new();
        let header_len = write_long_header(&mut packet, &header, pn, 2, payload.len() + TAG_LEN);
        packet.extend_from_slice(&payload);
        let keys = match space {
            INITIAL => self.initial.as_ref(),
            _ => self.handshake.as_ref(),
        }
        .expect("keys for long header packet");
        protect::seal(&keys.seal, pn, &mut packet, header_len, 2).expect("seal");
        packet
    }

    fn seal_short(&mut self, payload: &[u8]) -> Vec<u8> {
        let pn = self.next_pn(APP);
        let mut payload = payload.to_vec();
        payload.resize(payload.len().max(4), 0);
        let mut packet = Vec::new();
        let header_len = write_short_header(&mut packet, &self.client_cid, self.key_phase, pn, 2);
        packet.extend_from_slice(&payload);
        let keys = self.one_rtt.as_ref().expect("1-RTT keys");
        protect::seal(&keys.seal, pn, &mut packet, header_len, 2).expect("seal");
        packet
    }

}

/// Remove protection and decrypt; `None` if the keys are missing or the
/// packet does not authenticate.
fn open(
    keys: Option<&DirectionalKeys>,
    packet: &mut [u8],
    pn_offset: usize,
    largest: Option<u64>,
) -> Option<(u64, Vec<u8>)> {
    let opened = protect::open(keys?, packet, pn_offset, largest).ok()?;
    let payload = packet[opened.header_len..opened.header_len + opened.payload_len].to_vec();
    Some((opened.pn, payload))
}

/// A scripted server running on its own task.
pub struct TestServer {
    pub log: Arc<Mutex<ServerLog>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Spawn the server; returns it and the client end of the link.
    pub fn spawn(opts: ServerOptions) -> (Self, Arc<dyn DatagramTransport>) {
        let (client_end, server_end) = link();
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let mut server = ScriptedServer::new(opts, log.clone());
        let task = tokio::spawn(async move {
            while let Ok(datagram) = server_end.recv().await {
                for reply in server.handle(&datagram) {
                    if server_end.send(&reply).await.is_err() {
                        return;
                    }
                }
            }
        });
        (Self { log, task }, Arc::new(client_end))
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, ServerLog> {
        self.log.lock().expect("server log")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
