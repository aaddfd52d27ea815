//! Async driver for [`Connection`] on tokio.
//!
//! A [`Client`] owns the connection behind one mutex. A receive task feeds
//! datagrams from the [`DatagramTransport`] into it and a timer task fires
//! [`Connection::handle_timeout`]; every caller operation runs under the
//! same lock, after which pending datagrams are flushed to the transport.
//! Stream reads and writes suspend on a [`Notify`] that is signalled after
//! every state change, so dropping the future (or wrapping it in
//! `tokio::time::timeout`) cancels the wait without touching stream state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionStats, Event, State};
use crate::error::{ConnectionError, Error, Result};
use crate::tls::TlsSession;
use crate::transport::stream::Dir;
use crate::transport::{DatagramTransport, Instant, UdpTransport};

struct Shared {
    conn: Mutex<Connection>,
    transport: Arc<dyn DatagramTransport>,
    /// Signalled after anything that may unblock a caller.
    changed: Notify,
    /// Signalled when the connection's next timeout may have moved.
    rearm: Notify,
    epoch: tokio::time::Instant,
}

impl Shared {
    fn now(&self) -> Instant {
        self.epoch.elapsed().as_micros() as u64
    }

    fn deadline(&self, at: Instant) -> tokio::time::Instant {
        self.epoch + Duration::from_micros(at)
    }

    /// Run `f` on the connection, then send whatever it queued and wake
    /// waiters.
    async fn drive<T>(&self, f: impl FnOnce(&mut Connection, Instant) -> T) -> T {
        let (out, datagrams) = {
            let mut conn = self.conn.lock().await;
            let now = self.now();
            let out = f(&mut conn, now);
            let mut datagrams = Vec::new();
            while let Some(datagram) = conn.poll_transmit(now) {
                datagrams.push(datagram);
            }
            (out, datagrams)
        };
        for datagram in datagrams {
            trace!(len = datagram.len(), "send datagram");
            if let Err(e) = self.transport.send(&datagram).await {
                // The channel is lossy anyway; recovery retransmits.
                debug!(error = %e, "datagram send failed");
            }
        }
        self.rearm.notify_one();
        self.changed.notify_waiters();
        out
    }

    /// Retry `op` until it yields `Some`, waiting for a state change between
    /// attempts.
    async fn wait_for<T>(&self, mut op: impl FnMut(&mut Connection, Instant) -> Result<Option<T>>) -> Result<T> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if let Some(out) = self.drive(&mut op).await? {
                return Ok(out);
            }
            changed.await;
        }
    }
}

/// A QUIC client connection driven by background tasks.
///
/// Dropping the client stops its tasks without notifying the server; call
/// [`close`](Self::close) first for a graceful shutdown.
pub struct Client {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Resolve `host`, connect a UDP socket and complete the handshake.
    pub async fn connect(host: &str, port: u16, config: Config, tls: Box<dyn TlsSession>) -> Result<Self> {
        let transport = UdpTransport::connect(host, port).await?;
        Self::with_transport(Arc::new(transport), host, config, tls).await
    }

    /// Complete a handshake with `server_name` over an existing transport.
    pub async fn with_transport(
        transport: Arc<dyn DatagramTransport>,
        server_name: &str,
        config: Config,
        tls: Box<dyn TlsSession>,
    ) -> Result<Self> {
        let client = Self::start(transport, server_name, config, tls).await?;
        client.established().await?;
        Ok(client)
    }

    /// Send the first flight and return without waiting for the handshake.
    /// With 0-RTT keys in place streams are usable right away; otherwise
    /// wait for [`established`](Self::established).
    pub async fn start(
        transport: Arc<dyn DatagramTransport>,
        server_name: &str,
        config: Config,
        tls: Box<dyn TlsSession>,
    ) -> Result<Self> {
        let epoch = tokio::time::Instant::now();
        let conn = Connection::new(config, server_name, tls, &mut rand::thread_rng(), 0);
        let shared = Arc::new(Shared {
            conn: Mutex::new(conn),
            transport,
            changed: Notify::new(),
            rearm: Notify::new(),
            epoch,
        });
        shared.drive(|conn, now| conn.connect(now)).await?;

        let tasks = vec![
            tokio::spawn(recv_task(shared.clone())),
            tokio::spawn(timer_task(shared.clone())),
        ];
        Ok(Self { shared, tasks })
    }

    /// Wait until the handshake is confirmed.
    pub async fn established(&self) -> Result<()> {
        self.shared
            .wait_for(|conn, _| {
                if conn.is_established() {
                    Ok(Some(()))
                } else if let Some(error) = conn.error() {
                    Err(Error::ConnectionLost(error.clone()))
                } else {
                    Ok(None)
                }
            })
            .await
    }

    pub async fn state(&self) -> State {
        self.shared.conn.lock().await.state()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.shared.conn.lock().await.stats()
    }

    /// `Some(accepted)` once a 0-RTT attempt is settled.
    pub async fn early_data_accepted(&self) -> Option<bool> {
        self.shared.conn.lock().await.early_data_accepted()
    }

    /// NEW_TOKEN from the server, for the next connection.
    pub async fn new_token(&self) -> Option<Bytes> {
        self.shared.conn.lock().await.new_token().cloned()
    }

    pub async fn open_stream(&self, dir: Dir) -> Result<u64> {
        self.shared.drive(|conn, now| conn.open_stream(dir, now)).await
    }

    /// Write all of `data`, waiting for flow-control credit as needed.
    pub async fn write(&self, stream_id: u64, data: &[u8], fin: bool) -> Result<()> {
        let mut written = 0;
        self.shared
            .wait_for(|conn, _| {
                written += conn.write(stream_id, &data[written..], fin)?;
                Ok((written == data.len()).then_some(()))
            })
            .await
    }

    /// Read up to `max` bytes, waiting until data or the end of the stream
    /// is available. Returns `(bytes, fin)`.
    pub async fn read(&self, stream_id: u64, max: usize) -> Result<(Bytes, bool)> {
        self.shared
            .wait_for(|conn, _| {
                let (data, fin) = conn.read(stream_id, max)?;
                Ok((!data.is_empty() || fin).then_some((data, fin)))
            })
            .await
    }

    /// Read the rest of a stream.
    pub async fn read_to_end(&self, stream_id: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let (data, fin) = self.read(stream_id, usize::MAX).await?;
            out.extend_from_slice(&data);
            if fin {
                return Ok(out);
            }
        }
    }

    pub async fn reset_stream(&self, stream_id: u64, error_code: u64) -> Result<()> {
        self.shared.drive(|conn, _| conn.reset_stream(stream_id, error_code)).await
    }

    pub async fn stop_sending(&self, stream_id: u64, error_code: u64) -> Result<()> {
        self.shared.drive(|conn, _| conn.stop_sending(stream_id, error_code)).await
    }

    /// Start path validation; [`Event::PathValidated`] reports success.
    pub async fn probe_path(&self) -> Result<()> {
        self.shared.drive(|conn, _| conn.probe_path()).await
    }

    /// Next queued event, if any.
    pub async fn poll_event(&self) -> Option<Event> {
        self.shared.conn.lock().await.poll_event()
    }

    /// Wait for the next event. `None` once the connection is closed and
    /// every event has been delivered.
    pub async fn next_event(&self) -> Option<Event> {
        let event = self
            .shared
            .wait_for(|conn, _| match conn.poll_event() {
                Some(event) => Ok(Some(Some(event))),
                None if conn.is_closed() => Ok(Some(None)),
                None => Ok(None),
            })
            .await;
        event.ok().flatten()
    }

    /// Close with an application error code and wait until the connection
    /// has drained.
    pub async fn close(&self, error_code: u64, reason: &str) -> ConnectionError {
        self.shared.drive(|conn, now| conn.close(error_code, reason, now)).await;
        self.closed().await
    }

    /// Wait until the connection is closed and return why.
    pub async fn closed(&self) -> ConnectionError {
        let error = self
            .shared
            .wait_for(|conn, _| {
                Ok(match (conn.state(), conn.error()) {
                    (State::Closed, Some(error)) => Some(error.clone()),
                    (State::Closed, None) => Some(ConnectionError::LocallyClosed),
                    _ => None,
                })
            })
            .await;
        error.unwrap_or(ConnectionError::LocallyClosed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_task(shared: Arc<Shared>) {
    loop {
        let datagram = match shared.transport.recv().await {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(error = %e, "datagram receive failed, stopping receive task");
                return;
            }
        };
        trace!(len = datagram.len(), "recv datagram");
        let closed = shared
            .drive(|conn, now| {
                conn.handle_datagram(&datagram, now);
                conn.is_closed()
            })
            .await;
        if closed {
            return;
        }
    }
}

async fn timer_task(shared: Arc<Shared>) {
    loop {
        let rearmed = shared.rearm.notified();
        tokio::pin!(rearmed);
        rearmed.as_mut().enable();

        let (next, closed) = {
            let conn = shared.conn.lock().await;
            (conn.next_timeout(), conn.is_closed())
        };
        if closed {
            shared.changed.notify_waiters();
            return;
        }
        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(shared.deadline(at)) => {
                        shared.drive(|conn, now| conn.handle_timeout(now.max(at))).await;
                    }
                    _ = &mut rearmed => {}
                }
            }
            None => rearmed.await,
        }
    }
}
