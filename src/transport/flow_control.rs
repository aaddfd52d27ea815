//! Connection- and stream-level flow control (RFC 9000 §4).
//!
//! [`SendWindow`] is the credit the peer gave us, [`RecvWindow`] the credit
//! we gave the peer. Both scopes use the same types; the connection keeps one
//! pair in [`FlowController`] and every stream keeps its own.

use crate::error::{Error, Result, TransportError};
use crate::transport::Instant;

/// An update is sent once more than 3/4 of the last advertised window
/// has been consumed.
const CONSUMED_NUM: u64 = 3;
const CONSUMED_DEN: u64 = 4;

/// ... or once fewer than this many bytes of credit remain.
const MIN_REMAINING: u64 = 16 * 1024;

/// ... or when the last advertisement is older than this (microseconds)
/// and anything was consumed since.
const MAX_ADVERT_AGE: u64 = 5_000_000;

/// Windows grow with the smoothed RTT in steps of this many microseconds.
const RTT_STEP: u64 = 100_000;
const MAX_RTT_SCALE: u64 = 8;

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SendWindow {
    max_data: u64,
    used: u64,
    /// Limit for which a *_BLOCKED frame was already queued.
    blocked_reported: Option<u64>,
}

impl SendWindow {
    pub fn new(max_data: u64) -> Self {
        Self {
            max_data,
            used: 0,
            blocked_reported: None,
        }
    }

    /// Bytes that may still be committed.
    pub fn credit(&self) -> u64 {
        self.max_data.saturating_sub(self.used)
    }

    /// Commit `bytes`. Exceeding the credit is a local bug and is refused.
    pub fn consume(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.credit() {
            return Err(Error::Transport(TransportError::FlowControlError));
        }
        self.used += bytes;
        Ok(())
    }

    /// Peer raised the limit (MAX_DATA / MAX_STREAM_DATA). Lower values are
    /// ignored. Returns whether credit grew.
    pub fn raise(&mut self, max_data: u64) -> bool {
        if max_data > self.max_data {
            self.max_data = max_data;
            true
        } else {
            false
        }
    }

    /// Limit to report in a *_BLOCKED frame, once per limit.
    pub fn poll_blocked(&mut self) -> Option<u64> {
        if self.credit() == 0 && self.blocked_reported != Some(self.max_data) {
            self.blocked_reported = Some(self.max_data);
            Some(self.max_data)
        } else {
            None
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.credit() == 0
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecvWindow {
    default_window: u64,
    /// Highest offset the peer may send up to.
    advertised: u64,
    /// Bytes the peer has used (highest offset received, or their sum).
    received: u64,
    /// Bytes handed to the application.
    consumed: u64,
    consumed_at_advert: u64,
    window_at_advert: u64,
    last_advert: Instant,
}

impl RecvWindow {
    pub fn new(window: u64, now: Instant) -> Self {
        Self {
            default_window: window,
            advertised: window,
            received: 0,
            consumed: 0,
            consumed_at_advert: 0,
            window_at_advert: window,
            last_advert: now,
        }
    }

    /// Peer used `bytes` more of the window. Going past the advertised
    /// limit is a FLOW_CONTROL_ERROR.
    pub fn on_received(&mut self, bytes: u64) -> Result<()> {
        let received = self.received + bytes;
        if received > self.advertised {
            return Err(Error::Transport(TransportError::FlowControlError));
        }
        self.received = received;
        Ok(())
    }

    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed = (self.consumed + bytes).min(self.received);
    }

    /// Window to advertise beyond current consumption: at least twice the
    /// default, more when the path is long.
    fn target_window(&self, srtt: u64) -> u64 {
        let scale = (srtt / RTT_STEP).clamp(1, MAX_RTT_SCALE);
        2 * self.default_window * scale
    }

    /// New limit to advertise, if the update policy says one is due.
    pub fn poll_update(&self, now: Instant, srtt: u64) -> Option<u64> {
        let since_advert = self.consumed - self.consumed_at_advert;
        if since_advert == 0 {
            return None;
        }
        let remaining = self.advertised - self.consumed;
        let due = since_advert * CONSUMED_DEN > self.window_at_advert * CONSUMED_NUM
            || remaining < MIN_REMAINING
            || now.saturating_sub(self.last_advert) > MAX_ADVERT_AGE;
        if !due {
            return None;
        }
        let next = self.consumed + self.target_window(srtt);
        (next > self.advertised).then_some(next)
    }

    /// A MAX_DATA / MAX_STREAM_DATA carrying `limit` was queued.
    pub fn on_update_sent(&mut self, limit: u64, now: Instant) {
        self.advertised = self.advertised.max(limit);
        self.consumed_at_advert = self.consumed;
        self.window_at_advert = self.advertised - self.consumed;
        self.last_advert = now;
    }

    pub fn advertised(&self) -> u64 {
        self.advertised
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

// ---------------------------------------------------------------------------
// Connection scope
// ---------------------------------------------------------------------------

/// Connection-level flow controller (MAX_DATA / DATA_BLOCKED).
#[derive(Debug, Clone)]
pub struct FlowController {
    pub send: SendWindow,
    pub recv: RecvWindow,
}

impl FlowController {
    /// Send credit starts at zero until the peer's transport parameters
    /// (or remembered ones for 0-RTT) arrive.
    pub fn new(local_max_data: u64, now: Instant) -> Self {
        Self {
            send: SendWindow::new(0),
            recv: RecvWindow::new(local_max_data, now),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
