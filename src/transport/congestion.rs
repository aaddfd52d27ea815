//! NewReno congestion control and pacing (RFC 9002 §7).

use crate::transport::Instant;

/// Datagrams the pacer lets out back to back.
const BURST_DATAGRAMS: u64 = 10;

/// Window starts at ten datagrams and never shrinks below two.
const INITIAL_WINDOW_DATAGRAMS: u64 = 10;
const MINIMUM_WINDOW_DATAGRAMS: u64 = 2;

/// NewReno window accounting over bytes of ack-eliciting packets.
pub struct CongestionController {
    window: u64,
    threshold: u64,
    in_flight: u64,
    /// Send time marking the current recovery period; packets sent at or
    /// before it cannot trigger another reduction.
    recovery_since: Option<Instant>,
    datagram: u64,
}

impl CongestionController {
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            window: INITIAL_WINDOW_DATAGRAMS * max_datagram_size,
            threshold: u64::MAX,
            in_flight: 0,
            recovery_since: None,
            datagram: max_datagram_size,
        }
    }

    fn floor(&self) -> u64 {
        MINIMUM_WINDOW_DATAGRAMS * self.datagram
    }

    pub fn can_send(&self, bytes: u64) -> bool {
        self.in_flight.saturating_add(bytes) <= self.window
    }

    pub fn available_window(&self) -> u64 {
        self.window.saturating_sub(self.in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.in_flight += bytes;
    }

    /// `sent_time` is when the acknowledged packet left.
    pub fn on_packet_acked(&mut self, bytes: u64, sent_time: Instant) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        if self.in_recovery(sent_time) {
            return;
        }
        // Anything sent after the reduction got through.
        self.recovery_since = None;

        let growth = if self.in_slow_start() {
            bytes
        } else {
            self.datagram * bytes / self.window
        };
        self.window += growth;
        tracing::trace!(cwnd = self.window, in_flight = self.in_flight, "window grew");
    }

    pub fn on_packet_lost(&mut self, bytes: u64, sent_time: Instant, now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_since = Some(now);
        self.threshold = self.floor().max(self.window / 2);
        self.window = self.threshold;
        tracing::debug!(cwnd = self.window, ssthresh = self.threshold, "congestion event");
    }

    /// RFC 9002 §7.6.2: collapse to the minimum window.
    pub fn on_persistent_congestion(&mut self) {
        self.window = self.floor();
        self.recovery_since = None;
        tracing::debug!(cwnd = self.window, "persistent congestion");
    }

    /// Bytes of a discarded packet number space leave the flight without
    /// affecting the window.
    pub fn on_packets_discarded(&mut self, bytes: u64) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.in_flight
    }

    pub fn cwnd(&self) -> u64 {
        self.window
    }

    pub fn ssthresh(&self) -> u64 {
        self.threshold
    }

    pub fn in_slow_start(&self) -> bool {
        self.window < self.threshold
    }

    pub fn in_recovery(&self, sent_time: Instant) -> bool {
        self.recovery_since.is_some_and(|since| sent_time <= since)
    }

    pub fn max_datagram_size(&self) -> u64 {
        self.datagram
    }
}

/// Token bucket releasing bytes at 1.25 * cwnd / srtt, holding at most a
/// burst of [`BURST_DATAGRAMS`] datagrams.
pub struct Pacer {
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl Pacer {
    pub fn new(max_datagram_size: u64, now: Instant) -> Self {
        let capacity = BURST_DATAGRAMS * max_datagram_size;
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// When a datagram of `bytes` may be sent; `None` means right away.
    pub fn delay(&mut self, bytes: u64, cwnd: u64, srtt: u64, now: Instant) -> Option<Instant> {
        if srtt == 0 || cwnd == 0 {
            return None;
        }
        let elapsed = now.saturating_sub(self.last_refill) as u128;
        let refill = elapsed * cwnd as u128 * 5 / (srtt as u128 * 4);
        if refill > 0 {
            self.tokens = (self.tokens as u128 + refill).min(self.capacity as u128) as u64;
            self.last_refill = now;
        }
        if self.tokens >= bytes {
            return None;
        }
        let missing = (bytes - self.tokens) as u128;
        let rate_den = cwnd as u128 * 5;
        let wait = (missing * srtt as u128 * 4).div_ceil(rate_den);
        Some(now + wait as u64)
    }

    pub fn on_sent(&mut self, bytes: u64) {
        self.tokens = self.tokens.saturating_sub(bytes);
    }
}
