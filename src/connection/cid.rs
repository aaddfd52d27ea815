//! Connection IDs issued by the server and their stateless reset tokens
//! (RFC 9000 §5.1, §10.3).

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::TransportError;
use crate::frame::NewConnectionIdFrame;
use crate::packet::ConnectionId;

/// Stateless reset tokens are the last 16 bytes of a datagram.
pub(crate) const RESET_TOKEN_LEN: usize = 16;

/// Smallest datagram that can carry a stateless reset (RFC 9000 §10.3).
const MIN_STATELESS_RESET_LEN: usize = 21;

#[derive(Debug, Clone)]
struct RemoteCid {
    cid: ConnectionId,
    reset_token: Option<[u8; RESET_TOKEN_LEN]>,
}

#[derive(Debug)]
pub(crate) struct CidState {
    /// The connection ID the server addresses us with.
    pub local: ConnectionId,
    active_seq: u64,
    active: RemoteCid,
    spare: BTreeMap<u64, RemoteCid>,
    retire_prior_to: u64,
    pending_retire: Vec<u64>,
    /// Our active_connection_id_limit.
    limit: u64,
}

impl CidState {
    pub fn new(local: ConnectionId, initial_dcid: ConnectionId, limit: u64) -> Self {
        Self {
            local,
            active_seq: 0,
            active: RemoteCid {
                cid: initial_dcid,
                reset_token: None,
            },
            spare: BTreeMap::new(),
            retire_prior_to: 0,
            pending_retire: Vec::new(),
            limit: limit.max(2),
        }
    }

    /// Destination connection ID for the next packet.
    pub fn remote(&self) -> &ConnectionId {
        &self.active.cid
    }

    /// The server chose its connection ID (first Initial or Retry).
    pub fn set_remote(&mut self, cid: ConnectionId) {
        debug!(?cid, "server connection id");
        self.active.cid = cid;
    }

    /// Stateless reset token for sequence number 0, from transport params.
    pub fn set_reset_token(&mut self, token: [u8; RESET_TOKEN_LEN]) {
        if self.active_seq == 0 {
            self.active.reset_token = Some(token);
        }
    }

    pub fn on_new_connection_id(&mut self, frame: &NewConnectionIdFrame<'_>) -> Result<(), TransportError> {
        if self.active.cid.is_empty() {
            return Err(TransportError::ProtocolViolation);
        }
        let cid = ConnectionId::from_slice(frame.connection_id).ok_or(TransportError::FrameEncodingError)?;
        let seq = frame.sequence_number;

        let known = if seq == self.active_seq {
            Some(&self.active)
        } else {
            self.spare.get(&seq)
        };
        if let Some(known) = known {
            if known.cid != cid || known.reset_token != Some(frame.stateless_reset_token) {
                return Err(TransportError::ProtocolViolation);
            }
            return Ok(());
        }

        if seq < self.retire_prior_to {
            self.pending_retire.push(seq);
        } else {
            self.spare.insert(
                seq,
                RemoteCid {
                    cid,
                    reset_token: Some(frame.stateless_reset_token),
                },
            );
        }

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let retired: Vec<u64> = self.spare.range(..self.retire_prior_to).map(|(&s, _)| s).collect();
            for seq in retired {
                self.spare.remove(&seq);
                self.pending_retire.push(seq);
            }
            if self.active_seq < self.retire_prior_to {
                self.rotate();
            }
        }

        if self.spare.len() as u64 + 1 > self.limit {
            return Err(TransportError::ConnectionIdLimitError);
        }
        Ok(())
    }

    /// Move to the lowest spare connection ID and retire the active one.
    fn rotate(&mut self) {
        let Some((&seq, _)) = self.spare.iter().next() else {
            return;
        };
        let Some(next) = self.spare.remove(&seq) else {
            return;
        };
        self.pending_retire.push(self.active_seq);
        debug!(retired = self.active_seq, active = seq, "switching server connection id");
        self.active_seq = seq;
        self.active = next;
    }

    /// Next sequence number to retire with RETIRE_CONNECTION_ID.
    pub fn poll_retire(&mut self) -> Option<u64> {
        self.pending_retire.pop()
    }

    /// A RETIRE_CONNECTION_ID was lost.
    pub fn requeue_retire(&mut self, seq: u64) {
        if !self.pending_retire.contains(&seq) {
            self.pending_retire.push(seq);
        }
    }

    /// Does `datagram` end with one of the server's reset tokens?
    pub fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        if datagram.len() < MIN_STATELESS_RESET_LEN {
            return false;
        }
        let tail = &datagram[datagram.len() - RESET_TOKEN_LEN..];
        std::iter::once(&self.active)
            .chain(self.spare.values())
            .filter_map(|c| c.reset_token.as_ref())
            .any(|token| token == tail)
    }

    pub fn spare_count(&self) -> usize {
        self.spare.len()
    }
}
