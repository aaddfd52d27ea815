//! Connection-level key management.
//!
//! Keys live here per encryption level until the level is retired. Dropping
//! a [`KeySet`] or [`PacketKey`] wipes its material, so every replacement
//! below erases the superseded keys on the spot.

use tracing::debug;

use crate::crypto::key_schedule::{derive_directional_keys, derive_initial_keys, derive_level_keys};
use crate::crypto::{DirectionalKeys, KeySet, Level, PacketKey};
use crate::error::{Error, Result};
use crate::tls::LevelSecrets;

// ---------------------------------------------------------------------------
// 1-RTT keys
// ---------------------------------------------------------------------------

/// 1-RTT keys plus key update state (RFC 9001 §6).
///
/// Header protection keys never change; only the packet keys advance.
pub(crate) struct OneRttKeys {
    pub local: DirectionalKeys,
    pub remote: DirectionalKeys,
    pub key_phase: bool,
    /// Remote packet key of the next phase, derived on first use.
    next_remote: Option<PacketKey>,
    pub updates: u64,
}

impl OneRttKeys {
    fn new(keys: KeySet) -> Self {
        Self {
            local: keys.local,
            remote: keys.remote,
            key_phase: false,
            next_remote: None,
            updates: 0,
        }
    }

    /// Packet key for a packet whose key phase differs from ours.
    pub fn next_remote(&mut self) -> Result<&PacketKey> {
        if self.next_remote.is_none() {
            self.next_remote = Some(self.remote.packet.next_generation()?);
        }
        self.next_remote.as_ref().ok_or(Error::InvalidKey)
    }

    /// A packet authenticated under the next phase: both directions move
    /// to the next generation and the old packet keys are dropped.
    pub fn promote(&mut self) -> Result<()> {
        let next_remote = match self.next_remote.take() {
            Some(key) => key,
            None => self.remote.packet.next_generation()?,
        };
        let next_local = self.local.packet.next_generation()?;
        self.remote.packet = next_remote;
        self.local.packet = next_local;
        self.key_phase = !self.key_phase;
        self.updates += 1;
        debug!(key_phase = self.key_phase, updates = self.updates, "peer key update");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// All levels
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct ConnectionKeys {
    pub initial: Option<KeySet>,
    pub handshake: Option<KeySet>,
    /// Client to server only.
    pub zero_rtt: Option<DirectionalKeys>,
    pub one_rtt: Option<OneRttKeys>,
}

impl ConnectionKeys {
    /// Derive Initial keys from the destination connection ID, replacing
    /// any previous ones (after Retry).
    pub fn set_initial(&mut self, dcid: &[u8], version: u32) -> Result<()> {
        let keys = derive_initial_keys(dcid, version)?;
        if let Some(old) = self.initial.replace(keys) {
            old.discard(Level::Initial);
        }
        Ok(())
    }

    /// Install keys exported by the TLS session.
    pub fn install(&mut self, level: Level, secrets: &LevelSecrets) -> Result<()> {
        match level {
            Level::Initial => return Err(Error::InvalidKey),
            Level::ZeroRtt => {
                self.zero_rtt = Some(derive_directional_keys(secrets.suite, &secrets.local)?);
            }
            Level::Handshake => {
                self.handshake = Some(derive_level_keys(secrets.suite, &secrets.local, &secrets.remote)?);
            }
            Level::OneRtt => {
                let keys = derive_level_keys(secrets.suite, &secrets.local, &secrets.remote)?;
                self.one_rtt = Some(OneRttKeys::new(keys));
            }
        }
        debug!(?level, suite = ?secrets.suite, "keys installed");
        Ok(())
    }

    pub fn has(&self, level: Level) -> bool {
        self.local(level).is_some()
    }

    /// Keys protecting what we send at `level`.
    pub fn local(&self, level: Level) -> Option<&DirectionalKeys> {
        match level {
            Level::Initial => self.initial.as_ref().map(|k| &k.local),
            Level::Handshake => self.handshake.as_ref().map(|k| &k.local),
            Level::ZeroRtt => self.zero_rtt.as_ref(),
            Level::OneRtt => self.one_rtt.as_ref().map(|k| &k.local),
        }
    }

    /// Keys for opening what the server sends at `level`. A client never
    /// receives 0-RTT.
    pub fn remote(&self, level: Level) -> Option<&DirectionalKeys> {
        match level {
            Level::Initial => self.initial.as_ref().map(|k| &k.remote),
            Level::Handshake => self.handshake.as_ref().map(|k| &k.remote),
            Level::ZeroRtt => None,
            Level::OneRtt => self.one_rtt.as_ref().map(|k| &k.remote),
        }
    }

    pub fn discard(&mut self, level: Level) {
        match level {
            Level::Initial => {
                if let Some(keys) = self.initial.take() {
                    keys.discard(level);
                }
            }
            Level::Handshake => {
                if let Some(keys) = self.handshake.take() {
                    keys.discard(level);
                }
            }
            Level::ZeroRtt => {
                if self.zero_rtt.take().is_some() {
                    debug!(?level, "discarding keys");
                }
            }
            Level::OneRtt => {
                if self.one_rtt.take().is_some() {
                    debug!(?level, "discarding keys");
                }
            }
        }
    }

    pub fn discard_all(&mut self) {
        for level in [Level::Initial, Level::ZeroRtt, Level::Handshake, Level::OneRtt] {
            self.discard(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherSuite, Secret};

    fn secrets() -> LevelSecrets {
        LevelSecrets {
            suite: CipherSuite::Aes128GcmSha256,
            local: Secret::new(&[1; 32]),
            remote: Secret::new(&[2; 32]),
        }
    }

    #[test]
    fn levels_install_and_discard() {
        let mut keys = ConnectionKeys::default();
        keys.set_initial(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08], 1).unwrap();
        assert!(keys.has(Level::Initial));
        assert!(!keys.has(Level::Handshake));

        keys.install(Level::Handshake, &secrets()).unwrap();
        keys.install(Level::ZeroRtt, &secrets()).unwrap();
        assert!(keys.has(Level::ZeroRtt));
        assert!(keys.remote(Level::ZeroRtt).is_none());

        keys.discard(Level::Initial);
        assert!(!keys.has(Level::Initial));
        assert!(keys.install(Level::Initial, &secrets()).is_err());

        keys.discard_all();
        assert!(!keys.has(Level::Handshake));
        assert!(!keys.has(Level::ZeroRtt));
    }

    #[test]
    fn key_update_follows_the_peer() {
        let mut client = ConnectionKeys::default();
        client.install(Level::OneRtt, &secrets()).unwrap();
        let mut server = ConnectionKeys::default();
        let swapped = LevelSecrets {
            suite: CipherSuite::Aes128GcmSha256,
            local: Secret::new(&[2; 32]),
            remote: Secret::new(&[1; 32]),
        };
        server.install(Level::OneRtt, &swapped).unwrap();

        let server_1rtt = server.one_rtt.as_mut().unwrap();
        server_1rtt.promote().unwrap();
        let mut payload = *b"after the update";
        let tag = server_1rtt.local.packet.seal(9, b"hdr", &mut payload).unwrap();
        let mut sealed = payload.to_vec();
        sealed.extend_from_slice(&tag);

        let client_1rtt = client.one_rtt.as_mut().unwrap();
        let mut trial = sealed.clone();
        assert!(client_1rtt.remote.packet.open(9, b"hdr", &mut trial).is_err());
        let len = client_1rtt.next_remote().unwrap().open(9, b"hdr", &mut sealed).unwrap();
        assert_eq!(&sealed[..len], b"after the update");

        client_1rtt.promote().unwrap();
        assert!(client_1rtt.key_phase);
        assert_eq!(client_1rtt.updates, 1);
    }
}
