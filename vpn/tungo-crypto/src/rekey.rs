// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Epoch rotation: the per-peer key container and rekey state machine.
//!
//! Both directions of an epoch are derived from one X25519 exchange between
//! ephemeral keys carried by RekeyInit/RekeyAck. The initiator keeps its
//! ephemeral private half in the machine until the matching ack arrives;
//! retransmitted inits reuse it, so any ack for the attempt remains valid.

use crate::{endpoint::Role, open::Opener, seal::Sealer, Key, KEY_LEN};
use hkdf::Hkdf;
use sha2::Sha256;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tungo_core::packet::Epoch;
use x25519_dalek::{PublicKey, StaticSecret};

/// HKDF info label for the client-to-server direction
pub const LABEL_C2S: &[u8] = b"tungo-rekey-c2s";

/// HKDF info label for the server-to-client direction
pub const LABEL_S2C: &[u8] = b"tungo-rekey-s2c";

/// How long a superseded receive epoch keeps decrypting after the next one
/// activates. Covers in-flight frames for well over two round trips.
pub const EPOCH_GRACE: Duration = Duration::from_secs(10);

/// How long an unanswered rekey attempt may hold its ephemeral key
pub const DEFAULT_REKEY_TIMEOUT: Duration = Duration::from_secs(30);

/// The u16 epoch space is spent and the session must be re-established
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rekey epoch space exhausted")]
pub struct EpochExhausted;

/// Directional keys for one epoch, named from the client's perspective
pub struct EpochKeys {
    pub client_to_server: Key,
    pub server_to_client: Key,
}

impl EpochKeys {
    pub fn new(client_to_server: [u8; KEY_LEN], server_to_client: [u8; KEY_LEN]) -> Self {
        Self {
            client_to_server: Key::new(client_to_server),
            server_to_client: Key::new(server_to_client),
        }
    }
}

/// Derives the directional keys for a new epoch from an ephemeral X25519
/// exchange.
///
/// Both sides call this with their own private half and the peer's public
/// half and arrive at identical directional keys.
pub fn derive_epoch_keys(local_private: &StaticSecret, remote_public: &PublicKey) -> EpochKeys {
    let shared = local_private.diffie_hellman(remote_public);
    let kdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut client_to_server = Key::new([0; KEY_LEN]);
    let mut server_to_client = Key::new([0; KEY_LEN]);
    kdf.expand(LABEL_C2S, client_to_server.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    kdf.expand(LABEL_S2C, server_to_client.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    EpochKeys {
        client_to_server,
        server_to_client,
    }
}

/// Rotation progress for one peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stable,
    /// We sent RekeyInit and hold the pending ephemeral private key
    PendingInitiator,
    /// We received RekeyInit and have not activated the new epoch yet
    PendingResponder,
}

/// Sealer/opener pair for one installed epoch
#[derive(Debug)]
pub struct DirectionCiphers {
    pub(crate) sealer: Sealer,
    pub(crate) opener: Opener,
}

impl DirectionCiphers {
    fn new(role: Role, keys: &EpochKeys) -> Self {
        let (seal_key, open_key) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            sealer: Sealer::new(seal_key),
            opener: Opener::new(open_key),
        }
    }
}

struct PendingRekey {
    private: StaticSecret,
    since: Instant,
}

/// Remembers the last rekey the responder completed, so a retransmitted
/// init re-sends the same ack instead of installing another epoch.
struct ResponderCache {
    remote_public: [u8; 32],
    local_public: [u8; 32],
    epoch: Epoch,
}

/// Per-peer rekey state machine.
///
/// Accessed from a single data-plane worker at a time; callers elsewhere
/// (reaper, control plane) serialize through the owning peer's guard.
pub struct Fsm {
    role: Role,
    state: State,
    send_epoch: Epoch,
    last_rekey_epoch: Epoch,
    epochs: BTreeMap<Epoch, DirectionCiphers>,
    retiring: Option<(Epoch, Instant)>,
    pending: Option<PendingRekey>,
    responder_cache: Option<ResponderCache>,
}

impl Fsm {
    /// Starts a machine at epoch 0 with the handshake-derived keys
    pub fn new(role: Role, keys: &EpochKeys) -> Self {
        let mut epochs = BTreeMap::new();
        epochs.insert(Epoch::ZERO, DirectionCiphers::new(role, keys));
        Self {
            role,
            state: State::Stable,
            send_epoch: Epoch::ZERO,
            last_rekey_epoch: Epoch::ZERO,
            epochs,
            retiring: None,
            pending: None,
            responder_cache: None,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn is_stable(&self) -> bool {
        self.state == State::Stable
    }

    #[inline]
    pub fn send_epoch(&self) -> Epoch {
        self.send_epoch
    }

    #[inline]
    pub fn last_rekey_epoch(&self) -> Epoch {
        self.last_rekey_epoch
    }

    #[inline]
    pub fn is_installed(&self, epoch: Epoch) -> bool {
        self.epochs.contains_key(&epoch)
    }

    /// Installs a new epoch without switching the send side.
    ///
    /// Returns the epoch the keys were installed under.
    pub fn start_rekey(&mut self, keys: &EpochKeys) -> Result<Epoch, EpochExhausted> {
        let epoch = self.last_rekey_epoch.next().ok_or(EpochExhausted)?;
        self.epochs
            .insert(epoch, DirectionCiphers::new(self.role, keys));
        self.last_rekey_epoch = epoch;
        Ok(epoch)
    }

    /// Promotes `epoch` to the send side and schedules the previous epoch
    /// for eviction. No-op when `epoch` is not installed.
    pub fn activate_send_epoch(&mut self, epoch: Epoch, now: Instant) {
        if !self.epochs.contains_key(&epoch) || epoch == self.send_epoch {
            return;
        }
        // at most one epoch retires at a time; a back-to-back rekey evicts
        // the older one immediately
        if let Some((old, _)) = self.retiring.take() {
            self.remove_epoch(old);
        }
        self.retiring = Some((self.send_epoch, now + EPOCH_GRACE));
        self.send_epoch = epoch;
        self.state = State::Stable;
    }

    /// Evicts an epoch immediately. The active send epoch is never removed.
    pub fn remove_epoch(&mut self, epoch: Epoch) {
        if epoch != self.send_epoch {
            self.epochs.remove(&epoch);
        }
    }

    /// Evicts the retiring epoch once its grace period has elapsed
    pub fn evict_expired(&mut self, now: Instant) {
        if let Some((epoch, deadline)) = self.retiring {
            if now >= deadline {
                self.remove_epoch(epoch);
                self.retiring = None;
            }
        }
    }

    /// Records an outgoing rekey attempt and its ephemeral private half
    pub fn set_pending_private(&mut self, private: StaticSecret, now: Instant) {
        self.state = State::PendingInitiator;
        self.pending = Some(PendingRekey {
            private,
            since: now,
        });
    }

    /// The ephemeral private half of the in-flight attempt, if any
    pub fn pending_private(&self) -> Option<&StaticSecret> {
        self.pending.as_ref().map(|pending| &pending.private)
    }

    /// The public half to retransmit in RekeyInit
    pub fn pending_public(&self) -> Option<[u8; 32]> {
        self.pending
            .as_ref()
            .map(|pending| PublicKey::from(&pending.private).to_bytes())
    }

    pub fn clear_pending_private(&mut self) {
        self.pending = None;
        if self.state == State::PendingInitiator {
            self.state = State::Stable;
        }
    }

    /// Marks the responder side busy between install and activation
    pub fn note_responding(&mut self) {
        if self.state == State::Stable {
            self.state = State::PendingResponder;
        }
    }

    /// Records the ack the responder produced for `remote_public`
    pub fn note_responder_result(
        &mut self,
        remote_public: [u8; 32],
        local_public: [u8; 32],
        epoch: Epoch,
    ) {
        self.responder_cache = Some(ResponderCache {
            remote_public,
            local_public,
            epoch,
        });
    }

    /// The ack to re-send when `remote_public` was already answered.
    ///
    /// A retransmitted init must not install another epoch; the initiator
    /// still holds the keypair the first ack answered.
    pub fn responder_replay(&self, remote_public: &[u8; 32]) -> Option<([u8; 32], Epoch)> {
        self.responder_cache
            .as_ref()
            .filter(|cache| cache.remote_public == *remote_public)
            .filter(|cache| self.epochs.contains_key(&cache.epoch))
            .map(|cache| (cache.local_public, cache.epoch))
    }

    /// Drops an in-flight attempt whose ack never arrived. Idempotent.
    pub fn abort_pending_if_expired(&mut self, now: Instant, timeout: Duration) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|pending| now.duration_since(pending.since) >= timeout);
        if expired {
            self.clear_pending_private();
        }
    }

    /// Sealer for the current send epoch
    #[inline]
    pub(crate) fn sealer_mut(&mut self) -> &mut Sealer {
        &mut self
            .epochs
            .get_mut(&self.send_epoch)
            .expect("send epoch is always installed")
            .sealer
    }

    /// Opener for a received epoch, when that epoch is installed
    #[inline]
    pub(crate) fn opener_mut(&mut self, epoch: Epoch) -> Option<&mut Opener> {
        self.epochs.get_mut(&epoch).map(|pair| &mut pair.opener)
    }

    /// Whether the send epoch's counter is near exhaustion
    #[inline]
    pub fn should_rekey(&self) -> bool {
        self.epochs
            .get(&self.send_epoch)
            .is_some_and(|pair| pair.sealer.should_rekey())
    }

    /// Drops every installed epoch, wiping the key schedules
    pub fn wipe(&mut self) {
        self.epochs.clear();
        self.pending = None;
        self.retiring = None;
        self.responder_cache = None;
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn force_last_rekey_epoch(&mut self, epoch: Epoch) {
        self.last_rekey_epoch = epoch;
    }
}

impl core::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Fsm")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("send_epoch", &self.send_epoch)
            .field("last_rekey_epoch", &self.last_rekey_epoch)
            .field("epochs", &self.epochs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn handshake_keys() -> EpochKeys {
        EpochKeys::new([1; 32], [2; 32])
    }

    fn fsm(role: Role) -> Fsm {
        Fsm::new(role, &handshake_keys())
    }

    #[test]
    fn derivation_is_symmetric_between_the_roles() {
        let client_private = StaticSecret::random_from_rng(OsRng);
        let server_private = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_private);
        let server_public = PublicKey::from(&server_private);

        let client_side = derive_epoch_keys(&client_private, &server_public);
        let server_side = derive_epoch_keys(&server_private, &client_public);

        assert_eq!(
            client_side.client_to_server.as_ref(),
            server_side.client_to_server.as_ref()
        );
        assert_eq!(
            client_side.server_to_client.as_ref(),
            server_side.server_to_client.as_ref()
        );
        // directions must differ from each other
        assert_ne!(
            client_side.client_to_server.as_ref(),
            client_side.server_to_client.as_ref()
        );
    }

    #[test]
    fn start_rekey_installs_without_switching() {
        let mut fsm = fsm(Role::Server);
        let epoch = fsm.start_rekey(&handshake_keys()).unwrap();
        assert_eq!(epoch, Epoch::new(1));
        assert_eq!(fsm.send_epoch(), Epoch::ZERO);
        assert!(fsm.is_installed(epoch));
    }

    #[test]
    fn activation_switches_and_retires_with_grace() {
        let mut fsm = fsm(Role::Server);
        let now = Instant::now();
        let epoch = fsm.start_rekey(&handshake_keys()).unwrap();

        fsm.activate_send_epoch(epoch, now);
        assert_eq!(fsm.send_epoch(), epoch);
        // the old epoch keeps receiving during the grace period
        assert!(fsm.is_installed(Epoch::ZERO));

        fsm.evict_expired(now + EPOCH_GRACE - Duration::from_millis(1));
        assert!(fsm.is_installed(Epoch::ZERO));
        fsm.evict_expired(now + EPOCH_GRACE);
        assert!(!fsm.is_installed(Epoch::ZERO));
    }

    #[test]
    fn activating_an_unknown_epoch_is_a_no_op() {
        let mut fsm = fsm(Role::Client);
        fsm.activate_send_epoch(Epoch::new(9), Instant::now());
        assert_eq!(fsm.send_epoch(), Epoch::ZERO);
    }

    #[test]
    fn the_send_epoch_cannot_be_removed() {
        let mut fsm = fsm(Role::Client);
        fsm.remove_epoch(Epoch::ZERO);
        assert!(fsm.is_installed(Epoch::ZERO));
    }

    #[test]
    fn epoch_space_exhausts_at_the_limit() {
        let mut fsm = fsm(Role::Server);
        fsm.force_last_rekey_epoch(Epoch::new(Epoch::MAX_REKEY));
        assert_eq!(fsm.start_rekey(&handshake_keys()), Err(EpochExhausted));

        fsm.force_last_rekey_epoch(Epoch::new(Epoch::MAX_REKEY - 1));
        assert_eq!(
            fsm.start_rekey(&handshake_keys()),
            Ok(Epoch::new(Epoch::MAX_REKEY))
        );
    }

    #[test]
    fn pending_attempt_is_reused_and_expires() {
        let mut fsm = fsm(Role::Client);
        let now = Instant::now();
        let private = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private).to_bytes();

        fsm.set_pending_private(private, now);
        assert_eq!(fsm.state(), State::PendingInitiator);
        assert_eq!(fsm.pending_public(), Some(public));
        // retransmission sees the same keypair
        assert_eq!(fsm.pending_public(), Some(public));

        fsm.abort_pending_if_expired(now + Duration::from_secs(29), Duration::from_secs(30));
        assert!(fsm.pending_private().is_some());

        fsm.abort_pending_if_expired(now + Duration::from_secs(30), Duration::from_secs(30));
        assert!(fsm.pending_private().is_none());
        assert_eq!(fsm.state(), State::Stable);

        // idempotent
        fsm.abort_pending_if_expired(now + Duration::from_secs(31), Duration::from_secs(30));
        assert!(fsm.pending_private().is_none());
    }

    #[test]
    fn wipe_drops_every_epoch() {
        let mut fsm = fsm(Role::Server);
        let epoch = fsm.start_rekey(&handshake_keys()).unwrap();
        fsm.wipe();
        assert!(!fsm.is_installed(Epoch::ZERO));
        assert!(!fsm.is_installed(epoch));
    }
}
