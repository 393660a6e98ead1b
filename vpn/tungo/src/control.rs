// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The in-band control plane.
//!
//! Service packets are stateless translations into rekey-machine actions;
//! everything stateful (the pending keypair, the epoch container) lives in
//! the machine itself. The client side adds two pieces of clockwork: the
//! rekey scheduler, evaluated inline with TUN reads, and the keepalive
//! check, evaluated inline with wire reads.

use crate::ConnectionError;
use rand::rngs::OsRng;
use std::time::{Duration, Instant};
use tungo_core::packet::service::ServicePacket;
use tungo_crypto::{
    rekey::{derive_epoch_keys, EpochExhausted},
    session::CryptoSession,
};
use x25519_dalek::{PublicKey, StaticSecret};

/// What the worker does after a service packet was handled
#[derive(Debug, PartialEq, Eq)]
pub enum ControlAction {
    /// Nothing to send
    None,
    /// Seal and send this packet under the current send epoch
    Reply(ServicePacket),
    /// Send the packet, then promote the named epoch
    ReplyThenActivate(ServicePacket, tungo_core::packet::Epoch),
}

/// Handles a service packet on the server side of a session.
///
/// `crypto` is accessed under the owning peer's guard by the caller.
pub fn server_handle(
    crypto: &mut CryptoSession,
    packet: ServicePacket,
    _now: Instant,
) -> Result<ControlAction, ConnectionError> {
    match packet {
        ServicePacket::RekeyInit { public_key } => {
            // a retransmitted init re-sends the same ack
            if let Some((local_public, _epoch)) = crypto.fsm().responder_replay(&public_key) {
                return Ok(ControlAction::Reply(ServicePacket::RekeyAck {
                    public_key: local_public,
                }));
            }

            let local_private = StaticSecret::random_from_rng(OsRng);
            let local_public = PublicKey::from(&local_private).to_bytes();
            let keys = derive_epoch_keys(&local_private, &PublicKey::from(public_key));

            let fsm = crypto.fsm_mut();
            fsm.note_responding();
            let epoch = match fsm.start_rekey(&keys) {
                Ok(epoch) => epoch,
                Err(EpochExhausted) => {
                    return Ok(ControlAction::Reply(ServicePacket::EpochExhausted));
                }
            };
            fsm.note_responder_result(public_key, local_public, epoch);
            Ok(ControlAction::ReplyThenActivate(
                ServicePacket::RekeyAck {
                    public_key: local_public,
                },
                epoch,
            ))
        }
        ServicePacket::Ping => Ok(ControlAction::Reply(ServicePacket::Pong)),
        // a client tearing down its side ends the connection
        ServicePacket::SessionReset => Err(ConnectionError::SessionReset),
        // not meaningful toward a server; dropped
        ServicePacket::Pong
        | ServicePacket::RekeyAck { .. }
        | ServicePacket::EpochExhausted => Ok(ControlAction::None),
    }
}

/// Handles a service packet on the client side of a session
pub fn client_handle(
    crypto: &mut CryptoSession,
    packet: ServicePacket,
    now: Instant,
) -> Result<ControlAction, ConnectionError> {
    match packet {
        ServicePacket::RekeyAck { public_key } => {
            let fsm = crypto.fsm_mut();
            let Some(private) = fsm.pending_private() else {
                // no attempt in flight; a duplicate ack after completion
                return Ok(ControlAction::None);
            };
            let keys = derive_epoch_keys(private, &PublicKey::from(public_key));
            let epoch = fsm
                .start_rekey(&keys)
                .map_err(|EpochExhausted| ConnectionError::EpochExhausted)?;
            fsm.activate_send_epoch(epoch, now);
            fsm.clear_pending_private();
            tracing::debug!(epoch = epoch.as_u16(), "rekey completed");
            Ok(ControlAction::None)
        }
        ServicePacket::EpochExhausted => Err(ConnectionError::EpochExhausted),
        ServicePacket::SessionReset => Err(ConnectionError::SessionReset),
        // keepalive progress is recorded at decrypt time
        ServicePacket::Pong => Ok(ControlAction::None),
        // initiator-bound packets arriving at a client are dropped
        ServicePacket::Ping | ServicePacket::RekeyInit { .. } => Ok(ControlAction::None),
    }
}

/// Client-side rekey clockwork, evaluated inline with TUN reads.
///
/// A deadline comparison rather than an async timer: it cannot wedge when
/// there is no traffic, and a zero-traffic session has nothing worth
/// rekeying.
pub struct RekeyScheduler {
    rotate_at: Instant,
    interval: Duration,
    timeout: Duration,
}

impl RekeyScheduler {
    pub fn new(now: Instant, interval: Duration, timeout: Duration) -> Self {
        Self {
            rotate_at: now + interval,
            interval,
            timeout,
        }
    }

    /// Runs one scheduling step; returns an init packet to send, if one is
    /// due.
    ///
    /// The deadline advances whether or not the machine was ready, so a
    /// wedged pending attempt delays the next try instead of busy-looping;
    /// the pending timeout clears the wedge first.
    pub fn poll(&mut self, crypto: &mut CryptoSession, now: Instant) -> Option<ServicePacket> {
        let fsm = crypto.fsm_mut();
        fsm.abort_pending_if_expired(now, self.timeout);
        fsm.evict_expired(now);

        let deadline_due = now >= self.rotate_at;
        if deadline_due {
            self.rotate_at = now + self.interval;
        }

        if fsm.pending_private().is_some() {
            // retransmit the in-flight attempt on the deadline only; the
            // first ack to land remains valid for every copy
            return deadline_due.then(|| ServicePacket::RekeyInit {
                public_key: fsm.pending_public().expect("pending attempt has a keypair"),
            });
        }

        if !fsm.is_stable() {
            return None;
        }

        // nonce pressure initiates early regardless of the deadline
        if !deadline_due && !crypto.should_rekey() {
            return None;
        }

        let private = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private).to_bytes();
        crypto.fsm_mut().set_pending_private(private, now);
        tracing::debug!("rekey initiated");
        Some(ServicePacket::RekeyInit { public_key })
    }
}

/// Client-side keepalive clockwork, evaluated inline with wire reads
pub struct Keepalive {
    ping_interval: Duration,
    restart_timeout: Duration,
    last_ping: Option<Instant>,
}

impl Keepalive {
    pub fn new(ping_interval: Duration, restart_timeout: Duration) -> Self {
        Self {
            ping_interval,
            restart_timeout,
            last_ping: None,
        }
    }

    /// Decides what the quiet period since `last_recv` warrants
    pub fn poll(
        &mut self,
        last_recv: Instant,
        now: Instant,
    ) -> Result<Option<ServicePacket>, ConnectionError> {
        let quiet = now.saturating_duration_since(last_recv);
        if quiet >= self.restart_timeout {
            return Err(ConnectionError::ServerUnreachable);
        }
        if quiet >= self.ping_interval {
            // one ping per interval, not one per poll
            let due = self
                .last_ping
                .is_none_or(|last| now.saturating_duration_since(last) >= self.ping_interval);
            if due {
                self.last_ping = Some(now);
                return Ok(Some(ServicePacket::Ping));
            }
        }
        Ok(None)
    }
}
