// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-peer ownership bundle.
//!
//! A peer's crypto is the rotation-sensitive state: both envelope directions
//! mutate counters and replay windows, so the data plane takes the guard's
//! writer side for the span of a single seal or open, and the reader side
//! serves cheap state inspection. Closing wins over both: the closed flag is
//! checked before any acquisition and the keys are wiped only while holding
//! the writer lock, so no accessor can observe half-dead key material.

use crate::{dataplane::Egress, Transport};
use core::net::{Ipv4Addr, Ipv6Addr};
use parking_lot::{Mutex, RwLock};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tungo_core::inet::AllowedSources;
use tungo_crypto::session::CryptoSession;

/// The peer was torn down while the caller held a reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("peer is closed")]
pub struct PeerClosed;

/// Immutable session identity established at registration
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub client_id: i32,
    pub public_key: [u8; 32],
    pub internal_ipv4: Ipv4Addr,
    pub internal_ipv6: Option<Ipv6Addr>,
    /// Datagram demux id; `None` on stream transports
    pub route_id: Option<u64>,
    pub allowed_sources: AllowedSources,
    pub transport: Transport,
}

/// One registered peer
pub struct Peer {
    info: PeerInfo,
    external: RwLock<SocketAddr>,
    crypto: RwLock<CryptoSession>,
    closed: AtomicBool,
    egress: Egress,
    last_recv: Mutex<Instant>,
}

impl Peer {
    pub fn new(
        info: PeerInfo,
        external: SocketAddr,
        crypto: CryptoSession,
        egress: Egress,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            external: RwLock::new(external),
            crypto: RwLock::new(crypto),
            closed: AtomicBool::new(false),
            egress,
            last_recv: Mutex::new(Instant::now()),
        })
    }

    #[inline]
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    #[inline]
    pub fn external(&self) -> SocketAddr {
        *self.external.read()
    }

    pub(crate) fn set_external(&self, addr: SocketAddr) {
        *self.external.write() = addr;
    }

    #[inline]
    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `f` with exclusive access to the crypto session.
    ///
    /// Fails fast once the peer is closed; the closed check happens before
    /// and after acquisition so a closer never races a fresh accessor.
    #[inline]
    pub fn with_crypto<R>(
        &self,
        f: impl FnOnce(&mut CryptoSession) -> R,
    ) -> Result<R, PeerClosed> {
        if self.is_closed() {
            return Err(PeerClosed);
        }
        let mut guard = self.crypto.write();
        if self.is_closed() {
            return Err(PeerClosed);
        }
        Ok(f(&mut guard))
    }

    /// Runs `f` with shared read access to the crypto session
    #[inline]
    pub fn inspect_crypto<R>(&self, f: impl FnOnce(&CryptoSession) -> R) -> Result<R, PeerClosed> {
        if self.is_closed() {
            return Err(PeerClosed);
        }
        let guard = self.crypto.read();
        if self.is_closed() {
            return Err(PeerClosed);
        }
        Ok(f(&guard))
    }

    /// Stamps receipt of authenticated data, for the idle reaper
    pub fn touch_recv(&self, now: Instant) {
        *self.last_recv.lock() = now;
    }

    pub fn last_recv(&self) -> Instant {
        *self.last_recv.lock()
    }

    /// Tears the peer down: marks it closed, wipes the keys under the
    /// writer lock and closes the egress. Exactly once; later calls are
    /// no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut crypto = self.crypto.write();
            crypto.wipe();
        }
        self.egress.close();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for Peer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Peer")
            .field("client_id", &self.info.client_id)
            .field("internal_ipv4", &self.info.internal_ipv4)
            .field("transport", &self.info.transport)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
