// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session ownership: the repository, the registrar and the idle reaper.
//!
//! The repository maps every key a packet can arrive under onto the owning
//! peer. Lookups run on every packet and go straight to the sharded index;
//! mutations are rare and serialize through one mutex so displacement and
//! roaming are atomic with respect to each other.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};

mod peer;
mod reaper;
mod registrar;

pub use peer::{Peer, PeerClosed, PeerInfo};
pub use reaper::run_reaper;
pub use registrar::{Registrar, Registration};

/// Concurrent peer map, indexed by everything a packet can carry
#[derive(Default)]
pub struct SessionRepository {
    by_ipv4: DashMap<Ipv4Addr, Arc<Peer>>,
    by_ipv6: DashMap<Ipv6Addr, Arc<Peer>>,
    by_external: DashMap<SocketAddr, Arc<Peer>>,
    by_route: DashMap<u64, Arc<Peer>>,
    /// Serializes add/delete/update so displacement closes exactly once
    mutation: Mutex<()>,
}

impl SessionRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `peer`, displacing any peer registered on the same internal
    /// address. The displaced peer is closed before the new one becomes
    /// visible.
    pub fn add(&self, peer: Arc<Peer>) {
        let _guard = self.mutation.lock();

        let displaced = self
            .by_ipv4
            .get(&peer.info().internal_ipv4)
            .map(|entry| entry.value().clone());
        if let Some(displaced) = displaced {
            self.unlink(&displaced);
            displaced.close();
        }

        self.by_ipv4.insert(peer.info().internal_ipv4, peer.clone());
        if let Some(ipv6) = peer.info().internal_ipv6 {
            self.by_ipv6.insert(ipv6, peer.clone());
        }
        self.by_external.insert(peer.external(), peer.clone());
        if let Some(route_id) = peer.info().route_id {
            self.by_route.insert(route_id, peer);
        }
    }

    /// Removes and closes `peer`. A peer that was already displaced is left
    /// alone; only index entries still pointing at it are removed.
    pub fn delete(&self, peer: &Arc<Peer>) {
        let _guard = self.mutation.lock();
        self.unlink(peer);
        peer.close();
    }

    /// Points the external index at `addr` after an authenticated datagram
    /// arrived from it.
    pub fn update_external_addr(&self, peer: &Arc<Peer>, addr: SocketAddr) {
        let _guard = self.mutation.lock();
        let previous = peer.external();
        if previous == addr {
            return;
        }
        self.by_external
            .remove_if(&previous, |_, current| Arc::ptr_eq(current, peer));
        peer.set_external(addr);
        self.by_external.insert(addr, peer.clone());
        tracing::debug!(client_id = peer.info().client_id, %addr, "peer roamed");
    }

    /// The peer owning `destination`, either as its internal address or
    /// inside one of its routed prefixes.
    pub fn find_by_destination_ip(&self, destination: IpAddr) -> Option<Arc<Peer>> {
        match destination {
            IpAddr::V4(v4) => {
                if let Some(entry) = self.by_ipv4.get(&v4) {
                    return Some(entry.value().clone());
                }
            }
            IpAddr::V6(v6) => {
                if let Some(entry) = self.by_ipv6.get(&v6) {
                    return Some(entry.value().clone());
                }
            }
        }
        // routed prefixes are the slow path; direct internal addresses cover
        // the common case above
        self.by_ipv4
            .iter()
            .map(|entry| entry.value().clone())
            .find(|peer| peer.info().allowed_sources.covers(destination))
    }

    pub fn get_by_external(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.by_external.get(&addr).map(|entry| entry.value().clone())
    }

    pub fn get_by_route_id(&self, route_id: u64) -> Option<Arc<Peer>> {
        self.by_route.get(&route_id).map(|entry| entry.value().clone())
    }

    /// Closes and removes every peer registered with `public_key`.
    ///
    /// The revocation hook for the configuration watcher.
    pub fn terminate_by_pub_key(&self, public_key: &[u8; 32]) -> usize {
        let targets: Vec<Arc<Peer>> = self
            .by_ipv4
            .iter()
            .filter(|entry| entry.value().info().public_key == *public_key)
            .map(|entry| entry.value().clone())
            .collect();
        for peer in &targets {
            self.delete(peer);
        }
        targets.len()
    }

    /// Closes and removes peers with no authenticated traffic for
    /// `idle_timeout`.
    pub fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let idle: Vec<Arc<Peer>> = self
            .by_ipv4
            .iter()
            .filter(|entry| {
                now.saturating_duration_since(entry.value().last_recv()) >= idle_timeout
            })
            .map(|entry| entry.value().clone())
            .collect();
        for peer in &idle {
            tracing::debug!(client_id = peer.info().client_id, "reaping idle peer");
            self.delete(peer);
        }
        idle.len()
    }

    /// Closes and removes every peer, for endpoint shutdown
    pub fn close_all(&self) {
        let peers: Vec<Arc<Peer>> = self
            .by_ipv4
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for peer in &peers {
            self.delete(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ipv4.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ipv4.is_empty()
    }

    /// Removes every index entry still pointing at `peer`.
    ///
    /// Callers hold the mutation lock.
    fn unlink(&self, peer: &Arc<Peer>) {
        let info = peer.info();
        self.by_ipv4
            .remove_if(&info.internal_ipv4, |_, current| Arc::ptr_eq(current, peer));
        if let Some(ipv6) = info.internal_ipv6 {
            self.by_ipv6
                .remove_if(&ipv6, |_, current| Arc::ptr_eq(current, peer));
        }
        self.by_external
            .remove_if(&peer.external(), |_, current| Arc::ptr_eq(current, peer));
        if let Some(route_id) = info.route_id {
            self.by_route
                .remove_if(&route_id, |_, current| Arc::ptr_eq(current, peer));
        }
    }
}
