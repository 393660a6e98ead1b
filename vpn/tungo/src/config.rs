// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Settings the core consumes.
//!
//! File formats are the embedder's concern; everything here is plain data
//! with serde derives so any format maps onto it. The [`ConfigurationManager`]
//! trait is the seam the server is built against: a settings snapshot plus a
//! watch channel of allowed-peer revisions that drives revocation.

use core::net::IpAddr;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tungo_core::inet::Cidr;
use tungo_crypto::handshake::{AllowedPeer, AllowedPeersLookup, Identity};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no protocol is enabled")]
    NoProtocolEnabled,
    #[error("server identity key is not configured")]
    MissingServerKey,
    #[error("key is not valid base64 or has the wrong length")]
    InvalidKey,
    #[error("client id {0} does not fit the ipv4 subnet")]
    SubnetExhausted(i32),
}

/// Per-protocol listener toggles; a `Some` port enables the protocol
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Protocols {
    #[serde(default)]
    pub tcp: Option<u16>,
    #[serde(default)]
    pub udp: Option<u16>,
    #[serde(default)]
    pub ws: Option<u16>,
}

impl Protocols {
    #[inline]
    pub fn any_enabled(&self) -> bool {
        self.tcp.is_some() || self.udp.is_some() || self.ws.is_some()
    }
}

/// Timer knobs, in seconds on the wire format
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timers {
    #[serde(with = "seconds")]
    pub rekey_interval: Duration,
    #[serde(with = "seconds")]
    pub rekey_timeout: Duration,
    #[serde(with = "seconds")]
    pub ping_interval: Duration,
    #[serde(with = "seconds")]
    pub ping_restart_timeout: Duration,
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            rekey_interval: Duration::from_secs(600),
            rekey_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            ping_restart_timeout: Duration::from_secs(75),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One configured peer
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    #[serde(with = "key_bytes")]
    pub public_key: [u8; 32],
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub client_id: i32,
    #[serde(default)]
    pub allowed_ips: Vec<Cidr>,
}

impl From<&PeerEntry> for AllowedPeer {
    fn from(entry: &PeerEntry) -> Self {
        AllowedPeer {
            name: entry.name.clone(),
            public_key: entry.public_key,
            enabled: entry.enabled,
            client_id: entry.client_id,
            allowed_ips: entry.allowed_ips.clone(),
        }
    }
}

/// Everything the server core consumes
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Bind address; `::` listens dual-stack where the platform allows it
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default)]
    pub protocols: Protocols,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(with = "key_bytes")]
    pub x25519_private: [u8; 32],
    pub ipv4_subnet: Cidr,
    #[serde(default)]
    pub ipv6_subnet: Option<Cidr>,
    #[serde(default)]
    pub allowed_peers: Vec<PeerEntry>,
    #[serde(default)]
    pub timers: Timers,
    /// Handshakes in flight beyond this demand cookies
    #[serde(default = "default_handshake_load")]
    pub handshake_load_threshold: usize,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.protocols.any_enabled() {
            return Err(ConfigError::NoProtocolEnabled);
        }
        if self.x25519_private == [0u8; 32] {
            return Err(ConfigError::MissingServerKey);
        }
        for peer in &self.allowed_peers {
            if peer.client_id < 0
                || self
                    .ipv4_subnet
                    .host_at(peer.client_id as u32 + 1)
                    .is_none()
            {
                return Err(ConfigError::SubnetExhausted(peer.client_id));
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.x25519_private)
    }

    pub fn allowed_peers(&self) -> Vec<AllowedPeer> {
        self.allowed_peers.iter().map(AllowedPeer::from).collect()
    }

    /// MTU for a given transport; datagrams leave room for their larger
    /// envelope inside the path MTU.
    pub fn transport_mtu(&self, transport: crate::Transport) -> u16 {
        match transport {
            crate::Transport::Udp => self.mtu.saturating_sub(
                (tungo_core::packet::datagram::Datagram::OVERHEAD
                    - tungo_core::packet::frame::Frame::OVERHEAD) as u16,
            ),
            _ => self.mtu,
        }
    }
}

/// The seam between the embedder's configuration and the server core
pub trait ConfigurationManager: Send + Sync + 'static {
    /// A settings snapshot; failure here is fatal
    fn settings(&self) -> Result<Settings, ConfigError>;

    /// Revisions of the allowed-peer list. Each new value replaces the
    /// previous one; disabled or vanished peers are revoked.
    fn peer_revisions(&self) -> watch::Receiver<Vec<AllowedPeer>>;
}

/// In-memory configuration, for embedding and tests
pub struct StaticConfiguration {
    settings: Settings,
    peers_tx: watch::Sender<Vec<AllowedPeer>>,
}

impl StaticConfiguration {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (peers_tx, _) = watch::channel(settings.allowed_peers());
        Arc::new(Self { settings, peers_tx })
    }

    /// Publishes a new allowed-peer revision
    pub fn update_peers(&self, peers: Vec<AllowedPeer>) {
        // receivers only care about the latest revision
        let _ = self.peers_tx.send(peers);
    }
}

impl ConfigurationManager for StaticConfiguration {
    fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(self.settings.clone())
    }

    fn peer_revisions(&self) -> watch::Receiver<Vec<AllowedPeer>> {
        self.peers_tx.subscribe()
    }
}

/// Read-side view of the latest peer revision, used by the registrar
#[derive(Clone)]
pub struct PeerDirectory {
    revisions: watch::Receiver<Vec<AllowedPeer>>,
}

impl PeerDirectory {
    pub fn new(revisions: watch::Receiver<Vec<AllowedPeer>>) -> Self {
        Self { revisions }
    }
}

impl AllowedPeersLookup for PeerDirectory {
    fn is_empty(&self) -> bool {
        self.revisions.borrow().is_empty()
    }

    fn find(&self, public_key: &[u8; 32]) -> Option<AllowedPeer> {
        self.revisions
            .borrow()
            .iter()
            .find(|peer| peer.public_key == *public_key)
            .cloned()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V6(core::net::Ipv6Addr::UNSPECIFIED)
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_true() -> bool {
    true
}

const fn default_handshake_load() -> usize {
    256
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Keys travel through configuration as base64 strings
mod key_bytes {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        use base64::Engine as _;
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected a 32-byte key"))
    }
}
