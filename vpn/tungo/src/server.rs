// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server assembly.
//!
//! Each enabled protocol gets its own TUN device and listener; the peers
//! they register all share one repository. Around the listeners run the
//! housekeeping tasks: the idle reaper, cookie-secret rotation and the
//! revocation watcher that applies allowed-peer revisions.

use crate::{
    config::{ConfigurationManager, PeerDirectory, Settings},
    session::{run_reaper, Registrar, SessionRepository},
    transport::{serve_tcp, serve_udp, serve_ws},
    tun::TunFactory,
    FatalError, Transport,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, net::UdpSocket, sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tungo_crypto::handshake::{AllowedPeer, CookieManager, InFlightHandshakes};

/// The assembled server endpoint
pub struct Server<C, F> {
    config: Arc<C>,
    tun_factory: Arc<F>,
}

/// A running server: live addresses, the shared repository and the task
/// set, with shutdown wired to a cancellation token.
pub struct ServerHandle {
    repository: Arc<SessionRepository>,
    local_addrs: HashMap<Transport, SocketAddr>,
    settings: Settings,
    dispose: Arc<dyn TunFactory>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl<C: ConfigurationManager, F: TunFactory> Server<C, F> {
    pub fn new(config: Arc<C>, tun_factory: Arc<F>) -> Self {
        Self {
            config,
            tun_factory,
        }
    }

    /// Binds every enabled listener and spawns the endpoint's tasks.
    ///
    /// The returned handle owns the tasks; `cancel` (or
    /// [`ServerHandle::shutdown`]) stops them.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<ServerHandle, FatalError> {
        let settings = self.config.settings()?;
        settings.validate()?;

        let repository = SessionRepository::new();
        let cookies = Arc::new(CookieManager::new(
            tungo_crypto::handshake::cookie::DEFAULT_COOKIE_TTL,
        ));
        let load = Arc::new(InFlightHandshakes::new(settings.handshake_load_threshold));
        let registrar = Arc::new(Registrar::new(
            settings.identity(),
            PeerDirectory::new(self.config.peer_revisions()),
            cookies.clone(),
            load,
            repository.clone(),
            settings.ipv4_subnet,
            settings.ipv6_subnet,
        ));

        let mut tasks = JoinSet::new();
        let mut local_addrs = HashMap::new();

        if let Some(port) = settings.protocols.tcp {
            let listener = TcpListener::bind((settings.host, port))
                .await
                .map_err(FatalError::Listener)?;
            local_addrs.insert(Transport::Tcp, listener.local_addr().map_err(FatalError::Listener)?);
            let tun = self
                .tun_factory
                .create_device(Transport::Tcp, &settings)
                .map_err(FatalError::Tun)?;
            tasks.spawn(serve_tcp(
                listener,
                registrar.clone(),
                repository.clone(),
                tun,
                settings.transport_mtu(Transport::Tcp),
                cancel.clone(),
            ));
        }

        if let Some(port) = settings.protocols.udp {
            let socket = UdpSocket::bind((settings.host, port))
                .await
                .map_err(FatalError::Listener)?;
            local_addrs.insert(Transport::Udp, socket.local_addr().map_err(FatalError::Listener)?);
            let tun = self
                .tun_factory
                .create_device(Transport::Udp, &settings)
                .map_err(FatalError::Tun)?;
            tasks.spawn(serve_udp(
                Arc::new(socket),
                registrar.clone(),
                repository.clone(),
                tun,
                settings.transport_mtu(Transport::Udp),
                cancel.clone(),
            ));
        }

        if let Some(port) = settings.protocols.ws {
            let listener = TcpListener::bind((settings.host, port))
                .await
                .map_err(FatalError::Listener)?;
            local_addrs.insert(Transport::Ws, listener.local_addr().map_err(FatalError::Listener)?);
            let tun = self
                .tun_factory
                .create_device(Transport::Ws, &settings)
                .map_err(FatalError::Tun)?;
            tasks.spawn(serve_ws(
                listener,
                registrar.clone(),
                repository.clone(),
                tun,
                settings.transport_mtu(Transport::Ws),
                cancel.clone(),
            ));
        }

        tasks.spawn(run_reaper(
            repository.clone(),
            settings.timers.idle_timeout,
            cancel.clone(),
        ));
        tasks.spawn(rotate_cookies(cookies, cancel.clone()));
        tasks.spawn(watch_revocations(
            self.config.peer_revisions(),
            repository.clone(),
            cancel.clone(),
        ));

        tracing::info!(?local_addrs, "server running");
        Ok(ServerHandle {
            repository,
            local_addrs,
            settings,
            dispose: self.tun_factory,
            cancel,
            tasks,
        })
    }

    /// Spawns, waits for `cancel`, then tears everything down
    pub async fn run(self, cancel: CancellationToken) -> Result<(), FatalError> {
        let handle = self.spawn(cancel.clone()).await?;
        cancel.cancelled().await;
        handle.shutdown().await;
        Ok(())
    }
}

impl ServerHandle {
    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repository
    }

    pub fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.local_addrs.get(&transport).copied()
    }

    /// Stops the tasks, closes every peer and disposes the TUN devices
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        self.repository.close_all();
        if let Err(error) = self.dispose.dispose_devices(&self.settings) {
            tracing::warn!(%error, "tun disposal failed");
        }
    }
}

/// Rotates the cookie secret on the manager's cadence
async fn rotate_cookies(cookies: Arc<CookieManager>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(cookies.rotation_period());
    // the first tick is immediate; the secret is already fresh
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => cookies.rotate(),
        }
    }
}

/// Applies allowed-peer revisions: peers that vanish or flip to disabled
/// lose their live sessions.
async fn watch_revocations(
    mut revisions: watch::Receiver<Vec<AllowedPeer>>,
    repository: Arc<SessionRepository>,
    cancel: CancellationToken,
) {
    let mut enabled_keys: Vec<[u8; 32]> = enabled_keys_of(&revisions.borrow());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let current = revisions.borrow_and_update().clone();
        let still_enabled = enabled_keys_of(&current);
        for key in &enabled_keys {
            if !still_enabled.contains(key) {
                let terminated = repository.terminate_by_pub_key(key);
                if terminated > 0 {
                    tracing::info!(terminated, "revoked peer sessions");
                }
            }
        }
        enabled_keys = still_enabled;
    }
}

fn enabled_keys_of(peers: &[AllowedPeer]) -> Vec<[u8; 32]> {
    peers
        .iter()
        .filter(|peer| peer.enabled)
        .map(|peer| peer.public_key)
        .collect()
}
