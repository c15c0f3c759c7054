// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The top-level device: one TUN, one UDP bind, many peers.
//!
//! State is split into disjoint records, each behind its own lock. Lock
//! order, where several are held: `net` → `static_identity` → `peers` →
//! individual peer. The routing table is taken last or alone.

pub(crate) mod allowed_ips;
pub mod configure;
mod peer;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::packet;
use crate::session::Session;
use crate::task::Task;
use crate::tun::{Tun, TunEvent};
use crate::udp::{Bind, Endpoint, EndpointParseError, MAX_DATAGRAM_SIZE, Networking};
use crate::x25519::{PublicKey, StaticSecret};
use allowed_ips::AllowedIps;

pub use peer::Peer;

/// Error of [`Device`]-related operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("local port in use: {0}")]
    PortInUse(#[source] io::Error),

    #[error("peer appears multiple times in config")]
    PeerDuplicate,

    #[error("key is not usable on this device")]
    InvalidKey,

    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointParseError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errno-style code for the IPC surface, so callers can map
    /// configuration failures onto a wire error.
    pub fn ipc_errno(&self) -> i32 {
        match self {
            Error::PortInUse(_) => 98, // EADDRINUSE
            Error::PeerDuplicate | Error::InvalidKey | Error::InvalidEndpoint(_) => 22, // EINVAL
            Error::Io(_) => 5, // EIO
        }
    }
}

/// A reference-counted handle to a running device.
pub struct Device<N: Networking, T: Tun> {
    inner: Arc<DeviceInner<N, T>>,
}

impl<N: Networking, T: Tun> Clone for Device<N, T> {
    fn clone(&self) -> Self {
        Device {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct DeviceInner<N: Networking, T: Tun> {
    tun: T,
    networking: N,

    net: Mutex<Net<N::Bind>>,
    static_identity: Mutex<Identity>,
    peers: Mutex<PeerTable>,
    routing: RwLock<AllowedIps<Arc<Peer>>>,

    /// Advisory MTU from the configuration surface.
    mtu: AtomicU16,
    is_up: AtomicBool,
    closed: AtomicBool,

    event_pump: SyncMutex<Option<Task>>,
}

struct Net<B> {
    bind: Option<Arc<B>>,
    port: u16,
    fwmark: u32,
    /// Workers spawned against the current bind; they die with it.
    workers: Vec<Task>,
}

#[derive(Default)]
struct Identity {
    keys: Option<(StaticSecret, PublicKey)>,
}

/// Peer table: by identity key for config operations, by session token for
/// inbound demux, plus declaration order for deterministic readback.
#[derive(Default)]
struct PeerTable {
    by_key: HashMap<PublicKey, Arc<Peer>>,
    by_token: HashMap<u32, Arc<Peer>>,
    order: Vec<PublicKey>,
}

impl PeerTable {
    fn insert(&mut self, peer: Arc<Peer>) {
        let key = *peer.public_key();
        if self.by_key.insert(key, peer).is_none() {
            self.order.push(key);
        }
    }

    fn remove(&mut self, key: &PublicKey) -> Option<Arc<Peer>> {
        let peer = self.by_key.remove(key)?;
        self.order.retain(|k| k != key);
        self.by_token.retain(|_, p| !Arc::ptr_eq(p, &peer));
        Some(peer)
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.order.iter().filter_map(|k| self.by_key.get(k))
    }

    fn index_token(&mut self, peer: &Arc<Peer>, token: Option<u32>) {
        self.by_token.retain(|_, p| !Arc::ptr_eq(p, peer));
        if let Some(token) = token {
            self.by_token.insert(token, Arc::clone(peer));
        }
    }
}

impl<N: Networking, T: Tun> Device<N, T> {
    /// Create a device attached to `tun`. It starts down, with no identity
    /// and no peers; interface events drive it up and down.
    pub fn new(tun: T, networking: N) -> Device<N, T> {
        let events = tun.events();
        let inner = Arc::new(DeviceInner {
            tun,
            networking,
            net: Mutex::new(Net {
                bind: None,
                port: 0,
                fwmark: 0,
                workers: Vec::new(),
            }),
            static_identity: Mutex::new(Identity::default()),
            peers: Mutex::new(PeerTable::default()),
            routing: RwLock::new(AllowedIps::new()),
            mtu: AtomicU16::new(0),
            is_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            event_pump: SyncMutex::new(None),
        });

        let pump = Task::spawn(
            "tun events",
            DeviceInner::worker_events(Arc::downgrade(&inner), events),
        );
        *inner.event_pump.lock() = Some(pump);

        Device { inner }
    }

    /// Install the static identity; `None` (the zero key) disables all
    /// sessions. Every peer session is rebuilt against the new key.
    pub async fn set_private_key(&self, key: Option<StaticSecret>) {
        self.inner.set_private_key(key).await;
    }

    pub async fn public_key(&self) -> Option<PublicKey> {
        self.inner.static_identity.lock().await.keys.as_ref().map(|(_, pk)| *pk)
    }

    /// Register a peer. Fails if the key is the device's own or already
    /// present.
    pub async fn new_peer(&self, public_key: PublicKey) -> Result<Arc<Peer>, Error> {
        self.inner.new_peer(public_key).await
    }

    /// Unregister a peer, purge its routing entries and tear down its
    /// session. Removing an absent peer is a no-op.
    pub async fn remove_peer(&self, public_key: &PublicKey) {
        self.inner.remove_peer(public_key).await;
    }

    pub async fn remove_all_peers(&self) {
        self.inner.remove_all_peers().await;
    }

    pub async fn lookup_peer(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        self.inner.peers.lock().await.by_key.get(public_key).cloned()
    }

    /// Record the desired listen port; applied on the next
    /// [`bind_update`](Self::bind_update).
    pub async fn set_port(&self, port: u16) {
        self.inner.net.lock().await.port = port;
    }

    pub async fn listen_port(&self) -> u16 {
        self.inner.net.lock().await.port
    }

    /// (Re)create the bind on the configured port. While the device is down
    /// this only records the wish; while up, the old bind and its workers
    /// are torn down, a new bind is created, the fwmark re-applied, every
    /// peer's cached source cleared, and fresh workers spawned.
    pub async fn bind_update(&self) -> io::Result<()> {
        self.inner.bind_update().await
    }

    /// Update the fwmark; applied to the live bind immediately when up.
    pub async fn bind_set_mark(&self, mark: u32) -> io::Result<()> {
        self.inner.bind_set_mark(mark).await
    }

    /// Tear down the bind; its workers observe the close and exit. Returns
    /// the first shutdown error; workers are reaped regardless.
    pub async fn bind_close(&self) -> io::Result<()> {
        self.inner.bind_close().await
    }

    pub async fn up(&self) -> io::Result<()> {
        self.inner.up().await
    }

    pub async fn down(&self) {
        self.inner.down().await;
    }

    pub fn is_up(&self) -> bool {
        self.inner.is_up.load(Ordering::Acquire)
    }

    /// Terminal: tear down workers, bind and TUN, in that order. Teardown
    /// is best-effort; the first error is returned after every resource has
    /// been attempted.
    pub async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }

    pub fn tun(&self) -> &T {
        &self.inner.tun
    }
}

impl<N: Networking, T: Tun> DeviceInner<N, T> {
    fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }

    async fn set_private_key(self: &Arc<Self>, key: Option<StaticSecret>) {
        let mut identity = self.static_identity.lock().await;

        let new = key.map(|sk| {
            let pk = PublicKey::from(&sk);
            (sk, pk)
        });
        let unchanged = match (&identity.keys, &new) {
            (Some((_, old)), Some((_, fresh))) => old == fresh,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        identity.keys = new;

        // a peer carrying our own identity cannot stay
        if let Some((_, own)) = &identity.keys {
            let own = *own;
            let removed = self.peers.lock().await.remove(&own);
            if let Some(peer) = removed {
                self.routing
                    .write()
                    .await
                    .remove(&|p: &Arc<Peer>| Arc::ptr_eq(p, &peer));
                peer.install_session(None).await;
                log::info!("removed peer matching device identity");
            }
        }

        self.rebuild_sessions(&identity).await;
        log::debug!("private key updated; sessions rebuilt");
    }

    /// Re-derive every peer's session (and the inbound token index) against
    /// the current identity. Caller holds the identity lock.
    async fn rebuild_sessions(&self, identity: &Identity) {
        let mut peers = self.peers.lock().await;
        let all: Vec<Arc<Peer>> = peers.by_key.values().cloned().collect();
        for peer in all {
            let session = match &identity.keys {
                Some((sk, pk)) => {
                    let psk = peer.preshared_key().await;
                    Some(Session::derive(sk, pk, peer.public_key(), psk.as_ref()))
                }
                None => None,
            };
            peer.install_session(session).await;
            let token = peer.session_token().await;
            peers.index_token(&peer, token);
        }
    }

    /// Derive one peer's session against the current identity; used after
    /// creation and after a preshared-key change.
    async fn refresh_peer_session(&self, peer: &Arc<Peer>) {
        let identity = self.static_identity.lock().await;
        let session = match &identity.keys {
            Some((sk, pk)) => {
                let psk = peer.preshared_key().await;
                Some(Session::derive(sk, pk, peer.public_key(), psk.as_ref()))
            }
            None => None,
        };
        peer.install_session(session).await;
        let token = peer.session_token().await;
        self.peers.lock().await.index_token(peer, token);
    }

    async fn new_peer(self: &Arc<Self>, public_key: PublicKey) -> Result<Arc<Peer>, Error> {
        {
            let identity = self.static_identity.lock().await;
            if identity.keys.as_ref().is_some_and(|(_, pk)| *pk == public_key) {
                return Err(Error::InvalidKey);
            }
        }

        let peer = Arc::new(Peer::new(public_key));
        {
            let mut peers = self.peers.lock().await;
            if peers.by_key.contains_key(&public_key) {
                return Err(Error::PeerDuplicate);
            }
            peers.insert(Arc::clone(&peer));
        }
        self.refresh_peer_session(&peer).await;
        log::info!("peer added");
        Ok(peer)
    }

    async fn remove_peer(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        let peer = self.peers.lock().await.remove(public_key)?;
        self.routing
            .write()
            .await
            .remove(&|p: &Arc<Peer>| Arc::ptr_eq(p, &peer));
        peer.install_session(None).await;
        log::info!("peer removed");
        Some(peer)
    }

    async fn remove_all_peers(&self) {
        let mut peers = self.peers.lock().await;
        let all: Vec<Arc<Peer>> = peers.by_key.values().cloned().collect();
        peers.by_key.clear();
        peers.by_token.clear();
        peers.order.clear();
        drop(peers);

        self.routing.write().await.clear();
        for peer in all {
            peer.install_session(None).await;
        }
    }

    async fn bind(&self) -> Option<Arc<N::Bind>> {
        self.net.lock().await.bind.clone()
    }

    async fn bind_update(self: &Arc<Self>) -> io::Result<()> {
        let mut net = self.net.lock().await;

        // close existing sockets and reap their workers
        let closed = match net.bind.take() {
            Some(bind) => bind.close(),
            None => Ok(()),
        };
        for worker in net.workers.drain(..) {
            worker.stop().await;
        }
        closed?;

        if !self.is_up() {
            return Ok(());
        }

        let (bind, port) = match self.networking.create_bind(net.port).await {
            Ok(v) => v,
            Err(e) => {
                net.port = 0;
                return Err(e);
            }
        };
        net.port = port;
        let bind = Arc::new(bind);

        if net.fwmark != 0 {
            bind.set_mark(net.fwmark)?;
        }

        // the local addresses just changed; cached sources are stale
        {
            let peers = self.peers.lock().await;
            for peer in peers.by_key.values() {
                peer.clear_endpoint_src().await;
            }
        }

        net.workers = self.spawn_workers(&bind);
        net.bind = Some(bind);
        log::debug!("UDP bind has been updated");
        Ok(())
    }

    async fn bind_set_mark(&self, mark: u32) -> io::Result<()> {
        let mut net = self.net.lock().await;
        if net.fwmark == mark {
            return Ok(());
        }
        net.fwmark = mark;

        if self.is_up()
            && let Some(bind) = &net.bind
        {
            bind.set_mark(mark)?;
        }
        Ok(())
    }

    async fn bind_close(&self) -> io::Result<()> {
        let mut net = self.net.lock().await;
        let closed = match net.bind.take() {
            Some(bind) => bind.close(),
            None => Ok(()),
        };
        for worker in net.workers.drain(..) {
            worker.stop().await;
        }
        closed
    }

    async fn up(self: &Arc<Self>) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is closed"));
        }
        self.is_up.store(true, Ordering::Release);
        self.bind_update().await
    }

    async fn down(self: &Arc<Self>) {
        self.is_up.store(false, Ordering::Release);
        if let Err(e) = self.bind_close().await {
            log::debug!("bind close failed: {e}");
        }
    }

    /// Best-effort teardown: every resource is attempted, the first error
    /// is returned, the rest are logged.
    async fn close(self: &Arc<Self>) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("closing device");
        self.is_up.store(false, Ordering::Release);
        let result = self.bind_close().await;
        self.tun.close();
        self.remove_all_peers().await;
        if let Some(pump) = self.event_pump.lock().take() {
            pump.stop().await;
        }
        result
    }

    fn spawn_workers(self: &Arc<Self>, bind: &Arc<N::Bind>) -> Vec<Task> {
        vec![
            Task::spawn(
                "receive ipv4",
                Self::worker_receive(Arc::downgrade(self), Arc::clone(bind), false),
            ),
            Task::spawn(
                "receive ipv6",
                Self::worker_receive(Arc::downgrade(self), Arc::clone(bind), true),
            ),
            Task::spawn(
                "tun reader",
                Self::worker_outbound(Arc::downgrade(self), Arc::clone(bind), self.tun.clone()),
            ),
            Task::spawn(
                "keepalive timer",
                Self::worker_keepalive(Arc::downgrade(self), Arc::clone(bind)),
            ),
        ]
    }

    /// Pull datagrams off one family's socket and feed the decrypt pipeline.
    /// Owns a direct reference to the bind it was spawned against; exits on
    /// the close-induced receive error.
    async fn worker_receive(device: Weak<Self>, bind: Arc<N::Bind>, v6: bool) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let result = if v6 {
                bind.recv_v6(&mut buf).await
            } else {
                bind.recv_v4(&mut buf).await
            };
            let (n, endpoint) = match result {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("receive worker exiting: {e}");
                    break;
                }
            };
            let Some(device) = device.upgrade() else { break };
            device.handle_inbound(&buf[..n], endpoint).await;
        }
    }

    async fn handle_inbound(&self, datagram: &[u8], endpoint: Endpoint) {
        let Some((header, body)) = packet::parse_data(datagram) else {
            log::trace!("dropping malformed datagram");
            return;
        };

        let peer = {
            let peers = self.peers.lock().await;
            peers.by_token.get(&header.receiver_token.get()).cloned()
        };
        let Some(peer) = peer else {
            log::trace!("dropping datagram for unknown session token");
            return;
        };

        let Some(plaintext) = peer.decrypt(header.counter.get(), body).await else {
            return;
        };

        // authenticated: remember where the peer is reachable now, and on
        // which local address it spoke to us
        peer.set_endpoint(endpoint).await;

        if plaintext.is_empty() {
            log::trace!("received keepalive");
            return;
        }

        // the inner source must resolve back to the sending peer
        let Some(source) = packet::inner_source(&plaintext) else {
            log::trace!("dropping inbound packet with unparsable source");
            return;
        };
        {
            let routing = self.routing.read().await;
            let allowed = routing.find(source).is_some_and(|owner| Arc::ptr_eq(owner, &peer));
            if !allowed {
                log::debug!("peer is not allowed to send packets from {source}");
                return;
            }
        }

        if let Err(e) = self.tun.write(&plaintext).await {
            log::debug!("tun write failed: {e}");
        }
    }

    /// Read outbound packets from the TUN, route them to a peer, encrypt and
    /// send.
    async fn worker_outbound(device: Weak<Self>, bind: Arc<N::Bind>, tun: T) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = match tun.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("tun reader exiting: {e}");
                    break;
                }
            };
            let Some(device) = device.upgrade() else { break };
            device.handle_outbound(&buf[..n], &bind).await;
        }
    }

    async fn handle_outbound(&self, packet: &[u8], bind: &Arc<N::Bind>) {
        let Some(destination) = packet::inner_destination(packet) else {
            log::trace!("dropping outbound packet with unparsable destination");
            return;
        };

        let peer = { self.routing.read().await.find(destination).cloned() };
        let Some(peer) = peer else {
            log::trace!("no peer routes {destination}");
            return;
        };

        if let Err(e) = peer.encrypt_and_send(packet, &**bind).await {
            log::debug!("send to peer failed: {e}");
        }
    }

    /// Emit persistent keepalives for peers whose interval has elapsed.
    async fn worker_keepalive(device: Weak<Self>, bind: Arc<N::Bind>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(device) = device.upgrade() else { break };
            let peers: Vec<Arc<Peer>> = {
                let table = device.peers.lock().await;
                table.by_key.values().cloned().collect()
            };
            for peer in peers {
                if let Err(e) = peer.tick_keepalive(&*bind).await {
                    log::trace!("keepalive send failed: {e}");
                }
            }
        }
    }

    /// Map interface events onto device lifecycle transitions.
    async fn worker_events(device: Weak<Self>, mut events: mpsc::UnboundedReceiver<TunEvent>) {
        while let Some(event) = events.recv().await {
            let Some(device) = device.upgrade() else { break };
            match event {
                TunEvent::Up => {
                    if let Err(e) = device.up().await {
                        log::error!("failed to bring device up: {e}");
                    }
                }
                TunEvent::Down => device.down().await,
                TunEvent::MtuChange(mtu) => log::debug!("tun mtu changed to {mtu}"),
            }
        }
    }
}
