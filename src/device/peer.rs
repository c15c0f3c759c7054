// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer mutable state.

use std::io;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use tokio::sync::Mutex;

use crate::session::Session;
use crate::udp::{Bind, Endpoint};
use crate::x25519::PublicKey;

/// A remote party, identified by its static public key.
///
/// Peers are exclusively owned by the device's peer table; everything else
/// holds `Arc` lookup handles. All mutable fields live behind the peer's own
/// mutex, the tail of the device lock order.
pub struct Peer {
    public_key: PublicKey,
    inner: Mutex<PeerInner>,
}

struct PeerInner {
    endpoint: Option<Endpoint>,
    preshared_key: Option<[u8; 32]>,
    /// Persistent keepalive interval in seconds; 0 disables.
    keepalive: u16,
    /// Allowed networks in declaration order, for configuration readback.
    /// The routing table owns the lookup copy.
    allowed_ips: Vec<IpNetwork>,
    session: Option<Session>,
    last_send: Instant,
}

impl Peer {
    pub(crate) fn new(public_key: PublicKey) -> Peer {
        Peer {
            public_key,
            inner: Mutex::new(PeerInner {
                endpoint: None,
                preshared_key: None,
                keepalive: 0,
                allowed_ips: Vec::new(),
                session: None,
                last_send: Instant::now(),
            }),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner.lock().await.endpoint.clone()
    }

    /// Replace the endpoint. The cached source survives only when the new
    /// endpoint has none of its own and the destination is byte-identical;
    /// any other change starts from a cleared source.
    pub async fn set_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.lock().await;
        let endpoint = match (&inner.endpoint, endpoint) {
            (Some(old), new) if new.src().is_none() && old.dst() == new.dst() => old.clone(),
            (_, new) => new,
        };
        inner.endpoint = Some(endpoint);
    }

    /// Forget the cached source; used when the bind (and with it the set of
    /// local addresses) is replaced.
    pub(crate) async fn clear_endpoint_src(&self) {
        if let Some(endpoint) = self.inner.lock().await.endpoint.as_mut() {
            endpoint.clear_src();
        }
    }

    pub async fn persistent_keepalive(&self) -> u16 {
        self.inner.lock().await.keepalive
    }

    pub(crate) async fn set_persistent_keepalive(&self, secs: u16) {
        self.inner.lock().await.keepalive = secs;
    }

    pub async fn preshared_key(&self) -> Option<[u8; 32]> {
        self.inner.lock().await.preshared_key
    }

    pub(crate) async fn set_preshared_key(&self, key: Option<[u8; 32]>) {
        self.inner.lock().await.preshared_key = key;
    }

    pub(crate) async fn allowed_ips(&self) -> Vec<IpNetwork> {
        self.inner.lock().await.allowed_ips.clone()
    }

    pub(crate) async fn set_allowed_ips(&self, networks: Vec<IpNetwork>) {
        self.inner.lock().await.allowed_ips = networks;
    }

    /// Install (or drop) the transport session for this peer.
    pub(crate) async fn install_session(&self, session: Option<Session>) {
        self.inner.lock().await.session = session;
    }

    pub(crate) async fn session_token(&self) -> Option<u32> {
        self.inner.lock().await.session.as_ref().map(Session::local_token)
    }

    /// Emit an empty transport packet toward the current endpoint.
    pub async fn send_keepalive<B: Bind>(&self, bind: &B) -> io::Result<()> {
        self.encrypt_and_send(&[], bind).await
    }

    /// Encrypt `payload` and send it from under the peer lock, so an
    /// EINVAL-triggered source clear lands in the cached endpoint.
    pub(crate) async fn encrypt_and_send<B: Bind>(&self, payload: &[u8], bind: &B) -> io::Result<()> {
        let mut inner = self.inner.lock().await;

        let Some(session) = &inner.session else {
            log::trace!("dropping outbound packet: no session");
            return Ok(());
        };
        let datagram = session.encrypt(payload);

        let Some(endpoint) = inner.endpoint.as_mut() else {
            log::trace!("dropping outbound packet: no endpoint");
            return Ok(());
        };
        bind.send(&datagram, endpoint).await?;
        inner.last_send = Instant::now();
        Ok(())
    }

    /// Decrypt the body of an inbound datagram. `None` means the packet is
    /// to be dropped (no session, replay, bad tag); the datapath records and
    /// continues.
    pub(crate) async fn decrypt(&self, counter: u64, body: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref()?;
        match session.decrypt(counter, body) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                log::trace!("dropping inbound packet: {e}");
                None
            }
        }
    }

    /// Send a keepalive if the interval is enabled and has elapsed since the
    /// last outbound packet.
    pub(crate) async fn tick_keepalive<B: Bind>(&self, bind: &B) -> io::Result<()> {
        let due = {
            let inner = self.inner.lock().await;
            inner.keepalive != 0
                && inner.session.is_some()
                && inner.endpoint.is_some()
                && inner.last_send.elapsed() >= Duration::from_secs(u64::from(inner.keepalive))
        };
        if due {
            log::trace!("sending persistent keepalive");
            self.send_keepalive(bind).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &crate::config::Key::from(self.public_key))
            .finish_non_exhaustive()
    }
}
