// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Reconciling a declarative [`Config`] against live device state.
//!
//! [`Device::reconfig`] applies the minimal set of changes: peers whose
//! public key survives the edit keep their object identity (and with it any
//! live session references held elsewhere); only dropped peers are torn
//! down. On failure the device is left in a defined state: identity set, no
//! peers, no routes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::config::{Config, Interface, Key, PeerConfig};
use crate::device::{Device, DeviceInner, Error};
use crate::tun::Tun;
use crate::udp::Networking;
use crate::x25519::{PublicKey, StaticSecret};

impl<N: Networking, T: Tun> Device<N, T> {
    /// Replace the device configuration with `cfg`.
    ///
    /// A failure to bind the listen port surfaces as [`Error::PortInUse`];
    /// any failure after the identity was installed leaves the device
    /// peerless but keeps the identity.
    pub async fn reconfig(&self, cfg: &Config) -> Result<(), Error> {
        let result = self.inner.apply_config(cfg).await;
        if let Err(e) = &result {
            log::warn!("reconfiguration failed, removing all peers: {e}");
            self.inner.remove_all_peers().await;
        }
        result
    }

    /// Read the live state back as a [`Config`]. Peers appear in
    /// declaration order, so a freshly applied config reads back
    /// render-identical.
    pub async fn config(&self) -> Config {
        self.inner.config_snapshot().await
    }
}

impl<N: Networking, T: Tun> DeviceInner<N, T> {
    pub(super) async fn apply_config(self: &Arc<Self>, cfg: &Config) -> Result<(), Error> {
        let old_keys: HashSet<PublicKey> = {
            let peers = self.peers.lock().await;
            peers.by_key.keys().copied().collect()
        };

        let private = cfg.interface.private_key;
        self.set_private_key(if private.is_zero() {
            None
        } else {
            Some(StaticSecret::from(private.to_bytes()))
        })
        .await;

        self.net.lock().await.port = cfg.interface.listen_port;
        self.bind_update().await.map_err(Error::PortInUse)?;
        self.mtu.store(cfg.interface.mtu, Ordering::Relaxed);

        let own = {
            let identity = self.static_identity.lock().await;
            identity.keys.as_ref().map(|(_, pk)| *pk)
        };

        // Routing entries are purged wholesale and re-inserted in
        // declaration order; peer objects are reused for retained keys.
        self.routing.write().await.clear();

        let mut seen: HashSet<PublicKey> = HashSet::new();
        let mut order: Vec<PublicKey> = Vec::new();
        for p in &cfg.peers {
            let public_key = PublicKey::from(p.public_key);
            if Some(public_key) == own {
                return Err(Error::InvalidKey);
            }
            if !seen.insert(public_key) {
                return Err(Error::PeerDuplicate);
            }
            order.push(public_key);

            let existing = self.peers.lock().await.by_key.get(&public_key).cloned();
            let peer = match existing {
                Some(peer) => peer,
                None => self.new_peer(public_key).await?,
            };

            let psk = p.preshared_key.filter(|k| !k.is_zero()).map(Key::to_bytes);
            if peer.preshared_key().await != psk {
                peer.set_preshared_key(psk).await;
                self.refresh_peer_session(&peer).await;
            }

            if let Some(text) = &p.endpoint {
                let endpoint = self.networking.create_endpoint(text)?;
                peer.set_endpoint(endpoint).await;
            }

            peer.set_persistent_keepalive(p.persistent_keepalive).await;
            // Send an immediate keepalive when turning it on for a peer
            // that existed before this reconfiguration.
            if p.persistent_keepalive != 0 && old_keys.contains(&public_key) && self.is_up() {
                if let Some(bind) = self.bind().await {
                    if let Err(e) = peer.send_keepalive(&*bind).await {
                        log::debug!("immediate keepalive failed: {e}");
                    }
                }
            }

            peer.set_allowed_ips(p.allowed_ips.clone()).await;
            {
                let mut routing = self.routing.write().await;
                for network in &p.allowed_ips {
                    routing.insert(network.network(), network.prefix(), Arc::clone(&peer));
                }
            }
        }

        // peers absent from the target configuration are dropped
        let stale: Vec<PublicKey> = {
            let peers = self.peers.lock().await;
            peers
                .by_key
                .keys()
                .filter(|k| !seen.contains(*k))
                .copied()
                .collect()
        };
        for key in stale {
            self.remove_peer(&key).await;
        }

        self.peers.lock().await.order = order;
        Ok(())
    }

    pub(super) async fn config_snapshot(&self) -> Config {
        let private_key = {
            let identity = self.static_identity.lock().await;
            identity
                .keys
                .as_ref()
                .map(|(sk, _)| Key::from(sk))
                .unwrap_or(Key::ZERO)
        };
        let listen_port = self.net.lock().await.port;
        let mtu = self.mtu.load(Ordering::Relaxed);

        let snapshot: Vec<_> = {
            let peers = self.peers.lock().await;
            peers.ordered().cloned().collect()
        };

        let mut peer_configs = Vec::with_capacity(snapshot.len());
        for peer in snapshot {
            peer_configs.push(PeerConfig {
                public_key: Key::from(*peer.public_key()),
                preshared_key: peer.preshared_key().await.map(Key::from),
                endpoint: peer.endpoint().await.map(|e| e.to_string()),
                persistent_keepalive: peer.persistent_keepalive().await,
                allowed_ips: peer.allowed_ips().await,
            });
        }

        Config {
            interface: Interface {
                private_key,
                listen_port,
                mtu,
            },
            peers: peer_configs,
        }
    }
}
