// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end scenarios over the simulated network: two full devices talk
//! through in-memory binds and channel TUNs, with no kernel involvement.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use zerocopy::IntoBytes;

use crate::config::{Config, Key, PeerConfig};
use crate::device::Device;
use crate::packet::{DataHeader, Ipv4Header};
use crate::tun::channel::ChannelTun;
use crate::udp::sim::{SimHost, SimNet};
use crate::udp::{Bind, Networking};
use crate::x25519::PublicKey;

const PORT: u16 = 51820;

async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = Ipv4Header::new(src, dst, payload.len()).as_bytes().to_vec();
    packet.extend_from_slice(payload);
    packet
}

struct TestDevice {
    device: Device<SimHost, ChannelTun>,
    tun: ChannelTun,
    config: Config,
}

/// Two devices on hosts 192.168.1.1 / .2, tunneling 10.0.0.1 <-> 10.0.0.2.
async fn device_pair() -> (TestDevice, TestDevice, SimNet) {
    let net = SimNet::new();
    let host1 = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host 1");
    let host2 = net.host(Some(Ipv4Addr::new(192, 168, 1, 2)), None).expect("host 2");

    let k1 = Key::generate_private();
    let k2 = Key::generate_private();

    let mut cfg1 = Config::default();
    cfg1.interface.private_key = k1;
    cfg1.interface.listen_port = PORT;
    let mut peer = PeerConfig::new(k2.public());
    peer.endpoint = Some(format!("192.168.1.2:{PORT}"));
    peer.allowed_ips.push("10.0.0.2/32".parse().expect("cidr"));
    cfg1.peers.push(peer);

    let mut cfg2 = Config::default();
    cfg2.interface.private_key = k2;
    cfg2.interface.listen_port = PORT;
    let mut peer = PeerConfig::new(k1.public());
    peer.endpoint = Some(format!("192.168.1.1:{PORT}"));
    peer.allowed_ips.push("10.0.0.1/32".parse().expect("cidr"));
    cfg2.peers.push(peer);

    let tun1 = ChannelTun::new("tun1", 1420);
    let tun2 = ChannelTun::new("tun2", 1420);
    let device1 = Device::new(tun1.clone(), host1);
    let device2 = Device::new(tun2.clone(), host2);

    device1.reconfig(&cfg1).await.expect("configure device 1");
    device2.reconfig(&cfg2).await.expect("configure device 2");
    device1.up().await.expect("device 1 up");
    device2.up().await.expect("device 2 up");

    (
        TestDevice { device: device1, tun: tun1, config: cfg1 },
        TestDevice { device: device2, tun: tun2, config: cfg2 },
        net,
    )
}

/// A packet injected at one TUN emerges byte-identical at the other.
#[test_log::test(tokio::test)]
async fn two_device_loopback() {
    let (d1, d2, _net) = device_pair().await;

    let outbound = ip_packet(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        b"hello through the tunnel",
    );
    d1.tun.inject(outbound.clone()).await;

    let delivered = within("packet at tun2", d2.tun.next_delivered())
        .await
        .expect("tun2 open");
    assert_eq!(delivered, outbound);

    // and the reverse direction
    let reply = ip_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        b"a reply",
    );
    d2.tun.inject(reply.clone()).await;
    let delivered = within("packet at tun1", d1.tun.next_delivered())
        .await
        .expect("tun1 open");
    assert_eq!(delivered, reply);

    d1.device.close().await.expect("close device 1");
    d2.device.close().await.expect("close device 2");
}

/// A packet whose inner source is outside the sender's allowed networks is
/// dropped after decryption.
#[test_log::test(tokio::test)]
async fn spoofed_inner_source_is_dropped() {
    let (d1, d2, _net) = device_pair().await;

    let spoofed = ip_packet(
        Ipv4Addr::new(10, 0, 0, 99), // not 10.0.0.1
        Ipv4Addr::new(10, 0, 0, 2),
        b"spoof",
    );
    d1.tun.inject(spoofed).await;

    let honest = ip_packet(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        b"honest",
    );
    d1.tun.inject(honest.clone()).await;

    // only the honest packet makes it through
    let delivered = within("packet at tun2", d2.tun.next_delivered())
        .await
        .expect("tun2 open");
    assert_eq!(delivered, honest);
}

/// `render(reconfig(C); config()) == render(C)` for canonical configs.
#[test_log::test(tokio::test)]
async fn config_round_trip() {
    let net = SimNet::new();
    let host = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host");

    let mut cfg = Config::default();
    cfg.interface.private_key = Key::generate_private();
    cfg.interface.listen_port = 7133;
    cfg.interface.mtu = 1380;

    let mut peer = PeerConfig::new(Key::generate_private().public());
    peer.preshared_key = Some(Key::from([0x17; 32]));
    peer.endpoint = Some("192.168.1.9:1234".to_owned());
    peer.persistent_keepalive = 25;
    peer.allowed_ips.push("10.0.0.2/32".parse().expect("cidr"));
    peer.allowed_ips.push("10.1.0.0/16".parse().expect("cidr"));
    cfg.peers.push(peer);
    cfg.peers.push(PeerConfig::new(Key::generate_private().public()));

    let device = Device::new(ChannelTun::new("tun", 1420), host);
    device.reconfig(&cfg).await.expect("reconfig");

    assert_eq!(device.config().await.render(), cfg.render());
}

/// Peers whose key survives a reconfiguration keep their object identity.
#[test_log::test(tokio::test)]
async fn reconfig_preserves_peer_identity() {
    let (d1, _d2, _net) = device_pair().await;

    let peer_key = PublicKey::from(d1.config.peers[0].public_key);
    let before = d1.device.lookup_peer(&peer_key).await.expect("peer exists");

    // scenario: move the peer's endpoint elsewhere
    let mut cfg = d1.config.clone();
    cfg.peers[0].endpoint = Some(format!("192.168.1.3:{PORT}"));
    d1.device.reconfig(&cfg).await.expect("reconfig");

    let after = d1.device.lookup_peer(&peer_key).await.expect("peer kept");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(d1.device.config().await.render(), cfg.render());
}

/// Appending a peer keeps the original peer's identity and renders both.
#[test_log::test(tokio::test)]
async fn reconfig_appends_third_peer() {
    let (d1, _d2, _net) = device_pair().await;

    let original_key = PublicKey::from(d1.config.peers[0].public_key);
    let before = d1.device.lookup_peer(&original_key).await.expect("peer");

    let k3 = Key::generate_private().public();
    let mut cfg = d1.config.clone();
    let mut third = PeerConfig::new(k3);
    third.allowed_ips.push("10.0.0.3/32".parse().expect("cidr"));
    cfg.peers.push(third);

    d1.device.reconfig(&cfg).await.expect("reconfig");

    let after = d1.device.lookup_peer(&original_key).await.expect("kept");
    assert!(Arc::ptr_eq(&before, &after));

    let rendered = d1.device.config().await.render();
    assert!(rendered.contains(&d1.config.peers[0].public_key.to_string()));
    assert!(rendered.contains(&k3.to_string()));
    assert_eq!(rendered, cfg.render());
}

/// Peers dropped from the target configuration are removed, with their
/// routing entries.
#[test_log::test(tokio::test)]
async fn reconfig_drops_absent_peers() {
    let (d1, _d2, _net) = device_pair().await;
    let peer_key = PublicKey::from(d1.config.peers[0].public_key);

    let mut cfg = d1.config.clone();
    cfg.peers.clear();
    d1.device.reconfig(&cfg).await.expect("reconfig");

    assert!(d1.device.lookup_peer(&peer_key).await.is_none());
    let routing = d1.device.inner.routing.read().await;
    assert!(routing.find(Ipv4Addr::new(10, 0, 0, 2).into()).is_none());
}

/// Requesting an occupied port fails with the distinguished error and
/// leaves the device peerless.
#[test_log::test(tokio::test)]
async fn reconfig_port_in_use() {
    let (d1, _d2, _net) = device_pair().await;

    // an external probe occupies the port on the device's own host
    let (probe, port) = d1.device.inner.networking.create_bind(4444).await.expect("probe");
    assert_eq!(port, 4444);

    let mut cfg = d1.config.clone();
    cfg.interface.listen_port = 4444;
    let err = d1.device.reconfig(&cfg).await.expect_err("port is taken");
    assert!(matches!(err, crate::device::Error::PortInUse(_)));
    assert_eq!(err.ipc_errno(), 98);

    assert!(d1.device.config().await.peers.is_empty());
    // identity survives the rollback
    assert_eq!(
        d1.device.config().await.interface.private_key,
        cfg.interface.private_key
    );
    drop(probe);
}

/// A public key listed twice fails the whole configuration; no peers are
/// left installed.
#[test_log::test(tokio::test)]
async fn reconfig_duplicate_peer() {
    let net = SimNet::new();
    let host = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host");
    let device = Device::new(ChannelTun::new("tun", 1420), host);

    let mut cfg = Config::default();
    cfg.interface.private_key = Key::generate_private();
    let dup = Key::generate_private().public();
    cfg.peers.push(PeerConfig::new(dup));
    cfg.peers.push(PeerConfig::new(dup));

    let err = device.reconfig(&cfg).await.expect_err("duplicate");
    assert!(matches!(err, crate::device::Error::PeerDuplicate));
    assert!(device.config().await.peers.is_empty());
}

/// Toggling persistent keepalive from 0 to nonzero on a pre-existing peer
/// while up emits exactly one immediate keepalive.
#[test_log::test(tokio::test)]
async fn keepalive_turn_on_rule() {
    let net = SimNet::new();
    let host = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host");
    let far_host = net.host(Some(Ipv4Addr::new(192, 168, 1, 2)), None).expect("far host");
    let (far_bind, far_port) = far_host.create_bind(0).await.expect("far bind");

    let mut cfg = Config::default();
    cfg.interface.private_key = Key::generate_private();
    cfg.interface.listen_port = PORT;
    let mut peer = PeerConfig::new(Key::generate_private().public());
    peer.endpoint = Some(format!("192.168.1.2:{far_port}"));
    peer.allowed_ips.push("10.0.0.2/32".parse().expect("cidr"));
    cfg.peers.push(peer);

    let device = Device::new(ChannelTun::new("tun", 1420), host);
    device.reconfig(&cfg).await.expect("initial config");
    device.up().await.expect("up");

    // no keepalive configured yet: nothing must arrive
    let mut buf = [0u8; 256];
    assert!(
        tokio::time::timeout(Duration::from_millis(200), far_bind.recv_v4(&mut buf))
            .await
            .is_err(),
        "no keepalive before the interval is enabled"
    );

    cfg.peers[0].persistent_keepalive = 25;
    device.reconfig(&cfg).await.expect("keepalive on");

    let (n, _from) = within("immediate keepalive", far_bind.recv_v4(&mut buf))
        .await
        .expect("receive");
    assert_eq!(n, DataHeader::OVERHEAD, "keepalive is an empty transport packet");

    // exactly one: nothing else arrives (the 25s periodic timer is far off)
    assert!(
        tokio::time::timeout(Duration::from_millis(300), far_bind.recv_v4(&mut buf))
            .await
            .is_err()
    );
}

/// Replacing the bind clears every peer's cached endpoint source.
#[test_log::test(tokio::test)]
async fn bind_update_clears_cached_sources() {
    let (d1, d2, _net) = device_pair().await;

    // drive traffic so d2's peer learns a source address
    let packet = ip_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), b"x");
    d1.tun.inject(packet).await;
    within("packet at tun2", d2.tun.next_delivered()).await.expect("delivered");

    let peer_key = PublicKey::from(d2.config.peers[0].public_key);
    let peer = d2.device.lookup_peer(&peer_key).await.expect("peer");
    let endpoint = peer.endpoint().await.expect("endpoint learned");
    assert!(endpoint.src_ip().is_some(), "receive populated the source cache");

    d2.device.bind_update().await.expect("bind update");

    let endpoint = peer.endpoint().await.expect("endpoint kept");
    assert_eq!(endpoint.src_ip(), None, "rebind invalidated the cached source");
}

/// Removing a peer purges it from the routing table; re-removal is a no-op.
#[test_log::test(tokio::test)]
async fn remove_peer_is_idempotent() {
    let (d1, _d2, _net) = device_pair().await;
    let peer_key = PublicKey::from(d1.config.peers[0].public_key);

    d1.device.remove_peer(&peer_key).await;
    assert!(d1.device.lookup_peer(&peer_key).await.is_none());
    {
        let routing = d1.device.inner.routing.read().await;
        assert!(routing.find(Ipv4Addr::new(10, 0, 0, 2).into()).is_none());
    }

    // again: nothing to do, nothing to break
    d1.device.remove_peer(&peer_key).await;
    assert!(d1.device.lookup_peer(&peer_key).await.is_none());
}

/// A peer with the device's own public key is rejected.
#[test_log::test(tokio::test)]
async fn own_key_as_peer_is_rejected() {
    let net = SimNet::new();
    let host = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host");
    let device = Device::new(ChannelTun::new("tun", 1420), host);

    let private = Key::generate_private();
    let mut cfg = Config::default();
    cfg.interface.private_key = private;
    cfg.peers.push(PeerConfig::new(private.public()));

    let err = device.reconfig(&cfg).await.expect_err("self peer");
    assert!(matches!(err, crate::device::Error::InvalidKey));
}

/// Fwmark updates apply to the live bind; re-applying the same mark is a
/// no-op, and the mark survives a bind replacement.
#[test_log::test(tokio::test)]
async fn fwmark_follows_bind() {
    let (d1, _d2, _net) = device_pair().await;

    d1.device.bind_set_mark(0x51).await.expect("mark applied");
    d1.device.bind_set_mark(0x51).await.expect("same mark is a no-op");

    d1.device.bind_update().await.expect("bind replaced");
    d1.device.bind_set_mark(0x52).await.expect("mark updated on new bind");
}

/// Interface events drive the device up and down.
#[test_log::test(tokio::test)]
async fn tun_events_drive_lifecycle() {
    let net = SimNet::new();
    let host = net.host(Some(Ipv4Addr::new(192, 168, 1, 1)), None).expect("host");
    let tun = ChannelTun::new("tun", 1420);
    let device = Device::new(tun.clone(), host);

    let mut cfg = Config::default();
    cfg.interface.private_key = Key::generate_private();
    cfg.interface.listen_port = PORT;
    device.reconfig(&cfg).await.expect("configure");

    assert!(!device.is_up());
    tun.push_event(crate::tun::TunEvent::Up);
    within("device up", async {
        while !device.is_up() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    tun.push_event(crate::tun::TunEvent::Down);
    within("device down", async {
        while device.is_up() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}
