// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Declarative device configuration.
//!
//! A [`Config`] describes the desired state of a device: identity, listen
//! port, and the full peer list. It is applied with
//! [`Device::reconfig`](crate::device::Device::reconfig) and read back with
//! [`Device::config`](crate::device::Device::config); [`Config::render`]
//! produces the canonical text form the round-trip property is stated over.

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ipnetwork::IpNetwork;

use crate::x25519::{PublicKey, StaticSecret};

/// A 32-byte curve25519 key in its textual forms.
///
/// Renders as base64; parses from base64 or 64-digit hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl Key {
    pub const ZERO: Key = Key([0; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Interpret this key as a private key and return the matching public
    /// key.
    pub fn public(&self) -> Key {
        Key(PublicKey::from(&StaticSecret::from(self.0)).to_bytes())
    }

    /// Generate a fresh private key.
    pub fn generate_private() -> Key {
        Key(StaticSecret::random().to_bytes())
    }
}

impl From<[u8; 32]> for Key {
    fn from(bytes: [u8; 32]) -> Self {
        Key(bytes)
    }
}

impl From<PublicKey> for Key {
    fn from(key: PublicKey) -> Self {
        Key(key.to_bytes())
    }
}

impl From<&StaticSecret> for Key {
    fn from(key: &StaticSecret) -> Self {
        Key(key.to_bytes())
    }
}

impl From<Key> for PublicKey {
    fn from(key: Key) -> Self {
        PublicKey::from(key.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid key {0:?}: expected base64 or hex of 32 bytes")]
pub struct InvalidKeyText(String);

impl FromStr for Key {
    type Err = InvalidKeyText;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = if s.len() == 64 {
            let mut bytes = vec![0u8; 32];
            for (i, out) in bytes.iter_mut().enumerate() {
                *out = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                    .map_err(|_| InvalidKeyText(s.to_owned()))?;
            }
            bytes
        } else {
            BASE64.decode(s).map_err(|_| InvalidKeyText(s.to_owned()))?
        };

        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InvalidKeyText(s.to_owned()))?;
        Ok(Key(bytes))
    }
}

/// Interface-scoped settings.
#[derive(Clone, Debug)]
pub struct Interface {
    /// Static private key; the zero key disables all sessions.
    pub private_key: Key,
    /// UDP listen port; 0 lets the OS choose.
    pub listen_port: u16,
    /// Advisory MTU for the attached TUN; 0 leaves it alone.
    pub mtu: u16,
}

impl Default for Interface {
    fn default() -> Self {
        Interface {
            private_key: Key::ZERO,
            listen_port: 0,
            mtu: 0,
        }
    }
}

/// One peer entry of a [`Config`].
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// The peer's identity. Unique within a config.
    pub public_key: Key,
    /// Optional extra symmetric secret mixed into the session keys.
    pub preshared_key: Option<Key>,
    /// Numeric `host:port` (`[host]:port` for IPv6). Name resolution is the
    /// caller's job.
    pub endpoint: Option<String>,
    /// Persistent keepalive interval in seconds; 0 disables.
    pub persistent_keepalive: u16,
    /// Networks routed to (outbound) and accepted from (inbound) this peer.
    pub allowed_ips: Vec<IpNetwork>,
}

impl PeerConfig {
    pub fn new(public_key: Key) -> Self {
        PeerConfig {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: 0,
            allowed_ips: Vec::new(),
        }
    }
}

/// A complete device configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub interface: Interface,
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// Render the canonical wg-quick-style text form.
    ///
    /// Unset and zero-valued optional fields are omitted, so two configs
    /// describing the same state render identically.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        out.push_str("[Interface]\n");
        let _ = writeln!(out, "PrivateKey = {}", self.interface.private_key);
        if self.interface.listen_port > 0 {
            let _ = writeln!(out, "ListenPort = {}", self.interface.listen_port);
        }
        if self.interface.mtu > 0 {
            let _ = writeln!(out, "MTU = {}", self.interface.mtu);
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            if let Some(psk) = &peer.preshared_key
                && !psk.is_zero()
            {
                let _ = writeln!(out, "PresharedKey = {psk}");
            }
            if !peer.allowed_ips.is_empty() {
                let nets: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
                let _ = writeln!(out, "AllowedIPs = {}", nets.join(", "));
            }
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(out, "Endpoint = {endpoint}");
            }
            if peer.persistent_keepalive > 0 {
                let _ = writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive);
            }
        }
        out
    }
}
