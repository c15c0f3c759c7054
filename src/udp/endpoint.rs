// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Source/destination addressing record for a peer.
//!
//! `dst` is the peer's observed remote address. `src` caches the local
//! address (and egress interface) the peer last reached us on, so replies
//! leave from the address the peer expects even on multihomed hosts. A
//! cleared `src` lets the OS pick.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Cached local source: address plus egress interface index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointSrc {
    pub addr: IpAddr,
    pub ifindex: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    dst: SocketAddr,
    src: Option<EndpointSrc>,
}

impl Endpoint {
    /// A fresh endpoint with no cached source.
    pub fn new(dst: SocketAddr) -> Endpoint {
        Endpoint { dst, src: None }
    }

    pub(crate) fn with_src(dst: SocketAddr, src: EndpointSrc) -> Endpoint {
        Endpoint {
            dst,
            src: Some(src),
        }
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst.ip()
    }

    pub fn src(&self) -> Option<EndpointSrc> {
        self.src
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.src.map(|s| s.addr)
    }

    /// Forget the cached source; the OS chooses it on the next send.
    pub fn clear_src(&mut self) {
        self.src = None;
    }

    /// Canonical byte form of the destination, fed into MAC/cookie
    /// computations. Two endpoints with the same destination MUST serialize
    /// identically: family tag, port in network order, 16 address bytes
    /// (IPv4 zero-padded).
    pub fn dst_to_bytes(&self) -> [u8; 19] {
        let mut out = [0u8; 19];
        out[1..3].copy_from_slice(&self.dst.port().to_be_bytes());
        match self.dst.ip() {
            IpAddr::V4(ip) => {
                out[0] = 4;
                out[3..7].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out[0] = 6;
                out[3..19].copy_from_slice(&ip.octets());
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid endpoint {0:?}: numeric host:port required")]
pub struct EndpointParseError(pub String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// Parse a numeric `host:port` / `[host]:port`. Hostnames are rejected;
    /// resolution is the caller's job. IPv6 scope ids are accepted in their
    /// numeric form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dst = SocketAddr::from_str(s).map_err(|_| EndpointParseError(s.to_owned()))?;
        Ok(Endpoint::new(dst))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dst.fmt(f)
    }
}
