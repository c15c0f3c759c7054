// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The UDP transport seam: dual-stack binds and their factory.
//!
//! A [`Bind`] is a pair of sockets, one per address family, both on the same
//! port. Receives surface the sender address *and* the local address the
//! datagram arrived on; sends re-inject that cached local address so replies
//! stay sticky across NAT rebinding. [`Networking`] abstracts bind and
//! endpoint construction so the simulated network can stand in for the OS.

use std::io;

pub mod endpoint;
pub mod sim;
#[cfg(target_os = "linux")]
pub mod socket;

pub use endpoint::{Endpoint, EndpointParseError, EndpointSrc};

/// Largest datagram a bind must be able to receive: MTU-bounded ciphertext
/// plus outer overhead, rounded all the way up to the UDP maximum.
pub const MAX_DATAGRAM_SIZE: usize = (1 << 16) - 1;

/// A dual-stack UDP transport bound to one port.
///
/// One sender and one receiver per family may operate concurrently.
/// [`Bind::close`] unblocks outstanding receives, which then observe an
/// error and wind down.
pub trait Bind: Send + Sync + 'static {
    /// Receive the next IPv4 datagram. The returned endpoint carries the
    /// sender as destination and the arrival address as cached source.
    /// Datagrams longer than `buf` are truncated.
    fn recv_v4<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Endpoint)>> + Send + 'a;

    /// IPv6 flavor of [`Bind::recv_v4`].
    fn recv_v6<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Endpoint)>> + Send + 'a;

    /// Send `buf` to `endpoint.dst()`, attaching the cached source address.
    /// If the OS rejects the cached source as no longer valid, the cache is
    /// cleared (visible to the caller) and the send retried once with an
    /// OS-chosen source; only a second failure surfaces.
    fn send<'a>(
        &'a self,
        buf: &'a [u8],
        endpoint: &'a mut Endpoint,
    ) -> impl Future<Output = io::Result<()>> + Send + 'a;

    /// Apply a firewall mark to both sockets for egress routing policy.
    /// Re-applying the current mark is a no-op.
    fn set_mark(&self, mark: u32) -> io::Result<()>;

    /// Shut both sockets down for reading and release them. Teardown is
    /// best-effort: both sockets are attempted, the first error is
    /// returned and the rest are logged.
    fn close(&self) -> io::Result<()>;
}

/// Platform abstraction for constructing binds and endpoints.
pub trait Networking: Send + Sync + 'static {
    type Bind: Bind;

    /// Bind both sockets to `port` (0 = OS-chosen); returns the bind and the
    /// port actually in use, which is the same for both families.
    fn create_bind(
        &self,
        port: u16,
    ) -> impl Future<Output = io::Result<(Self::Bind, u16)>> + Send + '_;

    /// Parse a textual endpoint. The host must already be numeric.
    fn create_endpoint(&self, s: &str) -> Result<Endpoint, EndpointParseError> {
        s.parse()
    }
}
