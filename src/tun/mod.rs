// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The virtual-interface collaborator seam.
//!
//! The device consumes outbound IP packets from [`Tun::read`] and delivers
//! decrypted inbound packets to [`Tun::write`]. Anything packet-shaped can
//! implement this; [`channel::ChannelTun`] backs the in-process tests.

use std::io;

use tokio::sync::mpsc;

pub mod channel;

/// Interface state changes reported by a TUN implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
    MtuChange(u16),
}

/// A virtual network interface.
///
/// Implementations are cheap handles (clones share the underlying device).
pub trait Tun: Clone + Send + Sync + 'static {
    /// Read the next outbound IP packet into `buf`; returns its length.
    fn read<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Deliver an inbound IP packet.
    fn write<'a>(&'a self, packet: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    fn mtu(&self) -> u16;

    fn name(&self) -> &str;

    /// The event stream of this interface.
    ///
    /// There is a single stream per device; the first caller takes it and
    /// later calls return an already-closed receiver.
    fn events(&self) -> mpsc::UnboundedReceiver<TunEvent>;

    /// Shut the interface down; pending and future reads fail.
    fn close(&self);
}
