// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A userspace, datagram-oriented layer-3 tunneling engine.
//!
//! Many encrypted peer sessions are multiplexed over a single dual-stack UDP
//! bind and a single virtual network interface. Replies leave from the same
//! local address a peer last contacted ("sticky sockets"), surviving NAT
//! rebinding.

pub mod config;
pub mod device;
pub mod packet;
pub mod session;
pub mod tun;
pub mod udp;

mod task;

/// Re-export of the x25519 types used for peer identities.
pub mod x25519 {
    pub use x25519_dalek::{PublicKey, StaticSecret};
}
