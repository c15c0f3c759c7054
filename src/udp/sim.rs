// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A simulated network: an in-memory "internet" of hosts and binds.
//!
//! [`SimNet`] maps IP addresses to virtual hosts; each host owns per-port
//! binds with one inbound queue per address family. Sending routes by
//! destination address and enqueues; receiving dequeues. The stickiness
//! contract holds end-to-end: the cached source of an endpoint decides the
//! source address the receiving side observes, and a cached source the host
//! does not own behaves like the kernel's "invalid argument" (cleared, then
//! retried with the host's own address). This lets the full datapath run
//! without any kernel sockets.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};

use crate::udp::{Bind, Endpoint, EndpointSrc, Networking};

const QUEUE_DEPTH: usize = 256;
const SIM_IFINDEX: u32 = 1;

struct Datagram {
    contents: Vec<u8>,
    /// Sender, from the recipient's point of view.
    from: SocketAddr,
    /// Local address the datagram "arrived" on.
    arrived_on: IpAddr,
}

struct World {
    routes: SyncMutex<HashMap<IpAddr, Arc<Host>>>,
}

struct Host {
    addr_v4: Option<Ipv4Addr>,
    addr_v6: Option<Ipv6Addr>,
    binds: SyncMutex<HashMap<u16, Queues>>,
}

struct Queues {
    tx4: mpsc::Sender<Datagram>,
    tx6: mpsc::Sender<Datagram>,
}

/// One instance of "the internet" for tests.
#[derive(Clone)]
pub struct SimNet {
    world: Arc<World>,
}

impl SimNet {
    pub fn new() -> SimNet {
        SimNet {
            world: Arc::new(World {
                routes: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a host with the given addresses. Fails with `AddrInUse` if an
    /// address is already assigned.
    pub fn host(
        &self,
        addr_v4: Option<Ipv4Addr>,
        addr_v6: Option<Ipv6Addr>,
    ) -> io::Result<SimHost> {
        let host = Arc::new(Host {
            addr_v4,
            addr_v6,
            binds: SyncMutex::new(HashMap::new()),
        });

        let mut routes = self.world.routes.lock();
        for addr in addr_v4
            .map(IpAddr::from)
            .into_iter()
            .chain(addr_v6.map(IpAddr::from))
        {
            if routes.contains_key(&addr) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} already assigned"),
                ));
            }
        }
        for addr in addr_v4
            .map(IpAddr::from)
            .into_iter()
            .chain(addr_v6.map(IpAddr::from))
        {
            routes.insert(addr, Arc::clone(&host));
        }

        Ok(SimHost {
            world: Arc::clone(&self.world),
            host,
        })
    }
}

impl Default for SimNet {
    fn default() -> Self {
        SimNet::new()
    }
}

/// A virtual interface on a [`SimNet`]; the simulation's [`Networking`].
#[derive(Clone)]
pub struct SimHost {
    world: Arc<World>,
    host: Arc<Host>,
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHost").finish_non_exhaustive()
    }
}

impl Networking for SimHost {
    type Bind = SimBind;

    async fn create_bind(&self, port: u16) -> io::Result<(SimBind, u16)> {
        let mut binds = self.host.binds.lock();

        let port = if port == 0 {
            // lowest free port, like the dummy network the tests grew up on
            (1u16..)
                .find(|p| !binds.contains_key(p))
                .expect("fewer than 65535 binds")
        } else if binds.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} in use"),
            ));
        } else {
            port
        };

        let (tx4, rx4) = mpsc::channel(QUEUE_DEPTH);
        let (tx6, rx6) = mpsc::channel(QUEUE_DEPTH);
        binds.insert(port, Queues { tx4, tx6 });

        Ok((
            SimBind {
                world: Arc::clone(&self.world),
                host: Arc::clone(&self.host),
                port,
                rx4: Mutex::new(rx4),
                rx6: Mutex::new(rx6),
                applied_mark: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            },
            port,
        ))
    }
}

pub struct SimBind {
    world: Arc<World>,
    host: Arc<Host>,
    port: u16,
    rx4: Mutex<mpsc::Receiver<Datagram>>,
    rx6: Mutex<mpsc::Receiver<Datagram>>,
    applied_mark: AtomicU32,
    closed: AtomicBool,
}

impl std::fmt::Debug for SimBind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBind")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SimBind {
    async fn recv(
        &self,
        rx: &Mutex<mpsc::Receiver<Datagram>>,
        buf: &mut [u8],
    ) -> io::Result<(usize, Endpoint)> {
        // closing removes this bind's queues from the host, dropping the
        // senders; recv then returns None and unblocks us
        let datagram = rx.lock().await.recv().await.ok_or_else(closed_err)?;

        let n = datagram.contents.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.contents[..n]);

        let endpoint = Endpoint::with_src(
            datagram.from,
            EndpointSrc {
                addr: datagram.arrived_on,
                ifindex: SIM_IFINDEX,
            },
        );
        Ok((n, endpoint))
    }

    /// The source address a send would leave from, mirroring pktinfo
    /// handling: a cached source the host owns wins, anything else is the
    /// kernel's "invalid argument" (cleared, OS default used instead).
    fn pick_source(&self, endpoint: &mut Endpoint, v6: bool) -> io::Result<IpAddr> {
        let own: Option<IpAddr> = if v6 {
            self.host.addr_v6.map(IpAddr::from)
        } else {
            self.host.addr_v4.map(IpAddr::from)
        };
        let own = own.ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address for family")
        })?;

        match endpoint.src_ip() {
            Some(cached) if cached == own => Ok(cached),
            Some(cached) => {
                log::trace!("cached source {cached} not owned by host; clearing and retrying");
                endpoint.clear_src();
                Ok(own)
            }
            None => Ok(own),
        }
    }
}

impl Bind for SimBind {
    async fn recv_v4(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.recv(&self.rx4, buf).await
    }

    async fn recv_v6(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.recv(&self.rx6, buf).await
    }

    async fn send(&self, buf: &[u8], endpoint: &mut Endpoint) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_err());
        }

        let dst = endpoint.dst();
        let source = self.pick_source(endpoint, dst.is_ipv6())?;
        let from = SocketAddr::new(source, self.port);

        let target = self
            .world
            .routes
            .lock()
            .get(&dst.ip())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::HostUnreachable, "no route to host"))?;

        let binds = target.binds.lock();
        let Some(queues) = binds.get(&dst.port()) else {
            // nothing is listening; UDP drops silently
            return Ok(());
        };
        let tx = if dst.is_ipv6() {
            queues.tx6.clone()
        } else {
            queues.tx4.clone()
        };
        drop(binds);

        // a full queue drops the datagram, as UDP does
        let _ = tx.try_send(Datagram {
            contents: buf.to_vec(),
            from,
            arrived_on: dst.ip(),
        });
        Ok(())
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        self.applied_mark.store(mark, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.host.binds.lock().remove(&self.port);
        }
        Ok(())
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "bind is closed")
}
