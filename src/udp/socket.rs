// Copyright (c) 2026 Stickytun Contributors. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Native Linux dual-socket bind with sticky source addresses.
//!
//! Userspace rendition of "sticky sockets": per-packet IP_PKTINFO /
//! IPV6_PKTINFO control messages carry the local address a datagram arrived
//! on, and the same control message pins the source of replies. When the
//! kernel rejects a cached source (interfaces changed underneath us) the
//! cache is cleared and the send retried once with an OS-chosen source.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nix::cmsg_space;
use nix::libc;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, SockFlag, SockType,
    SockaddrIn, SockaddrIn6, bind, getsockname, recvmsg, sendmsg, setsockopt, shutdown, socket,
    sockopt,
};
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::udp::{Bind, Endpoint, EndpointSrc, Networking};

/// [`Networking`] over the host's kernel sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysNetworking;

#[derive(Debug)]
pub struct SysBind {
    sock4: UdpSocket,
    sock6: UdpSocket,
    applied_mark: AtomicU32,
    closed: AtomicBool,
}

impl Networking for SysNetworking {
    type Bind = SysBind;

    async fn create_bind(&self, port: u16) -> io::Result<(SysBind, u16)> {
        // The v6 socket binds first; whatever port the OS hands it is then
        // demanded from the v4 socket so both families share one port.
        let (sock6, port) = create6(port)?;
        let sock4 = create4(port)?;
        Ok((
            SysBind {
                sock4,
                sock6,
                applied_mark: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            },
            port,
        ))
    }
}

impl Bind for SysBind {
    async fn recv_v4(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        let fd = self.sock4.as_raw_fd();
        self.sock4
            .async_io(Interest::READABLE, || {
                if self.closed.load(Ordering::Acquire) {
                    return Err(closed_err());
                }
                let mut iov = [IoSliceMut::new(&mut buf[..])];
                let mut cmsg = cmsg_space!(libc::in_pktinfo);
                let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())
                    .map_err(io_err)?;

                let Some(sender) = msg.address else {
                    // shutdown-for-read drains as addressless zero reads
                    return Err(closed_err());
                };

                let dst = SocketAddr::V4(SocketAddrV4::new(sender.ip(), sender.port()));
                let mut endpoint = Endpoint::new(dst);
                for cmsg in msg.cmsgs().map_err(io_err)? {
                    if let ControlMessageOwned::Ipv4PacketInfo(pi) = cmsg {
                        endpoint = Endpoint::with_src(
                            dst,
                            EndpointSrc {
                                addr: std::net::Ipv4Addr::from(u32::from_be(
                                    pi.ipi_spec_dst.s_addr,
                                ))
                                .into(),
                                ifindex: pi.ipi_ifindex as u32,
                            },
                        );
                    }
                }
                Ok((msg.bytes, endpoint))
            })
            .await
    }

    async fn recv_v6(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        let fd = self.sock6.as_raw_fd();
        self.sock6
            .async_io(Interest::READABLE, || {
                if self.closed.load(Ordering::Acquire) {
                    return Err(closed_err());
                }
                let mut iov = [IoSliceMut::new(&mut buf[..])];
                let mut cmsg = cmsg_space!(libc::in6_pktinfo);
                let msg = recvmsg::<SockaddrIn6>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())
                    .map_err(io_err)?;

                let Some(sender) = msg.address else {
                    return Err(closed_err());
                };

                let dst = SocketAddr::V6(SocketAddrV6::new(
                    sender.ip(),
                    sender.port(),
                    sender.flowinfo(),
                    sender.scope_id(),
                ));
                let mut endpoint = Endpoint::new(dst);
                for cmsg in msg.cmsgs().map_err(io_err)? {
                    if let ControlMessageOwned::Ipv6PacketInfo(pi) = cmsg {
                        endpoint = Endpoint::with_src(
                            dst,
                            EndpointSrc {
                                addr: Ipv6Addr::from(pi.ipi6_addr.s6_addr).into(),
                                ifindex: pi.ipi6_ifindex,
                            },
                        );
                    }
                }
                Ok((msg.bytes, endpoint))
            })
            .await
    }

    async fn send(&self, buf: &[u8], endpoint: &mut Endpoint) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_err());
        }
        match endpoint.dst() {
            SocketAddr::V4(dst) => {
                let first = self.send4(buf, dst, endpoint.src()).await;
                match first {
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        // cached source no longer valid on this host
                        endpoint.clear_src();
                        self.send4(buf, dst, None).await
                    }
                    other => other,
                }
            }
            SocketAddr::V6(dst) => {
                let first = self.send6(buf, dst, endpoint.src()).await;
                match first {
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        endpoint.clear_src();
                        self.send6(buf, dst, None).await
                    }
                    other => other,
                }
            }
        }
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        if self.applied_mark.swap(mark, Ordering::AcqRel) == mark {
            return Ok(());
        }
        setsockopt(&self.sock6, sockopt::Mark, &mark).map_err(io_err)?;
        setsockopt(&self.sock4, sockopt::Mark, &mark).map_err(io_err)?;
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        // shutdown-for-read wakes blocked receivers; the descriptors
        // themselves are released when the last handle drops
        let v6 = shutdown(self.sock6.as_raw_fd(), Shutdown::Read).map_err(io_err);
        let v4 = shutdown(self.sock4.as_raw_fd(), Shutdown::Read).map_err(io_err);
        match (v6, v4) {
            (Err(e), Err(other)) => {
                log::debug!("v4 shutdown also failed: {other}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

impl SysBind {
    async fn send4(&self, buf: &[u8], dst: SocketAddrV4, src: Option<EndpointSrc>) -> io::Result<()> {
        let fd = self.sock4.as_raw_fd();
        let addr = SockaddrIn::from(dst);

        let mut pktinfo = libc::in_pktinfo {
            ipi_ifindex: 0,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr { s_addr: 0 },
        };
        if let Some(EndpointSrc {
            addr: std::net::IpAddr::V4(ip),
            ifindex,
        }) = src
        {
            pktinfo.ipi_ifindex = ifindex as libc::c_int;
            pktinfo.ipi_spec_dst.s_addr = u32::from(ip).to_be();
        }

        self.sock4
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(buf)];
                let cmsgs = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&addr)).map_err(io_err)?;
                Ok(())
            })
            .await
    }

    async fn send6(&self, buf: &[u8], dst: SocketAddrV6, src: Option<EndpointSrc>) -> io::Result<()> {
        let fd = self.sock6.as_raw_fd();
        let addr = SockaddrIn6::from(dst);

        let mut pktinfo = libc::in6_pktinfo {
            ipi6_addr: libc::in6_addr { s6_addr: [0; 16] },
            ipi6_ifindex: 0,
        };
        if let Some(EndpointSrc {
            addr: std::net::IpAddr::V6(ip),
            ifindex,
        }) = src
        {
            pktinfo.ipi6_addr.s6_addr = ip.octets();
            pktinfo.ipi6_ifindex = ifindex;
        }

        self.sock6
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(buf)];
                let cmsgs = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&addr)).map_err(io_err)?;
                Ok(())
            })
            .await
    }
}

fn create4(port: u16) -> io::Result<UdpSocket> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io_err)?;

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io_err)?;
    setsockopt(&fd, sockopt::Ipv4PacketInfo, &true).map_err(io_err)?;

    let addr = SockaddrIn::from(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port));
    bind(fd.as_raw_fd(), &addr).map_err(io_err)?;

    UdpSocket::from_std(std::net::UdpSocket::from(fd))
}

fn create6(port: u16) -> io::Result<(UdpSocket, u16)> {
    let fd = socket(
        AddressFamily::Inet6,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io_err)?;

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io_err)?;
    setsockopt(&fd, sockopt::Ipv6RecvPacketInfo, &true).map_err(io_err)?;
    // v4 traffic must only arrive on the v4 socket
    setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io_err)?;

    let addr = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    bind(fd.as_raw_fd(), &addr).map_err(io_err)?;
    let bound: SockaddrIn6 = getsockname(fd.as_raw_fd()).map_err(io_err)?;

    let sock = UdpSocket::from_std(std::net::UdpSocket::from(fd))?;
    Ok((sock, bound.port()))
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "bind is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::MAX_DATAGRAM_SIZE;
    use std::time::Duration;

    #[tokio::test]
    async fn os_chosen_port_is_shared() {
        let (bind, port) = SysNetworking.create_bind(0).await.expect("bind");
        assert_ne!(port, 0);
        bind.close().expect("close");
    }

    #[tokio::test]
    async fn occupied_port_is_rejected() {
        // an external probe without SO_REUSEADDR occupies the port
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe");
        let port = probe.local_addr().expect("addr").port();

        let err = SysNetworking.create_bind(port).await.expect_err("in use");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn close_unblocks_receiver() {
        let (bind, _port) = SysNetworking.create_bind(0).await.expect("bind");
        let bind = std::sync::Arc::new(bind);

        let receiver = {
            let bind = bind.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                bind.recv_v4(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        bind.close().expect("close");

        let res = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("receiver unblocked within bound")
            .expect("no panic");
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn loopback_send_caches_source() {
        let (a, _port_a) = SysNetworking.create_bind(0).await.expect("bind a");
        let (b, port_b) = SysNetworking.create_bind(0).await.expect("bind b");

        let mut target: Endpoint = format!("127.0.0.1:{port_b}").parse().expect("endpoint");
        a.send(b"hello", &mut target).await.expect("send");

        let mut buf = vec![0u8; 256];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), b.recv_v4(&mut buf))
            .await
            .expect("datagram arrives")
            .expect("recv");
        assert_eq!(&buf[..n], b"hello");
        // arrival populated the source cache with the local address
        assert_eq!(from.src_ip(), Some(std::net::Ipv4Addr::LOCALHOST.into()));

        a.close().expect("close a");
        b.close().expect("close b");
    }
}
