//! Multicast socket plumbing for the discovery plane. Announcements, crash
//! notices and leader broadcasts all travel on a single well-known multicast
//! group; every server (and any client that wants leader notifications)
//! joins it.

use crate::error::{Error, Result};

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Opens a socket subscribed to the multicast group on the given interface.
/// SO_REUSEADDR is set before binding so several processes on one host can
/// join the same group, and multicast loopback is enabled so they can hear
/// each other. Join failures are fatal: a server that can't hear
/// announcements is useless.
pub fn multicast_listener(group: SocketAddrV4, interface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Fatal(format!("failed to create multicast socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::Fatal(format!("failed to set SO_REUSEADDR: {e}")))?;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
    socket
        .bind(&bind.into())
        .map_err(|e| Error::Fatal(format!("failed to bind multicast port {}: {e}", group.port())))?;
    socket
        .join_multicast_v4(group.ip(), &interface)
        .map_err(|e| Error::Fatal(format!("failed to join multicast group {group}: {e}")))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| Error::Fatal(format!("failed to enable multicast loopback: {e}")))?;
    Ok(socket.into())
}

/// Opens a socket for sending to the multicast group via the given
/// interface, with the given TTL and loopback enabled so processes on the
/// sending host receive their own announcements.
pub fn multicast_sender(interface: Ipv4Addr, ttl: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Fatal(format!("failed to create multicast sender: {e}")))?;
    socket.set_multicast_if_v4(&interface)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket
        .bind(&bind.into())
        .map_err(|e| Error::Fatal(format!("failed to bind multicast sender: {e}")))?;
    Ok(socket.into())
}

/// Resolves the multicast interface for a configured host: the host itself
/// when it is an IPv4 address, otherwise the kernel's default interface.
pub fn multicast_interface(host: &str) -> Ipv4Addr {
    host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Detects the local IP address by opening a throwaway UDP socket towards a
/// public address. No traffic is sent; the socket is only used to learn which
/// interface the OS would route through. Falls back to loopback when there is
/// no route, e.g. on an offline machine.
pub fn local_ip() -> IpAddr {
    let detect = || -> Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    detect().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
