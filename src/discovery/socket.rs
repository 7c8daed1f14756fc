use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use log::{debug, warn};
use socket2::SockRef;

use super::filter::split_list;
use crate::protocol::DatagramChannel;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(230, 255, 255, 255);
pub const DEFAULT_MULTICAST_TTL: u32 = 50;
pub const BROADCAST_ALL: &str = "BROADCAST_ALL";
pub const ALL_INTERFACES: &str = "ALL";

/// UDP socket joined to a multicast group on a set of local interfaces.
///
/// Datagrams sent to a multicast destination go out once per interface.
/// Group membership is dropped when the socket is.
#[derive(Debug)]
pub struct MulticastSocket {
    socket: UdpSocket,
    group: Ipv4Addr,
    interfaces: Vec<Ipv4Addr>,
    joined: Vec<Ipv4Addr>,
}

impl MulticastSocket {
    pub fn open(group: Ipv4Addr, interfaces: Vec<Ipv4Addr>, ttl: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(ttl)?;
        debug!(
            "discovery socket on {} with ttl {ttl}",
            socket.local_addr()?
        );

        let mut joined = Vec::with_capacity(interfaces.len());
        for interface in &interfaces {
            match socket.join_multicast_v4(&group, interface) {
                Ok(()) => {
                    debug!("joined {group} on {interface}");
                    joined.push(*interface);
                }
                Err(e) => debug!("unable to join {group} on {interface}: {e}"),
            }
        }

        Ok(Self {
            socket,
            group,
            interfaces,
            joined,
        })
    }

    pub fn interfaces(&self) -> &[Ipv4Addr] {
        &self.interfaces
    }

    pub fn joined(&self) -> &[Ipv4Addr] {
        &self.joined
    }
}

impl DatagramChannel for MulticastSocket {
    fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        if !to.ip().is_multicast() || self.interfaces.is_empty() {
            return self.socket.send_to(bytes, to);
        }

        let sock = SockRef::from(&self.socket);
        let mut sent = 0;
        for interface in &self.interfaces {
            sock.set_multicast_if_v4(interface)?;
            sent = self.socket.send_to(bytes, to)?;
            debug!("sent {sent} bytes to {to} via {interface}");
        }
        Ok(sent)
    }

    fn recv_datagram(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_datagram(buf, timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for MulticastSocket {
    fn drop(&mut self) {
        for interface in self.joined.drain(..) {
            if let Err(e) = self.socket.leave_multicast_v4(&self.group, &interface) {
                debug!("unable to leave {} on {interface}: {e}", self.group);
            }
        }
        debug!("discovery socket closed");
    }
}

fn local_interfaces() -> io::Result<Vec<if_addrs::Interface>> {
    if_addrs::get_if_addrs()
}

/// Every IPv4 address of this host, loopback included.
pub fn local_ipv4s() -> io::Result<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();
    for interface in local_interfaces()? {
        if let if_addrs::IfAddr::V4(v4) = interface.addr {
            if !ips.contains(&v4.ip) {
                ips.push(v4.ip);
            }
        }
    }
    Ok(ips)
}

/// First IPv4 address that is not a loopback address.
pub fn default_local_ip() -> io::Result<Ipv4Addr> {
    local_ipv4s()?
        .into_iter()
        .find(|ip| !ip.is_loopback())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no non-loopback IPv4 address"))
}

/// Broadcast address of every local IPv4 interface that has one.
pub fn broadcast_addresses() -> io::Result<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();
    for interface in local_interfaces()? {
        if let if_addrs::IfAddr::V4(v4) = interface.addr {
            if let Some(broadcast) = v4.broadcast {
                if !ips.contains(&broadcast) {
                    ips.push(broadcast);
                }
            }
        }
    }
    Ok(ips)
}

/// Local interfaces used for sending and joining the multicast group.
pub fn multicast_interfaces(setting: Option<&str>) -> io::Result<Vec<Ipv4Addr>> {
    let selected = match setting.map(str::trim) {
        Some(all) if all.eq_ignore_ascii_case(ALL_INTERFACES) => {
            let mut ips = vec![Ipv4Addr::LOCALHOST];
            ips.extend(local_ipv4s()?.into_iter().filter(|ip| *ip != Ipv4Addr::LOCALHOST));
            ips
        }
        Some(list) => parse_interfaces(list),
        None => Vec::new(),
    };

    if selected.is_empty() {
        return Ok(vec![default_local_ip()?]);
    }
    Ok(selected)
}

fn parse_interfaces(list: &str) -> Vec<Ipv4Addr> {
    split_list(list)
        .filter_map(|entry| match entry.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("invalid multicast interface {entry} (ignored)");
                None
            }
        })
        .collect()
}

/// Where discovery requests are sent.
pub fn resolve_destinations(setting: Option<&str>, port: u16) -> Vec<SocketAddr> {
    destinations_from(setting, port, || match broadcast_addresses() {
        Ok(ips) => ips,
        Err(e) => {
            warn!("unable to list broadcast addresses: {e}");
            Vec::new()
        }
    })
}

fn destinations_from<F>(setting: Option<&str>, port: u16, broadcast: F) -> Vec<SocketAddr>
where
    F: FnOnce() -> Vec<Ipv4Addr>,
{
    let Some(setting) = setting.map(str::trim) else {
        return vec![SocketAddr::from((DEFAULT_MULTICAST_GROUP, port))];
    };

    if setting.is_empty() || setting.eq_ignore_ascii_case(BROADCAST_ALL) {
        let mut ips = broadcast();
        if ips.is_empty() {
            ips.push(Ipv4Addr::BROADCAST);
        }
        return ips
            .into_iter()
            .map(|ip| SocketAddr::from((ip, port)))
            .collect();
    }

    let mut destinations = Vec::new();
    for entry in split_list(setting) {
        match resolve(entry, port) {
            Some(addr) if !destinations.contains(&addr) => destinations.push(addr),
            Some(_) => {}
            None => warn!("unable to validate discovery address {entry} (ignored)"),
        }
    }
    destinations
}

fn resolve(entry: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    (entry, port)
        .to_socket_addrs()
        .ok()?
        .find(SocketAddr::is_ipv4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_targets_default_group() {
        let destinations = destinations_from(None, 7777, || unreachable!());
        assert_eq!(destinations, vec!["230.255.255.255:7777".parse().unwrap()]);
    }

    #[test]
    fn broadcast_all_uses_interfaces() {
        let found = || vec![Ipv4Addr::new(10, 0, 0, 255), Ipv4Addr::new(192, 168, 1, 255)];
        let destinations = destinations_from(Some("broadcast_all"), 7000, found);
        assert_eq!(
            destinations,
            vec![
                "10.0.0.255:7000".parse().unwrap(),
                "192.168.1.255:7000".parse().unwrap()
            ]
        );

        let destinations = destinations_from(Some(""), 7000, Vec::new);
        assert_eq!(destinations, vec!["255.255.255.255:7000".parse().unwrap()]);
    }

    #[test]
    fn explicit_list_is_deduplicated() {
        let destinations = destinations_from(
            Some("10.0.0.255, , 10.0.0.255, 127.0.0.1"),
            7777,
            || unreachable!(),
        );
        assert_eq!(
            destinations,
            vec![
                "10.0.0.255:7777".parse().unwrap(),
                "127.0.0.1:7777".parse().unwrap()
            ]
        );
    }

    #[test]
    fn interface_list_is_parsed() {
        assert_eq!(
            multicast_interfaces(Some("127.0.0.1, bogus")).unwrap(),
            vec![Ipv4Addr::LOCALHOST]
        );
    }

    #[test]
    fn all_interfaces_starts_with_loopback() {
        let interfaces = multicast_interfaces(Some("all")).unwrap();
        assert_eq!(interfaces[0], Ipv4Addr::LOCALHOST);
        assert_eq!(
            interfaces.iter().filter(|ip| **ip == Ipv4Addr::LOCALHOST).count(),
            1
        );
    }

    #[test]
    fn multicast_send_goes_out_on_every_interface() {
        let interfaces = vec![Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST];
        let socket = MulticastSocket::open(DEFAULT_MULTICAST_GROUP, interfaces, 1).unwrap();
        assert_eq!(socket.interfaces().len(), 2);
        // Hosts without multicast on loopback cannot join at all.
        if socket.joined().is_empty() {
            return;
        }
        // A second join on the same interface is refused.
        assert_eq!(socket.joined(), &[Ipv4Addr::LOCALHOST]);

        let port = socket.local_addr().unwrap().port();
        let group = SocketAddr::from((DEFAULT_MULTICAST_GROUP, port));
        if socket.send_datagram(b"REQ", group).is_err() {
            return;
        }

        let mut buf = [0; 16];
        for _ in 0..2 {
            let (n, _) = socket
                .recv_datagram(&mut buf, Some(Duration::from_secs(2)))
                .unwrap();
            assert_eq!(&buf[..n], b"REQ");
        }
    }

    #[test]
    fn group_is_left_on_drop() {
        let socket =
            MulticastSocket::open(DEFAULT_MULTICAST_GROUP, vec![Ipv4Addr::LOCALHOST], 1).unwrap();
        if socket.joined().is_empty() {
            return;
        }
        let raw = socket.socket.try_clone().unwrap();
        drop(socket);

        // Membership is gone, so joining again through the same socket works.
        raw.join_multicast_v4(&DEFAULT_MULTICAST_GROUP, &Ipv4Addr::LOCALHOST)
            .unwrap();
    }

    #[test]
    fn unicast_send_and_receive() {
        let socket = MulticastSocket::open(DEFAULT_MULTICAST_GROUP, Vec::new(), 1).unwrap();
        assert!(socket.joined().is_empty());

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        peer.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let mut buf = [0; 16];
        let (n, from) = socket
            .recv_datagram(&mut buf, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, peer.local_addr().unwrap());

        socket
            .send_datagram(b"pong", peer.local_addr().unwrap())
            .unwrap();
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
