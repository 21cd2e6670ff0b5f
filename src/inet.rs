//! Netlink and ioctl helpers for addresses, routes, tunnels and bridges
//!
//! Address, route and link operations go through one shared rtnetlink
//! handle. Tunnel and bridge create/delete use the BSD-ioctl path the
//! kernel still requires for `sit` devices and 802.1d bridges; TUN devices
//! come from /dev/net/tun. Every socket is close-on-exec and closed on all
//! exit paths.

use crate::error::{ConnError, ConnResult};
use futures::stream::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::{debug, warn};

const SIOCADDTUNNEL: libc::c_ulong = 0x89F1;
const SIOCDELTUNNEL: libc::c_ulong = 0x89F2;
const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const IFNAMSIZ: usize = 16;
const IFREQ_SIZE: usize = 40;

/// Interface index by name.
pub fn ifindex(name: &str) -> ConnResult<u32> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| ConnError::InvalidArgument(format!("interface name {}", name)))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(ConnError::NotFound(format!("interface {}", name)));
    }
    Ok(index)
}

/// Interface name by index.
pub fn ifname(index: u32) -> ConnResult<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return Err(ConnError::NotFound(format!("interface index {}", index)));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Shared rtnetlink handle for address/route/link operations.
#[derive(Clone)]
pub struct Inet {
    handle: Handle,
}

impl Inet {
    pub fn new() -> ConnResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| ConnError::Transport(format!("netlink connection: {}", e)))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn ifup(&self, index: u32) -> ConnResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("link up {}: {}", index, e)))
    }

    pub async fn ifdown(&self, index: u32) -> ConnResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("link down {}: {}", index, e)))
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> ConnResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("set mtu {}: {}", index, e)))
    }

    /// Add an IPv4 address; peer and broadcast attributes are attached when
    /// given (the peer form is what point-to-point TUN setups need).
    pub async fn add_address_v4(
        &self,
        index: u32,
        address: Ipv4Addr,
        prefix: u8,
        broadcast: Option<Ipv4Addr>,
        peer: Option<Ipv4Addr>,
    ) -> ConnResult<()> {
        let mut request = self.handle.address().add(index, IpAddr::V4(address), prefix);

        let message = request.message_mut();
        if let Some(broadcast) = broadcast {
            message
                .attributes
                .push(AddressAttribute::Broadcast(broadcast));
        }
        if let Some(peer) = peer {
            message
                .attributes
                .push(AddressAttribute::Address(IpAddr::V4(peer)));
        }

        request
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("add address: {}", e)))
    }

    pub async fn add_address_v6(&self, index: u32, address: Ipv6Addr, prefix: u8) -> ConnResult<()> {
        self.handle
            .address()
            .add(index, IpAddr::V6(address), prefix)
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("add address: {}", e)))
    }

    /// Remove every address of the given family from the interface.
    pub async fn flush_addresses(&self, index: u32, ipv6: bool) -> ConnResult<()> {
        let mut addresses = self.handle.address().get().execute();

        while let Some(msg) = addresses
            .try_next()
            .await
            .map_err(|e| ConnError::Transport(format!("list addresses: {}", e)))?
        {
            if msg.header.index != index {
                continue;
            }
            let is_v6 = msg
                .attributes
                .iter()
                .any(|a| matches!(a, AddressAttribute::Address(IpAddr::V6(_))));
            if is_v6 != ipv6 {
                continue;
            }
            if let Err(e) = self.handle.address().del(msg).execute().await {
                warn!("address removal on index {} failed: {}", index, e);
            }
        }

        Ok(())
    }

    pub async fn add_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
        let msg = RouteMessageBuilder::<Ipv4Addr>::default()
            .gateway(gateway)
            .output_interface(index)
            .build();
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("add default route: {}", e)))
    }

    pub async fn del_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
        let msg = RouteMessageBuilder::<Ipv4Addr>::default()
            .gateway(gateway)
            .output_interface(index)
            .build();
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("del default route: {}", e)))
    }

    /// Host route to a single address out of the given interface, used for
    /// nameservers living outside the interface subnet.
    pub async fn add_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()> {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(destination, 32)
            .output_interface(index);
        if let Some(gateway) = gateway {
            builder = builder.gateway(gateway);
        }
        self.handle
            .route()
            .add(builder.build())
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("add host route: {}", e)))
    }

    pub async fn del_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()> {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(destination, 32)
            .output_interface(index);
        if let Some(gateway) = gateway {
            builder = builder.gateway(gateway);
        }
        self.handle
            .route()
            .del(builder.build())
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("del host route: {}", e)))
    }

    /// Default IPv6 route with an explicit metric (the 6-to-4 relay route
    /// uses metric 1).
    pub async fn add_default_route_v6(
        &self,
        index: u32,
        gateway: Ipv6Addr,
        metric: u32,
    ) -> ConnResult<()> {
        let msg = RouteMessageBuilder::<Ipv6Addr>::default()
            .gateway(gateway)
            .output_interface(index)
            .priority(metric)
            .build();
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("add v6 default route: {}", e)))
    }

    pub async fn del_default_route_v6(&self, index: u32, gateway: Ipv6Addr) -> ConnResult<()> {
        let msg = RouteMessageBuilder::<Ipv6Addr>::default()
            .gateway(gateway)
            .output_interface(index)
            .build();
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| ConnError::Transport(format!("del v6 default route: {}", e)))
    }

    /// List the kernel route table and return the gateway of the current
    /// IPv4 default route, if one is installed.
    pub async fn default_gateway_v4(&self) -> ConnResult<Option<(u32, Ipv4Addr)>> {
        let mut routes = self
            .handle
            .route()
            .get(RouteMessageBuilder::<Ipv4Addr>::default().build())
            .execute();

        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| ConnError::Transport(format!("list routes: {}", e)))?
        {
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            let gateway = msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
                _ => None,
            });
            let oif = msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Oif(idx) => Some(*idx),
                _ => None,
            });
            if let (Some(gateway), Some(oif)) = (gateway, oif) {
                return Ok(Some((oif, gateway)));
            }
        }

        Ok(None)
    }
}

struct IoctlSocket {
    fd: libc::c_int,
}

impl IoctlSocket {
    fn new(sock_type: libc::c_int) -> ConnResult<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, sock_type | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(ConnError::Io(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    fn ioctl(&self, request: libc::c_ulong, arg: *mut libc::c_void) -> ConnResult<()> {
        let ret = unsafe { libc::ioctl(self.fd, request as _, arg) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(ConnError::Rejected {
                op: format!("ioctl 0x{:x}", request),
                errno: err.raw_os_error().unwrap_or(0),
            });
        }
        Ok(())
    }
}

impl Drop for IoctlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn ifreq_with_name(name: &str) -> [u8; IFREQ_SIZE] {
    let mut ifr = [0u8; IFREQ_SIZE];
    let bytes = name.as_bytes();
    let len = bytes.len().min(IFNAMSIZ - 1);
    ifr[..len].copy_from_slice(&bytes[..len]);
    ifr
}

/// `ip_tunnel_parm`: name + link + keys + the embedded IPv4 header that
/// describes the encapsulation.
fn tunnel_parm(name: &str, local: Option<Ipv4Addr>, ttl: u8) -> [u8; 52] {
    let mut parm = [0u8; 52];
    let bytes = name.as_bytes();
    let len = bytes.len().min(IFNAMSIZ - 1);
    parm[..len].copy_from_slice(&bytes[..len]);

    // iph starts at offset 32: version/ihl, tos, tot_len, id, frag_off,
    // ttl, protocol, check, saddr, daddr.
    parm[32] = 0x45;
    if local.is_some() {
        parm[38..40].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    }
    parm[40] = ttl;
    parm[41] = libc::IPPROTO_IPV6 as u8;
    if let Some(local) = local {
        parm[44..48].copy_from_slice(&local.octets());
    }

    parm
}

/// Create a `sit` tunnel device carrying IPv6-in-IPv4 from the given local
/// address, DF set, ttl 64.
pub fn tunnel_create(name: &str, local: Ipv4Addr) -> ConnResult<()> {
    let socket = IoctlSocket::new(libc::SOCK_DGRAM)?;

    let mut parm = tunnel_parm(name, Some(local), 64);
    let mut ifr = ifreq_with_name("sit0");
    let parm_ptr = parm.as_mut_ptr() as u64;
    ifr[IFNAMSIZ..IFNAMSIZ + 8].copy_from_slice(&parm_ptr.to_ne_bytes());

    debug!("add tunnel {} local {}", name, local);
    socket.ioctl(SIOCADDTUNNEL, ifr.as_mut_ptr() as *mut libc::c_void)
}

pub fn tunnel_destroy(name: &str) -> ConnResult<()> {
    let socket = IoctlSocket::new(libc::SOCK_DGRAM)?;

    let mut parm = tunnel_parm(name, None, 0);
    let mut ifr = ifreq_with_name(name);
    let parm_ptr = parm.as_mut_ptr() as u64;
    ifr[IFNAMSIZ..IFNAMSIZ + 8].copy_from_slice(&parm_ptr.to_ne_bytes());

    debug!("del tunnel {}", name);
    socket.ioctl(SIOCDELTUNNEL, ifr.as_mut_ptr() as *mut libc::c_void)
}

pub fn bridge_create(name: &str) -> ConnResult<()> {
    let socket = IoctlSocket::new(libc::SOCK_STREAM)?;
    let cname = std::ffi::CString::new(name)
        .map_err(|_| ConnError::InvalidArgument(format!("bridge name {}", name)))?;

    match socket.ioctl(SIOCBRADDBR, cname.as_ptr() as *mut libc::c_void) {
        Err(ConnError::Rejected { errno, .. }) if errno == libc::EEXIST => Ok(()),
        other => other,
    }
}

pub fn bridge_remove(name: &str) -> ConnResult<()> {
    let socket = IoctlSocket::new(libc::SOCK_STREAM)?;
    let cname = std::ffi::CString::new(name)
        .map_err(|_| ConnError::InvalidArgument(format!("bridge name {}", name)))?;
    socket.ioctl(SIOCBRDELBR, cname.as_ptr() as *mut libc::c_void)
}

/// Allocate a TUN device; the kernel picks the name. The fd ends up with
/// the requesting bus peer, who owns its closure.
pub fn create_tun() -> ConnResult<(OwnedFd, String)> {
    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(ConnError::Io(io::Error::last_os_error()));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut ifr = [0u8; IFREQ_SIZE];
    let flags = IFF_TUN | IFF_NO_PI;
    ifr[IFNAMSIZ..IFNAMSIZ + 2].copy_from_slice(&flags.to_ne_bytes());

    let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, ifr.as_mut_ptr()) };
    if ret < 0 {
        return Err(ConnError::Io(io::Error::last_os_error()));
    }

    let end = ifr.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
    let name = String::from_utf8_lossy(&ifr[..end]).into_owned();
    debug!("created TUN device {}", name);
    Ok((owned, name))
}

/// Set a bridge's forward delay through sysfs.
pub async fn set_forward_delay(bridge: &str, delay: u32) -> ConnResult<()> {
    let path = format!("/sys/class/net/{}/bridge/forward_delay", bridge);
    tokio::fs::write(&path, delay.to_string())
        .await
        .map_err(|e| ConnError::Io(e))
}

/// Toggle IPv4 forwarding; returns the previous setting so disable can
/// restore it.
pub async fn set_ip_forward(enable: bool) -> ConnResult<bool> {
    let path = "/proc/sys/net/ipv4/ip_forward";
    let previous = tokio::fs::read_to_string(path).await?;
    let previous = previous.trim() == "1";
    tokio::fs::write(path, if enable { "1" } else { "0" }).await?;
    Ok(previous)
}

/// Switch rp_filter to loose mode; returns the prior value.
pub async fn set_rp_filter_loose() -> ConnResult<i32> {
    let path = "/proc/sys/net/ipv4/conf/all/rp_filter";
    let previous = tokio::fs::read_to_string(path).await?;
    let previous: i32 = previous
        .trim()
        .parse()
        .map_err(|_| ConnError::ParseError("rp_filter value".into()))?;
    tokio::fs::write(path, "2").await?;
    Ok(previous)
}

pub async fn restore_rp_filter(value: i32) -> ConnResult<()> {
    let path = "/proc/sys/net/ipv4/conf/all/rp_filter";
    tokio::fs::write(path, value.to_string()).await?;
    Ok(())
}

/// Netmask to prefix length (all-ones run from the top).
pub fn netmask_prefix_len(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_prefix_len() {
        assert_eq!(netmask_prefix_len("255.255.255.0".parse().unwrap()), 24);
        assert_eq!(netmask_prefix_len("255.255.0.0".parse().unwrap()), 16);
        assert_eq!(netmask_prefix_len("255.255.255.255".parse().unwrap()), 32);
        assert_eq!(netmask_prefix_len("0.0.0.0".parse().unwrap()), 0);
    }

    #[test]
    fn test_tunnel_parm_layout() {
        let parm = tunnel_parm("tun6to4-1", Some("1.2.3.4".parse().unwrap()), 64);
        assert_eq!(&parm[..9], b"tun6to4-1");
        assert_eq!(parm[32], 0x45);
        assert_eq!(parm[40], 64);
        assert_eq!(parm[41], 41); // IPv6-in-IPv4
        assert_eq!(&parm[44..48], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_ifreq_name_truncated() {
        let ifr = ifreq_with_name("averylonginterfacename0");
        assert_eq!(ifr[IFNAMSIZ - 1], 0);
    }
}
