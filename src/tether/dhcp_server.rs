//! Embedded DHCPv4 server for the tethering bridge
//!
//! Serves one pool on one interface: DISCOVER gets an OFFER from the pool,
//! REQUEST gets an ACK (or NAK when the requested address cannot be
//! honored), RELEASE frees the lease. Options handed out are subnet mask,
//! router, DNS server, lease time and server identifier.

use crate::error::{ConnError, ConnResult};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const BOOTP_MIN_SIZE: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVER: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

/// DHCP message type (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl DhcpMessageType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DhcpMessageType::Discover),
            2 => Some(DhcpMessageType::Offer),
            3 => Some(DhcpMessageType::Request),
            4 => Some(DhcpMessageType::Decline),
            5 => Some(DhcpMessageType::Ack),
            6 => Some(DhcpMessageType::Nak),
            7 => Some(DhcpMessageType::Release),
            8 => Some(DhcpMessageType::Inform),
            _ => None,
        }
    }

    fn code(&self) -> u8 {
        match self {
            DhcpMessageType::Discover => 1,
            DhcpMessageType::Offer => 2,
            DhcpMessageType::Request => 3,
            DhcpMessageType::Decline => 4,
            DhcpMessageType::Ack => 5,
            DhcpMessageType::Nak => 6,
            DhcpMessageType::Release => 7,
            DhcpMessageType::Inform => 8,
        }
    }
}

/// One BOOTP frame plus its options.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub op: u8,
    pub hlen: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<(u8, Vec<u8>)>,
}

impl DhcpMessage {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < BOOTP_MIN_SIZE || buf[236..240] != MAGIC_COOKIE {
            return None;
        }

        let read_addr =
            |off: usize| Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3]);

        let mut message = Self {
            op: buf[0],
            hlen: buf[2],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: read_addr(12),
            yiaddr: read_addr(16),
            siaddr: read_addr(20),
            giaddr: read_addr(24),
            chaddr: buf[28..44].try_into().ok()?,
            options: Vec::new(),
        };

        let mut pos = BOOTP_MIN_SIZE;
        while pos < buf.len() {
            let code = buf[pos];
            if code == OPT_END {
                break;
            }
            if code == 0 {
                pos += 1;
                continue;
            }
            if pos + 1 >= buf.len() {
                return None;
            }
            let len = buf[pos + 1] as usize;
            if pos + 2 + len > buf.len() {
                return None;
            }
            message
                .options
                .push((code, buf[pos + 2..pos + 2 + len].to_vec()));
            pos += 2 + len;
        }

        Some(message)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BOOTP_MIN_SIZE];
        buf[0] = self.op;
        buf[1] = 1; // ethernet
        buf[2] = self.hlen;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);

        for (code, data) in &self.options {
            buf.push(*code);
            buf.push(data.len() as u8);
            buf.extend_from_slice(data);
        }
        buf.push(OPT_END);
        buf
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, data)| data.as_slice())
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.option(OPT_MESSAGE_TYPE)
            .and_then(|data| data.first())
            .and_then(|code| DhcpMessageType::from_code(*code))
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option(OPT_REQUESTED_IP)
            .filter(|data| data.len() == 4)
            .map(|data| Ipv4Addr::new(data[0], data[1], data[2], data[3]))
    }
}

#[derive(Debug, Clone)]
pub struct DhcpServerConfig {
    pub interface: String,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub lease_time: Duration,
    pub dns_server: Ipv4Addr,
}

struct Lease {
    address: Ipv4Addr,
    expires: Instant,
}

struct Pool {
    leases: HashMap<[u8; 16], Lease>,
}

impl Pool {
    fn allocate(
        &mut self,
        config: &DhcpServerConfig,
        chaddr: &[u8; 16],
        requested: Option<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        let now = Instant::now();
        self.leases.retain(|_, lease| lease.expires > now);

        if let Some(lease) = self.leases.get(chaddr) {
            return Some(lease.address);
        }

        let start = u32::from(config.pool_start);
        let end = u32::from(config.pool_end);

        if let Some(requested) = requested {
            let addr = u32::from(requested);
            if addr >= start && addr <= end && !self.in_use(requested) {
                return Some(requested);
            }
        }

        (start..=end)
            .map(Ipv4Addr::from)
            .find(|addr| !self.in_use(*addr))
    }

    fn in_use(&self, address: Ipv4Addr) -> bool {
        self.leases.values().any(|lease| lease.address == address)
    }

    fn commit(&mut self, config: &DhcpServerConfig, chaddr: [u8; 16], address: Ipv4Addr) {
        self.leases.insert(
            chaddr,
            Lease {
                address,
                expires: Instant::now() + config.lease_time,
            },
        );
    }

    fn release(&mut self, chaddr: &[u8; 16]) {
        self.leases.remove(chaddr);
    }
}

/// Pure request handling: request in, optional reply out.
fn handle_message(
    config: &DhcpServerConfig,
    pool: &mut Pool,
    request: &DhcpMessage,
) -> Option<DhcpMessage> {
    if request.op != BOOTREQUEST {
        return None;
    }

    let reply_base = |yiaddr: Ipv4Addr, kind: DhcpMessageType| {
        let mut options = vec![
            (OPT_MESSAGE_TYPE, vec![kind.code()]),
            (OPT_SERVER_ID, config.server_ip.octets().to_vec()),
        ];
        if kind != DhcpMessageType::Nak {
            options.push((
                OPT_LEASE_TIME,
                (config.lease_time.as_secs() as u32).to_be_bytes().to_vec(),
            ));
            options.push((OPT_SUBNET_MASK, config.subnet_mask.octets().to_vec()));
            options.push((OPT_ROUTER, config.server_ip.octets().to_vec()));
            options.push((OPT_DNS_SERVER, config.dns_server.octets().to_vec()));
        }

        DhcpMessage {
            op: BOOTREPLY,
            hlen: request.hlen,
            xid: request.xid,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr: config.server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options,
        }
    };

    match request.message_type()? {
        DhcpMessageType::Discover => {
            let address = pool.allocate(config, &request.chaddr, request.requested_ip())?;
            debug!("OFFER {} to {:02x?}", address, &request.chaddr[..6]);
            Some(reply_base(address, DhcpMessageType::Offer))
        }
        DhcpMessageType::Request => {
            let wanted = request
                .requested_ip()
                .or((request.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(request.ciaddr));

            match pool.allocate(config, &request.chaddr, wanted) {
                Some(address) if wanted.map(|w| w == address).unwrap_or(true) => {
                    pool.commit(config, request.chaddr, address);
                    info!("ACK {} to {:02x?}", address, &request.chaddr[..6]);
                    Some(reply_base(address, DhcpMessageType::Ack))
                }
                _ => {
                    debug!("NAK to {:02x?}", &request.chaddr[..6]);
                    Some(reply_base(Ipv4Addr::UNSPECIFIED, DhcpMessageType::Nak))
                }
            }
        }
        DhcpMessageType::Release => {
            pool.release(&request.chaddr);
            None
        }
        DhcpMessageType::Decline
        | DhcpMessageType::Inform
        | DhcpMessageType::Offer
        | DhcpMessageType::Ack
        | DhcpMessageType::Nak => None,
    }
}

pub struct DhcpServer {
    config: DhcpServerConfig,
    pool: Arc<Mutex<Pool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DhcpServer {
    pub fn new(config: DhcpServerConfig) -> Self {
        Self {
            config,
            pool: Arc::new(Mutex::new(Pool {
                leases: HashMap::new(),
            })),
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> ConnResult<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(ConnError::AlreadyExists("DHCP server running".into()));
        }

        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", DHCP_SERVER_PORT))?;
        std_socket.set_nonblocking(true)?;
        bind_to_interface(&std_socket, &self.config.interface)?;
        let socket = UdpSocket::from_std(std_socket)?;
        socket.set_broadcast(true)?;

        info!(
            "DHCP server on {} ({}-{})",
            self.config.interface, self.config.pool_start, self.config.pool_end
        );

        let config = self.config.clone();
        let pool = self.pool.clone();
        *task = Some(tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (len, _peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("DHCP receive failed: {}", e);
                        continue;
                    }
                };

                let Some(request) = DhcpMessage::parse(&buf[..len]) else {
                    continue;
                };

                let reply = {
                    let mut pool = pool.lock().await;
                    handle_message(&config, &mut pool, &request)
                };

                if let Some(reply) = reply {
                    let data = reply.serialize();
                    if let Err(e) = socket
                        .send_to(&data, (Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT))
                        .await
                    {
                        warn!("DHCP reply failed: {}", e);
                    }
                }
            }
        }));

        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.pool.lock().await.leases.clear();
        info!("DHCP server on {} stopped", self.config.interface);
    }
}

fn bind_to_interface(socket: &std::net::UdpSocket, interface: &str) -> ConnResult<()> {
    let mut name = [0u8; libc::IF_NAMESIZE];
    let bytes = interface.as_bytes();
    if bytes.len() >= libc::IF_NAMESIZE {
        return Err(ConnError::InvalidArgument(format!(
            "interface {}",
            interface
        )));
    }
    name[..bytes.len()].copy_from_slice(bytes);

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            libc::IF_NAMESIZE as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ConnError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DhcpServerConfig {
        DhcpServerConfig {
            interface: "tether".to_string(),
            server_ip: "192.168.218.1".parse().unwrap(),
            subnet_mask: "255.255.255.0".parse().unwrap(),
            pool_start: "192.168.218.100".parse().unwrap(),
            pool_end: "192.168.218.200".parse().unwrap(),
            lease_time: Duration::from_secs(24 * 3600),
            dns_server: "192.168.218.1".parse().unwrap(),
        }
    }

    fn discover(mac: u8) -> DhcpMessage {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, mac]);
        DhcpMessage {
            op: BOOTREQUEST,
            hlen: 6,
            xid: 0x1234_0000 | mac as u32,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![(OPT_MESSAGE_TYPE, vec![DhcpMessageType::Discover.code()])],
        }
    }

    fn request(mac: u8, address: Ipv4Addr) -> DhcpMessage {
        let mut message = discover(mac);
        message.options = vec![
            (OPT_MESSAGE_TYPE, vec![DhcpMessageType::Request.code()]),
            (OPT_REQUESTED_IP, address.octets().to_vec()),
        ];
        message
    }

    #[test]
    fn test_codec_roundtrip() {
        let message = discover(1);
        let parsed = DhcpMessage::parse(&message.serialize()).unwrap();
        assert_eq!(parsed.xid, message.xid);
        assert_eq!(parsed.chaddr, message.chaddr);
        assert_eq!(parsed.message_type(), Some(DhcpMessageType::Discover));
    }

    #[test]
    fn test_parse_rejects_short_or_bad_magic() {
        assert!(DhcpMessage::parse(&[0u8; 100]).is_none());
        let mut buf = discover(1).serialize();
        buf[236] = 0;
        assert!(DhcpMessage::parse(&buf).is_none());
    }

    #[test]
    fn test_discover_offer_request_ack() {
        let config = config();
        let mut pool = Pool {
            leases: HashMap::new(),
        };

        let offer = handle_message(&config, &mut pool, &discover(1)).unwrap();
        assert_eq!(offer.message_type(), Some(DhcpMessageType::Offer));
        assert_eq!(offer.yiaddr, "192.168.218.100".parse::<Ipv4Addr>().unwrap());
        assert_eq!(offer.siaddr, config.server_ip);

        let ack = handle_message(&config, &mut pool, &request(1, offer.yiaddr)).unwrap();
        assert_eq!(ack.message_type(), Some(DhcpMessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
        assert_eq!(
            ack.option(OPT_ROUTER).unwrap(),
            config.server_ip.octets().as_slice()
        );
        assert_eq!(
            ack.option(OPT_LEASE_TIME).unwrap(),
            (24u32 * 3600).to_be_bytes().as_slice()
        );
    }

    #[test]
    fn test_second_client_gets_next_address() {
        let config = config();
        let mut pool = Pool {
            leases: HashMap::new(),
        };

        let first = handle_message(&config, &mut pool, &discover(1)).unwrap();
        handle_message(&config, &mut pool, &request(1, first.yiaddr)).unwrap();

        let second = handle_message(&config, &mut pool, &discover(2)).unwrap();
        assert_eq!(
            second.yiaddr,
            "192.168.218.101".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_request_outside_pool_naks() {
        let config = config();
        let mut pool = Pool {
            leases: HashMap::new(),
        };

        let reply =
            handle_message(&config, &mut pool, &request(1, "10.1.2.3".parse().unwrap())).unwrap();
        assert_eq!(reply.message_type(), Some(DhcpMessageType::Nak));
    }

    #[test]
    fn test_release_frees_lease() {
        let config = config();
        let mut pool = Pool {
            leases: HashMap::new(),
        };

        let offer = handle_message(&config, &mut pool, &discover(1)).unwrap();
        handle_message(&config, &mut pool, &request(1, offer.yiaddr)).unwrap();

        let mut release = discover(1);
        release.options = vec![(OPT_MESSAGE_TYPE, vec![DhcpMessageType::Release.code()])];
        assert!(handle_message(&config, &mut pool, &release).is_none());

        // Address is available to the next client again.
        let next = handle_message(&config, &mut pool, &discover(2)).unwrap();
        assert_eq!(next.yiaddr, offer.yiaddr);
    }
}
