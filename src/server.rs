use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::options::MessageType;
use crate::packet::{BOOTREQUEST, DhcpPacket};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

/// UDP transport in front of a [`Handler`].
pub struct DhcpServer {
    handler: Arc<Handler>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    /// Binds `0.0.0.0:67` and prepares to serve `handler`.
    pub fn new(handler: Arc<Handler>, settings: &ServerConfig) -> Result<Self> {
        let socket = Self::create_socket(settings.interface_index)?;

        info!(
            "DHCP server listening on 0.0.0.0:{} as {}",
            DHCP_SERVER_PORT,
            handler.config().server_identifier()
        );
        for network in &handler.config().networks {
            let pools = network.subnets.iter().map(|s| s.pools.len()).sum::<usize>();
            info!(network = %network.name, subnets = network.subnets.len(), pools, "Serving network");
        }

        Ok(Self::from_socket(handler, socket))
    }

    /// Serves `handler` on an already bound socket.
    pub fn from_socket(handler: Arc<Handler>, socket: UdpSocket) -> Self {
        Self {
            handler,
            socket: Arc::new(socket),
        }
    }

    fn create_socket(interface_index: Option<u32>) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        if let Some(interface_index) = interface_index {
            #[cfg(windows)]
            {
                use std::os::windows::io::AsRawSocket;

                if let Err(error) = set_interface_index(socket.as_raw_socket(), interface_index) {
                    warn!(
                        "Failed to set interface index {}: {}",
                        interface_index, error
                    );
                }
            }
            #[cfg(not(windows))]
            {
                warn!(
                    "interface_index ({}) is only supported on Windows and will be ignored",
                    interface_index
                );
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// Receives datagrams forever, one task per datagram.
    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = Arc::clone(&self.handler);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        let Some((reply, request)) = process(&handler, &data, source).await else {
                            return;
                        };
                        if let Err(error) = send_reply(&socket, &reply, &request).await {
                            warn!(xid = reply.xid, error = %error, "Failed to send reply");
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

/// Parses one datagram and runs it through `handler`.
///
/// Returns the reply with the request it answers, or `None` when the
/// datagram is dropped.
async fn process(
    handler: &Arc<Handler>,
    data: &[u8],
    source: SocketAddr,
) -> Option<(DhcpPacket, DhcpPacket)> {
    let packet = match DhcpPacket::parse(data) {
        Ok(packet) => packet,
        Err(error) => {
            debug!(%source, error = %error, "Dropping malformed packet");
            return None;
        }
    };

    if packet.op != BOOTREQUEST {
        debug!(%source, op = packet.op, "Dropping non-request packet");
        return None;
    }
    if packet.message_type().is_none() {
        debug!(%source, mac = %packet.mac(), "Ignoring BOOTP packet");
        return None;
    }

    let reply = handler.serve(packet.clone()).await?;
    Some((reply, packet))
}

/// Where a reply to `request` goes (RFC 2131 §4.1).
fn reply_destination(reply: &DhcpPacket, request: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if request.is_relayed() {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

async fn send_reply(socket: &UdpSocket, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()> {
    let destination = reply_destination(reply, request);
    socket.send_to(&reply.encode(), destination).await?;
    debug!(
        kind = ?reply.message_type(),
        ip = %reply.yiaddr,
        %destination,
        "Sent reply"
    );
    Ok(())
}

#[cfg(windows)]
fn set_interface_index(raw_socket: std::os::windows::io::RawSocket, index: u32) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_UNICAST_IF: i32 = 31;

    let index_bytes = index.to_be_bytes();
    let result = unsafe {
        setsockopt(
            raw_socket as SOCKET,
            IPPROTO_IP,
            IP_UNICAST_IF,
            index_bytes.as_ptr(),
            std::mem::size_of::<u32>() as i32,
        )
    };

    if result != 0 {
        return Err(Error::Socket(format!(
            "setsockopt IP_UNICAST_IF failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
