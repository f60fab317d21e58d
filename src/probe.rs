//! Liveness probing of candidate addresses.
//!
//! Before a never-used address is offered, the allocator asks whether some
//! host outside our control is already answering on it. [`IcmpProbe`] sends
//! one ICMP echo request and waits for the reply up to a timeout.
//!
//! Probing fails open: if the socket cannot be created or anything else goes
//! wrong the address is reported as not in use, so a host without raw socket
//! privileges still hands out addresses.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Whether `ip` currently answers on the wire.
    async fn is_in_use(&self, ip: Ipv4Addr) -> bool;
}

/// Never reports an address as in use.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProbe;

#[async_trait]
impl LivenessProbe for DisabledProbe {
    async fn is_in_use(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

/// Probe double answering for a fixed, adjustable set of addresses.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct StaticProbe {
    in_use: std::sync::Mutex<std::collections::HashSet<Ipv4Addr>>,
}

#[cfg(test)]
impl StaticProbe {
    pub(crate) fn new(in_use: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            in_use: std::sync::Mutex::new(in_use.into_iter().collect()),
        }
    }

    pub(crate) fn set_in_use(&self, ip: Ipv4Addr, in_use: bool) {
        let mut set = self.in_use.lock().unwrap();
        if in_use {
            set.insert(ip);
        } else {
            set.remove(&ip);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn is_in_use(&self, ip: Ipv4Addr) -> bool {
        self.in_use.lock().unwrap().contains(&ip)
    }
}

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

/// Native ICMP echo probe.
#[derive(Debug)]
pub struct IcmpProbe {
    timeout: Duration,
    ident: u16,
    sequence: AtomicU16,
}

impl IcmpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.max(Duration::from_millis(10)),
            ident: (std::process::id() & 0xFFFF) as u16,
            sequence: AtomicU16::new(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LivenessProbe for IcmpProbe {
    async fn is_in_use(&self, ip: Ipv4Addr) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ident = self.ident;
        let timeout = self.timeout;

        let outcome =
            tokio::task::spawn_blocking(move || echo(ip, ident, sequence, timeout)).await;

        match outcome {
            Ok(Ok(answered)) => {
                trace!(%ip, answered, "Liveness probe finished");
                answered
            }
            Ok(Err(e)) => {
                debug!(%ip, error = %e, "Liveness probe failed, treating address as free");
                false
            }
            Err(e) => {
                debug!(%ip, error = %e, "Liveness probe task failed, treating address as free");
                false
            }
        }
    }
}

/// Opens a raw ICMP socket, falling back to an unprivileged datagram one.
///
/// Returns the socket and whether received packets carry an IP header.
fn open_socket() -> io::Result<(Socket, bool)> {
    match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(socket) => Ok((socket, true)),
        Err(raw_err) => {
            trace!(error = %raw_err, "Raw ICMP socket unavailable, trying datagram socket");
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
            Ok((socket, false))
        }
    }
}

fn echo(ip: Ipv4Addr, ident: u16, sequence: u16, timeout: Duration) -> io::Result<bool> {
    let (socket, raw) = open_socket()?;
    socket.connect(&SockAddr::from(SocketAddr::new(ip.into(), 0)))?;
    socket.set_write_timeout(Some(timeout))?;
    socket.send(&build_echo_request(ident, sequence))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    let mut reader = &socket;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket.set_read_timeout(Some(remaining))?;

        match reader.read(&mut buf) {
            Ok(n) => {
                if is_echo_reply(&buf[..n], raw, ident, sequence) {
                    return Ok(true);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Matches an echo reply to our request.
///
/// Datagram ICMP sockets rewrite the identifier, so only the sequence number
/// is compared there.
fn is_echo_reply(packet: &[u8], raw: bool, ident: u16, sequence: u16) -> bool {
    let icmp = if raw {
        let Some(first) = packet.first() else {
            return false;
        };
        let header_len = usize::from(first & 0x0F) * 4;
        match packet.get(header_len..) {
            Some(rest) => rest,
            None => return false,
        }
    } else {
        packet
    };

    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY || icmp[1] != 0 {
        return false;
    }
    let reply_ident = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_sequence = u16::from_be_bytes([icmp[6], icmp[7]]);
    reply_sequence == sequence && (!raw || reply_ident == ident)
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let Some(&b) = chunks.remainder().first() {
        sum = sum.wrapping_add(u32::from(b) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_echo_request(ident: u16, sequence: u16) -> [u8; 8] {
    let mut packet = [0u8; 8];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}
