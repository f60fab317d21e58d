//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A message is the 236-byte BOOTP header, the magic cookie `99.130.83.99`
//! and an option area. Offsets into the header:
//!
//! ```text
//!   0  op  htype  hlen  hops       28  chaddr (16)
//!   4  xid (4)                     44  sname (64)
//!   8  secs (2)  flags (2)        108  file (128)
//!  12  ciaddr  16 yiaddr          236  magic cookie (4)
//!  20  siaddr  24 giaddr          240  options
//! ```
//!
//! With option 52 present, `file` and/or `sname` carry further options and
//! are read after the main area.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

/// Header plus magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = 240;

/// Replies are padded to the BOOTP minimum so old relay agents accept them.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Maximum hop count before dropping the packet (RFC 1542 §4.1.1).
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Sequential reader over the fixed header.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn addr(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.take::<4>())
    }
}

/// A parsed DHCP packet.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Set by a client that already holds an address.
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; unspecified for clients on the local segment.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_LEN],
    pub sname: [u8; SNAME_LEN],
    pub file: [u8; FILE_LEN],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parses a datagram.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] for frames shorter than 240 bytes, a wrong
    /// magic cookie, more than 16 hops, an Ethernet `hlen` other than 6, or
    /// an option whose length runs past the end of its area.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut packet = Self {
            op: cursor.u8(),
            htype: cursor.u8(),
            hlen: cursor.u8(),
            hops: cursor.u8(),
            xid: cursor.u32(),
            secs: cursor.u16(),
            flags: cursor.u16(),
            ciaddr: cursor.addr(),
            yiaddr: cursor.addr(),
            siaddr: cursor.addr(),
            giaddr: cursor.addr(),
            chaddr: cursor.take(),
            sname: cursor.take(),
            file: cursor.take(),
            options: Vec::new(),
        };

        if cursor.take::<4>() != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }
        if packet.hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                packet.hops, MAX_HOPS
            )));
        }
        if packet.htype == HTYPE_ETHERNET && packet.hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Ethernet hardware length must be {}, got {}",
                HLEN_ETHERNET, packet.hlen
            )));
        }

        read_options(&data[DHCP_FIXED_HEADER_SIZE..], &mut packet.options)?;

        let overload = packet.options.iter().find_map(|opt| match opt {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                read_options(&packet.file, &mut packet.options)?;
            }
            if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                read_options(&packet.sname, &mut packet.options)?;
            }
        }

        Ok(packet)
    }

    /// Encodes the packet for transmission, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(576);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            out.extend(option.encode());
        }
        out.push(OptionCode::End as u8);

        if out.len() < DHCP_MIN_PACKET_SIZE {
            out.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        out
    }

    fn find<'a, T>(&'a self, select: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(select)
    }

    /// Option 53; `None` for plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find(|opt| match opt {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    /// Option 50, if present and well formed.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find(|opt| match opt {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Whether option 50 is present at all, even with a malformed payload.
    pub fn has_requested_ip_option(&self) -> bool {
        self.options
            .iter()
            .any(|opt| opt.code() == OptionCode::RequestedIpAddress as u8)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find(|opt| match opt {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 82, echoed in replies.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.find(|opt| match opt {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.find(|opt| match opt {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Option 55 in the client's order.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find(|opt| match opt {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// Option 51, in seconds.
    pub fn requested_lease_time(&self) -> Option<u32> {
        self.find(|opt| match opt {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// The first `hlen` bytes of `chaddr`.
    pub fn mac(&self) -> MacAddress {
        let len = usize::from(self.hlen).min(CHADDR_LEN);
        MacAddress::from_hardware(&self.chaddr[..len])
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn is_relayed(&self) -> bool {
        !self.giaddr.is_unspecified()
    }

    /// Builds a reply to `request` carrying `message_type` followed by `options`.
    ///
    /// The transaction, flags, relay address and hardware fields are copied
    /// from the request.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut reply_options = Vec::with_capacity(options.len() + 1);
        reply_options.push(DhcpOption::MessageType(message_type));
        reply_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            // A renewing client keeps its address in ciaddr on the ACK.
            ciaddr: if message_type == MessageType::Ack {
                request.ciaddr
            } else {
                Ipv4Addr::UNSPECIFIED
            },
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0; SNAME_LEN],
            file: [0; FILE_LEN],
            options: reply_options,
        }
    }
}

/// Appends the TLVs in `area` to `options`, stopping at the end marker.
fn read_options(area: &[u8], options: &mut Vec<DhcpOption>) -> Result<()> {
    let mut rest = area;
    loop {
        match rest {
            [] => return Ok(()),
            [code, tail @ ..] if *code == OptionCode::Pad as u8 => rest = tail,
            [code, ..] if *code == OptionCode::End as u8 => return Ok(()),
            [_] => {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            }
            [code, len, tail @ ..] => {
                let len = usize::from(*len);
                let Some((body, tail)) = tail.split_at_checked(len) else {
                    return Err(Error::InvalidPacket(format!(
                        "Option {} claims {} bytes, {} remain",
                        code,
                        len,
                        tail.len()
                    )));
                };
                options.push(DhcpOption::parse(*code, body));
                rest = tail;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds raw client frames for parser tests.
    struct Frame {
        bytes: Vec<u8>,
        options: Vec<u8>,
    }

    impl Frame {
        fn request() -> Self {
            let mut bytes = vec![0u8; DHCP_FIXED_HEADER_SIZE];
            bytes[0] = BOOTREQUEST;
            bytes[1] = HTYPE_ETHERNET;
            bytes[2] = HLEN_ETHERNET;
            bytes[28..34].copy_from_slice(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x07]);
            bytes[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
            Self {
                bytes,
                options: Vec::new(),
            }
        }

        fn kind(self, kind: MessageType) -> Self {
            self.option(OptionCode::MessageType as u8, &[kind as u8])
        }

        fn option(mut self, code: u8, data: &[u8]) -> Self {
            self.options.push(code);
            self.options.push(data.len() as u8);
            self.options.extend_from_slice(data);
            self
        }

        fn raw_options(mut self, data: &[u8]) -> Self {
            self.options.extend_from_slice(data);
            self
        }

        fn set(mut self, offset: usize, data: &[u8]) -> Self {
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
            self
        }

        fn build(self) -> Vec<u8> {
            let mut bytes = self.bytes;
            bytes.extend(self.options);
            bytes
        }

        fn parse(self) -> DhcpPacket {
            DhcpPacket::parse(&self.build()).unwrap()
        }
    }

    #[test]
    fn test_header_fields() {
        let packet = Frame::request()
            .set(3, &[5])
            .set(4, &0xDEAD_BEEFu32.to_be_bytes())
            .set(8, &1234u16.to_be_bytes())
            .set(10, &BROADCAST_FLAG.to_be_bytes())
            .set(12, &[10, 0, 0, 1])
            .set(16, &[10, 0, 0, 2])
            .set(20, &[10, 0, 0, 3])
            .set(24, &[10, 0, 0, 4])
            .set(44, b"bootsrv")
            .kind(MessageType::Discover)
            .parse();

        assert_eq!(packet.op, BOOTREQUEST);
        assert_eq!(packet.hops, 5);
        assert_eq!(packet.xid, 0xDEAD_BEEF);
        assert_eq!(packet.secs, 1234);
        assert!(packet.is_broadcast());
        assert_eq!(packet.ciaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(packet.yiaddr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(packet.siaddr, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(packet.giaddr, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(&packet.sname[..7], b"bootsrv");
        assert_eq!(packet.mac().to_string(), "02:42:ac:11:00:07");
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_typed_accessors() {
        let packet = Frame::request()
            .kind(MessageType::Request)
            .option(50, &[192, 168, 1, 100])
            .option(54, &[192, 168, 1, 1])
            .option(12, b"printer-3")
            .option(51, &7200u32.to_be_bytes())
            .option(55, &[1, 3, 6])
            .option(82, &[1, 2, 3, 4, 5])
            .parse();

        assert_eq!(packet.requested_ip(), Some(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(packet.has_requested_ip_option());
        assert_eq!(packet.server_identifier(), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(packet.hostname(), Some("printer-3"));
        assert_eq!(packet.requested_lease_time(), Some(7200));
        assert_eq!(packet.parameter_request_list(), Some(&[1u8, 3, 6][..]));
        assert_eq!(packet.relay_agent_info(), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
        assert!(DhcpPacket::parse(&[0u8; 239]).is_err());

        let bad_cookie = Frame::request().set(236, &[0, 0, 0, 0]).build();
        assert!(DhcpPacket::parse(&bad_cookie).is_err());

        let bad_hlen = Frame::request().set(2, &[7]).build();
        assert!(DhcpPacket::parse(&bad_hlen).is_err());

        let too_many_hops = Frame::request().set(3, &[17]).build();
        assert!(DhcpPacket::parse(&too_many_hops).is_err());
        let max_hops = Frame::request().set(3, &[16]).build();
        assert!(DhcpPacket::parse(&max_hops).is_ok());
    }

    #[test]
    fn test_truncated_options_rejected() {
        let missing_length = Frame::request().raw_options(&[51]).build();
        assert!(DhcpPacket::parse(&missing_length).is_err());

        let short_body = Frame::request().raw_options(&[51, 4, 0, 0]).build();
        assert!(DhcpPacket::parse(&short_body).is_err());
    }

    #[test]
    fn test_option_area_edge_cases() {
        let bare = Frame::request().parse();
        assert!(bare.options.is_empty());
        assert_eq!(bare.message_type(), None);

        let padded = Frame::request()
            .raw_options(&[0, 0, 0, 0])
            .kind(MessageType::Discover)
            .raw_options(&[255, 51, 4])
            .parse();
        assert_eq!(padded.message_type(), Some(MessageType::Discover));
        assert_eq!(padded.options.len(), 1);

        let empty_list = Frame::request().option(55, &[]).parse();
        assert_eq!(empty_list.parameter_request_list(), Some(&[][..]));

        let twice = Frame::request()
            .kind(MessageType::Discover)
            .kind(MessageType::Request)
            .parse();
        assert_eq!(twice.message_type(), Some(MessageType::Discover));
        assert_eq!(twice.options.len(), 2);
    }

    #[test]
    fn test_unknown_and_malformed_options_kept_raw() {
        let packet = Frame::request()
            .kind(MessageType::Request)
            .option(200, &[0xDE, 0xAD, 0xBE, 0xEF])
            .option(50, &[10, 0, 0])
            .parse();

        assert!(packet.options.contains(&DhcpOption::Raw(200, vec![0xDE, 0xAD, 0xBE, 0xEF])));
        assert!(packet.options.contains(&DhcpOption::Raw(50, vec![10, 0, 0])));
        assert_eq!(packet.requested_ip(), None);
        assert!(packet.has_requested_ip_option());
    }

    #[test]
    fn test_option_overload() {
        let mut file = [0u8; FILE_LEN];
        file[..10].copy_from_slice(&[12, 8, b'f', b'i', b'l', b'e', b'h', b'o', b's', b't']);
        file[10] = 255;
        let mut sname = [0u8; 16];
        sname[..7].copy_from_slice(&[15, 5, b'l', b'o', b'c', b'a', b'l']);
        sname[7] = 255;

        let in_file = Frame::request().set(108, &file).option(52, &[1]).parse();
        assert_eq!(in_file.hostname(), Some("filehost"));

        let in_sname = Frame::request().set(44, &sname).option(52, &[2]).parse();
        assert!(in_sname.options.contains(&DhcpOption::Raw(15, b"local".to_vec())));
        assert_eq!(in_sname.hostname(), None);

        let both = Frame::request()
            .set(44, &sname)
            .set(108, &file)
            .option(52, &[3])
            .parse();
        assert_eq!(both.hostname(), Some("filehost"));
        assert!(both.options.contains(&DhcpOption::Raw(15, b"local".to_vec())));
    }

    #[test]
    fn test_mac_respects_hlen() {
        let packet = Frame::request().set(1, &[6, 4]).parse();
        assert_eq!(packet.mac().to_string(), "02:42:ac:11:00:00");
    }

    #[test]
    fn test_is_relayed() {
        assert!(!Frame::request().parse().is_relayed());
        assert!(Frame::request().set(24, &[10, 1, 0, 1]).parse().is_relayed());
    }

    #[test]
    fn test_create_reply_copies_request_fields() {
        let request = Frame::request()
            .set(4, &0x0102_0304u32.to_be_bytes())
            .set(10, &BROADCAST_FLAG.to_be_bytes())
            .set(24, &[192, 168, 2, 1])
            .kind(MessageType::Discover)
            .parse();

        let offer = DhcpPacket::create_reply(
            &request,
            MessageType::Offer,
            Ipv4Addr::new(192, 168, 2, 100),
            Ipv4Addr::new(192, 168, 1, 1),
            vec![DhcpOption::LeaseTime(86400)],
        );

        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, request.xid);
        assert_eq!(offer.flags, BROADCAST_FLAG);
        assert_eq!(offer.giaddr, Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(offer.chaddr, request.chaddr);
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 2, 100));
        assert_eq!(offer.siaddr, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(offer.options[0], DhcpOption::MessageType(MessageType::Offer));
        assert_eq!(offer.options[1], DhcpOption::LeaseTime(86400));
    }

    #[test]
    fn test_ack_keeps_client_address() {
        let renew = Frame::request()
            .set(12, &[192, 168, 2, 100])
            .kind(MessageType::Request)
            .parse();
        let server = Ipv4Addr::new(192, 168, 1, 1);

        let ack = DhcpPacket::create_reply(&renew, MessageType::Ack, renew.ciaddr, server, vec![]);
        assert_eq!(ack.ciaddr, Ipv4Addr::new(192, 168, 2, 100));

        let nak = DhcpPacket::create_reply(
            &renew,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server,
            vec![],
        );
        assert_eq!(nak.ciaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_encode_layout() {
        let request = Frame::request()
            .set(24, &[192, 168, 2, 1])
            .kind(MessageType::Request)
            .parse();
        let ack = DhcpPacket::create_reply(
            &request,
            MessageType::Ack,
            Ipv4Addr::new(192, 168, 2, 20),
            Ipv4Addr::new(192, 168, 1, 1),
            Vec::new(),
        );

        let encoded = ack.encode();
        assert_eq!(encoded.len(), DHCP_MIN_PACKET_SIZE);
        assert_eq!(encoded[0], BOOTREPLY);
        assert_eq!(&encoded[16..20], &[192, 168, 2, 20]);
        assert_eq!(&encoded[20..24], &[192, 168, 1, 1]);
        assert_eq!(&encoded[24..28], &[192, 168, 2, 1]);
        assert_eq!(&encoded[28..34], &[0x02, 0x42, 0xac, 0x11, 0x00, 0x07]);
        assert_eq!(&encoded[236..240], &DHCP_MAGIC_COOKIE);
        assert_eq!(&encoded[240..244], &[53, 1, MessageType::Ack as u8, 255]);

        let reparsed = DhcpPacket::parse(&encoded).unwrap();
        assert_eq!(reparsed.message_type(), Some(MessageType::Ack));
        assert_eq!(reparsed.mac(), request.mac());
    }
}
