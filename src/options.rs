//! DHCP options on the wire (RFC 2132).
//!
//! Every option is a code byte, a length byte and up to 255 bytes of data.
//! Only the options the server reads from clients are decoded into typed
//! variants; everything else, including the configured options sent back in
//! replies, travels as [`DhcpOption::Raw`].
//!
//! A known option whose payload has the wrong size is kept raw instead of
//! failing the whole packet, so callers see it as absent.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)
//! - RFC 3396: Encoding Long Options

use std::net::Ipv4Addr;

/// Largest payload a single option can carry.
const MAX_OPTION_DATA: usize = 255;

/// Option codes the server interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    /// Client hostname (RFC 2132 §3.14).
    Hostname = 12,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// Option overload (RFC 2132 §9.3).
    OptionOverload = 52,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            12 => Ok(Self::Hostname),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            82 => Ok(Self::RelayAgentInfo),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// Option overload flags (Option 52).
///
/// Says that the `sname` and/or `file` header fields hold options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A single DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    /// Echoed verbatim in replies to relayed requests.
    RelayAgentInfo(Vec<u8>),
    /// Any other option, or a known one with a malformed payload.
    Raw(u8, Vec<u8>),
}

fn ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::Raw(code, _) => *code,
        }
    }

    /// Decodes an option from its code and payload.
    pub fn parse(code: u8, data: &[u8]) -> Self {
        let typed = match OptionCode::try_from(code) {
            Ok(OptionCode::Hostname) if !data.is_empty() => {
                Some(Self::Hostname(String::from_utf8_lossy(data).into_owned()))
            }
            Ok(OptionCode::RequestedIpAddress) => ipv4(data).map(Self::RequestedIpAddress),
            Ok(OptionCode::ServerIdentifier) => ipv4(data).map(Self::ServerIdentifier),
            Ok(OptionCode::LeaseTime) => data
                .try_into()
                .ok()
                .map(|bytes: [u8; 4]| Self::LeaseTime(u32::from_be_bytes(bytes))),
            Ok(OptionCode::OptionOverload) => match data {
                [flag] => OverloadFlag::try_from(*flag).ok().map(Self::OptionOverload),
                _ => None,
            },
            Ok(OptionCode::MessageType) => match data {
                [kind] => MessageType::try_from(*kind).ok().map(Self::MessageType),
                _ => None,
            },
            Ok(OptionCode::ParameterRequestList) => {
                Some(Self::ParameterRequestList(data.to_vec()))
            }
            Ok(OptionCode::RelayAgentInfo) => Some(Self::RelayAgentInfo(data.to_vec())),
            _ => None,
        };
        typed.unwrap_or_else(|| Self::Raw(code, data.to_vec()))
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Hostname(name) => name.as_bytes().to_vec(),
            Self::RequestedIpAddress(ip) | Self::ServerIdentifier(ip) => ip.octets().to_vec(),
            Self::LeaseTime(seconds) => seconds.to_be_bytes().to_vec(),
            Self::OptionOverload(flag) => vec![*flag as u8],
            Self::MessageType(kind) => vec![*kind as u8],
            Self::ParameterRequestList(data) | Self::RelayAgentInfo(data) | Self::Raw(_, data) => {
                data.clone()
            }
        }
    }

    /// Encodes the option as one or more TLVs.
    ///
    /// Payloads longer than 255 bytes are split across consecutive
    /// instances of the same code (RFC 3396).
    pub fn encode(&self) -> Vec<u8> {
        let code = self.code();
        let payload = self.payload();
        let mut encoded = Vec::with_capacity(payload.len() + 2);

        if payload.is_empty() {
            encoded.extend_from_slice(&[code, 0]);
            return encoded;
        }
        for chunk in payload.chunks(MAX_OPTION_DATA) {
            encoded.push(code);
            encoded.push(chunk.len() as u8);
            encoded.extend_from_slice(chunk);
        }
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(1), Ok(MessageType::Discover));
        assert_eq!(MessageType::try_from(8), Ok(MessageType::Inform));
        assert_eq!(MessageType::try_from(9), Err(9));
        assert_eq!(MessageType::Nak.to_string(), "NAK");
    }

    #[test]
    fn test_typed_parsing() {
        assert_eq!(
            DhcpOption::parse(50, &[10, 0, 0, 7]),
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 7))
        );
        assert_eq!(
            DhcpOption::parse(51, &[0, 0, 0x0E, 0x10]),
            DhcpOption::LeaseTime(3600)
        );
        assert_eq!(
            DhcpOption::parse(53, &[3]),
            DhcpOption::MessageType(MessageType::Request)
        );
        assert_eq!(
            DhcpOption::parse(12, b"laptop"),
            DhcpOption::Hostname("laptop".to_string())
        );
    }

    #[test]
    fn test_malformed_known_option_kept_raw() {
        assert_eq!(
            DhcpOption::parse(50, &[10, 0, 0]),
            DhcpOption::Raw(50, vec![10, 0, 0])
        );
        assert_eq!(DhcpOption::parse(53, &[42]), DhcpOption::Raw(53, vec![42]));
        assert_eq!(DhcpOption::parse(52, &[1, 2]), DhcpOption::Raw(52, vec![1, 2]));
        assert_eq!(DhcpOption::parse(12, &[]), DhcpOption::Raw(12, vec![]));
    }

    #[test]
    fn test_unknown_option_kept_raw() {
        let option = DhcpOption::parse(200, &[0xDE, 0xAD]);
        assert_eq!(option, DhcpOption::Raw(200, vec![0xDE, 0xAD]));
        assert_eq!(option.encode(), vec![200, 2, 0xDE, 0xAD]);
    }

    #[test]
    fn test_encode_typed() {
        assert_eq!(
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)).encode(),
            vec![54, 4, 10, 0, 0, 1]
        );
        assert_eq!(DhcpOption::LeaseTime(60).encode(), vec![51, 4, 0, 0, 0, 60]);
        assert_eq!(
            DhcpOption::MessageType(MessageType::Ack).encode(),
            vec![53, 1, 5]
        );
    }

    #[test]
    fn test_long_option_is_split() {
        let option = DhcpOption::Raw(6, vec![1; 300]);
        let encoded = option.encode();

        assert_eq!(encoded.len(), 300 + 4);
        assert_eq!(&encoded[..2], &[6, 255]);
        assert_eq!(&encoded[257..259], &[6, 45]);
    }

    #[test]
    fn test_empty_option_encodes_zero_length() {
        assert_eq!(DhcpOption::Raw(80, vec![]).encode(), vec![80, 0]);
    }
}
