//! Option names accepted by the configuration language.
//!
//! Every `option <name> <values...>` line is looked up here (after any
//! vendor sub-options declared with `decloption`) to find the DHCP option
//! code and the shape its values must take. Values are encoded to the exact
//! bytes that go on the wire, so a reply only has to copy them.
//!
//! Names of the form `option-NNN` address an arbitrary code with untyped
//! values.

use std::net::Ipv4Addr;

use crate::lexer::{Token, TokenKind};

/// DHCP option code of the vendor-specific information option.
pub const VENDOR_OPTIONS_CODE: u8 = 43;

/// Largest payload a single DHCP option can carry.
pub const MAX_OPTION_LEN: usize = 255;

/// Shape of the values an option accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// One `true`/`false`, encoded as a single byte.
    Boolean,
    /// Exactly one address.
    Address,
    /// One or more addresses.
    AddressList,
    /// Address pairs (destination/router or address/mask).
    AddressPairs,
    /// One string, sent as raw bytes.
    Text,
    /// One integer of the given byte width.
    Integer { width: u8, signed: bool },
    /// One or more unsigned integers of the given byte width.
    IntegerList { width: u8 },
    /// Any mix of values; numbers are encoded as 32-bit integers.
    Any,
}

impl ValueKind {
    /// Type names accepted by `decloption ... type <name>`.
    pub fn from_declared(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Boolean,
            "address" => Self::Address,
            "address-list" => Self::AddressList,
            "string" => Self::Text,
            "int8" => Self::Integer {
                width: 1,
                signed: false,
            },
            "int16" => Self::Integer {
                width: 2,
                signed: false,
            },
            "int32" => Self::Integer {
                width: 4,
                signed: false,
            },
            _ => return None,
        })
    }

    /// Encodes parsed tokens into option bytes.
    ///
    /// The error string describes what was wrong and is wrapped with the line
    /// number by the parser.
    pub fn encode(self, values: &[Token]) -> Result<Vec<u8>, String> {
        if values.is_empty() {
            return Err("option needs at least one value".to_string());
        }

        let single = matches!(
            self,
            Self::Boolean | Self::Address | Self::Text | Self::Integer { .. }
        );
        if single && values.len() != 1 {
            return Err(format!("option takes one value, found {}", values.len()));
        }

        let mut bytes = Vec::new();
        for token in values {
            match (self, &token.kind) {
                (Self::Boolean | Self::Any, TokenKind::Boolean(value)) => {
                    bytes.push(u8::from(*value));
                }
                (
                    Self::Address | Self::AddressList | Self::AddressPairs | Self::Any,
                    TokenKind::IpAddress(ip),
                ) => {
                    bytes.extend_from_slice(&ip.octets());
                }
                (Self::Text | Self::Any, TokenKind::String(text)) => {
                    bytes.extend_from_slice(text.as_bytes());
                }
                (Self::Integer { width, signed }, TokenKind::Number(value)) => {
                    bytes.extend(encode_integer(*value, width, signed)?);
                }
                (Self::IntegerList { width }, TokenKind::Number(value)) => {
                    bytes.extend(encode_integer(*value, width, false)?);
                }
                (Self::Any, TokenKind::Number(value)) => {
                    bytes.extend(encode_integer(*value, 4, *value < 0)?);
                }
                (_, other) => {
                    return Err(format!("unexpected {} for {} option", other, self.describe()));
                }
            }
        }

        if self == Self::AddressPairs && !bytes.len().is_multiple_of(8) {
            return Err("addresses must be given in pairs".to_string());
        }

        if bytes.len() > MAX_OPTION_LEN {
            return Err(format!(
                "encoded option is {} bytes, the limit is {}",
                bytes.len(),
                MAX_OPTION_LEN
            ));
        }

        Ok(bytes)
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Address => "address",
            Self::AddressList => "address list",
            Self::AddressPairs => "address pair",
            Self::Text => "string",
            Self::Integer { .. } => "integer",
            Self::IntegerList { .. } => "integer list",
            Self::Any => "untyped",
        }
    }
}

fn encode_integer(value: i64, width: u8, signed: bool) -> Result<Vec<u8>, String> {
    let bits = u32::from(width) * 8;
    let (min, max) = if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };

    if value < min || value > max {
        return Err(format!(
            "{} does not fit in a {}-byte {} integer",
            value,
            width,
            if signed { "signed" } else { "unsigned" }
        ));
    }

    let full = value.to_be_bytes();
    Ok(full[full.len() - usize::from(width)..].to_vec())
}

/// A named DHCP option the configuration language understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub code: u8,
    pub kind: ValueKind,
}

const fn spec(name: &'static str, code: u8, kind: ValueKind) -> OptionSpec {
    OptionSpec { name, code, kind }
}

const U8: ValueKind = ValueKind::Integer {
    width: 1,
    signed: false,
};
const U16: ValueKind = ValueKind::Integer {
    width: 2,
    signed: false,
};
const U32: ValueKind = ValueKind::Integer {
    width: 4,
    signed: false,
};
const I32: ValueKind = ValueKind::Integer {
    width: 4,
    signed: true,
};

use ValueKind::{Address, AddressList, AddressPairs, Boolean, Text};

/// RFC 2132 options that may be set by name.
pub const STANDARD_OPTIONS: &[OptionSpec] = &[
    spec("subnet-mask", 1, Address),
    spec("time-offset", 2, I32),
    spec("router", 3, AddressList),
    spec("time-server", 4, AddressList),
    spec("name-server", 5, AddressList),
    spec("domain-name-server", 6, AddressList),
    spec("log-server", 7, AddressList),
    spec("cookie-server", 8, AddressList),
    spec("lpr-server", 9, AddressList),
    spec("impress-server", 10, AddressList),
    spec("resource-location-server", 11, AddressList),
    spec("hostname", 12, Text),
    spec("boot-file-size", 13, U16),
    spec("merit-dump-file", 14, Text),
    spec("domain-name", 15, Text),
    spec("swap-server", 16, Address),
    spec("root-path", 17, Text),
    spec("extensions-path", 18, Text),
    spec("ip-forwarding-toggle", 19, Boolean),
    spec("non-local-source-routing-toggle", 20, Boolean),
    spec("policy-filter", 21, AddressPairs),
    spec("max-datagram-reassembly-size", 22, U16),
    spec("default-ip-ttl", 23, U8),
    spec("path-mtu-aging-timeout", 24, U32),
    spec("path-mtu-plateau-table", 25, ValueKind::IntegerList { width: 2 }),
    spec("interface-mtu", 26, U16),
    spec("all-subnets-are-local", 27, Boolean),
    spec("broadcast-address", 28, Address),
    spec("perform-mask-discovery", 29, Boolean),
    spec("mask-supplier", 30, Boolean),
    spec("perform-router-discovery", 31, Boolean),
    spec("router-solicitation-address", 32, Address),
    spec("static-route", 33, AddressPairs),
    spec("trailer-encapsulation", 34, Boolean),
    spec("arp-cache-timeout", 35, U32),
    spec("ethernet-encapsulation", 36, Boolean),
    spec("tcp-default-ttl", 37, U8),
    spec("tcp-keepalive-interval", 38, U32),
    spec("tcp-keepalive-garbage", 39, Boolean),
    spec("network-information-service-domain", 40, Text),
    spec("network-information-servers", 41, AddressList),
    spec("network-time-protocol-servers", 42, AddressList),
    spec("vendor-options", VENDOR_OPTIONS_CODE, Boolean),
    spec("netbios-over-tcpip-name-server", 44, AddressList),
    spec("netbios-over-tcpip-datagram-distribution-server", 45, AddressList),
    spec("netbios-over-tcpip-node-type", 46, U8),
    spec("netbios-over-tcpip-scope", 47, Text),
    spec("xwindow-system-font-server", 48, AddressList),
    spec("xwindow-system-display-manager", 49, AddressList),
    spec("renewal-time-value", 58, U32),
    spec("rebinding-time-value", 59, U32),
    spec("nis+-domain", 64, Text),
    spec("nis+-servers", 65, AddressList),
    spec("tftp-server-name", 66, Text),
    spec("mobile-ip-home-agent", 68, AddressList),
    spec("simple-mail-transport-protocol", 69, AddressList),
    spec("post-office-protocol-server", 70, AddressList),
    spec("network-news-transport-protocol", 71, AddressList),
    spec("default-www-server", 72, AddressList),
    spec("default-finger-server", 73, AddressList),
    spec("default-irc-server", 74, AddressList),
    spec("street-talk-server", 75, AddressList),
    spec("street-talk-directory-assistance", 76, AddressList),
];

/// Finds a standard option by name (case-insensitive), or an `option-NNN` code.
pub fn lookup(name: &str) -> Option<OptionSpec> {
    let lowered = name.to_ascii_lowercase();
    if let Some(found) = STANDARD_OPTIONS.iter().find(|spec| spec.name == lowered) {
        return Some(*found);
    }

    let code = lowered.strip_prefix("option-")?.parse::<u8>().ok()?;
    if code == 0 || code == u8::MAX {
        return None;
    }
    Some(OptionSpec {
        name: "custom",
        code,
        kind: ValueKind::Any,
    })
}

/// Encodes vendor sub-options as concatenated code/length/value triples.
///
/// Returns `None` when there is nothing to send or the result would not fit
/// in a single option.
pub fn encode_vendor_options<'a>(
    suboptions: impl IntoIterator<Item = (&'a u8, &'a Vec<u8>)>,
) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    for (code, value) in suboptions {
        bytes.push(*code);
        bytes.push(u8::try_from(value.len()).ok()?);
        bytes.extend_from_slice(value);
    }

    if bytes.is_empty() || bytes.len() > MAX_OPTION_LEN {
        None
    } else {
        Some(bytes)
    }
}

/// Renders option bytes for display using the schema of a known code.
pub fn describe_value(code: u8, bytes: &[u8]) -> String {
    let kind = STANDARD_OPTIONS
        .iter()
        .find(|spec| spec.code == code)
        .map(|spec| spec.kind);

    let addresses = || {
        bytes
            .chunks_exact(4)
            .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    match kind {
        Some(Address | AddressList | AddressPairs) if bytes.len().is_multiple_of(4) => addresses(),
        Some(Text) => String::from_utf8_lossy(bytes).into_owned(),
        Some(Boolean) if bytes.len() == 1 && code != VENDOR_OPTIONS_CODE => {
            (bytes[0] != 0).to_string()
        }
        Some(ValueKind::Integer { signed: true, .. }) if bytes.len() == 4 => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()
        }
        Some(ValueKind::Integer { .. }) if bytes.len() <= 4 => bytes
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
            .to_string(),
        _ => bytes
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kind: TokenKind) -> Token {
        Token { kind, line: 1 }
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Token {
        token(TokenKind::IpAddress(Ipv4Addr::new(a, b, c, d)))
    }

    #[test]
    fn test_lookup_standard_and_custom() {
        let router = lookup("router").unwrap();
        assert_eq!(router.code, 3);
        assert_eq!(router.kind, AddressList);

        assert_eq!(lookup("NIS+-Domain").unwrap().code, 64);
        assert_eq!(lookup("option-150").unwrap().code, 150);
        assert!(lookup("option-0").is_none());
        assert!(lookup("option-255").is_none());
        assert!(lookup("option-300").is_none());
        assert!(lookup("not-an-option").is_none());
    }

    #[test]
    fn test_table_codes_are_unique() {
        for (index, first) in STANDARD_OPTIONS.iter().enumerate() {
            for second in &STANDARD_OPTIONS[index + 1..] {
                assert_ne!(first.code, second.code, "{} and {}", first.name, second.name);
                assert_ne!(first.name, second.name);
            }
        }
    }

    #[test]
    fn test_integers_are_big_endian_at_width() {
        let values = [token(TokenKind::Number(1500))];
        assert_eq!(U16.encode(&values).unwrap(), vec![0x05, 0xdc]);
        assert_eq!(U32.encode(&values).unwrap(), vec![0, 0, 0x05, 0xdc]);
        assert!(U8.encode(&values).is_err());

        let negative = [token(TokenKind::Number(-3600))];
        assert_eq!(I32.encode(&negative).unwrap(), (-3600i32).to_be_bytes().to_vec());
        assert!(U32.encode(&negative).is_err());
    }

    #[test]
    fn test_address_lists() {
        let values = [ip(10, 0, 0, 1), ip(10, 0, 0, 2)];
        assert_eq!(
            AddressList.encode(&values).unwrap(),
            vec![10, 0, 0, 1, 10, 0, 0, 2]
        );
        assert!(Address.encode(&values).is_err());
        assert!(AddressPairs.encode(&values[..1]).is_err());
        assert_eq!(AddressPairs.encode(&values).unwrap().len(), 8);
    }

    #[test]
    fn test_type_mismatch_and_empty() {
        assert!(Text.encode(&[ip(10, 0, 0, 1)]).is_err());
        assert!(Boolean.encode(&[token(TokenKind::Number(1))]).is_err());
        assert!(Text.encode(&[]).is_err());
    }

    #[test]
    fn test_option_length_limit() {
        let long = token(TokenKind::String("x".repeat(256)));
        assert!(Text.encode(&[long]).is_err());
        let fits = token(TokenKind::String("x".repeat(255)));
        assert_eq!(Text.encode(&[fits]).unwrap().len(), 255);
    }

    #[test]
    fn test_untyped_values() {
        let values = [
            token(TokenKind::Number(7)),
            token(TokenKind::String("ab".to_string())),
            token(TokenKind::Boolean(true)),
        ];
        assert_eq!(
            ValueKind::Any.encode(&values).unwrap(),
            vec![0, 0, 0, 7, b'a', b'b', 1]
        );
    }

    #[test]
    fn test_declared_types() {
        assert_eq!(ValueKind::from_declared("address-list"), Some(AddressList));
        assert_eq!(ValueKind::from_declared("int16"), Some(U16));
        assert_eq!(ValueKind::from_declared("float"), None);
    }

    #[test]
    fn test_vendor_encoding() {
        let mut suboptions = std::collections::BTreeMap::new();
        suboptions.insert(1u8, vec![10, 0, 0, 1]);
        suboptions.insert(2u8, b"abc".to_vec());
        assert_eq!(
            encode_vendor_options(&suboptions),
            Some(vec![1, 4, 10, 0, 0, 1, 2, 3, b'a', b'b', b'c'])
        );

        let empty: std::collections::BTreeMap<u8, Vec<u8>> = Default::default();
        assert_eq!(encode_vendor_options(&empty), None);

        let mut oversized = std::collections::BTreeMap::new();
        oversized.insert(1u8, vec![0u8; 200]);
        oversized.insert(2u8, vec![0u8; 100]);
        assert_eq!(encode_vendor_options(&oversized), None);
    }

    #[test]
    fn test_describe_value() {
        assert_eq!(describe_value(3, &[10, 0, 0, 1, 10, 0, 0, 2]), "10.0.0.1, 10.0.0.2");
        assert_eq!(describe_value(15, b"example.org"), "example.org");
        assert_eq!(describe_value(26, &[0x05, 0xdc]), "1500");
        assert_eq!(describe_value(2, &(-60i32).to_be_bytes()), "-60");
        assert_eq!(describe_value(200, &[1, 2]), "01:02");
    }
}
