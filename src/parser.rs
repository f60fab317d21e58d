//! Recursive-descent parser for the DHCP configuration language.
//!
//! ```text
//! decloption "name" code <1-254> type <bool|address|address-list|string|int8|int16|int32> end
//!
//! global
//!     server-identifier 10.0.0.1
//!     <setting>...
//!     registered <setting>... end
//!     unregistered <setting>... end
//! end
//!
//! network [local] "name"
//!     [ignore-registration]
//!     <setting>...
//!     subnet 10.0.1.0/24          # short-hand for an unregistered subnet
//!         range 10.0.1.10 10.0.1.200
//!     end
//!     registered
//!         <setting>...
//!         subnet 10.0.2.0 255.255.255.0
//!             pool
//!                 range 10.0.2.10 10.0.2.100
//!                 <setting>...
//!             end
//!         end
//!     end
//! end
//!
//! include "other.conf"
//! ```
//!
//! A setting is `option <name> <values...>`, `default-lease-time <seconds>`,
//! `max-lease-time <seconds>` or `free-lease-after <seconds>` (global and
//! network blocks only). Parsing stops at the first error.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::warn;

use crate::error::{Error, Result};
use crate::lexer::{Keyword, Lexer, Token, TokenKind};
use crate::option_table::{self, VENDOR_OPTIONS_CODE, ValueKind};
use crate::pool::Pool;
use crate::settings::{ModalSettings, Settings};
use crate::topology::{Config, Global, Network, Subnet};

/// Longest network name accepted.
const MAX_NETWORK_NAME_LEN: usize = 255;

pub(crate) fn parse_file(path: &Path) -> Result<Config> {
    let lexer = Lexer::from_file(path)?;
    Parser::new(lexer).parse()
}

pub(crate) fn parse_str(name: &str, text: &str) -> Result<Config> {
    Parser::new(Lexer::new(name, text)).parse()
}

/// A vendor sub-option declared with `decloption`.
#[derive(Debug, Clone, Copy)]
struct VendorOption {
    code: u8,
    kind: ValueKind,
}

/// Which settings block of a network is being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Root,
    Registered,
    Unregistered,
}

/// Where a settings block lives; decides whether `free-lease-after` is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Upper,
    Lower,
}

struct Parser {
    lexer: Lexer,
    vendor_types: HashMap<String, VendorOption>,
    global: Option<Global>,
    networks: Vec<Network>,
}

impl Parser {
    fn new(lexer: Lexer) -> Self {
        Self {
            lexer,
            vendor_types: HashMap::new(),
            global: None,
            networks: Vec::new(),
        }
    }

    fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            source_name: self.lexer.source_name().to_string(),
            line,
            message: message.into(),
        }
    }

    fn unexpected(&self, token: &Token, context: &str) -> Error {
        self.error(token.line, format!("unexpected {} in {}", token.kind, context))
    }

    fn parse(mut self) -> Result<Config> {
        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Eof => break,
                TokenKind::Keyword(Keyword::Global) => {
                    if self.global.is_some() {
                        return Err(self.error(token.line, "global block declared twice"));
                    }
                    if !self.networks.is_empty() {
                        return Err(
                            self.error(token.line, "global block must come before any network")
                        );
                    }
                    let global = self.parse_global(token.line)?;
                    self.global = Some(global);
                }
                TokenKind::Keyword(Keyword::Network) => {
                    let network = self.parse_network(token.line)?;
                    self.networks.push(network);
                }
                TokenKind::Keyword(Keyword::Include) => {
                    let path = self.lexer.next();
                    let line = path.line;
                    let TokenKind::String(path) = path.kind else {
                        return Err(self.error(line, "include needs a quoted file path"));
                    };
                    self.lexer
                        .push_reader(&path)
                        .map_err(|message| self.error(token.line, message))?;
                }
                TokenKind::Keyword(Keyword::DeclOption) => {
                    self.parse_option_declaration(token.line)?;
                }
                _ => return Err(self.unexpected(&token, "configuration")),
            }
        }

        let global = self.global.unwrap_or_default();
        if global.server_identifier.is_unspecified() {
            warn!("No server-identifier configured, replies will carry 0.0.0.0");
        }
        Config::build(global, self.networks)
    }

    fn parse_global(&mut self, start: usize) -> Result<Global> {
        let mut server_identifier = Ipv4Addr::UNSPECIFIED;
        let mut settings = ModalSettings::default();

        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Keyword(Keyword::End) => break,
                TokenKind::Eof => {
                    return Err(self.error(token.line, format!(
                        "global block starting on line {start} is not closed"
                    )));
                }
                TokenKind::Keyword(Keyword::ServerIdentifier) => {
                    server_identifier = self.expect_address("server-identifier")?;
                    self.expect_line_end()?;
                }
                TokenKind::Keyword(Keyword::Registered) => {
                    self.parse_settings_block(&mut settings.registered, token.line, "registered")?;
                }
                TokenKind::Keyword(Keyword::Unregistered) => {
                    self.parse_settings_block(
                        &mut settings.unregistered,
                        token.line,
                        "unregistered",
                    )?;
                }
                TokenKind::Keyword(keyword) if keyword.is_setting() => {
                    self.lexer.unread();
                    self.parse_setting(&mut settings.root, Scope::Upper)?;
                }
                _ => return Err(self.unexpected(&token, "global block")),
            }
        }

        settings.root.seal_vendor_options();
        Ok(Global::new(server_identifier, settings))
    }

    /// Parses a `registered`/`unregistered` block of global settings up to its `end`.
    fn parse_settings_block(&mut self, target: &mut Settings, start: usize, name: &str) -> Result<()> {
        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Keyword(Keyword::End) => break,
                TokenKind::Eof => {
                    return Err(self.error(token.line, format!(
                        "{name} block starting on line {start} is not closed"
                    )));
                }
                TokenKind::Keyword(keyword) if keyword.is_setting() => {
                    self.lexer.unread();
                    self.parse_setting(target, Scope::Upper)?;
                }
                _ => return Err(self.unexpected(&token, &format!("{name} block"))),
            }
        }
        target.seal_vendor_options();
        Ok(())
    }

    fn parse_network(&mut self, start: usize) -> Result<Network> {
        let mut token = self.lexer.next();
        let local = token.kind == TokenKind::Keyword(Keyword::Local);
        if local {
            token = self.lexer.next();
        }

        let TokenKind::String(name) = &token.kind else {
            return Err(self.error(token.line, "network needs a quoted name"));
        };
        let name = name.to_ascii_lowercase();
        if name.len() > MAX_NETWORK_NAME_LEN {
            return Err(self.error(token.line, "network name is longer than 255 characters"));
        }
        if self.networks.iter().any(|network| network.name == name) {
            return Err(self.error(token.line, format!("network \"{name}\" is already declared")));
        }

        let mut network = Network::new(name, start);
        network.local = local;
        let mut mode = Mode::Root;

        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Eof => {
                    return Err(self.error(token.line, format!(
                        "network \"{}\" starting on line {start} is not closed",
                        network.name
                    )));
                }
                TokenKind::Keyword(Keyword::End) => {
                    if mode == Mode::Root {
                        break;
                    }
                    mode = Mode::Root;
                }
                TokenKind::Keyword(Keyword::IgnoreRegistration) => {
                    network.ignore_registration = true;
                }
                TokenKind::Keyword(Keyword::Registered) if mode == Mode::Root => {
                    mode = Mode::Registered;
                }
                TokenKind::Keyword(Keyword::Unregistered) if mode == Mode::Root => {
                    mode = Mode::Unregistered;
                }
                TokenKind::Keyword(Keyword::Registered | Keyword::Unregistered) => {
                    return Err(self.error(
                        token.line,
                        "registered and unregistered blocks cannot be nested",
                    ));
                }
                TokenKind::Keyword(Keyword::Subnet) => {
                    let subnet = self.parse_subnet(mode != Mode::Registered, token.line)?;
                    network.subnets.push(subnet);
                }
                TokenKind::Keyword(keyword) if keyword.is_setting() => {
                    self.lexer.unread();
                    let target = match mode {
                        Mode::Root => &mut network.settings.root,
                        Mode::Registered => &mut network.settings.registered,
                        Mode::Unregistered => &mut network.settings.unregistered,
                    };
                    self.parse_setting(target, Scope::Upper)?;
                }
                _ => return Err(self.unexpected(&token, "network block")),
            }
        }

        network.settings.root.seal_vendor_options();
        network.settings.registered.seal_vendor_options();
        network.settings.unregistered.seal_vendor_options();
        Ok(network)
    }

    fn parse_subnet(&mut self, allow_unknown: bool, start: usize) -> Result<Subnet> {
        let address = self.expect_address("subnet")?;
        let mask = self.expect_address("subnet mask")?;
        let net = Ipv4Net::with_netmask(address, mask)
            .map_err(|_| self.error(start, format!("{mask} is not a valid netmask")))?
            .trunc();

        let mut subnet = Subnet::new(net, allow_unknown, start);
        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Keyword(Keyword::End) => break,
                TokenKind::Eof => {
                    return Err(self.error(token.line, format!(
                        "subnet {net} starting on line {start} is not closed"
                    )));
                }
                TokenKind::Keyword(Keyword::Pool) => {
                    let pool = self.parse_pool(net, token.line, true)?;
                    subnet.pools.push(pool);
                }
                TokenKind::Keyword(Keyword::Range) => {
                    self.lexer.unread();
                    let pool = self.parse_pool(net, token.line, false)?;
                    subnet.pools.push(pool);
                }
                TokenKind::Keyword(keyword) if keyword.is_setting() => {
                    self.lexer.unread();
                    self.parse_setting(&mut subnet.settings, Scope::Lower)?;
                }
                _ => return Err(self.unexpected(&token, "subnet block")),
            }
        }

        subnet.settings.seal_vendor_options();
        Ok(subnet)
    }

    /// Parses an explicit `pool ... end` block, or an implicit pool that
    /// starts at a `range` line and runs until the next `range`, `pool` or
    /// the subnet's `end`.
    fn parse_pool(&mut self, subnet: Ipv4Net, start: usize, explicit: bool) -> Result<Pool> {
        let mut settings = Settings::default();
        let mut range: Option<(Ipv4Addr, Ipv4Addr)> = None;

        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Keyword(Keyword::End) if explicit => break,
                TokenKind::Eof if explicit => {
                    return Err(self.error(token.line, format!(
                        "pool starting on line {start} is not closed"
                    )));
                }
                TokenKind::Keyword(Keyword::End | Keyword::Pool) | TokenKind::Eof if !explicit => {
                    self.lexer.unread();
                    break;
                }
                TokenKind::Keyword(Keyword::Range) => {
                    if range.is_some() {
                        if explicit {
                            return Err(self.error(token.line, "pool already has a range"));
                        }
                        self.lexer.unread();
                        break;
                    }
                    let first = self.expect_address("range")?;
                    let last = self.expect_address("range")?;
                    self.expect_line_end()?;
                    range = Some((first, last));
                }
                TokenKind::Keyword(keyword) if keyword.is_setting() => {
                    self.lexer.unread();
                    self.parse_setting(&mut settings, Scope::Lower)?;
                }
                _ => return Err(self.unexpected(&token, "pool block")),
            }
        }

        let Some((first, last)) = range else {
            return Err(self.error(start, "pool has no range"));
        };
        settings.seal_vendor_options();
        Ok(Pool::new(first, last, subnet, settings, start))
    }

    fn parse_setting(&mut self, target: &mut Settings, scope: Scope) -> Result<()> {
        let token = self.lexer.next();
        match &token.kind {
            TokenKind::Keyword(Keyword::Option) => self.parse_option(target, token.line),
            TokenKind::Keyword(Keyword::DefaultLeaseTime) => {
                target.default_lease_time = Some(self.expect_seconds(true)?);
                self.expect_line_end()
            }
            TokenKind::Keyword(Keyword::MaxLeaseTime) => {
                target.max_lease_time = Some(self.expect_seconds(true)?);
                self.expect_line_end()
            }
            TokenKind::Keyword(Keyword::FreeLeaseAfter) => {
                if scope == Scope::Lower {
                    return Err(self.error(
                        token.line,
                        "free-lease-after is only allowed in global and network blocks",
                    ));
                }
                target.free_lease_after = Some(self.expect_seconds(false)?);
                self.expect_line_end()
            }
            _ => Err(self.unexpected(&token, "settings")),
        }
    }

    fn parse_option(&mut self, target: &mut Settings, line: usize) -> Result<()> {
        let tokens = self.lexer.rest_of_line();
        let Some((name, values)) = tokens.split_first() else {
            return Err(self.error(line, "option needs a name and a value"));
        };
        let TokenKind::String(name) = &name.kind else {
            return Err(self.error(line, format!("expected an option name, found {}", name.kind)));
        };
        let wrap = |message: String| format!("option {name}: {message}");

        if let Some(vendor) = self.vendor_types.get(&name.to_ascii_lowercase()).copied() {
            let bytes = vendor
                .kind
                .encode(values)
                .map_err(|message| self.error(line, wrap(message)))?;
            target.vendor_options.insert(vendor.code, bytes);
            return Ok(());
        }

        let Some(spec) = option_table::lookup(name) else {
            return Err(self.error(line, format!("unknown option {name}")));
        };
        let bytes = spec
            .kind
            .encode(values)
            .map_err(|message| self.error(line, wrap(message)))?;

        if spec.code == VENDOR_OPTIONS_CODE && spec.kind == ValueKind::Boolean {
            target.send_vendor_options = bytes.first() == Some(&1);
        } else {
            target.options.insert(spec.code, bytes);
        }
        Ok(())
    }

    fn parse_option_declaration(&mut self, start: usize) -> Result<()> {
        let token = self.lexer.next();
        let TokenKind::String(name) = &token.kind else {
            return Err(self.error(token.line, "decloption needs a quoted name"));
        };
        let name = name.to_ascii_lowercase();
        if self.vendor_types.contains_key(&name) {
            return Err(self.error(token.line, format!("option {name} is already declared")));
        }

        let mut code = None;
        let mut kind = None;
        loop {
            let token = self.lexer.next();
            match &token.kind {
                TokenKind::Comment(_) | TokenKind::Eol => continue,
                TokenKind::Keyword(Keyword::End) => break,
                TokenKind::Eof => {
                    return Err(self.error(token.line, format!(
                        "decloption starting on line {start} is not closed"
                    )));
                }
                TokenKind::Keyword(Keyword::Code) => {
                    if code.is_some() {
                        return Err(self.error(token.line, "decloption has two codes"));
                    }
                    let value = self.lexer.next();
                    match value.kind {
                        TokenKind::Number(number @ 1..=254) => code = Some(number as u8),
                        _ => {
                            return Err(
                                self.error(value.line, "option code must be between 1 and 254")
                            );
                        }
                    }
                }
                TokenKind::Keyword(Keyword::Type) => {
                    if kind.is_some() {
                        return Err(self.error(token.line, "decloption has two types"));
                    }
                    let value = self.lexer.next();
                    let TokenKind::String(type_name) = &value.kind else {
                        return Err(self.error(value.line, "expected an option type"));
                    };
                    let Some(declared) = ValueKind::from_declared(type_name) else {
                        return Err(
                            self.error(value.line, format!("unknown option type {type_name}"))
                        );
                    };
                    kind = Some(declared);
                }
                _ => return Err(self.unexpected(&token, "decloption")),
            }
        }

        let (Some(code), Some(kind)) = (code, kind) else {
            return Err(self.error(start, format!("decloption {name} needs a code and a type")));
        };
        self.vendor_types.insert(name, VendorOption { code, kind });
        Ok(())
    }

    fn expect_address(&mut self, context: &str) -> Result<Ipv4Addr> {
        let token = self.lexer.next();
        match token.kind {
            TokenKind::IpAddress(ip) => Ok(ip),
            other => Err(self.error(
                token.line,
                format!("expected an address for {context}, found {other}"),
            )),
        }
    }

    fn expect_seconds(&mut self, positive: bool) -> Result<Duration> {
        let token = self.lexer.next();
        match token.kind {
            TokenKind::Number(seconds)
                if seconds <= i64::from(u32::MAX) && (seconds > 0 || (!positive && seconds == 0)) =>
            {
                Ok(Duration::from_secs(seconds.unsigned_abs()))
            }
            TokenKind::Number(seconds) => Err(self.error(
                token.line,
                format!("{seconds} is not a valid number of seconds"),
            )),
            other => Err(self.error(
                token.line,
                format!("expected a number of seconds, found {other}"),
            )),
        }
    }

    fn expect_line_end(&mut self) -> Result<()> {
        let rest = self.lexer.rest_of_line();
        match rest.first() {
            None => Ok(()),
            Some(token) => Err(self.error(token.line, format!("unexpected {} at end of line", token.kind))),
        }
    }
}
