//! The parsed network topology.
//!
//! ```text
//! Config
//! ├── Global (server identifier, root/registered/unregistered settings)
//! └── Network "name" (root/registered/unregistered settings)
//!     └── Subnet a.b.c.d/nn (registered or unregistered)
//!         └── Pool start - end
//! ```
//!
//! The tree is built once by the parser and never changes shape afterwards.
//! [`Config::build`] validates it and resolves the effective settings of
//! every node for both client modes; only the lease maps inside pools mutate
//! at runtime.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::option_table::describe_value;
use crate::pool::{Pool, PoolStats};
use crate::settings::{EffectiveSettings, ModalSettings, Resolved, Settings};

/// Option code of the subnet mask.
const SUBNET_MASK_CODE: u8 = 1;

#[derive(Debug)]
pub struct Global {
    pub server_identifier: Ipv4Addr,
    pub settings: ModalSettings,
    pub(crate) resolved: Resolved,
}

impl Global {
    pub fn new(server_identifier: Ipv4Addr, settings: ModalSettings) -> Self {
        Self {
            server_identifier,
            settings,
            resolved: Resolved::default(),
        }
    }
}

impl Default for Global {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, ModalSettings::default())
    }
}

#[derive(Debug)]
pub struct Network {
    /// Lower-cased, unique name.
    pub name: String,
    /// Serves clients on the server's own segment (no relay).
    pub local: bool,
    /// Every client is treated as registered.
    pub ignore_registration: bool,
    pub settings: ModalSettings,
    pub subnets: Vec<Subnet>,
    pub line: usize,
    pub(crate) resolved: Resolved,
}

impl Network {
    pub fn new(name: impl Into<String>, line: usize) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            local: false,
            ignore_registration: false,
            settings: ModalSettings::default(),
            subnets: Vec::new(),
            line,
            resolved: Resolved::default(),
        }
    }

    pub fn includes(&self, ip: Ipv4Addr) -> bool {
        self.subnets.iter().any(|subnet| subnet.net.contains(&ip))
    }

    /// Pools serving clients of the given registration standing, in declaration order.
    pub fn pools(&self, registered: bool) -> impl Iterator<Item = &Pool> {
        self.subnets
            .iter()
            .filter(move |subnet| subnet.allow_unknown != registered)
            .flat_map(|subnet| subnet.pools.iter())
    }

    pub fn pool_for_ip(&self, ip: Ipv4Addr, registered: bool) -> Option<&Pool> {
        self.pools(registered).find(|pool| pool.includes(ip))
    }

    /// The pool containing `ip`, whatever its mode.
    pub fn any_pool_for_ip(&self, ip: Ipv4Addr) -> Option<&Pool> {
        self.subnets
            .iter()
            .flat_map(|subnet| subnet.pools.iter())
            .find(|pool| pool.includes(ip))
    }

    pub fn effective(&self, registered: bool) -> &EffectiveSettings {
        self.resolved.get(registered)
    }
}

#[derive(Debug)]
pub struct Subnet {
    pub net: Ipv4Net,
    /// Unregistered clients are served from this subnet.
    pub allow_unknown: bool,
    pub settings: Settings,
    pub pools: Vec<Pool>,
    pub line: usize,
    pub(crate) resolved: Resolved,
}

impl Subnet {
    pub fn new(net: Ipv4Net, allow_unknown: bool, line: usize) -> Self {
        Self {
            net,
            allow_unknown,
            settings: Settings::default(),
            pools: Vec::new(),
            line,
            resolved: Resolved::default(),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub global: Global,
    pub networks: Vec<Network>,
    index: HashMap<String, usize>,
}

impl Config {
    /// Parses the configuration file at `path`.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::parser::parse_file(path.as_ref())
    }

    /// Parses configuration text; `name` is used in error messages.
    pub fn parse_str(name: &str, text: &str) -> Result<Self> {
        crate::parser::parse_str(name, text)
    }

    /// Validates the tree and resolves every node's settings.
    pub fn build(global: Global, networks: Vec<Network>) -> Result<Self> {
        let mut index = HashMap::new();
        for (position, network) in networks.iter().enumerate() {
            if index.insert(network.name.clone(), position).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "line {}: network \"{}\" is declared twice",
                    network.line, network.name
                )));
            }
        }

        let mut config = Self {
            global,
            networks,
            index,
        };
        config.validate()?;
        config.resolve();
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut ranges = Vec::new();
        for network in &self.networks {
            for subnet in &network.subnets {
                for pool in &subnet.pools {
                    if u32::from(pool.range_start) > u32::from(pool.range_end) {
                        return Err(Error::InvalidConfig(format!(
                            "line {}: pool range {} - {} ends before it starts",
                            pool.line, pool.range_start, pool.range_end
                        )));
                    }
                    if !subnet.net.contains(&pool.range_start)
                        || !subnet.net.contains(&pool.range_end)
                    {
                        return Err(Error::InvalidConfig(format!(
                            "line {}: pool range {} - {} is outside subnet {}",
                            pool.line, pool.range_start, pool.range_end, subnet.net
                        )));
                    }
                    ranges.push(pool);
                }
            }
        }

        ranges.sort_by_key(|pool| u32::from(pool.range_start));
        for pair in ranges.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(Error::InvalidConfig(format!(
                    "line {}: pool range {} - {} overlaps the pool on line {}",
                    pair[1].line, pair[1].range_start, pair[1].range_end, pair[0].line
                )));
            }
        }
        Ok(())
    }

    /// Computes the effective settings of every node, once.
    fn resolve(&mut self) {
        let Config {
            global, networks, ..
        } = self;
        let Global {
            settings: global_settings,
            resolved: global_resolved,
            ..
        } = global;
        let global_settings: &ModalSettings = global_settings;
        *global_resolved = Resolved::build(|registered| {
            [global_settings.for_mode(registered), &global_settings.root]
        });

        for network in networks.iter_mut() {
            for subnet in &mut network.subnets {
                if !subnet.settings.options.contains_key(&SUBNET_MASK_CODE) {
                    let mask = subnet.net.netmask().octets().to_vec();
                    subnet.settings.options.insert(SUBNET_MASK_CODE, mask);
                }
            }

            let Network {
                name,
                settings: network_settings,
                subnets,
                resolved: network_resolved,
                ..
            } = network;
            let network_settings: &ModalSettings = network_settings;

            let outer = |registered: bool| {
                [
                    network_settings.for_mode(registered),
                    &network_settings.root,
                    global_settings.for_mode(registered),
                    &global_settings.root,
                ]
            };
            *network_resolved = Resolved::build(outer);

            for subnet in subnets.iter_mut() {
                let Subnet {
                    net,
                    allow_unknown,
                    settings: subnet_settings,
                    pools,
                    resolved: subnet_resolved,
                    ..
                } = subnet;
                let subnet_settings: &Settings = subnet_settings;

                *subnet_resolved = Resolved::build(|registered| {
                    std::iter::once(subnet_settings).chain(outer(registered))
                });

                for pool in pools.iter_mut() {
                    pool.network = name.clone();
                    pool.registered = !*allow_unknown;
                    pool.subnet = *net;
                    let pool_settings = &pool.settings;
                    pool.resolved = Resolved::build(|registered| {
                        [pool_settings, subnet_settings]
                            .into_iter()
                            .chain(outer(registered))
                    });
                }
            }
        }
    }

    pub fn server_identifier(&self) -> Ipv4Addr {
        self.global.server_identifier
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|position| &self.networks[*position])
    }

    pub fn network_at(&self, position: usize) -> Option<&Network> {
        self.networks.get(position)
    }

    /// Position of the first network with a subnet containing `ip`.
    pub fn network_index_for_ip(&self, ip: Ipv4Addr) -> Option<usize> {
        self.networks.iter().position(|network| network.includes(ip))
    }

    pub fn network_for_ip(&self, ip: Ipv4Addr) -> Option<&Network> {
        self.network_index_for_ip(ip).map(|position| &self.networks[position])
    }

    /// Position of the first network flagged `local`.
    pub fn local_network(&self) -> Option<usize> {
        self.networks.iter().position(|network| network.local)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.networks
            .iter()
            .flat_map(|network| network.subnets.iter())
            .flat_map(|subnet| subnet.pools.iter())
    }

    pub async fn pool_stats(&self, now: DateTime<Utc>) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        for pool in self.pools() {
            stats.push(pool.stats(now).await);
        }
        stats
    }
}

fn write_settings(f: &mut fmt::Formatter<'_>, indent: &str, label: &str, settings: &Settings) -> fmt::Result {
    if settings.is_empty() {
        return Ok(());
    }
    writeln!(f, "{indent}{label}:")?;
    for (code, value) in &settings.options {
        writeln!(f, "{indent}  option {code}: {}", describe_value(*code, value))?;
    }
    if let Some(time) = settings.default_lease_time {
        writeln!(f, "{indent}  default-lease-time {}", time.as_secs())?;
    }
    if let Some(time) = settings.max_lease_time {
        writeln!(f, "{indent}  max-lease-time {}", time.as_secs())?;
    }
    if let Some(time) = settings.free_lease_after {
        writeln!(f, "{indent}  free-lease-after {}", time.as_secs())?;
    }
    Ok(())
}

fn write_modal(f: &mut fmt::Formatter<'_>, indent: &str, settings: &ModalSettings) -> fmt::Result {
    write_settings(f, indent, "settings", &settings.root)?;
    write_settings(f, indent, "registered", &settings.registered)?;
    write_settings(f, indent, "unregistered", &settings.unregistered)
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "global (server identifier {})", self.global.server_identifier)?;
        write_modal(f, "  ", &self.global.settings)?;

        for network in &self.networks {
            let mut flags = Vec::new();
            if network.local {
                flags.push("local");
            }
            if network.ignore_registration {
                flags.push("ignore-registration");
            }
            if flags.is_empty() {
                writeln!(f, "network \"{}\"", network.name)?;
            } else {
                writeln!(f, "network \"{}\" [{}]", network.name, flags.join(", "))?;
            }
            write_modal(f, "  ", &network.settings)?;

            for subnet in &network.subnets {
                let mode = if subnet.allow_unknown {
                    "unregistered"
                } else {
                    "registered"
                };
                writeln!(f, "  subnet {} ({mode})", subnet.net)?;
                write_settings(f, "    ", "settings", &subnet.settings)?;
                for pool in &subnet.pools {
                    writeln!(f, "    pool {} - {}", pool.range_start, pool.range_end)?;
                    write_settings(f, "      ", "settings", &pool.settings)?;
                }
            }
        }
        Ok(())
    }
}
