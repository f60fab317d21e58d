//! Per-packet protocol logic.
//!
//! [`Handler`] turns one parsed client message into at most one reply. It
//! owns no socket; the transport in [`crate::server`] feeds it packets and
//! sends back whatever it returns.
//!
//! | Message  | Outcome                                                  |
//! |----------|----------------------------------------------------------|
//! | DISCOVER | OFFER, or nothing when no network or address fits        |
//! | REQUEST  | ACK, NAK, or nothing when addressed to another server    |
//! | RELEASE  | nothing; the lease collapses to the epoch                 |
//! | DECLINE  | nothing; the lease is abandoned                          |
//! | INFORM   | nothing                                                  |

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceStore};
use crate::error::Result;
use crate::gateway::GatewayCache;
use crate::lease::sanitize_hostname;
use crate::mac::MacAddress;
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::DhcpPacket;
use crate::pool::{Pool, PoolStats};
use crate::probe::LivenessProbe;
use crate::store::LeaseStore;
use crate::topology::{Config, Network};

/// Codes the handler writes itself; configured values for them are ignored.
const RESERVED_CODES: [u8; 6] = [
    OptionCode::Pad as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::MessageType as u8,
    OptionCode::ServerIdentifier as u8,
    OptionCode::RelayAgentInfo as u8,
    OptionCode::End as u8,
];

pub struct Handler {
    config: Arc<Config>,
    leases: Arc<dyn LeaseStore>,
    devices: Arc<dyn DeviceStore>,
    probe: Arc<dyn LivenessProbe>,
    gateways: GatewayCache,
    readonly: bool,
}

impl Handler {
    pub fn new(
        config: Arc<Config>,
        leases: Arc<dyn LeaseStore>,
        devices: Arc<dyn DeviceStore>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        if config.server_identifier().is_unspecified() {
            warn!("No server-identifier configured, replies will carry 0.0.0.0");
        }
        Self {
            config,
            leases,
            devices,
            probe,
            gateways: GatewayCache::new(),
            readonly: false,
        }
    }

    /// Processes packets and updates pools as usual, but never persists
    /// anything and never replies.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Places every persisted lease in the pool that owns its address.
    ///
    /// Returns how many leases were loaded.
    pub async fn load_leases(&self) -> Result<usize> {
        let mut loaded = 0;
        for lease in self.leases.get_all_leases().await? {
            let pool = self
                .config
                .network(&lease.network)
                .and_then(|network| network.any_pool_for_ip(lease.ip));
            match pool {
                Some(pool) => {
                    debug!(ip = %lease.ip, network = %lease.network, "Loaded lease");
                    pool.insert_lease(lease).await;
                    loaded += 1;
                }
                None => {
                    warn!(ip = %lease.ip, network = %lease.network, "Skipping lease outside every configured pool");
                }
            }
        }
        info!(leases = loaded, "Loaded persisted leases");
        Ok(loaded)
    }

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        self.config.pool_stats(Utc::now()).await
    }

    /// Handles `packet` on its own task.
    ///
    /// A panic while handling is logged and turns into no reply; it never
    /// reaches the caller.
    pub async fn serve(self: &Arc<Self>, packet: DhcpPacket) -> Option<DhcpPacket> {
        let handler = Arc::clone(self);
        let xid = packet.xid;
        let mac = packet.mac();

        match tokio::spawn(async move { handler.dispatch(&packet).await }).await {
            Ok(reply) if self.readonly => {
                if let Some(reply) = reply {
                    debug!(xid, %mac, kind = ?reply.message_type(), "Read-only mode, reply suppressed");
                }
                None
            }
            Ok(reply) => reply,
            Err(e) if e.is_panic() => {
                error!(xid, %mac, "Recovered from panic while handling packet");
                None
            }
            Err(e) => {
                error!(xid, %mac, error = %e, "Packet task failed");
                None
            }
        }
    }

    /// Handles `packet` on the current task.
    pub async fn dispatch(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let message_type = packet.message_type()?;
        debug!(
            kind = %message_type,
            xid = packet.xid,
            mac = %packet.mac(),
            ciaddr = %packet.ciaddr,
            gateway = %packet.giaddr,
            "Received message"
        );

        match message_type {
            MessageType::Discover => self.handle_discover(packet).await,
            MessageType::Request => self.handle_request(packet).await,
            MessageType::Release => {
                self.handle_release(packet).await;
                None
            }
            MessageType::Decline => {
                self.handle_decline(packet).await;
                None
            }
            MessageType::Inform => None,
            other => {
                debug!(kind = %other, "Ignoring server-side message type");
                None
            }
        }
    }

    fn store(&self) -> Option<&dyn LeaseStore> {
        if self.readonly {
            None
        } else {
            Some(self.leases.as_ref())
        }
    }

    async fn device(&self, mac: MacAddress) -> Option<Box<dyn Device>> {
        match self.devices.get_device_by_mac(mac).await {
            Ok(device) => Some(device),
            Err(e) => {
                error!(%mac, error = %e, "Failed to look up device");
                None
            }
        }
    }

    fn in_good_standing(device: &dyn Device) -> bool {
        device.id() != 0
            && device.is_registered()
            && !device.is_blacklisted()
            && !device.is_expired()
    }

    /// Which settings branch and subnets serve `device` on `network`.
    fn is_registered(network: &Network, device: &dyn Device) -> bool {
        network.ignore_registration || Self::in_good_standing(device)
    }

    async fn handle_discover(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let mac = packet.mac();

        let position = if packet.is_relayed() {
            self.gateways.resolve(&self.config, packet.giaddr).await
        } else {
            self.config.local_network()
        };
        let Some(network) = position.and_then(|position| self.config.network_at(position)) else {
            debug!(%mac, gateway = %packet.giaddr, "No network serves this DISCOVER");
            return None;
        };

        let device = self.device(mac).await?;
        if device.is_blacklisted() {
            info!(%mac, gateway = %packet.giaddr, username = ?device.username(), "Blacklisted device asked for a lease");
        }
        let registered = Self::is_registered(network, device.as_ref());
        let now = Utc::now();

        let mut offered = None;
        for pool in network.pools(registered) {
            if let Some(lease) = pool.offer_existing(mac, now).await {
                offered = Some((pool, lease));
                break;
            }
        }
        if offered.is_none() {
            for pool in network.pools(registered) {
                if let Some(lease) = pool.allocate(mac, self.probe.as_ref(), now).await {
                    offered = Some((pool, lease));
                    break;
                }
            }
        }
        if offered.is_none() {
            for pool in network.pools(registered) {
                if let Some(lease) = pool.allocate_desperate(mac, self.probe.as_ref(), now).await {
                    offered = Some((pool, lease));
                    break;
                }
            }
        }

        let Some((pool, lease)) = offered else {
            error!(network = %network.name, registered, "No free leases available in network");
            return None;
        };

        let lease_time = pool.lease_time(requested_lease_time(packet), registered);
        info!(ip = %lease.ip, %mac, network = %network.name, registered, "Offering lease");
        Some(self.reply(packet, MessageType::Offer, lease.ip, lease_time, pool.options(registered)))
    }

    async fn handle_request(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let mac = packet.mac();
        let server_identifier = self.config.server_identifier();

        if let Some(server) = packet.server_identifier()
            && server != server_identifier
        {
            debug!(%mac, %server, "REQUEST addressed to another server");
            return None;
        }

        let requested = if packet.has_requested_ip_option() {
            packet.requested_ip()
        } else {
            Some(packet.ciaddr)
        };
        let Some(ip) = requested.filter(|ip| !ip.is_unspecified()) else {
            return Some(self.nak(packet, "missing or malformed requested address"));
        };

        let Some(device) = self.device(mac).await else {
            return Some(self.nak(packet, "device lookup failed"));
        };
        if device.is_blacklisted() {
            info!(%mac, gateway = %packet.giaddr, username = ?device.username(), "Blacklisted device renewing a lease");
        }

        let position = if packet.is_relayed() {
            let cached = self.gateways.cached(packet.giaddr).await;
            if cached.is_none() {
                return Some(self.nak(packet, "relay has not been through DISCOVER"));
            }
            cached
        } else {
            self.config.network_index_for_ip(ip)
        };
        let Some(network) = position.and_then(|position| self.config.network_at(position)) else {
            info!(%ip, %mac, "REQUEST for an address outside every network");
            return Some(self.nak(packet, "address not in any network"));
        };

        let registered = Self::is_registered(network, device.as_ref());
        let Some(pool) = network.pool_for_ip(ip, registered) else {
            info!(%ip, %mac, network = %network.name, registered, "REQUEST for an address outside the client's pools");
            return Some(self.nak(packet, "address not in a pool for this client"));
        };

        let lease_time = pool.lease_time(requested_lease_time(packet), registered);
        let hostname = packet.hostname().map(sanitize_hostname);
        let lease = match pool
            .commit(ip, mac, hostname, lease_time, self.store(), Utc::now())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                info!(%ip, %mac, network = %network.name, registered, error = %e, "Refusing REQUEST");
                return Some(self.nak(packet, "lease cannot be committed"));
            }
        };

        info!(
            ip = %lease.ip,
            %mac,
            network = %network.name,
            registered,
            duration = lease_time.as_secs(),
            hostname = lease.hostname.as_deref().unwrap_or(""),
            "Acknowledging request"
        );

        if Self::in_good_standing(device.as_ref()) && !self.readonly {
            self.touch(device).await;
        }

        Some(self.reply(packet, MessageType::Ack, lease.ip, lease_time, pool.options(registered)))
    }

    /// Records that a registered device was seen. Failures are logged only.
    async fn touch(&self, mut device: Box<dyn Device>) {
        device.set_last_seen(Utc::now());
        if let Err(e) = device.save().await {
            error!(mac = %device.mac(), error = %e, "Failed to update device last seen");
        }
    }

    fn owning_pool(&self, ip: Ipv4Addr) -> Option<(&Network, &Pool)> {
        let network = self.config.network_for_ip(ip)?;
        let pool = network.any_pool_for_ip(ip)?;
        Some((network, pool))
    }

    async fn handle_release(&self, packet: &DhcpPacket) {
        let mac = packet.mac();
        let ip = packet.ciaddr;
        if ip.is_unspecified() {
            return;
        }

        let Some((network, pool)) = self.owning_pool(ip) else {
            info!(%ip, %mac, "RELEASE for an address outside every pool");
            return;
        };

        if pool.release(ip, mac, self.store()).await {
            info!(%ip, %mac, network = %network.name, "Releasing lease");
        } else {
            info!(%ip, %mac, network = %network.name, "Client tried to release a lease not belonging to it");
        }
    }

    async fn handle_decline(&self, packet: &DhcpPacket) {
        let mac = packet.mac();
        let ip = packet.requested_ip().unwrap_or(packet.ciaddr);
        if ip.is_unspecified() {
            return;
        }

        let Some((network, pool)) = self.owning_pool(ip) else {
            info!(%ip, %mac, "DECLINE for an address outside every pool");
            return;
        };

        if pool.decline(ip, mac, self.store()).await {
            warn!(%ip, %mac, network = %network.name, "Client declined address, abandoning it");
        } else {
            info!(%ip, %mac, network = %network.name, "Client tried to decline a lease not belonging to it");
        }
    }

    fn reply(
        &self,
        request: &DhcpPacket,
        kind: MessageType,
        ip: Ipv4Addr,
        lease_time: Duration,
        configured: &BTreeMap<u8, Vec<u8>>,
    ) -> DhcpPacket {
        let server_identifier = self.config.server_identifier();
        let seconds = u32::try_from(lease_time.as_secs()).unwrap_or(u32::MAX);

        let mut options = vec![
            DhcpOption::ServerIdentifier(server_identifier),
            DhcpOption::LeaseTime(seconds),
        ];
        options.extend(select_options(
            configured,
            request.parameter_request_list(),
        ));
        if let Some(info) = request.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(info.to_vec()));
        }

        DhcpPacket::create_reply(request, kind, ip, server_identifier, options)
    }

    fn nak(&self, request: &DhcpPacket, reason: &str) -> DhcpPacket {
        let server_identifier = self.config.server_identifier();
        warn!(mac = %request.mac(), xid = request.xid, reason, "Sending NAK");

        let mut options = vec![DhcpOption::ServerIdentifier(server_identifier)];
        if let Some(info) = request.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(info.to_vec()));
        }
        DhcpPacket::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server_identifier,
            options,
        )
    }
}

fn requested_lease_time(packet: &DhcpPacket) -> Duration {
    Duration::from_secs(u64::from(packet.requested_lease_time().unwrap_or(0)))
}

/// Configured options in the client's requested order, or all of them in
/// code order when the client sent no list.
fn select_options(
    configured: &BTreeMap<u8, Vec<u8>>,
    requested: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let option = |code: &u8| {
        if RESERVED_CODES.contains(code) {
            return None;
        }
        configured
            .get(code)
            .map(|value| DhcpOption::Raw(*code, value.clone()))
    };

    match requested {
        Some(order) => {
            let mut seen = [false; 256];
            order
                .iter()
                .filter(|code| !std::mem::replace(&mut seen[usize::from(**code)], true))
                .filter_map(option)
                .collect()
        }
        None => configured.keys().filter_map(option).collect(),
    }
}
