//! The lease record shared by pools, stores and the protocol handler.
//!
//! A lease binds one address to one client for a window of time. Its
//! lifecycle is driven entirely by timestamps:
//!
//! - **offered**: handed out in an OFFER, `end` a few seconds ahead, not
//!   persisted (`id == 0` for a brand new address)
//! - **committed**: confirmed by REQUEST/ACK, persisted, `end` one lease
//!   time ahead
//! - **released**: `start == end ==` [`released_at`], free immediately
//! - **abandoned**: the address answered a liveness probe or the client
//!   declined it; skipped by normal allocation
//!
//! Nothing ever deletes a lease from a pool; a lease whose `end` has passed
//! is simply reusable.

use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

/// How long an OFFER reserves an address while waiting for the REQUEST.
pub const OFFER_WINDOW_SECONDS: i64 = 30;

/// Slack added to committed leases to absorb client clock drift.
pub const CLOCK_DRIFT_SECONDS: i64 = 10;

/// Longest hostname kept from a client's hostname option.
const MAX_HOSTNAME_LEN: usize = 63;

/// Timestamp a released or declined lease collapses to (one second past the epoch).
pub fn released_at() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(1)
}

/// Keeps only characters valid in a host label and bounds the length.
pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LEN)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Store identifier; 0 until the lease has been persisted once.
    pub id: i64,
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddress>,
    /// Name of the network whose pool owns the address.
    pub network: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub is_abandoned: bool,
    /// True between an OFFER and the matching REQUEST; never persisted.
    #[serde(skip)]
    pub offered: bool,
    #[serde(default)]
    pub registered: bool,
}

impl Lease {
    /// A never-used lease for `ip`, already expired.
    pub fn new(ip: Ipv4Addr, network: impl Into<String>, registered: bool) -> Self {
        Self {
            id: 0,
            ip,
            mac: None,
            network: network.into(),
            start: DateTime::<Utc>::UNIX_EPOCH,
            end: DateTime::<Utc>::UNIX_EPOCH,
            hostname: None,
            is_abandoned: false,
            offered: false,
            registered,
        }
    }

    /// Whether the address may be handed out: never persisted, or past its end.
    pub fn is_free(&self) -> bool {
        self.is_free_at(Utc::now())
    }

    pub fn is_free_at(&self, now: DateTime<Utc>) -> bool {
        self.id == 0 || now > self.end
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end < now
    }

    /// Whether the lease currently holds its address (offered or committed).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }

    /// Reserves the lease for `mac` for the offer window.
    pub fn offer_to(&mut self, mac: MacAddress, now: DateTime<Utc>) {
        if self.mac != Some(mac) {
            self.hostname = None;
        }
        self.mac = Some(mac);
        self.offered = true;
        self.start = now;
        self.end = now + TimeDelta::seconds(OFFER_WINDOW_SECONDS);
    }

    /// Confirms the lease for `duration` starting at `now`.
    pub fn commit(&mut self, duration: TimeDelta, hostname: Option<String>, now: DateTime<Utc>) {
        self.start = now;
        self.end = duration
            .checked_add(&TimeDelta::seconds(CLOCK_DRIFT_SECONDS))
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.offered = false;
        if hostname.is_some() {
            self.hostname = hostname;
        }
    }

    /// Collapses the lease window so the address is free immediately.
    pub fn release(&mut self) {
        self.start = released_at();
        self.end = released_at();
        self.offered = false;
    }

    /// Marks the address unusable and releases the window.
    pub fn abandon(&mut self) {
        self.release();
        self.is_abandoned = true;
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.end - Utc::now()).num_seconds().max(0)
    }
}
