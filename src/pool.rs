//! Address pools and lease allocation.
//!
//! A [`Pool`] owns an inclusive address range and a map of every lease it
//! has ever seen for that range. All access to the map goes through one
//! per-pool mutex, so two DISCOVERs racing on the same pool can never be
//! offered the same address, and a REQUEST commit is atomic with respect to
//! concurrent allocation. The liveness probe runs with the lock released:
//! the candidate address is reserved first, probed, then either kept or
//! marked abandoned.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::lease::{Lease, OFFER_WINDOW_SECONDS};
use crate::mac::MacAddress;
use crate::probe::LivenessProbe;
use crate::settings::{EffectiveSettings, Resolved, Settings, to_delta};
use crate::store::{LeaseStore, save_lease};

/// Why a REQUEST could not be committed.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("no lease exists for {0}")]
    NoLease(Ipv4Addr),

    #[error("lease for {ip} belongs to {owner}")]
    NotOwner { ip: Ipv4Addr, owner: MacAddress },

    #[error("lease for {0} is abandoned")]
    Abandoned(Ipv4Addr),

    #[error("failed to persist lease: {0}")]
    Store(#[source] Error),
}

#[derive(Debug, Default)]
struct PoolState {
    leases: BTreeMap<Ipv4Addr, Lease>,
    /// Offset from the range start of the next address never handed out.
    cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub network: String,
    pub subnet: Ipv4Net,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub registered: bool,
    pub total: u64,
    pub active: u64,
    pub claimed: u64,
    pub abandoned: u64,
    pub free: u64,
}

#[derive(Debug)]
pub struct Pool {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub settings: Settings,
    /// Line of the configuration file that declared the pool.
    pub line: usize,
    pub(crate) subnet: Ipv4Net,
    pub(crate) network: String,
    pub(crate) registered: bool,
    pub(crate) resolved: Resolved,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        subnet: Ipv4Net,
        settings: Settings,
        line: usize,
    ) -> Self {
        Self {
            range_start,
            range_end,
            settings,
            line,
            subnet,
            network: String::new(),
            registered: false,
            resolved: Resolved::default(),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Whether the pool serves registered clients.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn includes(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.range_start)..=u32::from(self.range_end)).contains(&u32::from(ip))
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.range_end)).saturating_sub(u64::from(u32::from(self.range_start)))
            + 1
    }

    pub fn overlaps(&self, other: &Pool) -> bool {
        u32::from(self.range_start) <= u32::from(other.range_end)
            && u32::from(other.range_start) <= u32::from(self.range_end)
    }

    fn address_at(&self, offset: u64) -> Option<Ipv4Addr> {
        let ip = u64::from(u32::from(self.range_start)) + offset;
        if offset >= self.size() {
            return None;
        }
        u32::try_from(ip).ok().map(Ipv4Addr::from)
    }

    pub fn effective(&self, registered: bool) -> &EffectiveSettings {
        self.resolved.get(registered)
    }

    /// Lease duration for a client asking for `requested` (zero for no preference).
    pub fn lease_time(&self, requested: Duration, registered: bool) -> Duration {
        self.effective(registered).lease_time(requested)
    }

    pub fn options(&self, registered: bool) -> &BTreeMap<u8, Vec<u8>> {
        &self.effective(registered).options
    }

    /// Places a persisted lease in the pool's map, replacing any entry for its address.
    pub async fn insert_lease(&self, lease: Lease) {
        let mut state = self.state.lock().await;
        state.leases.insert(lease.ip, lease);
    }

    pub async fn lease(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.state.lock().await.leases.get(&ip).cloned()
    }

    pub async fn leases(&self) -> Vec<Lease> {
        self.state.lock().await.leases.values().cloned().collect()
    }

    /// Re-offers the lease already bound to `mac`, if the pool has one.
    ///
    /// A lease still active beyond the offer window keeps its window.
    pub async fn offer_existing(&self, mac: MacAddress, now: DateTime<Utc>) -> Option<Lease> {
        let mut state = self.state.lock().await;
        let lease = state
            .leases
            .values_mut()
            .find(|lease| lease.mac == Some(mac) && !lease.is_abandoned)?;

        if !lease.is_active_at(now + TimeDelta::seconds(OFFER_WINDOW_SECONDS)) {
            lease.offer_to(mac, now);
        }
        Some(lease.clone())
    }

    /// Offers a free address to `mac`.
    ///
    /// Expired leases past their grace period are reused first; otherwise the
    /// range is scanned for an address never handed out. Returns `None` when
    /// neither finds anything.
    pub async fn allocate(
        &self,
        mac: MacAddress,
        probe: &dyn LivenessProbe,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        {
            let mut state = self.state.lock().await;
            if let Some(lease) = state
                .leases
                .values_mut()
                .find(|lease| self.is_reusable(lease, now))
            {
                lease.offer_to(mac, now);
                lease.is_abandoned = false;
                debug!(ip = %lease.ip, %mac, "Reusing expired lease");
                return Some(lease.clone());
            }
        }

        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                let ip = self.next_unleased(&mut state)?;
                let mut lease = Lease::new(ip, self.network.as_str(), self.registered);
                lease.offer_to(mac, now);
                state.leases.insert(ip, lease.clone());
                lease
            };

            if !probe.is_in_use(candidate.ip).await {
                return Some(candidate);
            }

            warn!(ip = %candidate.ip, network = %self.network, "Address answered liveness probe, abandoning");
            let mut state = self.state.lock().await;
            if let Some(lease) = state.leases.get_mut(&candidate.ip)
                && lease.id == 0
                && lease.mac == Some(mac)
            {
                lease.abandon();
                lease.mac = None;
            }
        }
    }

    /// Last resort once [`Pool::allocate`] finds nothing.
    ///
    /// Takes the longest-expired lease regardless of the grace period, or
    /// else reclaims the first abandoned address that no longer answers.
    pub async fn allocate_desperate(
        &self,
        mac: MacAddress,
        probe: &dyn LivenessProbe,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        let abandoned: Vec<Ipv4Addr> = {
            let mut state = self.state.lock().await;
            if let Some(lease) = state
                .leases
                .values_mut()
                .filter(|lease| !lease.is_abandoned && !lease.is_active_at(now))
                .min_by_key(|lease| lease.end)
            {
                lease.offer_to(mac, now);
                info!(ip = %lease.ip, %mac, "Reusing oldest expired lease");
                return Some(lease.clone());
            }

            state
                .leases
                .values()
                .filter(|lease| lease.is_abandoned)
                .map(|lease| lease.ip)
                .collect()
        };

        for ip in abandoned {
            if probe.is_in_use(ip).await {
                continue;
            }

            let mut state = self.state.lock().await;
            if let Some(lease) = state.leases.get_mut(&ip)
                && lease.is_abandoned
            {
                lease.is_abandoned = false;
                lease.offer_to(mac, now);
                info!(%ip, %mac, "Reclaimed abandoned address");
                return Some(lease.clone());
            }
        }

        None
    }

    /// Commits the lease on `ip` for `mac` and persists it through `store`.
    ///
    /// The in-memory lease only changes once the store accepted the write.
    /// Without a store (read-only mode) nothing is persisted.
    pub async fn commit(
        &self,
        ip: Ipv4Addr,
        mac: MacAddress,
        hostname: Option<String>,
        duration: Duration,
        store: Option<&dyn LeaseStore>,
        now: DateTime<Utc>,
    ) -> Result<Lease, CommitError> {
        let mut state = self.state.lock().await;
        let Some(existing) = state.leases.get(&ip) else {
            return Err(CommitError::NoLease(ip));
        };
        let Some(owner) = existing.mac else {
            return Err(CommitError::NoLease(ip));
        };
        if owner != mac {
            return Err(CommitError::NotOwner { ip, owner });
        }
        if existing.is_abandoned {
            return Err(CommitError::Abandoned(ip));
        }

        let mut lease = existing.clone();
        lease.commit(to_delta(duration), hostname, now);
        if let Some(store) = store {
            lease.id = save_lease(store, &lease).await.map_err(CommitError::Store)?;
        }

        state.leases.insert(ip, lease.clone());
        Ok(lease)
    }

    /// Collapses the window of `mac`'s lease on `ip`. Returns whether it matched.
    pub async fn release(
        &self,
        ip: Ipv4Addr,
        mac: MacAddress,
        store: Option<&dyn LeaseStore>,
    ) -> bool {
        self.finish(ip, mac, store, Lease::release).await
    }

    /// Marks `mac`'s lease on `ip` abandoned. Returns whether it matched.
    pub async fn decline(
        &self,
        ip: Ipv4Addr,
        mac: MacAddress,
        store: Option<&dyn LeaseStore>,
    ) -> bool {
        self.finish(ip, mac, store, Lease::abandon).await
    }

    async fn finish(
        &self,
        ip: Ipv4Addr,
        mac: MacAddress,
        store: Option<&dyn LeaseStore>,
        apply: fn(&mut Lease),
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(lease) = state.leases.get_mut(&ip) else {
            return false;
        };
        if lease.mac != Some(mac) {
            return false;
        }

        apply(lease);
        if let Some(store) = store {
            match save_lease(store, lease).await {
                Ok(id) => lease.id = id,
                Err(e) => warn!(%ip, %mac, error = %e, "Failed to persist lease"),
            }
        }
        true
    }

    /// Counts leases by state.
    ///
    /// Expired leases still inside their free-lease-after grace period are
    /// claimed rather than free.
    pub async fn stats(&self, now: DateTime<Utc>) -> PoolStats {
        let state = self.state.lock().await;
        let mut active = 0;
        let mut claimed = 0;
        let mut abandoned = 0;
        for lease in state.leases.values() {
            if lease.is_abandoned {
                abandoned += 1;
            } else if lease.is_active_at(now) {
                active += 1;
            } else if !lease.offered && !self.is_reusable(lease, now) {
                claimed += 1;
            }
        }

        let total = self.size();
        PoolStats {
            network: self.network.clone(),
            subnet: self.subnet,
            range_start: self.range_start,
            range_end: self.range_end,
            registered: self.registered,
            total,
            active,
            claimed,
            abandoned,
            free: total.saturating_sub(active + claimed + abandoned),
        }
    }

    fn is_reusable(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        if lease.is_abandoned || lease.is_active_at(now) {
            return false;
        }
        if lease.offered {
            return true;
        }
        let grace = self.resolved.get(lease.registered).free_lease_after_delta();
        lease
            .end
            .checked_add_signed(grace)
            .is_some_and(|free_at| now > free_at)
    }

    fn next_unleased(&self, state: &mut PoolState) -> Option<Ipv4Addr> {
        while let Some(ip) = self.address_at(state.cursor) {
            state.cursor += 1;
            if !state.leases.contains_key(&ip) {
                return Some(ip);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DisabledProbe, StaticProbe};
    use crate::store::JsonLeaseStore;

    const M1: MacAddress = MacAddress::new([0xaa, 0, 0, 0, 0, 1]);
    const M2: MacAddress = MacAddress::new([0xaa, 0, 0, 0, 0, 2]);
    const M3: MacAddress = MacAddress::new([0xaa, 0, 0, 0, 0, 3]);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 1, last)
    }

    fn pool(start: u8, end: u8) -> Pool {
        let subnet: Ipv4Net = "10.0.1.0/24".parse().unwrap();
        let mut pool = Pool::new(ip(start), ip(end), subnet, Settings::default(), 1);
        pool.network = "campus".to_string();
        pool.registered = true;
        pool
    }

    fn grace_pool(start: u8, end: u8, grace: Duration) -> Pool {
        let mut pool = pool(start, end);
        let settings = Settings {
            free_lease_after: Some(grace),
            ..Default::default()
        };
        pool.resolved = Resolved::build(|_| [&settings]);
        pool
    }

    #[test]
    fn test_includes_and_size() {
        let pool = pool(10, 200);
        assert!(pool.includes(ip(10)));
        assert!(pool.includes(ip(200)));
        assert!(!pool.includes(ip(9)));
        assert!(!pool.includes(ip(201)));
        assert_eq!(pool.size(), 191);
        assert!(pool.overlaps(&self::pool(200, 210)));
        assert!(!pool.overlaps(&self::pool(201, 210)));
    }

    #[tokio::test]
    async fn test_sequential_allocation() {
        let pool = pool(10, 200);
        let now = Utc::now();

        let first = pool.allocate(M1, &DisabledProbe, now).await.unwrap();
        let second = pool.allocate(M2, &DisabledProbe, now).await.unwrap();
        assert_eq!(first.ip, ip(10));
        assert_eq!(second.ip, ip(11));
        assert!(first.offered);
        assert_eq!(first.id, 0);
        assert_eq!(first.network, "campus");
        assert!(first.registered);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let pool = pool(10, 12);
        let now = Utc::now();
        for mac in [M1, M2, M3] {
            assert!(pool.allocate(mac, &DisabledProbe, now).await.is_some());
        }
        let extra = MacAddress::new([0xbb, 0, 0, 0, 0, 1]);
        assert!(pool.allocate(extra, &DisabledProbe, now).await.is_none());
        assert!(pool.allocate_desperate(extra, &DisabledProbe, now).await.is_none());
    }

    #[tokio::test]
    async fn test_lapsed_offer_is_reused() {
        let pool = pool(10, 10);
        let now = Utc::now();
        pool.allocate(M1, &DisabledProbe, now).await.unwrap();

        let later = now + TimeDelta::seconds(OFFER_WINDOW_SECONDS + 1);
        let lease = pool.allocate(M2, &DisabledProbe, later).await.unwrap();
        assert_eq!(lease.ip, ip(10));
        assert_eq!(lease.mac, Some(M2));
    }

    #[tokio::test]
    async fn test_grace_period_respected() {
        let pool = grace_pool(10, 10, Duration::from_secs(3600));
        let now = Utc::now();
        let store = JsonLeaseStore::in_memory();

        pool.allocate(M1, &DisabledProbe, now).await.unwrap();
        pool.commit(ip(10), M1, None, Duration::from_secs(60), Some(&store), now)
            .await
            .unwrap();

        let expired = now + TimeDelta::seconds(120);
        assert!(pool.allocate(M2, &DisabledProbe, expired).await.is_none());

        let desperate = pool.allocate_desperate(M2, &DisabledProbe, expired).await;
        assert_eq!(desperate.map(|l| l.ip), Some(ip(10)));
    }

    #[tokio::test]
    async fn test_grace_period_elapsed() {
        let pool = grace_pool(10, 10, Duration::from_secs(60));
        let now = Utc::now();

        pool.allocate(M1, &DisabledProbe, now).await.unwrap();
        pool.commit(ip(10), M1, None, Duration::from_secs(60), None, now)
            .await
            .unwrap();

        let later = now + TimeDelta::seconds(60 + 10 + 61);
        let lease = pool.allocate(M2, &DisabledProbe, later).await.unwrap();
        assert_eq!(lease.ip, ip(10));
    }

    #[tokio::test]
    async fn test_probe_marks_abandoned() {
        let pool = pool(10, 12);
        let probe = StaticProbe::new([ip(10)]);
        let now = Utc::now();

        let lease = pool.allocate(M1, &probe, now).await.unwrap();
        assert_eq!(lease.ip, ip(11));

        let abandoned = pool.lease(ip(10)).await.unwrap();
        assert!(abandoned.is_abandoned);
        assert_eq!(abandoned.mac, None);
    }

    #[tokio::test]
    async fn test_desperate_reclaims_quiet_abandoned() {
        let pool = pool(10, 10);
        let probe = StaticProbe::new([ip(10)]);
        let now = Utc::now();

        assert!(pool.allocate(M1, &probe, now).await.is_none());
        assert!(pool.allocate_desperate(M1, &probe, now).await.is_none());

        probe.set_in_use(ip(10), false);
        let lease = pool.allocate_desperate(M1, &probe, now).await.unwrap();
        assert_eq!(lease.ip, ip(10));
        assert!(!lease.is_abandoned);
        assert_eq!(lease.mac, Some(M1));
    }

    #[tokio::test]
    async fn test_offer_existing() {
        let pool = pool(10, 20);
        let now = Utc::now();
        let offered = pool.allocate(M1, &DisabledProbe, now).await.unwrap();

        let again = pool.offer_existing(M1, now).await.unwrap();
        assert_eq!(again.ip, offered.ip);
        assert!(pool.offer_existing(M2, now).await.is_none());
    }

    #[tokio::test]
    async fn test_offer_existing_keeps_committed_window() {
        let pool = pool(10, 20);
        let now = Utc::now();
        pool.allocate(M1, &DisabledProbe, now).await.unwrap();
        let committed = pool
            .commit(ip(10), M1, None, Duration::from_secs(3600), None, now)
            .await
            .unwrap();

        let again = pool.offer_existing(M1, now).await.unwrap();
        assert_eq!(again.end, committed.end);
        assert!(!again.offered);
    }

    #[tokio::test]
    async fn test_commit_checks_owner() {
        let pool = pool(10, 20);
        let now = Utc::now();
        pool.allocate(M1, &DisabledProbe, now).await.unwrap();

        let err = pool
            .commit(ip(10), M2, None, Duration::ZERO, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::NotOwner { owner, .. } if owner == M1));

        let err = pool
            .commit(ip(15), M1, None, Duration::ZERO, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::NoLease(_)));
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let pool = pool(10, 20);
        let store = JsonLeaseStore::in_memory();
        let now = Utc::now();
        pool.allocate(M1, &DisabledProbe, now).await.unwrap();

        let lease = pool
            .commit(
                ip(10),
                M1,
                Some("laptop".to_string()),
                Duration::from_secs(3600),
                Some(&store),
                now,
            )
            .await
            .unwrap();
        assert_eq!(lease.id, 1);
        assert!(!lease.offered);
        assert_eq!(lease.hostname.as_deref(), Some("laptop"));

        let stored = store.get_lease_by_ip(ip(10)).await.unwrap().unwrap();
        assert_eq!(stored.end, lease.end);

        // Renewal updates the same record.
        let renewed = pool
            .commit(ip(10), M1, None, Duration::from_secs(7200), Some(&store), now)
            .await
            .unwrap();
        assert_eq!(renewed.id, 1);
        assert_eq!(store.get_all_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_and_decline() {
        let pool = pool(10, 20);
        let store = JsonLeaseStore::in_memory();
        let now = Utc::now();
        pool.allocate(M1, &DisabledProbe, now).await.unwrap();
        pool.commit(ip(10), M1, None, Duration::from_secs(3600), Some(&store), now)
            .await
            .unwrap();

        assert!(!pool.release(ip(10), M2, Some(&store)).await);
        assert!(pool.release(ip(10), M1, Some(&store)).await);
        let lease = pool.lease(ip(10)).await.unwrap();
        assert!(lease.is_free());
        assert!(lease.is_expired());

        assert!(pool.decline(ip(10), M1, Some(&store)).await);
        let stored = store.get_lease_by_ip(ip(10)).await.unwrap().unwrap();
        assert!(stored.is_abandoned);

        // Declined addresses are skipped by normal allocation.
        let next = pool.allocate(M2, &DisabledProbe, now).await.unwrap();
        assert_eq!(next.ip, ip(11));
    }

    #[tokio::test]
    async fn test_stats() {
        let pool = grace_pool(10, 19, Duration::from_secs(3600));
        let probe = StaticProbe::new([ip(11)]);
        let now = Utc::now();

        pool.allocate(M1, &probe, now).await.unwrap();
        pool.allocate(M2, &probe, now).await.unwrap();
        pool.allocate(M3, &probe, now).await.unwrap();
        pool.commit(ip(10), M1, None, Duration::from_secs(3600), None, now)
            .await
            .unwrap();
        pool.commit(ip(13), M3, None, Duration::from_secs(60), None, now)
            .await
            .unwrap();

        // 10 committed, 11 abandoned, 12 offered, 13 expired within grace.
        let later = now + TimeDelta::seconds(600);
        let stats = pool.stats(later).await;
        assert_eq!(stats.total, 10);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.free, 7);

        let stats = pool.stats(now).await;
        assert_eq!(stats.active, 3);
        assert_eq!(stats.claimed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_distinct() {
        let pool = std::sync::Arc::new(pool(1, 100));
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..50u8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mac = MacAddress::new([0xcc, 0, 0, 0, 0, i]);
                pool.allocate(mac, &DisabledProbe, now).await.map(|l| l.ip)
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let ip = handle.await.unwrap().unwrap();
            assert!(seen.insert(ip), "{ip} offered twice");
        }
    }
}
