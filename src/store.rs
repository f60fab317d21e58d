//! Lease persistence.
//!
//! The protocol handler only talks to the [`LeaseStore`] trait; where leases
//! actually live is up to the implementation. [`JsonLeaseStore`] keeps them
//! in memory and writes the whole set through to a JSON file on every
//! mutation, which is what the bundled binary uses.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::mac::MacAddress;

/// Filter for [`LeaseStore::search_leases`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LeaseQuery {
    pub network: Option<String>,
    pub mac: Option<MacAddress>,
    pub hostname_contains: Option<String>,
    pub registered: Option<bool>,
    /// Only leases whose window contains this instant.
    pub active_at: Option<DateTime<Utc>>,
}

impl LeaseQuery {
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn hostname_contains(mut self, fragment: impl Into<String>) -> Self {
        self.hostname_contains = Some(fragment.into());
        self
    }

    pub fn registered(mut self, registered: bool) -> Self {
        self.registered = Some(registered);
        self
    }

    pub fn active_at(mut self, instant: DateTime<Utc>) -> Self {
        self.active_at = Some(instant);
        self
    }

    pub fn matches(&self, lease: &Lease) -> bool {
        self.network
            .as_ref()
            .is_none_or(|network| lease.network.eq_ignore_ascii_case(network))
            && self.mac.is_none_or(|mac| lease.mac == Some(mac))
            && self.hostname_contains.as_ref().is_none_or(|fragment| {
                lease
                    .hostname
                    .as_ref()
                    .is_some_and(|hostname| hostname.contains(fragment.as_str()))
            })
            && self.registered.is_none_or(|registered| lease.registered == registered)
            && self
                .active_at
                .is_none_or(|instant| lease.start <= instant && instant < lease.end)
    }
}

/// Persistence capability for leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get_all_leases(&self) -> Result<Vec<Lease>>;

    async fn get_lease_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>>;

    /// The lease for `mac` with the latest start.
    async fn get_recent_lease_by_mac(&self, mac: MacAddress) -> Result<Option<Lease>>;

    async fn get_all_leases_by_mac(&self, mac: MacAddress) -> Result<Vec<Lease>>;

    /// Stores a new lease and returns the identifier assigned to it.
    async fn create_lease(&self, lease: &Lease) -> Result<i64>;

    async fn update_lease(&self, lease: &Lease) -> Result<()>;

    async fn delete_lease(&self, lease: &Lease) -> Result<()>;

    async fn search_leases(&self, query: &LeaseQuery) -> Result<Vec<Lease>>;
}

/// Writes `lease` through `store`, creating it when it has never been saved.
///
/// Returns the lease's identifier afterwards.
pub async fn save_lease(store: &dyn LeaseStore, lease: &Lease) -> Result<i64> {
    if lease.id == 0 {
        store.create_lease(lease).await
    } else {
        store.update_lease(lease).await?;
        Ok(lease.id)
    }
}

/// On-disk format of [`JsonLeaseStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LeaseFile {
    next_id: i64,
    leases: BTreeMap<i64, Lease>,
}

/// Lease store backed by a JSON file, or purely in memory without a path.
#[derive(Debug)]
pub struct JsonLeaseStore {
    state: Arc<RwLock<LeaseFile>>,
    path: Option<PathBuf>,
    save_lock: Arc<Mutex<()>>,
}

impl JsonLeaseStore {
    /// Opens the store at `path`, loading existing leases if the file exists.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            LeaseFile::default()
        };

        debug!(path = %path.display(), leases = file.leases.len(), "Opened lease store");

        Ok(Self {
            state: Arc::new(RwLock::new(file)),
            path: Some(path),
            save_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(LeaseFile::default())),
            path: None,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn persist(&self, snapshot: &LeaseFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Applies `change` and writes the result through to disk.
    ///
    /// Mutations are serialized on `save_lock` from the change until the file
    /// is written, so the file always reflects the latest change. A failed
    /// write restores the previous in-memory state.
    async fn mutate<T: Send>(
        &self,
        change: impl FnOnce(&mut LeaseFile) -> Result<T> + Send,
    ) -> Result<T> {
        let _lock = self.save_lock.lock().await;
        let mut state = self.state.write().await;
        let previous = state.clone();
        let value = change(&mut *state)?;
        let snapshot = state.clone();
        drop(state);

        if let Err(e) = self.persist(&snapshot).await {
            *self.state.write().await = previous;
            return Err(e);
        }
        Ok(value)
    }

    async fn filtered(&self, keep: impl Fn(&Lease) -> bool) -> Vec<Lease> {
        let state = self.state.read().await;
        state
            .leases
            .values()
            .filter(|lease| keep(lease))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LeaseStore for JsonLeaseStore {
    async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        Ok(self.filtered(|_| true).await)
    }

    async fn get_lease_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state.leases.values().find(|lease| lease.ip == ip).cloned())
    }

    async fn get_recent_lease_by_mac(&self, mac: MacAddress) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state
            .leases
            .values()
            .filter(|lease| lease.mac == Some(mac))
            .max_by_key(|lease| lease.start)
            .cloned())
    }

    async fn get_all_leases_by_mac(&self, mac: MacAddress) -> Result<Vec<Lease>> {
        Ok(self.filtered(|lease| lease.mac == Some(mac)).await)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<i64> {
        self.mutate(|state| {
            if state.leases.values().any(|existing| existing.ip == lease.ip) {
                return Err(Error::Store(format!(
                    "a lease for {} already exists",
                    lease.ip
                )));
            }

            state.next_id += 1;
            let id = state.next_id;
            let mut stored = lease.clone();
            stored.id = id;
            stored.offered = false;
            state.leases.insert(id, stored);
            Ok(id)
        })
        .await
    }

    async fn update_lease(&self, lease: &Lease) -> Result<()> {
        self.mutate(|state| {
            let Some(stored) = state.leases.get_mut(&lease.id) else {
                return Err(Error::Store(format!("lease {} does not exist", lease.id)));
            };
            *stored = lease.clone();
            stored.offered = false;
            Ok(())
        })
        .await
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<()> {
        self.mutate(|state| {
            if state.leases.remove(&lease.id).is_none() {
                return Err(Error::Store(format!("lease {} does not exist", lease.id)));
            }
            Ok(())
        })
        .await
    }

    async fn search_leases(&self, query: &LeaseQuery) -> Result<Vec<Lease>> {
        Ok(self.filtered(|lease| query.matches(lease)).await)
    }
}
