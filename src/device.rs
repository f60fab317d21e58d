//! Device registry capability.
//!
//! The lease server only needs a handful of facts about a client: whether it
//! is registered, blacklisted or expired, and a way to record that it was
//! seen. [`DeviceStore`] and [`Device`] are the seam; [`JsonDeviceStore`] is
//! a file-backed implementation for standalone deployments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::mac::MacAddress;

#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> i64;
    fn mac(&self) -> MacAddress;
    fn username(&self) -> Option<&str>;
    fn is_blacklisted(&self) -> bool;
    fn is_expired(&self) -> bool;
    /// Known, marked registered, not blacklisted and not expired.
    fn is_registered(&self) -> bool;
    fn set_last_seen(&mut self, when: DateTime<Utc>);
    async fn save(&self) -> Result<()>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Looks up a device; unknown MACs yield an unregistered device.
    async fn get_device_by_mac(&self, mac: MacAddress) -> Result<Box<dyn Device>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub id: i64,
    pub mac: MacAddress,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn unknown(mac: MacAddress) -> Self {
        Self {
            id: 0,
            mac,
            username: None,
            registered: false,
            blacklisted: false,
            expires: None,
            last_seen: None,
        }
    }

    pub fn registered(id: i64, mac: MacAddress, username: impl Into<String>) -> Self {
        Self {
            id,
            registered: true,
            username: Some(username.into()),
            ..Self::unknown(mac)
        }
    }
}

#[derive(Debug)]
struct Registry {
    path: Option<PathBuf>,
    records: RwLock<BTreeMap<MacAddress, DeviceRecord>>,
    save_lock: Mutex<()>,
}

impl Registry {
    async fn upsert(&self, record: &DeviceRecord) -> Result<()> {
        let _lock = self.save_lock.lock().await;
        let mut records = self.records.write().await;
        let mut record = record.clone();
        if record.id == 0 {
            record.id = records.values().map(|r| r.id).max().unwrap_or(0) + 1;
        }
        records.insert(record.mac, record);

        let snapshot: Vec<DeviceRecord> = records.values().cloned().collect();
        drop(records);

        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Device registry backed by a JSON list of [`DeviceRecord`]s.
#[derive(Debug, Clone)]
pub struct JsonDeviceStore {
    registry: Arc<Registry>,
}

impl JsonDeviceStore {
    /// Opens the registry at `path`; a missing file is an empty registry.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let list: Vec<DeviceRecord> = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };

        debug!(path = %path.display(), devices = list.len(), "Opened device registry");
        Ok(Self::with_records(Some(path), list))
    }

    pub fn in_memory(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self::with_records(None, records)
    }

    fn with_records(path: Option<PathBuf>, records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.mac, r)).collect();
        Self {
            registry: Arc::new(Registry {
                path,
                records: RwLock::new(records),
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub async fn record(&self, mac: MacAddress) -> Option<DeviceRecord> {
        self.registry.records.read().await.get(&mac).cloned()
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn get_device_by_mac(&self, mac: MacAddress) -> Result<Box<dyn Device>> {
        let record = self
            .record(mac)
            .await
            .unwrap_or_else(|| DeviceRecord::unknown(mac));
        Ok(Box::new(JsonDevice {
            record,
            registry: self.registry.clone(),
        }))
    }
}

struct JsonDevice {
    record: DeviceRecord,
    registry: Arc<Registry>,
}

#[async_trait]
impl Device for JsonDevice {
    fn id(&self) -> i64 {
        self.record.id
    }

    fn mac(&self) -> MacAddress {
        self.record.mac
    }

    fn username(&self) -> Option<&str> {
        self.record.username.as_deref()
    }

    fn is_blacklisted(&self) -> bool {
        self.record.blacklisted
    }

    fn is_expired(&self) -> bool {
        self.record.expires.is_some_and(|expires| expires < Utc::now())
    }

    fn is_registered(&self) -> bool {
        self.record.id != 0
            && self.record.registered
            && !self.record.blacklisted
            && !self.is_expired()
    }

    fn set_last_seen(&mut self, when: DateTime<Utc>) {
        self.record.last_seen = Some(when);
    }

    async fn save(&self) -> Result<()> {
        self.registry.upsert(&self.record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    const KNOWN: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
    const STRANGER: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 9]);

    #[tokio::test]
    async fn test_unknown_device_is_unregistered() {
        let store = JsonDeviceStore::in_memory([]);
        let device = store.get_device_by_mac(STRANGER).await.unwrap();
        assert_eq!(device.id(), 0);
        assert_eq!(device.mac(), STRANGER);
        assert!(!device.is_registered());
        assert!(!device.is_blacklisted());
        assert!(!device.is_expired());
        assert_eq!(device.username(), None);
    }

    #[tokio::test]
    async fn test_registered_device() {
        let record = DeviceRecord::registered(7, KNOWN, "alice");
        let store = JsonDeviceStore::in_memory([record]);

        let device = store.get_device_by_mac(KNOWN).await.unwrap();
        assert_eq!(device.id(), 7);
        assert!(device.is_registered());
        assert_eq!(device.username(), Some("alice"));
    }

    #[tokio::test]
    async fn test_expiry() {
        let mut record = DeviceRecord::registered(3, KNOWN, "bob");
        record.expires = Some(Utc::now() - TimeDelta::days(1));
        let store = JsonDeviceStore::in_memory([record]);

        let device = store.get_device_by_mac(KNOWN).await.unwrap();
        assert!(device.is_expired());
        assert!(!device.is_registered());
    }

    #[tokio::test]
    async fn test_blacklisted_device_is_not_registered() {
        let mut record = DeviceRecord::registered(4, KNOWN, "mallory");
        record.blacklisted = true;
        let store = JsonDeviceStore::in_memory([record]);

        let device = store.get_device_by_mac(KNOWN).await.unwrap();
        assert!(device.is_blacklisted());
        assert!(!device.is_registered());
    }

    #[tokio::test]
    async fn test_unsaved_record_is_not_registered() {
        let mut record = DeviceRecord::registered(5, KNOWN, "carol");
        record.id = 0;
        let store = JsonDeviceStore::in_memory([record]);

        let device = store.get_device_by_mac(KNOWN).await.unwrap();
        assert!(!device.is_registered());
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_reach_disk() {
        let path = "test_devices_concurrent.json".to_string();
        let _guard = TestGuard(path.clone());

        let store = JsonDeviceStore::open(&path).await.unwrap();
        let tasks: Vec<_> = (1..=24u8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let device = store
                        .get_device_by_mac(MacAddress::new([0x02, 0, 0, 0, 1, n]))
                        .await?;
                    device.save().await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = JsonDeviceStore::open(&path).await.unwrap();
        for n in 1..=24u8 {
            assert!(reopened.record(MacAddress::new([0x02, 0, 0, 0, 1, n])).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_last_seen_saved() {
        let path = "test_devices_last_seen.json".to_string();
        let _guard = TestGuard(path.clone());

        let store = JsonDeviceStore::open(&path).await.unwrap();
        let mut device = store.get_device_by_mac(KNOWN).await.unwrap();
        let seen = Utc::now();
        device.set_last_seen(seen);
        device.save().await.unwrap();

        let reopened = JsonDeviceStore::open(&path).await.unwrap();
        let record = reopened.record(KNOWN).await.unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.last_seen, Some(seen));
    }
}
