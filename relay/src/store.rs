//! Document-store seam.
//!
//! The registry only needs single-document atomic read-modify-write, plain
//! field writes stamped with server time, and an append-only reading log per
//! device. `PgStore` (see `db`) backs these in production; `MemoryStore` keeps
//! everything in process for tests.

use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Decision taken by an `atomic_upsert` mutator after looking at the current document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Keep,
    Put(Device),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Upserted {
    /// The mutator kept the document as it was (possibly absent).
    Unchanged(Option<Device>),
    /// The mutator's document was committed.
    Written(Device),
}

/// Partial update applied by `DeviceStore::write`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub status: Option<DeviceStatus>,
    pub last_temperature: Option<f64>,
    pub last_humidity: Option<f64>,
    /// Stamp `last_seen` with the store's clock, never moving it backwards.
    pub touch_last_seen: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

pub type Mutator<'a> = dyn FnMut(Option<&Device>) -> Mutation + Send + 'a;

#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    async fn server_time(&self) -> Result<DateTime<Utc>>;

    async fn get(&self, device_id: &str) -> Result<Option<Device>>;

    /// Read-modify-write of one document, atomic against every other writer of
    /// the same key, including other processes sharing the store.
    async fn atomic_upsert(&self, device_id: &str, mutator: &mut Mutator<'_>) -> Result<Upserted>;

    /// Returns `false` when the device does not exist.
    async fn write(&self, device_id: &str, patch: DevicePatch) -> Result<bool>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Device>>;

    /// Removes the device and all of its readings. Returns `false` when absent.
    async fn delete(&self, device_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Appending an identical sample twice stores it once.
    async fn append(&self, device_id: &str, reading: NewReading) -> Result<()>;

    /// Newest first, at most `limit` entries. Empty when there is nothing to show.
    async fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>>;
}

#[derive(Debug, Clone)]
struct StoredReading {
    seq: u64,
    reading: Reading,
}

#[derive(Debug, Default)]
struct MemoryInner {
    devices: HashMap<String, Device>,
    readings: HashMap<String, Vec<StoredReading>>,
    next_seq: u64,
    clock: Option<DateTime<Utc>>,
}

impl MemoryInner {
    // Server time that never runs backwards, like a store-assigned timestamp.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let now = match self.clock {
            Some(last) if last > now => last,
            _ => now,
        };
        self.clock = Some(now);
        now
    }
}

/// In-process store implementing both traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reading_count(&self, device_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.readings.get(device_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.inner.lock().await.tick())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.inner.lock().await.devices.get(device_id).cloned())
    }

    async fn atomic_upsert(&self, device_id: &str, mutator: &mut Mutator<'_>) -> Result<Upserted> {
        let mut inner = self.inner.lock().await;
        let current = inner.devices.get(device_id).cloned();
        match mutator(current.as_ref()) {
            Mutation::Keep => Ok(Upserted::Unchanged(current)),
            Mutation::Put(mut next) => {
                if next.id != device_id {
                    return Err(Error::Validation(format!(
                        "Document key {} does not match device id {}",
                        device_id, next.id
                    )));
                }
                next.version = current.map_or(1, |c| c.version + 1);
                inner.devices.insert(device_id.to_string(), next.clone());
                Ok(Upserted::Written(next))
            }
        }
    }

    async fn write(&self, device_id: &str, patch: DevicePatch) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return Ok(false);
        };
        if let Some(name) = patch.name {
            device.name = name;
        }
        if let Some(status) = patch.status {
            device.status = status;
        }
        if let Some(temperature) = patch.last_temperature {
            device.last_temperature = Some(temperature);
        }
        if let Some(humidity) = patch.last_humidity {
            device.last_humidity = Some(humidity);
        }
        if patch.touch_last_seen && now > device.last_seen {
            device.last_seen = now;
        }
        device.version += 1;
        Ok(true)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Device>> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(devices)
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.readings.remove(device_id);
        Ok(inner.devices.remove(device_id).is_some())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, device_id: &str, reading: NewReading) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.devices.contains_key(device_id) {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        let seq = inner.next_seq;
        let log = inner.readings.entry(device_id.to_string()).or_default();
        let duplicate = log.iter().any(|r| {
            r.reading.timestamp == reading.timestamp
                && r.reading.temperature == reading.temperature
                && r.reading.humidity == reading.humidity
        });
        if duplicate {
            return Ok(());
        }
        log.push(StoredReading {
            seq,
            reading: Reading {
                temperature: reading.temperature,
                humidity: reading.humidity,
                timestamp: reading.timestamp,
            },
        });
        inner.next_seq += 1;
        Ok(())
    }

    async fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let inner = self.inner.lock().await;
        let Some(log) = inner.readings.get(device_id) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<&StoredReading> = log.iter().collect();
        ordered.sort_by(|a, b| {
            b.reading
                .timestamp
                .cmp(&a.reading.timestamp)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(ordered
            .into_iter()
            .take(limit)
            .map(|r| r.reading.clone())
            .collect())
    }
}
