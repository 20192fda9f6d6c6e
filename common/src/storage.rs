//! Persistent storage seam.
//!
//! The device keeps two kinds of state across power cycles: a fixed-offset
//! byte region (the schedule table) and a handful of keyed scalars (default
//! level, license snapshot, network credentials). Backends stage writes and
//! make them durable on [`PersistentStore::commit`].

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Size of the raw region every backend must provide.
pub const REGION_SIZE: usize = 512;

pub const KEY_DEFAULT_LEVEL: &str = "default_level";
pub const KEY_LICENSE_SET: &str = "lic_set";
pub const KEY_LICENSE_YEAR: &str = "lic_year";
pub const KEY_LICENSE_MONTH: &str = "lic_month";
pub const KEY_LICENSE_DAY: &str = "lic_day";
pub const KEY_STATION_SSID: &str = "sta_ssid";
pub const KEY_STATION_PASS: &str = "sta_pass";
pub const KEY_AP_SSID: &str = "ap_ssid";
pub const KEY_AP_PASS: &str = "ap_pass";
pub const KEY_IP_OCTET: &str = "ip_octet";

pub trait PersistentStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError>;
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StorageError>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Make every staged write durable.
    fn commit(&mut self) -> Result<(), StorageError>;
    /// Drop every staged write and return to the last committed image.
    fn discard(&mut self) -> Result<(), StorageError>;
}

/// Stages writes with `stage` and commits them. If staging or the commit
/// fails, the staged writes are discarded so no later commit can make them
/// durable.
pub fn transaction<S, E>(
    store: &mut S,
    stage: impl FnOnce(&mut S) -> Result<(), E>,
) -> Result<(), E>
where
    S: PersistentStore + ?Sized,
    E: From<StorageError>,
{
    let result = stage(store).and_then(|()| store.commit().map_err(E::from));
    if result.is_err() {
        if let Err(err) = store.discard() {
            warn!("failed to discard staged writes: {err}");
        }
    }
    result
}

pub fn check_bounds(offset: usize, len: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= REGION_SIZE => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            offset,
            len,
            capacity: REGION_SIZE,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    U32(u32),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Image {
    region: Vec<u8>,
    entries: BTreeMap<String, StoredValue>,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            region: vec![0; REGION_SIZE],
            entries: BTreeMap::new(),
        }
    }
}

/// RAM-backed store with explicit staging, used by tests and the simulator.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Image,
    staged: Image,
    commits: usize,
    fail_commits: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything that was not committed, as a power loss would.
    pub fn power_cycle(&mut self) {
        self.staged = self.committed.clone();
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Make every following commit fail. Staged data stays staged.
    pub fn fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }

    pub fn committed_region(&self) -> &[u8] {
        &self.committed.region
    }
}

impl PersistentStore for MemoryStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.staged.region[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len())?;
        self.staged.region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        Ok(match self.staged.entries.get(key) {
            Some(StoredValue::U32(value)) => Some(*value),
            _ => None,
        })
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.staged
            .entries
            .insert(key.to_string(), StoredValue::U32(value));
        Ok(())
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(match self.staged.entries.get(key) {
            Some(StoredValue::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.staged
            .entries
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_commits {
            return Err(StorageError::Backend("commit rejected".to_string()));
        }
        self.committed = self.staged.clone();
        self.commits += 1;
        Ok(())
    }

    fn discard(&mut self) -> Result<(), StorageError> {
        self.staged = self.committed.clone();
        Ok(())
    }
}
