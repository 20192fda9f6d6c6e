//! License snapshot cache and the remote license check.

use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{StorageError, ValidationError},
    identity::DeviceIdentity,
    ports::LicenseTransport,
    storage::{
        transaction, PersistentStore, KEY_LICENSE_DAY, KEY_LICENSE_MONTH, KEY_LICENSE_SET,
        KEY_LICENSE_YEAR,
    },
};

/// Cached license verdict. The expiry day is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LicenseSnapshot {
    #[serde(rename = "expiryYear")]
    pub expiry_year: i32,
    #[serde(rename = "expiryMonth")]
    pub expiry_month: u32,
    #[serde(rename = "expiryDay")]
    pub expiry_day: u32,
    #[serde(rename = "isSet")]
    pub is_set: bool,
}

impl LicenseSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn expiring(date: NaiveDate) -> Self {
        use chrono::Datelike;

        Self {
            expiry_year: date.year(),
            expiry_month: date.month(),
            expiry_day: date.day(),
            is_set: true,
        }
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        if !self.is_set {
            return None;
        }
        NaiveDate::from_ymd_opt(self.expiry_year, self.expiry_month, self.expiry_day)
    }

    pub fn is_valid_on(&self, today: NaiveDate) -> bool {
        self.expiry_date().is_some_and(|expiry| expiry >= today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LicenseCache {
    snapshot: LicenseSnapshot,
}

impl LicenseCache {
    pub fn load<S: PersistentStore + ?Sized>(store: &mut S) -> Self {
        match read_snapshot(store) {
            Ok(Some(snapshot)) if snapshot.expiry_date().is_some() => {
                info!(
                    "cached license loaded, expires {:04}-{:02}-{:02}",
                    snapshot.expiry_year, snapshot.expiry_month, snapshot.expiry_day
                );
                Self { snapshot }
            }
            Ok(Some(snapshot)) => {
                warn!("cached license record is corrupt ({snapshot:?}), treating as not set");
                Self::default()
            }
            Ok(None) => Self::default(),
            Err(err) => {
                warn!("failed to read cached license, treating as not set: {err}");
                Self::default()
            }
        }
    }

    /// Local-only validity check; never touches the network.
    pub fn is_valid(&self, today: NaiveDate) -> bool {
        self.snapshot.is_valid_on(today)
    }

    pub fn snapshot(&self) -> &LicenseSnapshot {
        &self.snapshot
    }

    /// Overwrites the cached verdict. The in-memory verdict is kept even if
    /// persisting it fails.
    pub fn update<S: PersistentStore + ?Sized>(
        &mut self,
        snapshot: LicenseSnapshot,
        store: &mut S,
    ) -> Result<(), StorageError> {
        self.snapshot = snapshot;
        self.persist(store)
    }

    pub fn clear<S: PersistentStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<(), StorageError> {
        self.snapshot = LicenseSnapshot::empty();
        self.persist(store)
    }

    /// Applies an authoritative verdict from the license authority.
    pub fn apply<S: PersistentStore + ?Sized>(
        &mut self,
        verdict: &LicenseVerdict,
        store: &mut S,
    ) -> Result<(), StorageError> {
        match verdict {
            LicenseVerdict::Active(snapshot) => self.update(*snapshot, store),
            LicenseVerdict::Revoked(_) => self.clear(store),
        }
    }

    fn persist<S: PersistentStore + ?Sized>(&self, store: &mut S) -> Result<(), StorageError> {
        let snapshot = self.snapshot;
        transaction(store, |store| {
            store.put_u32(KEY_LICENSE_SET, u32::from(snapshot.is_set))?;
            store.put_u32(KEY_LICENSE_YEAR, snapshot.expiry_year.max(0) as u32)?;
            store.put_u32(KEY_LICENSE_MONTH, snapshot.expiry_month)?;
            store.put_u32(KEY_LICENSE_DAY, snapshot.expiry_day)
        })
    }
}

fn read_snapshot<S: PersistentStore + ?Sized>(
    store: &mut S,
) -> Result<Option<LicenseSnapshot>, StorageError> {
    match store.get_u32(KEY_LICENSE_SET)? {
        None | Some(0) => return Ok(None),
        Some(_) => {}
    }

    let year = store.get_u32(KEY_LICENSE_YEAR)?.unwrap_or(0);
    Ok(Some(LicenseSnapshot {
        expiry_year: i32::try_from(year).unwrap_or(0),
        expiry_month: store.get_u32(KEY_LICENSE_MONTH)?.unwrap_or(0),
        expiry_day: store.get_u32(KEY_LICENSE_DAY)?.unwrap_or(0),
        is_set: true,
    }))
}

#[derive(Debug, Serialize)]
pub struct LicenseRequest<'a> {
    pub client_mac_address: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseResponse {
    pub status: bool,
    pub expired: bool,
    pub mac_address: String,
    pub expiry_date: ExpiryDate,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ExpiryDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevocationReason {
    Inactive,
    Expired,
    IdentityMismatch,
    PastExpiry,
}

/// Outcome of a well-formed license response. Both variants are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseVerdict {
    Active(LicenseSnapshot),
    Revoked(RevocationReason),
}

#[derive(Debug, Clone)]
pub struct LicenseValidator {
    endpoint: String,
}

impl LicenseValidator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Sends one license request and judges the reply.
    pub fn revalidate<T: LicenseTransport + ?Sized>(
        &self,
        transport: &mut T,
        identity: &DeviceIdentity,
        today: NaiveDate,
    ) -> Result<LicenseVerdict, ValidationError> {
        let request = LicenseRequest {
            client_mac_address: identity.as_str(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|err| ValidationError::Transport(format!("request encoding failed: {err}")))?;

        let reply = transport.post_json(&self.endpoint, &body)?;
        if !reply.is_success() {
            return Err(ValidationError::Transport(format!(
                "license authority answered HTTP {}",
                reply.status
            )));
        }

        let response: LicenseResponse = serde_json::from_slice(&reply.body)
            .map_err(|err| ValidationError::MalformedResponse(err.to_string()))?;

        let verdict = judge(&response, identity, today)?;
        match verdict {
            LicenseVerdict::Active(snapshot) => info!(
                "license active until {:04}-{:02}-{:02}",
                snapshot.expiry_year, snapshot.expiry_month, snapshot.expiry_day
            ),
            LicenseVerdict::Revoked(reason) => warn!("license not active: {reason:?}"),
        }
        Ok(verdict)
    }
}

pub fn judge(
    response: &LicenseResponse,
    identity: &DeviceIdentity,
    today: NaiveDate,
) -> Result<LicenseVerdict, ValidationError> {
    if !response.status {
        return Ok(LicenseVerdict::Revoked(RevocationReason::Inactive));
    }
    if response.expired {
        return Ok(LicenseVerdict::Revoked(RevocationReason::Expired));
    }
    if !identity.matches(&response.mac_address) {
        return Ok(LicenseVerdict::Revoked(RevocationReason::IdentityMismatch));
    }

    let ExpiryDate { year, month, day } = response.expiry_date;
    let Some(expiry) = NaiveDate::from_ymd_opt(year, month, day) else {
        return Err(ValidationError::MalformedResponse(format!(
            "invalid expiry date {year:04}-{month:02}-{day:02}"
        )));
    };

    if expiry < today {
        return Ok(LicenseVerdict::Revoked(RevocationReason::PastExpiry));
    }
    Ok(LicenseVerdict::Active(LicenseSnapshot::expiring(expiry)))
}
