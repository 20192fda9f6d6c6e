use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    config::NetworkConfig,
    error::StorageError,
    storage::{
        transaction, PersistentStore, KEY_AP_PASS, KEY_AP_SSID, KEY_IP_OCTET,
        KEY_STATION_PASS, KEY_STATION_SSID,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Station,
    #[serde(rename = "ap")]
    AccessPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

/// Network credentials and addressing, persisted as keyed entries. Opaque to
/// the control core; consumed by whatever brings the network up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub station: Credentials,
    pub access_point: Credentials,
    pub static_ip_octet: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettingsUpdate {
    #[serde(default)]
    pub mode: Option<NetworkMode>,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "ipOctet", default)]
    pub ip_octet: Option<u8>,
}

pub fn is_valid_ip_octet(octet: u8) -> bool {
    (10..=250).contains(&octet)
}

impl NetworkSettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            station: Credentials {
                ssid: config.station_ssid.clone(),
                password: config.station_pass.clone(),
            },
            access_point: Credentials {
                ssid: config.ap_ssid.clone(),
                password: config.ap_pass.clone(),
            },
            static_ip_octet: config.static_ip_octet,
        }
    }

    /// Persisted entries override the configured defaults one by one.
    pub fn load<S: PersistentStore + ?Sized>(
        store: &mut S,
        defaults: &NetworkConfig,
    ) -> Result<Self, StorageError> {
        let mut settings = Self::from_config(defaults);
        if let Some(ssid) = store.get_str(KEY_STATION_SSID)? {
            settings.station.ssid = ssid;
        }
        if let Some(pass) = store.get_str(KEY_STATION_PASS)? {
            settings.station.password = pass;
        }
        if let Some(ssid) = store.get_str(KEY_AP_SSID)? {
            settings.access_point.ssid = ssid;
        }
        if let Some(pass) = store.get_str(KEY_AP_PASS)? {
            settings.access_point.password = pass;
        }
        if let Some(octet) = store.get_u32(KEY_IP_OCTET)? {
            settings.static_ip_octet = u8::try_from(octet).ok().filter(|o| is_valid_ip_octet(*o));
        }
        Ok(settings)
    }

    pub fn save<S: PersistentStore + ?Sized>(&self, store: &mut S) -> Result<(), StorageError> {
        transaction(store, |store| {
            store.put_str(KEY_STATION_SSID, &self.station.ssid)?;
            store.put_str(KEY_STATION_PASS, &self.station.password)?;
            store.put_str(KEY_AP_SSID, &self.access_point.ssid)?;
            store.put_str(KEY_AP_PASS, &self.access_point.password)?;
            store.put_u32(KEY_IP_OCTET, self.static_ip_octet.map_or(0, u32::from))
        })
    }

    /// Remembers station credentials that just produced a working connection.
    pub fn save_station_credentials<S: PersistentStore + ?Sized>(
        &mut self,
        store: &mut S,
        confirmed: Credentials,
    ) -> Result<(), StorageError> {
        if self.station == confirmed {
            return Ok(());
        }
        transaction(store, |store| {
            store.put_str(KEY_STATION_SSID, &confirmed.ssid)?;
            store.put_str(KEY_STATION_PASS, &confirmed.password)
        })?;
        self.station = confirmed;
        Ok(())
    }

    /// Applies a settings form. Empty fields are left unchanged; the mode picks
    /// which credential pair receives ssid/password. Returns whether anything
    /// changed, in which case the network must be brought up again.
    pub fn apply(&mut self, update: &NetworkSettingsUpdate) -> Result<bool, &'static str> {
        if let Some(octet) = update.ip_octet {
            if !is_valid_ip_octet(octet) {
                return Err("ip octet must be between 10 and 250");
            }
        }

        let before = self.clone();
        let target = match update.mode.unwrap_or(NetworkMode::Station) {
            NetworkMode::Station => &mut self.station,
            NetworkMode::AccessPoint => &mut self.access_point,
        };

        if let Some(ssid) = update.ssid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            target.ssid = ssid.to_string();
        }
        if let Some(password) = update.password.as_deref().filter(|p| !p.is_empty()) {
            target.password = password.to_string();
        }
        if let Some(octet) = update.ip_octet {
            self.static_ip_octet = Some(octet);
        }

        let changed = *self != before;
        if changed {
            info!("network settings updated");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::MemoryStore;

    fn settings() -> NetworkSettings {
        NetworkSettings::from_config(&NetworkConfig::default())
    }

    #[test]
    fn credentials_go_to_selected_pair() {
        let mut current = settings();
        let changed = current
            .apply(&NetworkSettingsUpdate {
                mode: Some(NetworkMode::AccessPoint),
                ssid: Some("Hotspot".to_string()),
                password: Some("secret123".to_string()),
                ip_octet: None,
            })
            .unwrap();

        assert!(changed);
        assert_eq!(current.access_point.ssid, "Hotspot");
        assert_eq!(current.access_point.password, "secret123");
        assert_eq!(current.station, settings().station);
    }

    #[test]
    fn missing_mode_targets_station_and_blank_fields_are_ignored() {
        let mut current = settings();
        current
            .apply(&NetworkSettingsUpdate {
                ssid: Some("HomeWifi".to_string()),
                password: Some(String::new()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(current.station.ssid, "HomeWifi");
        assert_eq!(current.station.password, "");
        assert!(!current.apply(&NetworkSettingsUpdate::default()).unwrap());
    }

    #[test]
    fn rejects_ip_octet_outside_range() {
        let mut current = settings();
        assert!(current
            .apply(&NetworkSettingsUpdate {
                ip_octet: Some(251),
                ..Default::default()
            })
            .is_err());
        assert_eq!(current, settings());
    }

    #[test]
    fn persisted_entries_override_defaults() {
        let mut store = MemoryStore::new();
        let mut current = settings();
        current.static_ip_octet = Some(42);
        current.access_point.password = "apsecret".to_string();
        current.save(&mut store).unwrap();

        current
            .save_station_credentials(
                &mut store,
                Credentials {
                    ssid: "Confirmed".to_string(),
                    password: "pw".to_string(),
                },
            )
            .unwrap();

        store.power_cycle();
        let loaded = NetworkSettings::load(&mut store, &NetworkConfig::default()).unwrap();
        assert_eq!(loaded, current);
        assert_eq!(loaded.station.ssid, "Confirmed");
    }

    #[test]
    fn rejected_save_is_not_committed_later() {
        let mut store = MemoryStore::new();
        let mut current = settings();
        current.station.ssid = "Rejected".to_string();
        store.fail_commits(true);
        assert!(current.save(&mut store).is_err());

        store.fail_commits(false);
        let mut fresh = settings();
        fresh
            .save_station_credentials(
                &mut store,
                Credentials {
                    ssid: "Confirmed".to_string(),
                    password: "pw".to_string(),
                },
            )
            .unwrap();
        store.power_cycle();

        let loaded = NetworkSettings::load(&mut store, &NetworkConfig::default()).unwrap();
        assert_eq!(loaded.station.ssid, "Confirmed");
        assert_eq!(loaded.static_ip_octet, NetworkConfig::default().static_ip_octet);
        assert_eq!(loaded.access_point, settings().access_point);
    }
}
