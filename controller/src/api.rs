//! Typed request surface. Transport layers (axum on the host, the esp HTTP
//! server on target) translate their requests into [`Request`] and render the
//! [`Reply`] or [`ApiError`] back; all device access goes through [`dispatch`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use switch_common::{
    LicenseMode, LicenseSnapshot, NetworkSettings, NetworkSettingsUpdate, PersistentStore,
    Schedule, ScheduleError, SlotIndex,
};

use crate::device::Device;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Status,
    ListSchedules,
    AddSchedule {
        #[serde(rename = "startHour")]
        start_hour: u8,
        #[serde(rename = "startMinute")]
        start_minute: u8,
        #[serde(rename = "durationSecs")]
        duration_secs: u32,
    },
    DeleteSchedule {
        index: SlotIndex,
    },
    DeleteAllSchedules,
    SetDefaultLevel {
        level: bool,
    },
    ForceActivate {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    RecheckLicense,
    GetNetwork,
    UpdateNetwork(NetworkSettingsUpdate),
}

impl Request {
    /// Requests still served while the license is not valid.
    pub fn allowed_in(&self, mode: LicenseMode) -> bool {
        match mode {
            LicenseMode::Active => true,
            LicenseMode::Restricted => matches!(
                self,
                Self::Status | Self::RecheckLicense | Self::GetNetwork | Self::UpdateNetwork(_)
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleView {
    pub index: SlotIndex,
    #[serde(flatten)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusView {
    pub mode: &'static str,
    #[serde(rename = "outputLevel")]
    pub output_level: bool,
    #[serde(rename = "defaultLevel")]
    pub default_level: bool,
    #[serde(rename = "overrideRemainingMs")]
    pub override_remaining_ms: u64,
    pub license: LicenseSnapshot,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "localTime")]
    pub local_time: Option<NaiveDateTime>,
    #[serde(rename = "activeSchedules")]
    pub active_schedules: usize,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NetworkView {
    #[serde(rename = "stationSsid")]
    pub station_ssid: String,
    #[serde(rename = "stationPassSet")]
    pub station_pass_set: bool,
    #[serde(rename = "apSsid")]
    pub ap_ssid: String,
    #[serde(rename = "apPassSet")]
    pub ap_pass_set: bool,
    #[serde(rename = "ipOctet")]
    pub ip_octet: Option<u8>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Reply {
    Status(StatusView),
    Schedules(Vec<ScheduleView>),
    ScheduleAdded {
        index: SlotIndex,
    },
    Done {
        ok: bool,
    },
    ForceActivated {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    License {
        valid: bool,
        mode: LicenseMode,
    },
    Network(NetworkView),
    NetworkUpdated {
        #[serde(rename = "restartRequired")]
        restart_required: bool,
        network: NetworkView,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("license is not active")]
    Restricted,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Restricted => 403,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidSchedule(_) => Self::BadRequest(err.to_string()),
            ScheduleError::CapacityExceeded { .. } => Self::Conflict(err.to_string()),
            ScheduleError::IndexOutOfRange { .. } => Self::NotFound(err.to_string()),
            ScheduleError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

pub fn dispatch<S: PersistentStore>(
    device: &mut Device<S>,
    request: Request,
    now_ms: u64,
) -> Result<Reply, ApiError> {
    if !request.allowed_in(device.mode()) {
        return Err(ApiError::Restricted);
    }

    match request {
        Request::Status => Ok(Reply::Status(build_status(device, now_ms))),
        Request::ListSchedules => Ok(Reply::Schedules(build_schedule_views(device))),
        Request::AddSchedule {
            start_hour,
            start_minute,
            duration_secs,
        } => {
            let index = device
                .controller
                .add_schedule(start_hour, start_minute, duration_secs)?;
            Ok(Reply::ScheduleAdded { index })
        }
        Request::DeleteSchedule { index } => {
            device.controller.delete_schedule(index)?;
            Ok(Reply::Done { ok: true })
        }
        Request::DeleteAllSchedules => {
            device.controller.delete_all_schedules()?;
            Ok(Reply::Done { ok: true })
        }
        Request::SetDefaultLevel { level } => {
            device.controller.set_default_level(level).map_err(|err| {
                ApiError::Internal(format!("failed to persist default level: {err}"))
            })?;
            Ok(Reply::Done { ok: true })
        }
        Request::ForceActivate { duration_ms } => {
            if duration_ms == 0 {
                return Err(ApiError::BadRequest("durationMs must be positive".to_string()));
            }
            let duration_ms = device.controller.force_activate(duration_ms, now_ms);
            Ok(Reply::ForceActivated { duration_ms })
        }
        Request::RecheckLicense => {
            let Some(today) = device.ports.clock.now_local().map(|now| now.date()) else {
                return Err(ApiError::Conflict("clock is not synchronised".to_string()));
            };
            let valid = device.controller.request_license_recheck(
                &device.validator,
                device.ports.transport.as_mut(),
                &device.identity,
                today,
            );
            Ok(Reply::License {
                valid,
                mode: device.controller.mode(),
            })
        }
        Request::GetNetwork => Ok(Reply::Network(build_network_view(&device.network_settings))),
        Request::UpdateNetwork(update) => {
            let restart_required = device
                .network_settings
                .apply(&update)
                .map_err(|message| ApiError::BadRequest(message.to_string()))?;
            if restart_required {
                device
                    .network_settings
                    .save(device.controller.store_mut())
                    .map_err(|err| {
                        ApiError::Internal(format!("failed to persist network settings: {err}"))
                    })?;
            }
            Ok(Reply::NetworkUpdated {
                restart_required,
                network: build_network_view(&device.network_settings),
            })
        }
    }
}

fn build_status<S: PersistentStore>(device: &Device<S>, now_ms: u64) -> StatusView {
    let local_time = device.ports.clock.now_local();
    let controller = &device.controller;
    StatusView {
        mode: controller.mode().as_str(),
        output_level: controller.current_output_level(),
        default_level: controller.default_level(),
        override_remaining_ms: controller.override_remaining_ms(now_ms),
        license: *controller.license_snapshot(),
        time_synced: local_time.is_some(),
        local_time,
        active_schedules: controller.list_active_schedules().len(),
        identity: device.identity.to_string(),
    }
}

fn build_schedule_views<S: PersistentStore>(device: &Device<S>) -> Vec<ScheduleView> {
    device
        .controller
        .list_active_schedules()
        .into_iter()
        .map(|(index, schedule)| ScheduleView { index, schedule })
        .collect()
}

fn build_network_view(settings: &NetworkSettings) -> NetworkView {
    NetworkView {
        station_ssid: settings.station.ssid.clone(),
        station_pass_set: !settings.station.password.is_empty(),
        ap_ssid: settings.access_point.ssid.clone(),
        ap_pass_set: !settings.access_point.password.is_empty(),
        ip_octet: settings.static_ip_octet,
    }
}

#[cfg(test)]
mod tests {
    use switch_common::{NetworkMode, MAX_SCHEDULES};

    use super::*;
    use crate::device::tests::{device, license_reply, licensed_probe};

    #[test]
    fn schedule_requests_round_trip_through_dispatch() {
        let probe = licensed_probe();
        let mut device = device(&probe);

        let added = dispatch(
            &mut device,
            Request::AddSchedule {
                start_hour: 8,
                start_minute: 0,
                duration_secs: 3600,
            },
            0,
        );
        assert_eq!(added, Ok(Reply::ScheduleAdded { index: 0 }));

        let Ok(Reply::Schedules(views)) = dispatch(&mut device, Request::ListSchedules, 0) else {
            panic!("expected schedule list");
        };
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].schedule.window_start_secs(), 8 * 3600);

        assert_eq!(
            dispatch(&mut device, Request::DeleteSchedule { index: 0 }, 0),
            Ok(Reply::Done { ok: true })
        );
        assert_eq!(
            dispatch(&mut device, Request::ListSchedules, 0),
            Ok(Reply::Schedules(Vec::new()))
        );
    }

    #[test]
    fn schedule_errors_map_to_status_codes() {
        let probe = licensed_probe();
        let mut device = device(&probe);

        let invalid = dispatch(
            &mut device,
            Request::AddSchedule {
                start_hour: 24,
                start_minute: 0,
                duration_secs: 60,
            },
            0,
        )
        .unwrap_err();
        assert_eq!(invalid.status_code(), 400);

        let missing = dispatch(&mut device, Request::DeleteSchedule { index: MAX_SCHEDULES }, 0)
            .unwrap_err();
        assert_eq!(missing.status_code(), 404);

        for _ in 0..MAX_SCHEDULES {
            dispatch(
                &mut device,
                Request::AddSchedule {
                    start_hour: 1,
                    start_minute: 0,
                    duration_secs: 60,
                },
                0,
            )
            .unwrap();
        }
        let full = dispatch(
            &mut device,
            Request::AddSchedule {
                start_hour: 2,
                start_minute: 0,
                duration_secs: 60,
            },
            0,
        )
        .unwrap_err();
        assert_eq!(full.status_code(), 409);
    }

    #[test]
    fn restricted_mode_only_serves_settings_and_license() {
        let probe = licensed_probe();
        probe.borrow_mut().license_reply = Some(license_reply(false, false));
        let mut device = device(&probe);
        assert_eq!(device.mode(), LicenseMode::Restricted);

        assert_eq!(
            dispatch(&mut device, Request::ListSchedules, 0),
            Err(ApiError::Restricted)
        );
        assert_eq!(
            dispatch(&mut device, Request::ForceActivate { duration_ms: 1_000 }, 0),
            Err(ApiError::Restricted)
        );
        assert!(dispatch(&mut device, Request::Status, 0).is_ok());
        assert!(dispatch(&mut device, Request::GetNetwork, 0).is_ok());
    }

    #[test]
    fn recheck_reports_new_validity() {
        let probe = licensed_probe();
        probe.borrow_mut().license_reply = None;
        let mut device = device(&probe);
        assert_eq!(device.mode(), LicenseMode::Restricted);

        probe.borrow_mut().license_reply = Some(license_reply(true, false));
        assert_eq!(
            dispatch(&mut device, Request::RecheckLicense, 0),
            Ok(Reply::License {
                valid: true,
                mode: LicenseMode::Active
            })
        );
        assert!(dispatch(&mut device, Request::ListSchedules, 0).is_ok());
    }

    #[test]
    fn force_activate_drives_output_until_expiry() {
        let probe = licensed_probe();
        let mut device = device(&probe);
        device.iterate(0);

        assert_eq!(
            dispatch(&mut device, Request::ForceActivate { duration_ms: 2_000 }, 0),
            Ok(Reply::ForceActivated { duration_ms: 2_000 })
        );
        device.iterate(1_000);
        device.iterate(2_000);

        assert_eq!(probe.borrow().levels, vec![true, false, true]);
    }

    #[test]
    fn network_update_persists_and_hides_passwords() {
        let probe = licensed_probe();
        let mut device = device(&probe);

        let reply = dispatch(
            &mut device,
            Request::UpdateNetwork(NetworkSettingsUpdate {
                mode: Some(NetworkMode::Station),
                ssid: Some("HomeWifi".to_string()),
                password: Some("hunter22".to_string()),
                ip_octet: Some(50),
            }),
            0,
        )
        .unwrap();

        let Reply::NetworkUpdated {
            restart_required,
            network,
        } = reply
        else {
            panic!("expected network update reply");
        };
        assert!(restart_required);
        assert_eq!(network.station_ssid, "HomeWifi");
        assert!(network.station_pass_set);
        assert_eq!(network.ip_octet, Some(50));

        let rendered = serde_json::to_string(&Reply::Network(network)).unwrap();
        assert!(!rendered.contains("hunter22"));

        assert_eq!(
            dispatch(
                &mut device,
                Request::UpdateNetwork(NetworkSettingsUpdate {
                    ip_octet: Some(5),
                    ..Default::default()
                }),
                0,
            )
            .unwrap_err()
            .status_code(),
            400
        );
    }

    #[test]
    fn requests_deserialize_from_tagged_json() {
        let request: Request = serde_json::from_str(
            r#"{"kind":"add_schedule","startHour":6,"startMinute":30,"durationSecs":900}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            Request::AddSchedule {
                start_hour: 6,
                start_minute: 30,
                duration_secs: 900
            }
        ));
    }
}
