//! Control loop state machine: license mode, output level, timed override and
//! periodic housekeeping. Purely reactive; the firmware feeds it uptime and
//! local time once per iteration and carries out the returned actions.

use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{ControllerConfig, OutputConfig},
    error::{ScheduleError, StorageError, ValidationError},
    identity::DeviceIdentity,
    license::{LicenseCache, LicenseSnapshot, LicenseValidator},
    ports::LicenseTransport,
    schedule::{Schedule, ScheduleStore, SlotIndex},
    storage::{transaction, PersistentStore, KEY_DEFAULT_LEVEL},
    window::{evaluate, seconds_since_midnight},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LicenseMode {
    Active,
    Restricted,
}

impl LicenseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Restricted => "RESTRICTED",
        }
    }

    fn from_validity(valid: bool) -> Self {
        if valid {
            Self::Active
        } else {
            Self::Restricted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    SetOutput(bool),
    ResyncClock,
    ReconnectNetwork,
    ModeChanged(LicenseMode),
}

pub struct SwitchController<S> {
    pub config: ControllerConfig,
    store: S,
    schedules: ScheduleStore,
    license: LicenseCache,
    default_level: bool,
    mode: LicenseMode,
    output_level: bool,
    output_applied: bool,
    override_until_ms: Option<u64>,
    last_clock_sync_ms: Option<u64>,
    last_reconnect_attempt_ms: Option<u64>,
    pending: Vec<ControlAction>,
}

impl<S: PersistentStore> SwitchController<S> {
    /// Loads persisted state. The mode starts RESTRICTED until [`Self::boot`]
    /// has consulted the license cache.
    pub fn load(config: ControllerConfig, output: &OutputConfig, mut store: S) -> Self {
        let schedules = ScheduleStore::load(&mut store);
        let license = LicenseCache::load(&mut store);
        let default_level = match store.get_u32(KEY_DEFAULT_LEVEL) {
            Ok(Some(value)) => value != 0,
            Ok(None) => output.default_level,
            Err(err) => {
                warn!("failed to read default level, using configured value: {err}");
                output.default_level
            }
        };

        Self {
            config,
            store,
            schedules,
            license,
            default_level,
            mode: LicenseMode::Restricted,
            output_level: default_level,
            output_applied: false,
            override_until_ms: None,
            last_clock_sync_ms: None,
            last_reconnect_attempt_ms: None,
            pending: Vec::new(),
        }
    }

    /// Settles the initial mode. A cached license that is still valid is
    /// trusted without a network round trip; otherwise one remote check is
    /// attempted when the network is up.
    pub fn boot<T: LicenseTransport + ?Sized>(
        &mut self,
        now_ms: u64,
        today: Option<NaiveDate>,
        network_up: bool,
        validator: &LicenseValidator,
        transport: &mut T,
        identity: &DeviceIdentity,
    ) -> LicenseMode {
        self.last_clock_sync_ms = Some(now_ms);

        let cached_valid = today.is_some_and(|today| self.license.is_valid(today));
        if !cached_valid {
            match today {
                Some(today) if network_up => {
                    if let Err(err) = self.revalidate(validator, transport, identity, today) {
                        warn!("boot license check failed, keeping cached verdict: {err}");
                    }
                }
                Some(_) => warn!("network unavailable at boot, skipping license check"),
                None => warn!("clock not synchronised at boot, skipping license check"),
            }
        }

        let valid = today.is_some_and(|today| self.license.is_valid(today));
        self.mode = LicenseMode::from_validity(valid);
        info!("booted in {} mode", self.mode.as_str());
        self.mode
    }

    /// One loop iteration.
    pub fn tick(
        &mut self,
        now_ms: u64,
        local_now: Option<NaiveDateTime>,
        network_up: bool,
    ) -> Vec<ControlAction> {
        let mut actions = std::mem::take(&mut self.pending);

        self.schedule_clock_resync(now_ms, &mut actions);
        self.schedule_reconnect(now_ms, network_up, &mut actions);

        if let Some(now) = local_now {
            self.refresh_mode(now.date(), &mut actions);
        }
        self.expire_override(now_ms);

        let desired = self.desired_level(now_ms, local_now);
        if !self.output_applied || desired != self.output_level {
            self.output_level = desired;
            self.output_applied = true;
            actions.push(ControlAction::SetOutput(desired));
        }

        actions
    }

    pub fn add_schedule(
        &mut self,
        start_hour: u8,
        start_minute: u8,
        duration_secs: u32,
    ) -> Result<SlotIndex, ScheduleError> {
        let candidate = Schedule::new(start_hour, start_minute, duration_secs)?;
        self.schedules.add(candidate, &mut self.store)
    }

    pub fn delete_schedule(&mut self, index: SlotIndex) -> Result<(), ScheduleError> {
        self.schedules.delete(index, &mut self.store)
    }

    pub fn delete_all_schedules(&mut self) -> Result<(), ScheduleError> {
        self.schedules.delete_all(&mut self.store)
    }

    pub fn list_active_schedules(&self) -> Vec<(SlotIndex, Schedule)> {
        self.schedules
            .active_schedules()
            .map(|(index, schedule)| (index, *schedule))
            .collect()
    }

    pub fn set_default_level(&mut self, level: bool) -> Result<(), StorageError> {
        transaction(&mut self.store, |store| {
            store.put_u32(KEY_DEFAULT_LEVEL, u32::from(level))
        })?;
        self.default_level = level;
        info!("default level set to {}", if level { "HIGH" } else { "LOW" });
        Ok(())
    }

    /// Holds the activated level for `duration_ms`, then hands the output back
    /// to the schedule evaluation. Ignored while RESTRICTED.
    pub fn force_activate(&mut self, duration_ms: u64, now_ms: u64) -> u64 {
        if self.mode == LicenseMode::Restricted {
            return 0;
        }
        let duration_ms = duration_ms.min(self.config.max_force_activate_ms);
        self.override_until_ms = Some(now_ms.saturating_add(duration_ms));
        info!("output forced to activated level for {duration_ms}ms");
        duration_ms
    }

    /// User-triggered license check. Returns the resulting validity.
    pub fn request_license_recheck<T: LicenseTransport + ?Sized>(
        &mut self,
        validator: &LicenseValidator,
        transport: &mut T,
        identity: &DeviceIdentity,
        today: NaiveDate,
    ) -> bool {
        if let Err(err) = self.revalidate(validator, transport, identity, today) {
            warn!("license recheck failed, keeping cached verdict: {err}");
        }

        let mut actions = Vec::new();
        self.refresh_mode(today, &mut actions);
        self.pending.extend(actions);
        self.license.is_valid(today)
    }

    /// Forces the next tick to drive the output again, e.g. after a failed pin write.
    pub fn mark_output_stale(&mut self) {
        self.output_applied = false;
    }

    pub fn current_output_level(&self) -> bool {
        self.output_level
    }

    pub fn default_level(&self) -> bool {
        self.default_level
    }

    pub fn mode(&self) -> LicenseMode {
        self.mode
    }

    pub fn license_snapshot(&self) -> &LicenseSnapshot {
        self.license.snapshot()
    }

    pub fn override_remaining_ms(&self, now_ms: u64) -> u64 {
        self.override_until_ms
            .map(|until| until.saturating_sub(now_ms))
            .unwrap_or(0)
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn revalidate<T: LicenseTransport + ?Sized>(
        &mut self,
        validator: &LicenseValidator,
        transport: &mut T,
        identity: &DeviceIdentity,
        today: NaiveDate,
    ) -> Result<(), ValidationError> {
        let verdict = validator.revalidate(transport, identity, today)?;
        if let Err(err) = self.license.apply(&verdict, &mut self.store) {
            warn!("failed to persist license verdict: {err}");
        }
        Ok(())
    }

    fn refresh_mode(&mut self, today: NaiveDate, actions: &mut Vec<ControlAction>) {
        let mode = LicenseMode::from_validity(self.license.is_valid(today));
        if mode == self.mode {
            return;
        }

        info!("license mode {} -> {}", self.mode.as_str(), mode.as_str());
        self.mode = mode;
        if mode == LicenseMode::Restricted {
            self.override_until_ms = None;
        }
        actions.push(ControlAction::ModeChanged(mode));
    }

    fn schedule_clock_resync(&mut self, now_ms: u64, actions: &mut Vec<ControlAction>) {
        let due = self
            .last_clock_sync_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.clock_resync_interval_ms)
            .unwrap_or(true);
        if due {
            self.last_clock_sync_ms = Some(now_ms);
            actions.push(ControlAction::ResyncClock);
        }
    }

    fn schedule_reconnect(
        &mut self,
        now_ms: u64,
        network_up: bool,
        actions: &mut Vec<ControlAction>,
    ) {
        if network_up {
            self.last_reconnect_attempt_ms = None;
            return;
        }

        let due = self
            .last_reconnect_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.reconnect_interval_ms)
            .unwrap_or(true);
        if due {
            self.last_reconnect_attempt_ms = Some(now_ms);
            actions.push(ControlAction::ReconnectNetwork);
        }
    }

    fn expire_override(&mut self, now_ms: u64) {
        if let Some(until) = self.override_until_ms {
            if now_ms >= until {
                self.override_until_ms = None;
            }
        }
    }

    fn desired_level(&self, now_ms: u64, local_now: Option<NaiveDateTime>) -> bool {
        if self.mode == LicenseMode::Restricted {
            return self.default_level;
        }
        if self.override_remaining_ms(now_ms) > 0 {
            return !self.default_level;
        }
        match local_now {
            Some(now) => evaluate(
                seconds_since_midnight(now.time()),
                self.schedules.active_schedules(),
                self.default_level,
            ),
            None => self.default_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::TransportError,
        ports::HttpReply,
        storage::MemoryStore,
    };

    struct FakeAuthority {
        reply: Result<HttpReply, TransportError>,
        calls: usize,
    }

    impl FakeAuthority {
        fn active_until(year: i32, month: u32, day: u32) -> Self {
            Self::answering(true, false, year, month, day)
        }

        fn answering(status: bool, expired: bool, year: i32, month: u32, day: u32) -> Self {
            let body = serde_json::json!({
                "status": status,
                "expired": expired,
                "mac_address": identity().as_str(),
                "expiry_date": { "year": year, "month": month, "day": day },
            });
            Self {
                reply: Ok(HttpReply {
                    status: 200,
                    body: body.to_string().into_bytes(),
                }),
                calls: 0,
            }
        }

        fn garbled() -> Self {
            Self {
                reply: Ok(HttpReply {
                    status: 200,
                    body: b"<html>maintenance</html>".to_vec(),
                }),
                calls: 0,
            }
        }

        fn unreachable() -> Self {
            Self {
                reply: Err(TransportError("no route to host".to_string())),
                calls: 0,
            }
        }
    }

    impl LicenseTransport for FakeAuthority {
        fn post_json(&mut self, _url: &str, _body: &[u8]) -> Result<HttpReply, TransportError> {
            self.calls += 1;
            self.reply.clone()
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_mac([0x40, 0xF5, 0x20, 0x23, 0x01, 0x2E])
    }

    fn validator() -> LicenseValidator {
        LicenseValidator::new("http://license.test/check")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        today().and_hms_opt(hour, minute, second).unwrap()
    }

    fn controller(store: MemoryStore) -> SwitchController<MemoryStore> {
        SwitchController::load(ControllerConfig::default(), &OutputConfig::default(), store)
    }

    fn licensed() -> SwitchController<MemoryStore> {
        let mut controller = controller(MemoryStore::new());
        let mode = controller.boot(
            0,
            Some(today()),
            true,
            &validator(),
            &mut FakeAuthority::active_until(2027, 1, 1),
            &identity(),
        );
        assert_eq!(mode, LicenseMode::Active);
        controller
    }

    fn outputs(actions: &[ControlAction]) -> Vec<bool> {
        actions
            .iter()
            .filter_map(|action| match action {
                ControlAction::SetOutput(level) => Some(*level),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn valid_cache_boots_active_without_network() {
        let mut store = MemoryStore::new();
        LicenseCache::default()
            .update(LicenseSnapshot::expiring(today()), &mut store)
            .unwrap();

        let mut controller = controller(store);
        let mut authority = FakeAuthority::unreachable();
        let mode = controller.boot(
            0,
            Some(today()),
            true,
            &validator(),
            &mut authority,
            &identity(),
        );

        assert_eq!(mode, LicenseMode::Active);
        assert_eq!(authority.calls, 0);
    }

    #[test]
    fn failed_boot_check_settles_restricted() {
        let mut controller = controller(MemoryStore::new());
        let mut authority = FakeAuthority::unreachable();
        let mode = controller.boot(
            0,
            Some(today()),
            true,
            &validator(),
            &mut authority,
            &identity(),
        );

        assert_eq!(mode, LicenseMode::Restricted);
        assert_eq!(authority.calls, 1);
    }

    #[test]
    fn restricted_mode_holds_default_level() {
        let mut controller = controller(MemoryStore::new());
        controller.boot(
            0,
            Some(today()),
            false,
            &validator(),
            &mut FakeAuthority::unreachable(),
            &identity(),
        );
        controller.add_schedule(8, 0, 3600).unwrap();
        controller.force_activate(10_000, 0);

        let actions = controller.tick(1_000, Some(at(8, 30, 0)), true);
        assert_eq!(outputs(&actions), vec![true]);
        assert!(controller.current_output_level());
    }

    #[test]
    fn active_mode_follows_schedule_window() {
        let mut controller = licensed();
        controller.add_schedule(8, 0, 3600).unwrap();

        assert_eq!(outputs(&controller.tick(1_000, Some(at(7, 59, 59)), true)), vec![true]);
        assert_eq!(outputs(&controller.tick(2_000, Some(at(8, 0, 0)), true)), vec![false]);
        assert!(outputs(&controller.tick(3_000, Some(at(8, 59, 59)), true)).is_empty());
        assert_eq!(outputs(&controller.tick(4_000, Some(at(9, 0, 0)), true)), vec![true]);
    }

    #[test]
    fn unsynchronised_clock_holds_default_level() {
        let mut controller = licensed();
        controller.add_schedule(0, 0, 86_399).unwrap();

        assert_eq!(outputs(&controller.tick(1_000, None, true)), vec![true]);
    }

    #[test]
    fn override_reverts_after_hold() {
        let mut controller = licensed();
        controller.tick(0, Some(at(12, 0, 0)), true);

        controller.force_activate(5_000, 1_000);
        assert_eq!(outputs(&controller.tick(1_000, Some(at(12, 0, 1)), true)), vec![false]);
        assert!(outputs(&controller.tick(5_999, Some(at(12, 0, 5)), true)).is_empty());
        assert_eq!(outputs(&controller.tick(6_000, Some(at(12, 0, 6)), true)), vec![true]);
        assert_eq!(controller.override_remaining_ms(6_000), 0);
    }

    #[test]
    fn force_activate_is_capped() {
        let mut controller = licensed();
        let granted = controller.force_activate(u64::MAX, 0);
        assert_eq!(granted, controller.config.max_force_activate_ms);
    }

    #[test]
    fn transport_failure_keeps_cached_license() {
        let mut controller = licensed();
        let still_valid = controller.request_license_recheck(
            &validator(),
            &mut FakeAuthority::unreachable(),
            &identity(),
            today(),
        );

        assert!(still_valid);
        assert_eq!(controller.mode(), LicenseMode::Active);
    }

    #[test]
    fn malformed_reply_keeps_cached_license() {
        let mut controller = licensed();
        let cached = *controller.license_snapshot();

        let authorities = [
            FakeAuthority::garbled(),
            FakeAuthority::answering(true, false, 2026, 2, 30),
        ];
        for mut authority in authorities {
            let still_valid = controller.request_license_recheck(
                &validator(),
                &mut authority,
                &identity(),
                today(),
            );
            assert!(still_valid);
            assert_eq!(authority.calls, 1);
        }

        assert_eq!(controller.license_snapshot(), &cached);
        assert_eq!(controller.mode(), LicenseMode::Active);
        assert!(!controller
            .tick(1_000, Some(at(12, 0, 0)), true)
            .contains(&ControlAction::ModeChanged(LicenseMode::Restricted)));
    }

    #[test]
    fn malformed_boot_reply_leaves_cache_untouched() {
        let yesterday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let mut store = MemoryStore::new();
        LicenseCache::default()
            .update(LicenseSnapshot::expiring(yesterday), &mut store)
            .unwrap();
        let mut controller = controller(store);

        let mut authority = FakeAuthority::garbled();
        let mode = controller.boot(
            0,
            Some(today()),
            true,
            &validator(),
            &mut authority,
            &identity(),
        );

        assert_eq!(authority.calls, 1);
        assert_eq!(mode, LicenseMode::Restricted);
        assert_eq!(controller.license_snapshot(), &LicenseSnapshot::expiring(yesterday));
    }

    #[test]
    fn explicit_expiry_clears_cache_and_restricts() {
        let mut controller = licensed();
        controller.add_schedule(8, 0, 3600).unwrap();
        controller.tick(0, Some(at(8, 30, 0)), true);
        assert!(!controller.current_output_level());

        let valid = controller.request_license_recheck(
            &validator(),
            &mut FakeAuthority::answering(true, true, 2027, 1, 1),
            &identity(),
            today(),
        );
        assert!(!valid);
        assert_eq!(controller.license_snapshot(), &LicenseSnapshot::empty());

        let actions = controller.tick(1_000, Some(at(8, 30, 1)), true);
        assert_eq!(
            actions,
            vec![
                ControlAction::ModeChanged(LicenseMode::Restricted),
                ControlAction::SetOutput(true),
            ]
        );
    }

    #[test]
    fn recheck_can_lift_restriction() {
        let mut controller = controller(MemoryStore::new());
        controller.boot(
            0,
            Some(today()),
            false,
            &validator(),
            &mut FakeAuthority::unreachable(),
            &identity(),
        );

        let valid = controller.request_license_recheck(
            &validator(),
            &mut FakeAuthority::active_until(2026, 10, 19),
            &identity(),
            today(),
        );
        assert!(valid);
        assert_eq!(controller.mode(), LicenseMode::Active);
        assert!(controller
            .tick(1_000, Some(at(12, 0, 0)), true)
            .contains(&ControlAction::ModeChanged(LicenseMode::Active)));
    }

    #[test]
    fn license_lapses_at_day_rollover() {
        let mut controller = controller(MemoryStore::new());
        controller.boot(
            0,
            Some(today()),
            true,
            &validator(),
            &mut FakeAuthority::active_until(2026, 10, 19),
            &identity(),
        );

        assert!(!controller
            .tick(1_000, Some(at(23, 59, 59)), true)
            .contains(&ControlAction::ModeChanged(LicenseMode::Restricted)));
        let next_day = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(controller
            .tick(2_000, Some(next_day), true)
            .contains(&ControlAction::ModeChanged(LicenseMode::Restricted)));
    }

    #[test]
    fn resync_and_reconnect_follow_uptime() {
        let mut controller = licensed();
        let day = controller.config.clock_resync_interval_ms;
        let reconnect = controller.config.reconnect_interval_ms;

        assert!(!controller.tick(1_000, None, true).contains(&ControlAction::ResyncClock));
        assert!(controller.tick(day, None, true).contains(&ControlAction::ResyncClock));

        assert!(controller.tick(day + 1, None, false).contains(&ControlAction::ReconnectNetwork));
        assert!(!controller
            .tick(day + reconnect, None, false)
            .contains(&ControlAction::ReconnectNetwork));
        assert!(controller
            .tick(day + 1 + reconnect, None, false)
            .contains(&ControlAction::ReconnectNetwork));
    }

    #[test]
    fn state_round_trips_through_power_cycle() {
        let mut controller = licensed();
        controller.add_schedule(6, 30, 1800).unwrap();
        controller.add_schedule(19, 0, 7200).unwrap();
        controller.add_schedule(22, 0, 60).unwrap();
        controller.delete_schedule(0).unwrap();
        controller.set_default_level(false).unwrap();

        let expected = controller.list_active_schedules();
        let mut store = std::mem::take(controller.store_mut());
        store.power_cycle();

        let reloaded = self::controller(store);
        assert_eq!(reloaded.list_active_schedules(), expected);
        assert!(!reloaded.default_level());
        assert!(reloaded.license_snapshot().is_set);
    }

    #[test]
    fn rejected_default_level_is_not_committed_later() {
        let mut controller = licensed();
        controller.store_mut().fail_commits(true);
        assert!(controller.set_default_level(false).is_err());
        assert!(controller.default_level());

        controller.store_mut().fail_commits(false);
        controller.add_schedule(8, 0, 3600).unwrap();

        let mut store = std::mem::take(controller.store_mut());
        store.power_cycle();
        let reloaded = self::controller(store);
        assert!(reloaded.default_level());
        assert_eq!(reloaded.list_active_schedules().len(), 1);
    }

    #[test]
    fn rejected_schedule_is_not_committed_by_default_level_change() {
        let mut controller = licensed();
        controller.store_mut().fail_commits(true);
        assert!(matches!(
            controller.add_schedule(8, 0, 3600),
            Err(ScheduleError::Storage(_))
        ));

        controller.store_mut().fail_commits(false);
        controller.set_default_level(false).unwrap();

        let mut store = std::mem::take(controller.store_mut());
        store.power_cycle();
        let reloaded = self::controller(store);
        assert!(reloaded.list_active_schedules().is_empty());
        assert!(!reloaded.default_level());
    }

    #[test]
    fn unpersisted_license_verdict_is_not_committed_later() {
        let mut controller = licensed();
        controller.store_mut().fail_commits(true);
        let valid = controller.request_license_recheck(
            &validator(),
            &mut FakeAuthority::answering(false, false, 2027, 1, 1),
            &identity(),
            today(),
        );
        assert!(!valid);

        controller.store_mut().fail_commits(false);
        controller.set_default_level(false).unwrap();

        let mut store = std::mem::take(controller.store_mut());
        store.power_cycle();
        let reloaded = self::controller(store);
        let on_disk = LicenseSnapshot::expiring(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap());
        assert_eq!(reloaded.license_snapshot(), &on_disk);
    }
}
