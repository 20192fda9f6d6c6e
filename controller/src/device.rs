use log::{info, warn};

use switch_common::{
    Clock, ControlAction, DeviceIdentity, LicenseMode, LicenseTransport, LicenseValidator,
    NetworkConfig, NetworkLink, NetworkSettings, OutputPin, PersistentStore, RuntimeConfig,
    SwitchController,
};

/// Hardware seams the device runs against.
pub struct Ports {
    pub transport: Box<dyn LicenseTransport>,
    pub clock: Box<dyn Clock>,
    pub output: Box<dyn OutputPin>,
    pub network: Box<dyn NetworkLink>,
}

/// Everything the single control loop owns. Nothing here is shared.
pub struct Device<S: PersistentStore> {
    pub(crate) controller: SwitchController<S>,
    pub(crate) validator: LicenseValidator,
    pub(crate) identity: DeviceIdentity,
    pub(crate) network_settings: NetworkSettings,
    pub(crate) ports: Ports,
}

impl<S: PersistentStore> Device<S> {
    pub fn boot(
        runtime: &RuntimeConfig,
        store: S,
        identity: DeviceIdentity,
        mut ports: Ports,
        now_ms: u64,
    ) -> Self {
        let mut controller =
            SwitchController::load(runtime.controller.clone(), &runtime.output, store);
        let network_settings = load_network_settings(&mut controller, &runtime.network);

        if !ports.clock.resync() {
            warn!("initial time synchronisation failed");
        }

        let validator = LicenseValidator::new(runtime.license.endpoint.clone());
        let today = ports.clock.now_local().map(|now| now.date());
        let network_up = ports.network.is_connected();
        controller.boot(
            now_ms,
            today,
            network_up,
            &validator,
            ports.transport.as_mut(),
            &identity,
        );

        info!("device {identity} ready");
        Self {
            controller,
            validator,
            identity,
            network_settings,
            ports,
        }
    }

    /// One pass of the control loop.
    pub fn iterate(&mut self, now_ms: u64) {
        let local_now = self.ports.clock.now_local();
        let network_up = self.ports.network.is_connected();

        for action in self.controller.tick(now_ms, local_now, network_up) {
            self.execute(action);
        }
    }

    pub fn mode(&self) -> LicenseMode {
        self.controller.mode()
    }

    fn execute(&mut self, action: ControlAction) {
        match action {
            ControlAction::SetOutput(level) => {
                if let Err(err) = self.ports.output.set_level(level) {
                    warn!("failed to drive output: {err}");
                    self.controller.mark_output_stale();
                } else {
                    info!("output {}", if level { "HIGH" } else { "LOW" });
                }
            }
            ControlAction::ResyncClock => {
                if self.ports.clock.resync() {
                    info!("clock resynchronised");
                } else {
                    warn!("clock resync failed");
                }
            }
            ControlAction::ReconnectNetwork => {
                info!("network down, attempting reconnect");
                if let Err(err) = self.ports.network.reconnect() {
                    warn!("network reconnect failed: {err}");
                }
            }
            ControlAction::ModeChanged(mode) => {
                info!("request handlers switched to {} set", mode.as_str());
            }
        }
    }
}

fn load_network_settings<S: PersistentStore>(
    controller: &mut SwitchController<S>,
    defaults: &NetworkConfig,
) -> NetworkSettings {
    NetworkSettings::load(controller.store_mut(), defaults).unwrap_or_else(|err| {
        warn!("failed to load network settings, using defaults: {err}");
        NetworkSettings::from_config(defaults)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, rc::Rc};

    use chrono::{NaiveDate, NaiveDateTime};
    use switch_common::{HttpReply, MemoryStore, PortError, TransportError};

    use super::*;

    #[derive(Default)]
    pub(crate) struct Probe {
        pub levels: Vec<bool>,
        pub resyncs: usize,
        pub reconnects: usize,
        pub license_calls: usize,
        pub now: Option<NaiveDateTime>,
        pub connected: bool,
        pub license_reply: Option<HttpReply>,
        pub fail_output: bool,
    }

    pub(crate) type Shared = Rc<RefCell<Probe>>;

    struct FakeClock(Shared);
    struct FakePin(Shared);
    struct FakeLink(Shared);
    struct FakeTransport(Shared);

    impl Clock for FakeClock {
        fn now_local(&self) -> Option<NaiveDateTime> {
            self.0.borrow().now
        }

        fn resync(&mut self) -> bool {
            self.0.borrow_mut().resyncs += 1;
            true
        }
    }

    impl OutputPin for FakePin {
        fn set_level(&mut self, high: bool) -> Result<(), PortError> {
            let mut probe = self.0.borrow_mut();
            if probe.fail_output {
                return Err(PortError("gpio busy".to_string()));
            }
            probe.levels.push(high);
            Ok(())
        }
    }

    impl NetworkLink for FakeLink {
        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }

        fn reconnect(&mut self) -> Result<(), PortError> {
            self.0.borrow_mut().reconnects += 1;
            Ok(())
        }
    }

    impl LicenseTransport for FakeTransport {
        fn post_json(&mut self, _url: &str, _body: &[u8]) -> Result<HttpReply, TransportError> {
            let mut probe = self.0.borrow_mut();
            probe.license_calls += 1;
            probe
                .license_reply
                .clone()
                .ok_or_else(|| TransportError("offline".to_string()))
        }
    }

    pub(crate) fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    pub(crate) fn identity() -> DeviceIdentity {
        DeviceIdentity::from_mac([0x40, 0xF5, 0x20, 0x23, 0x01, 0x2E])
    }

    pub(crate) fn license_reply(status: bool, expired: bool) -> HttpReply {
        let body = serde_json::json!({
            "status": status,
            "expired": expired,
            "mac_address": identity().as_str(),
            "expiry_date": { "year": 2027, "month": 1, "day": 1 },
        });
        HttpReply {
            status: 200,
            body: body.to_string().into_bytes(),
        }
    }

    pub(crate) fn device(probe: &Shared) -> Device<MemoryStore> {
        let ports = Ports {
            transport: Box::new(FakeTransport(probe.clone())),
            clock: Box::new(FakeClock(probe.clone())),
            output: Box::new(FakePin(probe.clone())),
            network: Box::new(FakeLink(probe.clone())),
        };
        Device::boot(&RuntimeConfig::default(), MemoryStore::new(), identity(), ports, 0)
    }

    pub(crate) fn licensed_probe() -> Shared {
        Rc::new(RefCell::new(Probe {
            now: Some(noon()),
            connected: true,
            license_reply: Some(license_reply(true, false)),
            ..Default::default()
        }))
    }

    #[test]
    fn boot_syncs_clock_and_checks_license() {
        let probe = licensed_probe();
        let device = device(&probe);

        assert_eq!(device.mode(), LicenseMode::Active);
        assert_eq!(probe.borrow().resyncs, 1);
        assert_eq!(probe.borrow().license_calls, 1);
    }

    #[test]
    fn offline_boot_is_restricted_and_skips_license_call() {
        let probe = licensed_probe();
        probe.borrow_mut().connected = false;
        let mut device = device(&probe);

        assert_eq!(device.mode(), LicenseMode::Restricted);
        assert_eq!(probe.borrow().license_calls, 0);

        device.iterate(1_000);
        assert_eq!(probe.borrow().reconnects, 1);
        assert_eq!(probe.borrow().levels, vec![true]);
    }

    #[test]
    fn failed_pin_write_is_retried_next_iteration() {
        let probe = licensed_probe();
        let mut device = device(&probe);

        probe.borrow_mut().fail_output = true;
        device.iterate(1_000);
        assert!(probe.borrow().levels.is_empty());

        probe.borrow_mut().fail_output = false;
        device.iterate(2_000);
        assert_eq!(probe.borrow().levels, vec![true]);
    }
}
