pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod license;
pub mod network;
pub mod ports;
pub mod schedule;
pub mod storage;
pub mod window;

pub use config::{ControllerConfig, LicenseConfig, NetworkConfig, OutputConfig, RuntimeConfig};
pub use controller::{ControlAction, LicenseMode, SwitchController};
pub use error::{PortError, ScheduleError, StorageError, TransportError, ValidationError};
pub use identity::DeviceIdentity;
pub use license::{
    LicenseCache, LicenseSnapshot, LicenseValidator, LicenseVerdict, RevocationReason,
};
pub use network::{Credentials, NetworkMode, NetworkSettings, NetworkSettingsUpdate};
pub use ports::{Clock, HttpReply, LicenseTransport, NetworkLink, OutputPin};
pub use schedule::{Schedule, ScheduleStore, SlotIndex, MAX_SCHEDULES};
pub use storage::{check_bounds, MemoryStore, PersistentStore, StoredValue, REGION_SIZE};
pub use window::{evaluate, seconds_since_midnight};
