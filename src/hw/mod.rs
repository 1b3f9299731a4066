mod btleplug_backend;
mod fake_backend;
mod hardware;
mod model;

pub use self::btleplug_backend::BtleplugRadio;
pub use self::fake_backend::FakeRadio;
pub(crate) use self::fake_backend::{FakeBackendConfig, NotificationPayloads, ScanFixture};
pub use self::hardware::{DiscoveredPeripheral, HardwareClient};
pub(crate) use self::hardware::{fake_hardware_client, real_hardware_client};
pub use self::model::FoundDevice;
