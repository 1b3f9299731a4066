mod app;
mod cli;
mod dispatch;
mod error;
mod event;
mod hw;
mod protocol;
mod telemetry;
mod terminal;
mod transport;
mod utils;

pub use app::{
    fake_hardware_client, real_hardware_client, run, run_with_clients,
    run_with_clients_and_log_level, run_with_log_level,
};
pub use cli::{Args, Command, FakeArgs, LogLevel, Newline, OutputFormat, TerminalArgs};
pub use dispatch::{ForegroundHandle, ForegroundLoop, ForegroundTask, SerialService};
pub use error::{FixtureError, RadioError, SerialError, TransportError};
pub use event::{SerialEvent, SerialListener};
pub use hw::{BtleplugRadio, DiscoveredPeripheral, FakeRadio, FoundDevice, HardwareClient};
pub use protocol::{
    ATT_HEADER_LEN, CCCD_UUID, DEFAULT_MTU, DEFAULT_PAYLOAD_SIZE, READ_CREDITS_HIGH_WATER,
    READ_CREDITS_LOW_WATER, REQUESTED_MTU, VendorProfile,
};
pub use terminal::TerminalClient;
pub use transport::{
    CccdValue, Connection, ConnectionState, GattCallbacks, GattCharacteristic, GattEvent,
    GattLink, GattRequest, GattService, LinkState, PeripheralId, Radio,
};
