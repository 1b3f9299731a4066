mod connection;
mod delegate;
pub(crate) mod gatt;
mod machine;
mod write_queue;

pub use connection::Connection;
pub use gatt::{
    CccdValue, GattCallbacks, GattCharacteristic, GattEvent, GattLink, GattRequest, GattService,
    LinkState, PeripheralId, Radio,
};
pub use machine::ConnectionState;
