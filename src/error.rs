use thiserror::Error;
use uuid::Uuid;

/// Cause carried by `ConnectError` and `IoError` serial events.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("connectGatt failed")]
    ConnectGattFailed,
    #[error("discoverServices failed")]
    DiscoverServicesFailed,
    #[error("gatt status {status}")]
    LinkLost { status: u8 },
    #[error("no serial profile found")]
    NoSerialProfile,
    #[error("multiple write characteristics ({first}/{second})")]
    MultipleWriteCharacteristics { first: String, second: String },
    #[error("no write characteristic ({first}/{second})")]
    NoWriteCharacteristic { first: String, second: String },
    #[error("{role} characteristic not found")]
    CharacteristicNotFound { role: &'static str },
    #[error("request MTU failed")]
    RequestMtuFailed,
    #[error("write characteristic not writable")]
    WriteCharacteristicNotWritable,
    #[error("no notification for {role} characteristic")]
    NotificationUnsupported { role: &'static str },
    #[error("no CCCD descriptor for {role} characteristic")]
    MissingCccd { role: &'static str },
    #[error("no indication/notification for read characteristic ({properties})")]
    NoIndicationOrNotification { properties: String },
    #[error("{role} characteristic CCCD descriptor not writable")]
    CccdNotWritable { role: &'static str },
    #[error("write descriptor failed")]
    WriteDescriptorFailed,
    #[error("write credits descriptor failed")]
    WriteCreditsDescriptorFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("write read credits failed")]
    GrantReadCreditsFailed,
    #[error("pairing request")]
    PairingRequest,
}

/// Errors returned synchronously by the serial API.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("listener must be attached from the foreground thread")]
    NotOnForeground,
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Errors raised by radio backends.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{id}` is not known to this radio")]
    UnknownPeripheral { id: String },
    #[error("characteristic {uuid} is not present on the connected peripheral")]
    UnknownCharacteristic { uuid: Uuid },
    #[error("the GATT link is closed")]
    LinkClosed,
    #[error("radio links must be opened from within a tokio runtime")]
    NoRuntime,
    #[error("no peripheral matching `{prefix}*` was found in the fake fixture")]
    NoMatchingFixtureDevice { prefix: String },
}

/// Errors returned when parsing fake backend fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid hex payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TransportError::NoSerialProfile, "no serial profile found")]
    #[case(TransportError::LinkLost { status: 8 }, "gatt status 8")]
    #[case(
        TransportError::CharacteristicNotFound { role: "read credits" },
        "read credits characteristic not found"
    )]
    #[case(
        TransportError::MultipleWriteCharacteristics {
            first: "write".to_string(),
            second: "write | notify".to_string(),
        },
        "multiple write characteristics (write/write | notify)"
    )]
    fn transport_errors_render_expected_messages(
        #[case] error: TransportError,
        #[case] expected: &str,
    ) {
        assert_eq!(expected, error.to_string());
    }
}
