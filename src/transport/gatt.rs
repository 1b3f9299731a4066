use std::fmt;
use std::sync::{Arc, Weak};

use btleplug::api::{CharPropFlags, WriteType};
use uuid::Uuid;

use crate::error::RadioError;

/// Backend-specific identifier of a peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display, derive_more::From)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wraps a backend-specific identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A characteristic discovered on the connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GattCharacteristic {
    uuid: Uuid,
    properties: CharPropFlags,
    descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Creates a characteristic description.
    #[must_use]
    pub fn new(uuid: Uuid, properties: CharPropFlags, descriptors: Vec<Uuid>) -> Self {
        Self {
            uuid,
            properties,
            descriptors,
        }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the advertised properties.
    #[must_use]
    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    /// Returns the UUIDs of descriptors attached to this characteristic.
    #[must_use]
    pub fn descriptors(&self) -> &[Uuid] {
        &self.descriptors
    }

    pub(crate) fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

/// A GATT service with its discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GattService {
    uuid: Uuid,
    characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Creates a service description.
    #[must_use]
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns all characteristics of this service.
    #[must_use]
    pub fn characteristics(&self) -> &[GattCharacteristic] {
        &self.characteristics
    }

    pub(crate) fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == *uuid)
    }
}

/// Link-layer connection state reported by the radio.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum LinkState {
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "disconnecting")]
    Disconnecting,
    #[strum(to_string = "disconnected")]
    Disconnected,
}

/// Value written to a client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CccdValue {
    EnableNotification,
    EnableIndication,
}

impl CccdValue {
    /// Returns the descriptor bytes in wire order.
    #[must_use]
    pub fn bytes(self) -> [u8; 2] {
        match self {
            Self::EnableNotification => [0x01, 0x00],
            Self::EnableIndication => [0x02, 0x00],
        }
    }
}

/// Asynchronous notifications delivered by the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged {
        state: LinkState,
        status: u8,
    },
    ServicesDiscovered {
        services: Vec<GattService>,
    },
    MtuChanged {
        mtu: u16,
        success: bool,
    },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        success: bool,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        success: bool,
    },
    PairingRequest {
        variant: i32,
    },
    BondStateChanged {
        previous: i32,
        current: i32,
    },
}

/// Operations a connection asks the radio to start.
#[derive(Debug, Clone, PartialEq)]
pub enum GattRequest {
    DiscoverServices,
    RequestMtu {
        mtu: u16,
    },
    SetNotification {
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: CccdValue,
    },
    WriteCharacteristic {
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect,
}

/// An open GATT link to one peripheral.
///
/// `submit` only initiates an operation; its outcome arrives later through the
/// link's [`GattCallbacks`]. An `Err` means the operation could not be started.
pub trait GattLink: Send + Sync + fmt::Debug {
    /// Starts one GATT operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio refuses to start the operation.
    fn submit(&self, request: GattRequest) -> Result<(), RadioError>;

    /// Releases the link. Further requests fail and no further events are delivered.
    fn close(&self);
}

/// Opens GATT links to peripherals.
pub trait Radio: Send + Sync + fmt::Debug {
    /// Opens a link; progress is reported through `callbacks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio cannot start connecting.
    fn connect_gatt(
        &self,
        peripheral: &PeripheralId,
        callbacks: GattCallbacks,
    ) -> Result<Arc<dyn GattLink>, RadioError>;
}

/// Receiver of radio notifications for one link.
pub(crate) trait GattEventHandler: Send + Sync {
    fn handle_gatt_event(&self, event: GattEvent);
}

/// Callback handle through which a radio reports events for one link.
///
/// Holds only a weak reference, so events for a dropped connection are ignored.
#[derive(Clone)]
pub struct GattCallbacks {
    handler: Weak<dyn GattEventHandler>,
}

impl GattCallbacks {
    pub(crate) fn new(handler: Weak<dyn GattEventHandler>) -> Self {
        Self { handler }
    }

    /// Delivers one radio event to the owning connection.
    pub fn deliver(&self, event: GattEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.handle_gatt_event(event);
        }
    }

    /// Returns whether the owning connection still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.handler.strong_count() > 0
    }
}

impl fmt::Debug for GattCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCallbacks")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Renders characteristic properties as lowercase labels joined by `|`.
pub(crate) fn property_labels(flags: CharPropFlags) -> String {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        "none".to_string()
    } else {
        labels.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CharPropFlags::empty(), "none")]
    #[case(CharPropFlags::WRITE, "write")]
    #[case(CharPropFlags::READ | CharPropFlags::NOTIFY, "read | notify")]
    fn property_labels_render_flag_names(#[case] flags: CharPropFlags, #[case] expected: &str) {
        assert_eq!(expected, property_labels(flags));
    }

    #[rstest]
    #[case(CccdValue::EnableNotification, [0x01, 0x00])]
    #[case(CccdValue::EnableIndication, [0x02, 0x00])]
    fn cccd_values_match_wire_bytes(#[case] value: CccdValue, #[case] expected: [u8; 2]) {
        assert_eq!(expected, value.bytes());
    }

    #[test]
    fn callbacks_for_dropped_handler_are_inert() {
        struct Counting(std::sync::atomic::AtomicUsize);
        impl GattEventHandler for Counting {
            fn handle_gatt_event(&self, _event: GattEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let handler = Arc::new(Counting(std::sync::atomic::AtomicUsize::new(0)));
        let weak: Weak<dyn GattEventHandler> = Arc::downgrade(&handler) as Weak<dyn GattEventHandler>;
        let callbacks = GattCallbacks::new(weak);

        callbacks.deliver(GattEvent::PairingRequest { variant: 0 });
        assert_eq!(1, handler.0.load(std::sync::atomic::Ordering::SeqCst));

        drop(handler);
        assert_eq!(false, callbacks.is_alive());
        callbacks.deliver(GattEvent::PairingRequest { variant: 0 });
    }
}
