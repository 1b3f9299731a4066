use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use uuid::Uuid;

/// ATT MTU requested during connection setup.
pub const REQUESTED_MTU: u16 = 512;
/// ATT MTU assumed until negotiation completes.
pub const DEFAULT_MTU: u16 = 23;
/// ATT header bytes subtracted from the MTU to obtain the write payload budget.
pub const ATT_HEADER_LEN: u16 = 3;
/// Payload budget used when MTU negotiation is not granted.
pub const DEFAULT_PAYLOAD_SIZE: usize = (DEFAULT_MTU - ATT_HEADER_LEN) as usize;

/// Read credits at or below which a fresh batch is granted to the peer.
pub const READ_CREDITS_LOW_WATER: u32 = 16;
/// Read credit balance restored by each grant.
pub const READ_CREDITS_HIGH_WATER: u32 = 64;

/// Client characteristic configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub(crate) const CC254X_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub(crate) const CC254X_RW_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

pub(crate) const RN4870_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);
pub(crate) const RN4870_RW_UUID: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);

pub(crate) const NORDIC_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub(crate) const NORDIC_RW2_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub(crate) const NORDIC_RW3_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

pub(crate) const TIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fefb_0000_1000_8000_00805f9b34fb);
pub(crate) const TIO_DATA_TX_UUID: Uuid = Uuid::from_u128(0x00000001_0000_1000_8000_008025000000);
pub(crate) const TIO_DATA_RX_UUID: Uuid = Uuid::from_u128(0x00000002_0000_1000_8000_008025000000);
pub(crate) const TIO_CREDITS_TX_UUID: Uuid =
    Uuid::from_u128(0x00000003_0000_1000_8000_008025000000);
pub(crate) const TIO_CREDITS_RX_UUID: Uuid =
    Uuid::from_u128(0x00000004_0000_1000_8000_008025000000);

/// Vendor serial profiles recognised during service discovery.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, clap::ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum VendorProfile {
    /// TI CC254x legacy UART: one characteristic for both directions.
    #[strum(to_string = "cc254x")]
    Cc254x,
    /// Microchip RN4870 transparent UART: one characteristic for both directions.
    #[strum(to_string = "rn4870")]
    Rn4870,
    /// Nordic UART service: two characteristics whose roles are detected at runtime.
    #[strum(to_string = "nordic")]
    Nordic,
    /// Telit TIO 2.0: split data characteristics with credit-based flow control.
    #[strum(to_string = "telit_tio")]
    TelitTio,
}

/// Characteristic layout a profile expects inside its service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CharacteristicLayout {
    /// One characteristic serves reads and writes.
    Single { read_write: Uuid },
    /// Two characteristics; exactly one must be writable.
    Split { first: Uuid, second: Uuid },
    /// Data and credit characteristics of a credit-flow profile.
    Credit {
        data_write: Uuid,
        data_read: Uuid,
        credits_in: Uuid,
        credits_out: Uuid,
    },
}

/// Descriptive metadata for one vendor profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ProfileMetadata {
    name: &'static str,
    service_uuid: Uuid,
    layout: CharacteristicLayout,
}

impl ProfileMetadata {
    /// Human-readable profile name.
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    /// Service UUID that selects this profile.
    pub(crate) fn service_uuid(self) -> Uuid {
        self.service_uuid
    }

    /// Characteristic layout within the service.
    pub(crate) fn layout(self) -> CharacteristicLayout {
        self.layout
    }
}

/// Profile metadata keyed by service UUID.
static PROFILES_BY_SERVICE: LazyLock<HashMap<Uuid, VendorProfile>> = LazyLock::new(|| {
    VendorProfile::iter()
        .map(|profile| (metadata_for(profile).service_uuid, profile))
        .collect()
});

/// Returns metadata for one profile.
pub(crate) fn profile_metadata(profile: VendorProfile) -> ProfileMetadata {
    metadata_for(profile)
}

/// Returns the profile served by a service UUID, if it is a known serial service.
pub(crate) fn profile_for_service(service_uuid: &Uuid) -> Option<VendorProfile> {
    PROFILES_BY_SERVICE.get(service_uuid).copied()
}

fn metadata_for(profile: VendorProfile) -> ProfileMetadata {
    match profile {
        VendorProfile::Cc254x => ProfileMetadata {
            name: "cc254x uart",
            service_uuid: CC254X_SERVICE_UUID,
            layout: CharacteristicLayout::Single {
                read_write: CC254X_RW_UUID,
            },
        },
        VendorProfile::Rn4870 => ProfileMetadata {
            name: "rn4870 uart",
            service_uuid: RN4870_SERVICE_UUID,
            layout: CharacteristicLayout::Single {
                read_write: RN4870_RW_UUID,
            },
        },
        VendorProfile::Nordic => ProfileMetadata {
            name: "nrf uart",
            service_uuid: NORDIC_SERVICE_UUID,
            layout: CharacteristicLayout::Split {
                first: NORDIC_RW2_UUID,
                second: NORDIC_RW3_UUID,
            },
        },
        VendorProfile::TelitTio => ProfileMetadata {
            name: "telit tio 2.0",
            service_uuid: TIO_SERVICE_UUID,
            layout: CharacteristicLayout::Credit {
                data_write: TIO_DATA_TX_UUID,
                data_read: TIO_DATA_RX_UUID,
                credits_in: TIO_CREDITS_RX_UUID,
                credits_out: TIO_CREDITS_TX_UUID,
            },
        },
    }
}
