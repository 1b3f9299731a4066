use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use btleplug::api::CharPropFlags;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::model::FoundDevice;
use crate::error::{FixtureError, RadioError};
use crate::protocol::{
    CCCD_UUID, CharacteristicLayout, DEFAULT_MTU, VendorProfile, profile_metadata,
};
use crate::transport::{
    GattCallbacks, GattCharacteristic, GattEvent, GattLink, GattRequest, GattService, LinkState,
    PeripheralId, Radio,
};

/// Write credits a fake credit-flow peripheral hands out once credits are enabled.
const DEFAULT_WRITE_CREDITS: u8 = 4;
const GENERIC_ACCESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub(crate) struct ScanFixture {
    devices: Vec<FoundDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Parsed fake notification payload fixtures.
#[derive(Debug, Clone, Default, derive_more::Into)]
pub(crate) struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = parse_notifications(value)?;
        Ok(Self { payloads })
    }
}

/// Settings for constructing a fake hardware backend.
#[derive(Debug, Builder)]
pub(crate) struct FakeBackendConfig {
    scan_fixture: ScanFixture,
    #[builder(default = VendorProfile::Nordic)]
    profile: VendorProfile,
    granted_mtu: Option<u16>,
    notifications: Option<NotificationPayloads>,
    #[builder(default = DEFAULT_WRITE_CREDITS)]
    write_credits: u8,
    #[builder(default = true)]
    echo: bool,
    #[builder(default)]
    discovery_delay: Duration,
}

/// Fake backend used in tests and non-hardware environments.
#[derive(Debug)]
pub(crate) struct FakeBackend {
    devices: Vec<FoundDevice>,
    radio: FakeRadio,
    discovery_delay: Duration,
}

impl FakeBackend {
    /// Creates a fake backend from explicit settings.
    pub(crate) fn new(config: FakeBackendConfig) -> Self {
        let FakeBackendConfig {
            scan_fixture,
            profile,
            granted_mtu,
            notifications,
            write_credits,
            echo,
            discovery_delay,
        } = config;

        Self {
            devices: scan_fixture.into(),
            radio: FakeRadio {
                profile,
                granted_mtu,
                notifications: notifications.unwrap_or_default().into(),
                write_credits,
                echo,
            },
            discovery_delay,
        }
    }

    /// Returns the first fixture device whose name matches, plus a radio that emulates it.
    #[instrument(skip(self), level = "debug", fields(prefix = name_prefix))]
    pub(crate) async fn find_first_matching_device(
        self,
        name_prefix: &str,
    ) -> Result<(FoundDevice, FakeRadio), RadioError> {
        let Self {
            devices,
            radio,
            discovery_delay,
        } = self;
        if !discovery_delay.is_zero() {
            sleep(discovery_delay).await;
        }

        let device = devices
            .into_iter()
            .find(|device| device.local_name_starts_with(name_prefix))
            .ok_or_else(|| RadioError::NoMatchingFixtureDevice {
                prefix: name_prefix.to_string(),
            })?;
        Ok((device, radio))
    }
}

/// Radio that emulates one vendor serial peripheral in a background task.
///
/// Writes to the data characteristic are acknowledged and, when echo is on, sent back as
/// notifications. A credit-flow peripheral hands out write credits once its credit
/// indications are enabled and returns one credit per acknowledged write.
#[derive(Debug, Clone)]
pub struct FakeRadio {
    profile: VendorProfile,
    granted_mtu: Option<u16>,
    notifications: Vec<Vec<u8>>,
    write_credits: u8,
    echo: bool,
}

impl FakeRadio {
    /// Creates a radio emulating `profile` that grants no MTU and echoes writes.
    #[must_use]
    pub fn new(profile: VendorProfile) -> Self {
        Self {
            profile,
            granted_mtu: None,
            notifications: Vec::new(),
            write_credits: DEFAULT_WRITE_CREDITS,
            echo: true,
        }
    }

    /// Grants `mtu` when the connection asks for a larger one.
    #[must_use]
    pub fn with_granted_mtu(mut self, mtu: u16) -> Self {
        self.granted_mtu = Some(mtu);
        self
    }

    /// Sends `payloads` as notifications right after setup completes.
    #[must_use]
    pub fn with_notifications(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.notifications = payloads;
        self
    }

    /// Sets the write credits handed out by a credit-flow peripheral.
    #[must_use]
    pub fn with_write_credits(mut self, credits: u8) -> Self {
        self.write_credits = credits;
        self
    }

    /// Enables or disables loopback of written data.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

impl Radio for FakeRadio {
    fn connect_gatt(
        &self,
        peripheral: &PeripheralId,
        callbacks: GattCallbacks,
    ) -> Result<Arc<dyn GattLink>, RadioError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RadioError::NoRuntime)?;
        let (sender, receiver) = unbounded_channel();
        let cancel = CancellationToken::new();
        debug!(%peripheral, profile = %self.profile, "fake link opened");
        runtime.spawn(emulate_peripheral(
            FakePeripheral::new(self.clone()),
            callbacks,
            receiver,
            cancel.clone(),
        ));
        Ok(Arc::new(FakeLink { sender, cancel }))
    }
}

#[derive(Debug)]
struct FakeLink {
    sender: UnboundedSender<GattRequest>,
    cancel: CancellationToken,
}

impl GattLink for FakeLink {
    fn submit(&self, request: GattRequest) -> Result<(), RadioError> {
        if self.cancel.is_cancelled() {
            return Err(RadioError::LinkClosed);
        }
        self.sender
            .send(request)
            .map_err(|_| RadioError::LinkClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Characteristic roles of the emulated peripheral.
#[derive(Debug)]
struct FakePeripheral {
    radio: FakeRadio,
    data_read: Uuid,
    data_write: Uuid,
    credits: Option<(Uuid, Uuid)>,
}

impl FakePeripheral {
    fn new(radio: FakeRadio) -> Self {
        let (data_read, data_write, credits) = match profile_metadata(radio.profile).layout() {
            CharacteristicLayout::Single { read_write } => (read_write, read_write, None),
            CharacteristicLayout::Split { first, second } => (second, first, None),
            CharacteristicLayout::Credit {
                data_write,
                data_read,
                credits_in,
                credits_out,
            } => (data_read, data_write, Some((credits_in, credits_out))),
        };
        Self {
            radio,
            data_read,
            data_write,
            credits,
        }
    }

    fn services(&self) -> Vec<GattService> {
        let metadata = profile_metadata(self.radio.profile);
        let notify = |uuid| GattCharacteristic::new(uuid, CharPropFlags::NOTIFY, vec![CCCD_UUID]);
        let writable = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        let characteristics = match metadata.layout() {
            CharacteristicLayout::Single { read_write } => vec![GattCharacteristic::new(
                read_write,
                writable | CharPropFlags::NOTIFY,
                vec![CCCD_UUID],
            )],
            CharacteristicLayout::Split { first, second } => vec![
                GattCharacteristic::new(first, writable, Vec::new()),
                notify(second),
            ],
            CharacteristicLayout::Credit {
                data_write,
                data_read,
                credits_in,
                credits_out,
            } => vec![
                GattCharacteristic::new(data_write, writable, Vec::new()),
                notify(data_read),
                GattCharacteristic::new(credits_out, writable, Vec::new()),
                GattCharacteristic::new(credits_in, CharPropFlags::INDICATE, vec![CCCD_UUID]),
            ],
        };
        vec![
            GattService::new(
                GENERIC_ACCESS_SERVICE_UUID,
                vec![GattCharacteristic::new(
                    DEVICE_NAME_UUID,
                    CharPropFlags::READ,
                    Vec::new(),
                )],
            ),
            GattService::new(metadata.service_uuid(), characteristics),
        ]
    }

    /// Handles one request. Returns `false` once the link should close.
    fn respond(&self, request: GattRequest, callbacks: &GattCallbacks) -> bool {
        trace!(?request, "fake request");
        match request {
            GattRequest::DiscoverServices => callbacks.deliver(GattEvent::ServicesDiscovered {
                services: self.services(),
            }),
            GattRequest::RequestMtu { mtu } => {
                let event = match self.radio.granted_mtu {
                    Some(granted) => GattEvent::MtuChanged {
                        mtu: granted.min(mtu),
                        success: true,
                    },
                    None => GattEvent::MtuChanged {
                        mtu: DEFAULT_MTU,
                        success: false,
                    },
                };
                callbacks.deliver(event);
            }
            GattRequest::SetNotification { .. } => {}
            GattRequest::WriteDescriptor {
                characteristic,
                descriptor,
                ..
            } => {
                callbacks.deliver(GattEvent::DescriptorWritten {
                    characteristic,
                    descriptor,
                    success: true,
                });
                if let Some((credits_in, _)) = self.credits
                    && characteristic == credits_in
                {
                    self.grant_write_credits(self.radio.write_credits, callbacks);
                }
                if characteristic == self.data_read {
                    for payload in &self.radio.notifications {
                        callbacks.deliver(GattEvent::CharacteristicChanged {
                            characteristic: self.data_read,
                            value: payload.clone(),
                        });
                    }
                }
            }
            GattRequest::WriteCharacteristic {
                characteristic,
                value,
                ..
            } => {
                callbacks.deliver(GattEvent::CharacteristicWritten {
                    characteristic,
                    success: true,
                });
                if characteristic == self.data_write {
                    if self.radio.echo {
                        callbacks.deliver(GattEvent::CharacteristicChanged {
                            characteristic: self.data_read,
                            value,
                        });
                    }
                    self.grant_write_credits(1, callbacks);
                }
            }
            GattRequest::Disconnect => return false,
        }
        true
    }

    fn grant_write_credits(&self, credits: u8, callbacks: &GattCallbacks) {
        if let Some((credits_in, _)) = self.credits
            && credits > 0
        {
            callbacks.deliver(GattEvent::CharacteristicChanged {
                characteristic: credits_in,
                value: vec![credits],
            });
        }
    }
}

async fn emulate_peripheral(
    peripheral: FakePeripheral,
    callbacks: GattCallbacks,
    mut requests: UnboundedReceiver<GattRequest>,
    cancel: CancellationToken,
) {
    callbacks.deliver(GattEvent::ConnectionStateChanged {
        state: LinkState::Connected,
        status: 0,
    });
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            break;
        };
        if !peripheral.respond(request, &callbacks) {
            break;
        }
    }
    cancel.cancel();
    debug!(profile = %peripheral.radio.profile, "fake link closed");
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FoundDevice>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FoundDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    let [adapter, peripheral_id, local_name, rssi] = fields.as_slice() else {
        return Err(FixtureError::InvalidRecordFieldCount);
    };
    if [adapter, peripheral_id, local_name, rssi]
        .iter()
        .any(|field| field.is_empty())
    {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = (*local_name != "-").then(|| (*local_name).to_string());
    let rssi = if *rssi == "-" {
        None
    } else {
        Some(rssi.parse::<i16>()?)
    };

    Ok(FoundDevice::new(
        (*adapter).to_string(),
        PeripheralId::new(*peripheral_id),
        local_name,
        rssi,
    ))
}

fn parse_notifications(raw_value: &str) -> Result<Vec<Vec<u8>>, FixtureError> {
    if raw_value.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw_value.split(',').map(parse_hex).collect()
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(cleaned)?)
}
