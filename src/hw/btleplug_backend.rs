use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::model::{FoundDevice, matches_name_prefix};
use crate::error::RadioError;
use crate::protocol::DEFAULT_MTU;
use crate::transport::{
    GattCallbacks, GattCharacteristic, GattEvent, GattLink, GattRequest, GattService, LinkState,
    PeripheralId, Radio,
};

/// Status reported when the link drops or a connect attempt fails.
const GATT_ERROR_STATUS: u8 = 133;
/// Status reported when the peripheral goes away on its own.
const LINK_TIMEOUT_STATUS: u8 = 8;
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Hardware backend backed by `btleplug`.
#[derive(Debug)]
pub(crate) struct BtleplugBackend {
    manager: Manager,
}

impl BtleplugBackend {
    /// Creates the real BLE backend.
    pub(crate) async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Scans indefinitely until the first matching peripheral appears.
    #[instrument(skip(self), level = "debug", fields(prefix = name_prefix))]
    pub(crate) async fn find_first_matching_device(
        self,
        name_prefix: &str,
    ) -> Result<(FoundDevice, BtleplugRadio), RadioError> {
        let adapters = self.adapters().await?;
        info!(
            adapter_count = adapters.len(),
            "starting indefinite BLE scan"
        );

        for adapter in &adapters {
            adapter.adapter.start_scan(ScanFilter::default()).await?;
        }

        loop {
            for adapter in &adapters {
                let peripherals = adapter.adapter.peripherals().await?;
                for peripheral in peripherals {
                    let Some(properties) = peripheral.properties().await? else {
                        continue;
                    };
                    if !matches_name_prefix(properties.local_name.as_deref(), name_prefix) {
                        continue;
                    }

                    for handle in &adapters {
                        if let Err(error) = handle.adapter.stop_scan().await {
                            debug!(?error, "failed to stop adapter scan cleanly");
                        }
                    }

                    let peripheral_id = PeripheralId::new(peripheral.id().to_string());
                    let device = FoundDevice::new(
                        adapter.name.clone(),
                        peripheral_id.clone(),
                        properties.local_name,
                        properties.rssi,
                    );
                    info!(%peripheral_id, "found matching peripheral");
                    let radio = BtleplugRadio {
                        peripherals: HashMap::from([(
                            peripheral_id,
                            (adapter.adapter.clone(), peripheral),
                        )]),
                    };
                    return Ok((device, radio));
                }
            }

            sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<AdapterHandle>, RadioError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(RadioError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        Ok(handles)
    }
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

/// Radio over peripherals found by a [`BtleplugBackend`] scan.
///
/// Each link is driven by a tokio task that performs one request at a time and reports
/// the outcome through the link's callbacks.
#[derive(Debug)]
pub struct BtleplugRadio {
    peripherals: HashMap<PeripheralId, (Adapter, Peripheral)>,
}

impl Radio for BtleplugRadio {
    fn connect_gatt(
        &self,
        peripheral: &PeripheralId,
        callbacks: GattCallbacks,
    ) -> Result<Arc<dyn GattLink>, RadioError> {
        let (adapter, ble_peripheral) =
            self.peripherals
                .get(peripheral)
                .ok_or_else(|| RadioError::UnknownPeripheral {
                    id: peripheral.to_string(),
                })?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RadioError::NoRuntime)?;
        let (sender, receiver) = unbounded_channel();
        let cancel = CancellationToken::new();
        runtime.spawn(drive_link(
            adapter.clone(),
            ble_peripheral.clone(),
            callbacks,
            receiver,
            cancel.clone(),
        ));
        Ok(Arc::new(BtleplugLink { sender, cancel }))
    }
}

#[derive(Debug)]
struct BtleplugLink {
    sender: UnboundedSender<GattRequest>,
    cancel: CancellationToken,
}

impl GattLink for BtleplugLink {
    fn submit(&self, request: GattRequest) -> Result<(), RadioError> {
        if self.cancel.is_cancelled() {
            return Err(RadioError::LinkClosed);
        }
        if matches!(request, GattRequest::SetNotification { .. }) {
            return Ok(());
        }
        self.sender
            .send(request)
            .map_err(|_| RadioError::LinkClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[instrument(skip_all, level = "debug", fields(peripheral = %peripheral.id()))]
async fn drive_link(
    adapter: Adapter,
    peripheral: Peripheral,
    callbacks: GattCallbacks,
    mut requests: UnboundedReceiver<GattRequest>,
    cancel: CancellationToken,
) {
    let mut central_events = match adapter.events().await {
        Ok(events) => events,
        Err(error) => {
            warn!(?error, "failed to watch adapter events");
            report_link_down(&callbacks, GATT_ERROR_STATUS);
            return;
        }
    };
    if let Err(error) = connect(&peripheral).await {
        warn!(?error, "connect failed");
        report_link_down(&callbacks, GATT_ERROR_STATUS);
        return;
    }
    let mut notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(error) => {
            warn!(?error, "failed to open notification stream");
            report_link_down(&callbacks, GATT_ERROR_STATUS);
            return;
        }
    };
    callbacks.deliver(GattEvent::ConnectionStateChanged {
        state: LinkState::Connected,
        status: 0,
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                if !perform(&peripheral, request, &callbacks).await {
                    break;
                }
            }
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    debug!("notification stream closed");
                    report_link_down(&callbacks, LINK_TIMEOUT_STATUS);
                    break;
                };
                callbacks.deliver(GattEvent::CharacteristicChanged {
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            event = central_events.next() => {
                if let Some(CentralEvent::DeviceDisconnected(id)) = event
                    && id == peripheral.id()
                {
                    debug!("peripheral disconnected");
                    report_link_down(&callbacks, LINK_TIMEOUT_STATUS);
                    break;
                }
            }
        }
    }

    cancel.cancel();
    match peripheral.is_connected().await {
        Ok(true) => {
            if let Err(error) = peripheral.disconnect().await {
                debug!(?error, "failed to disconnect cleanly");
            }
        }
        Ok(false) => {}
        Err(error) => debug!(?error, "failed to query connection state"),
    }
}

async fn connect(peripheral: &Peripheral) -> Result<(), btleplug::Error> {
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }
    Ok(())
}

fn report_link_down(callbacks: &GattCallbacks, status: u8) {
    callbacks.deliver(GattEvent::ConnectionStateChanged {
        state: LinkState::Disconnected,
        status,
    });
}

/// Performs one request. Returns `false` once the link should close.
async fn perform(peripheral: &Peripheral, request: GattRequest, callbacks: &GattCallbacks) -> bool {
    trace!(?request, "performing request");
    match request {
        GattRequest::DiscoverServices => {
            if let Err(error) = peripheral.discover_services().await {
                warn!(?error, "service discovery failed");
                report_link_down(callbacks, GATT_ERROR_STATUS);
                return false;
            }
            callbacks.deliver(GattEvent::ServicesDiscovered {
                services: collect_services(peripheral),
            });
        }
        GattRequest::RequestMtu { mtu } => {
            debug!(requested = mtu, "mtu negotiation is not exposed by this radio");
            callbacks.deliver(GattEvent::MtuChanged {
                mtu: DEFAULT_MTU,
                success: false,
            });
        }
        GattRequest::SetNotification { .. } => {}
        GattRequest::WriteDescriptor {
            characteristic,
            descriptor,
            ..
        } => {
            let success = match find_characteristic(peripheral, characteristic) {
                Some(found) => match peripheral.subscribe(&found).await {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(?error, %characteristic, "subscribe failed");
                        false
                    }
                },
                None => false,
            };
            callbacks.deliver(GattEvent::DescriptorWritten {
                characteristic,
                descriptor,
                success,
            });
        }
        GattRequest::WriteCharacteristic {
            characteristic,
            value,
            write_type,
        } => {
            let success = match find_characteristic(peripheral, characteristic) {
                Some(found) => match peripheral.write(&found, &value, write_type).await {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(?error, %characteristic, "write failed");
                        false
                    }
                },
                None => false,
            };
            callbacks.deliver(GattEvent::CharacteristicWritten {
                characteristic,
                success,
            });
        }
        GattRequest::Disconnect => return false,
    }
    true
}

fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
}

fn collect_services(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| {
            let characteristics = service
                .characteristics
                .iter()
                .map(|characteristic| {
                    GattCharacteristic::new(
                        characteristic.uuid,
                        characteristic.properties,
                        characteristic
                            .descriptors
                            .iter()
                            .map(|descriptor| descriptor.uuid)
                            .collect(),
                    )
                })
                .collect();
            GattService::new(service.uuid, characteristics)
        })
        .collect()
}
