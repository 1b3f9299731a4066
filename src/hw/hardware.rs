use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::btleplug_backend::BtleplugBackend;
use super::fake_backend::{FakeBackend, FakeBackendConfig};
use super::model::FoundDevice;
use crate::error::RadioError;
use crate::transport::Radio;

/// Creates a hardware client backed by the real BLE transport.
#[must_use]
pub(crate) fn real_hardware_client() -> Box<dyn HardwareClient> {
    Box::new(RealHardwareClient)
}

/// Creates a hardware client backed by fake BLE fixtures.
#[must_use]
pub(crate) fn fake_hardware_client(config: FakeBackendConfig) -> Box<dyn HardwareClient> {
    info!("using fake BLE backend");
    Box::new(FakeHardwareClient {
        backend: FakeBackend::new(config),
    })
}

#[async_trait]
pub trait HardwareClient: Send + Sync {
    /// Scans for the first peripheral whose local name starts with `name_prefix`.
    async fn find_first_device(
        self: Box<Self>,
        name_prefix: &str,
    ) -> Result<DiscoveredPeripheral, RadioError>;
}

/// A scanned peripheral together with the radio that can open it.
#[derive(Debug)]
pub struct DiscoveredPeripheral {
    device: FoundDevice,
    radio: Arc<dyn Radio>,
}

impl DiscoveredPeripheral {
    /// Returns scan details for the peripheral.
    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        &self.device
    }

    /// Returns the radio that opens links to the peripheral.
    #[must_use]
    pub fn radio(&self) -> Arc<dyn Radio> {
        Arc::clone(&self.radio)
    }
}

#[derive(Debug)]
struct RealHardwareClient;

#[async_trait]
impl HardwareClient for RealHardwareClient {
    async fn find_first_device(
        self: Box<Self>,
        name_prefix: &str,
    ) -> Result<DiscoveredPeripheral, RadioError> {
        let backend = BtleplugBackend::new().await?;
        let (device, radio) = backend.find_first_matching_device(name_prefix).await?;
        Ok(DiscoveredPeripheral {
            device,
            radio: Arc::new(radio),
        })
    }
}

#[derive(Debug)]
struct FakeHardwareClient {
    backend: FakeBackend,
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    async fn find_first_device(
        self: Box<Self>,
        name_prefix: &str,
    ) -> Result<DiscoveredPeripheral, RadioError> {
        let Self { backend } = *self;
        let (device, radio) = backend.find_first_matching_device(name_prefix).await?;
        Ok(DiscoveredPeripheral {
            device,
            radio: Arc::new(radio),
        })
    }
}
