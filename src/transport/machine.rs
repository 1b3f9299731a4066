use btleplug::api::{CharPropFlags, WriteType};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::event::SerialEvent;
use crate::protocol::{
    ATT_HEADER_LEN, CCCD_UUID, DEFAULT_PAYLOAD_SIZE, REQUESTED_MTU, VendorProfile,
    profile_for_service,
};
use crate::transport::delegate::{DelegateAction, ProfileDelegate};
use crate::transport::gatt::{
    CccdValue, GattCharacteristic, GattEvent, GattRequest, GattService, LinkState,
    property_labels,
};
use crate::transport::write_queue::WriteQueue;

/// Lifecycle of one serial connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum ConnectionState {
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "discovering services")]
    DiscoveringServices,
    #[strum(to_string = "enabling credits")]
    EnablingCredits,
    #[strum(to_string = "negotiating mtu")]
    NegotiatingMtu,
    #[strum(to_string = "configuring characteristics")]
    ConfiguringCharacteristics,
    #[strum(to_string = "connected")]
    Connected,
}

/// How a failure is reported to the consumer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Failure {
    Connect(TransportError),
    Io(TransportError),
}

/// Side effects produced by the state machine, applied after its lock is released.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Start a radio operation; `on_reject` is reported if the radio refuses it.
    Request {
        request: GattRequest,
        on_reject: Option<Failure>,
    },
    /// Report an event to the consumer.
    Emit(SerialEvent),
    /// Fail the attempt, unless an earlier request of the batch was refused first.
    Fail(Failure),
    /// Tear the connection down.
    Disconnect,
}

/// Transition core of a connection. Holds no radio handle; it only returns effects.
#[derive(Debug)]
pub(crate) struct Machine {
    state: ConnectionState,
    canceled: bool,
    released: bool,
    payload_size: usize,
    profile: Option<VendorProfile>,
    delegate: Option<ProfileDelegate>,
    read: Option<GattCharacteristic>,
    write: Option<GattCharacteristic>,
    write_type: WriteType,
    queue: WriteQueue,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            canceled: false,
            released: false,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            profile: None,
            delegate: None,
            read: None,
            write: None,
            write_type: WriteType::WithResponse,
            queue: WriteQueue::default(),
        }
    }
}

impl Machine {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) fn profile(&self) -> Option<VendorProfile> {
        self.profile
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[cfg(test)]
    pub(crate) fn delegate(&self) -> Option<&ProfileDelegate> {
        self.delegate.as_ref()
    }

    /// Moves a fresh machine into `Connecting`.
    pub(crate) fn begin_connect(&mut self) -> Result<(), TransportError> {
        if self.state != ConnectionState::Disconnected || self.canceled {
            return Err(TransportError::AlreadyConnected);
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Reverts `begin_connect` after the radio refused to open a link.
    pub(crate) fn abort_connect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.canceled = true;
        self.released = true;
    }

    /// Applies one radio event.
    pub(crate) fn handle(&mut self, event: GattEvent) -> Vec<Effect> {
        if self.canceled {
            trace!(?event, "event after cancellation ignored");
            return Vec::new();
        }
        match event {
            GattEvent::ConnectionStateChanged { state, status } => {
                self.on_link_state(state, status)
            }
            GattEvent::ServicesDiscovered { services } => self.on_services_discovered(&services),
            GattEvent::MtuChanged { mtu, success } => self.on_mtu_changed(mtu, success),
            GattEvent::DescriptorWritten {
                characteristic,
                descriptor,
                success,
            } => {
                trace!(%characteristic, %descriptor, success, "descriptor written");
                self.on_descriptor_written(characteristic, success)
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_changed(characteristic, value),
            GattEvent::CharacteristicWritten {
                characteristic,
                success,
            } => self.on_characteristic_written(characteristic, success),
            GattEvent::PairingRequest { variant } => {
                debug!(variant, "pairing request");
                self.fail(Failure::Connect(TransportError::PairingRequest))
            }
            GattEvent::BondStateChanged { previous, current } => {
                debug!(previous, current, "bond state changed");
                Vec::new()
            }
        }
    }

    /// Queues outbound bytes, returning the write to start right away if any.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<Vec<Effect>, TransportError> {
        if self.canceled || self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let can_write = self.can_write();
        let effects = self
            .queue
            .submit(data, self.payload_size, can_write)
            .map(|chunk| self.write_request(chunk))
            .into_iter()
            .collect();
        trace!(
            bytes = data.len(),
            queued = self.queue.pending_len(),
            "write submitted"
        );
        Ok(effects)
    }

    /// Reports a failure once; every later event is ignored.
    pub(crate) fn fail(&mut self, failure: Failure) -> Vec<Effect> {
        if self.canceled {
            return Vec::new();
        }
        self.canceled = true;
        self.queue.clear();
        let event = match failure {
            Failure::Connect(error) => {
                warn!(%error, state = %self.state, "connect failed");
                SerialEvent::ConnectError(error)
            }
            Failure::Io(error) => {
                warn!(%error, "connection failed");
                SerialEvent::IoError(error)
            }
        };
        vec![Effect::Emit(event), Effect::Disconnect]
    }

    /// Releases queue and profile state. Returns `true` on the first call only.
    pub(crate) fn shutdown(&mut self) -> bool {
        self.canceled = true;
        self.state = ConnectionState::Disconnected;
        if self.released {
            return false;
        }
        self.released = true;
        self.queue.clear();
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.release();
        }
        self.read = None;
        self.write = None;
        true
    }

    fn can_write(&self) -> bool {
        self.delegate
            .as_ref()
            .is_some_and(ProfileDelegate::can_write)
    }

    fn on_link_state(&mut self, state: LinkState, status: u8) -> Vec<Effect> {
        match state {
            LinkState::Connected => {
                debug!("link up, discovering services");
                self.state = ConnectionState::DiscoveringServices;
                vec![request(
                    GattRequest::DiscoverServices,
                    Failure::Connect(TransportError::DiscoverServicesFailed),
                )]
            }
            LinkState::Disconnected => {
                let error = TransportError::LinkLost { status };
                if self.state == ConnectionState::Connected {
                    self.fail(Failure::Io(error))
                } else {
                    self.fail(Failure::Connect(error))
                }
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                debug!(%state, status, "link state ignored");
                Vec::new()
            }
        }
    }

    fn on_services_discovered(&mut self, services: &[GattService]) -> Vec<Effect> {
        if self.state != ConnectionState::DiscoveringServices {
            debug!(state = %self.state, "unexpected service discovery result");
            return Vec::new();
        }
        let matched = services.iter().find_map(|service| {
            profile_for_service(&service.uuid()).map(|profile| (profile, service))
        });
        let Some((profile, service)) = matched else {
            dump_services(services);
            return self.fail(Failure::Connect(TransportError::NoSerialProfile));
        };
        let resolution = match ProfileDelegate::resolve(profile, service) {
            Ok(resolution) => resolution,
            Err(error) => {
                dump_services(services);
                return self.fail(Failure::Connect(error));
            }
        };
        self.profile = Some(profile);
        self.write_type = initial_write_type(&resolution.write);
        self.read = Some(resolution.read);
        self.write = Some(resolution.write);
        self.delegate = Some(resolution.delegate);
        if resolution.setup.is_empty() {
            return self.negotiate_mtu();
        }
        self.state = ConnectionState::EnablingCredits;
        resolution
            .setup
            .into_iter()
            .map(|(gatt_request, error)| request(gatt_request, Failure::Connect(error)))
            .collect()
    }

    fn negotiate_mtu(&mut self) -> Vec<Effect> {
        debug!(mtu = REQUESTED_MTU, "requesting mtu");
        self.state = ConnectionState::NegotiatingMtu;
        vec![request(
            GattRequest::RequestMtu { mtu: REQUESTED_MTU },
            Failure::Connect(TransportError::RequestMtuFailed),
        )]
    }

    fn on_mtu_changed(&mut self, mtu: u16, success: bool) -> Vec<Effect> {
        if self.state != ConnectionState::NegotiatingMtu {
            debug!(mtu, success, state = %self.state, "unexpected mtu change");
            return Vec::new();
        }
        if success {
            self.payload_size = usize::from(mtu.saturating_sub(ATT_HEADER_LEN)).max(1);
            debug!(mtu, payload_size = self.payload_size, "mtu negotiated");
        } else {
            debug!(mtu, payload_size = self.payload_size, "mtu not granted");
        }
        self.configure_characteristics()
    }

    fn configure_characteristics(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::ConfiguringCharacteristics;
        let (Some(read), Some(write)) = (self.read.as_ref(), self.write.as_ref()) else {
            return self.fail(Failure::Connect(TransportError::NoSerialProfile));
        };
        let write_properties = write.properties();
        if !write_properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            return self.fail(Failure::Connect(
                TransportError::WriteCharacteristicNotWritable,
            ));
        }
        let characteristic = read.uuid();
        let mut effects = vec![request(
            GattRequest::SetNotification {
                characteristic,
                enable: true,
            },
            Failure::Connect(TransportError::NotificationUnsupported { role: "read" }),
        )];
        if !read.has_descriptor(&CCCD_UUID) {
            effects.push(Effect::Fail(Failure::Connect(TransportError::MissingCccd {
                role: "read",
            })));
            return effects;
        }
        let read_properties = read.properties();
        let value = if read_properties.contains(CharPropFlags::INDICATE) {
            CccdValue::EnableIndication
        } else if read_properties.contains(CharPropFlags::NOTIFY) {
            CccdValue::EnableNotification
        } else {
            effects.push(Effect::Fail(Failure::Connect(
                TransportError::NoIndicationOrNotification {
                    properties: property_labels(read_properties),
                },
            )));
            return effects;
        };
        debug!(%characteristic, ?value, "enabling read notifications");
        effects.push(request(
            GattRequest::WriteDescriptor {
                characteristic,
                descriptor: CCCD_UUID,
                value,
            },
            Failure::Connect(TransportError::CccdNotWritable { role: "read" }),
        ));
        effects
    }

    fn on_descriptor_written(&mut self, characteristic: uuid::Uuid, success: bool) -> Vec<Effect> {
        let actions = match self.delegate.as_mut() {
            Some(delegate) => delegate.on_descriptor_written(characteristic, success),
            None => Vec::new(),
        };
        let mut effects = self.apply_actions(actions);
        if self.canceled {
            return effects;
        }
        let is_read = self
            .read
            .as_ref()
            .is_some_and(|read| read.uuid() == characteristic);
        if !is_read || self.state != ConnectionState::ConfiguringCharacteristics {
            return effects;
        }
        if !success {
            effects.extend(self.fail(Failure::Connect(TransportError::WriteDescriptorFailed)));
            return effects;
        }
        info!(profile = ?self.profile, payload_size = self.payload_size, "serial connection ready");
        self.state = ConnectionState::Connected;
        effects.push(Effect::Emit(SerialEvent::Connected));
        effects
    }

    fn on_characteristic_changed(
        &mut self,
        characteristic: uuid::Uuid,
        value: Vec<u8>,
    ) -> Vec<Effect> {
        let actions = match self.delegate.as_mut() {
            Some(delegate) => delegate.on_characteristic_changed(characteristic, &value),
            None => Vec::new(),
        };
        let mut effects = self.apply_actions(actions);
        if self.canceled {
            return effects;
        }
        let is_read = self
            .read
            .as_ref()
            .is_some_and(|read| read.uuid() == characteristic);
        if is_read {
            trace!(bytes = value.len(), "data received");
            effects.push(Effect::Emit(SerialEvent::DataReceived(value)));
        }
        effects
    }

    fn on_characteristic_written(
        &mut self,
        characteristic: uuid::Uuid,
        success: bool,
    ) -> Vec<Effect> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        if !success {
            return self.fail(Failure::Io(TransportError::WriteFailed));
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.on_characteristic_written(characteristic);
        }
        let is_write = self
            .write
            .as_ref()
            .is_some_and(|write| write.uuid() == characteristic);
        if !is_write {
            return Vec::new();
        }
        let can_write = self.can_write();
        self.queue
            .complete(can_write)
            .map(|chunk| self.write_request(chunk))
            .into_iter()
            .collect()
    }

    fn apply_actions(&mut self, actions: Vec<DelegateAction>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                DelegateAction::NegotiateMtu => {
                    if self.state == ConnectionState::EnablingCredits {
                        effects.extend(self.negotiate_mtu());
                    }
                }
                DelegateAction::Fail(error) => {
                    effects.extend(self.fail(Failure::Connect(error)));
                    return effects;
                }
                DelegateAction::UseWriteWithoutResponse => {
                    self.write_type = WriteType::WithoutResponse;
                }
                DelegateAction::GrantReadCredits {
                    characteristic,
                    amount,
                } => {
                    let failure = if self.state == ConnectionState::Connected {
                        Failure::Io(TransportError::GrantReadCreditsFailed)
                    } else {
                        Failure::Connect(TransportError::GrantReadCreditsFailed)
                    };
                    effects.push(request(
                        GattRequest::WriteCharacteristic {
                            characteristic,
                            value: vec![amount],
                            write_type: WriteType::WithoutResponse,
                        },
                        failure,
                    ));
                }
                DelegateAction::ResumeWrites => {
                    if self.state != ConnectionState::Connected {
                        continue;
                    }
                    let can_write = self.can_write();
                    if let Some(chunk) = self.queue.resume(can_write) {
                        effects.push(self.write_request(chunk));
                    }
                }
            }
        }
        effects
    }

    fn write_request(&self, chunk: Vec<u8>) -> Effect {
        let characteristic = self
            .write
            .as_ref()
            .map(GattCharacteristic::uuid)
            .unwrap_or_default();
        request(
            GattRequest::WriteCharacteristic {
                characteristic,
                value: chunk,
                write_type: self.write_type,
            },
            Failure::Io(TransportError::WriteFailed),
        )
    }
}

fn request(request: GattRequest, failure: Failure) -> Effect {
    Effect::Request {
        request,
        on_reject: Some(failure),
    }
}

fn initial_write_type(write: &GattCharacteristic) -> WriteType {
    if write.properties().contains(CharPropFlags::WRITE) {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

fn dump_services(services: &[GattService]) {
    for service in services {
        debug!(service = %service.uuid(), "discovered service");
        for characteristic in service.characteristics() {
            debug!(
                service = %service.uuid(),
                characteristic = %characteristic.uuid(),
                properties = %property_labels(characteristic.properties()),
                "discovered characteristic"
            );
        }
    }
}
