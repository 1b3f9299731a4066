use btleplug::api::CharPropFlags;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{
    CCCD_UUID, CharacteristicLayout, READ_CREDITS_HIGH_WATER, READ_CREDITS_LOW_WATER,
    VendorProfile, profile_metadata,
};
use crate::transport::gatt::{CccdValue, GattCharacteristic, GattRequest, GattService, property_labels};

/// Characteristics chosen for a profile plus any setup the profile needs before MTU negotiation.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) delegate: ProfileDelegate,
    pub(crate) read: GattCharacteristic,
    pub(crate) write: GattCharacteristic,
    /// Requests to start before MTU negotiation, each with the error reported if the radio refuses it.
    pub(crate) setup: Vec<(GattRequest, TransportError)>,
}

/// Follow-up work a delegate asks the connection to perform.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum DelegateAction {
    /// Profile-specific setup finished; continue with MTU negotiation.
    NegotiateMtu,
    /// Profile-specific setup failed.
    Fail(TransportError),
    /// Switch data writes to write-without-response.
    UseWriteWithoutResponse,
    /// Write a read-credit grant to the peer.
    GrantReadCredits { characteristic: Uuid, amount: u8 },
    /// The profile may write again; restart the write queue if it is idle.
    ResumeWrites,
}

/// Profile-specific behaviour of a connection.
#[derive(Debug)]
pub(crate) enum ProfileDelegate {
    /// One characteristic, or two with statically known roles.
    Single,
    /// Two characteristics whose roles were detected from their properties.
    Split,
    /// Data characteristics gated by credit-based flow control.
    Credit(CreditFlow),
}

impl ProfileDelegate {
    /// Selects read and write characteristics for `profile` inside `service`.
    pub(crate) fn resolve(
        profile: VendorProfile,
        service: &GattService,
    ) -> Result<Resolution, TransportError> {
        let metadata = profile_metadata(profile);
        debug!(profile = metadata.name(), "serial profile matched");
        match metadata.layout() {
            CharacteristicLayout::Single { read_write } => {
                let characteristic = service
                    .characteristic(&read_write)
                    .ok_or(TransportError::NoSerialProfile)?;
                Ok(Resolution {
                    delegate: Self::Single,
                    read: characteristic.clone(),
                    write: characteristic.clone(),
                    setup: Vec::new(),
                })
            }
            CharacteristicLayout::Split { first, second } => {
                let (Some(first), Some(second)) =
                    (service.characteristic(&first), service.characteristic(&second))
                else {
                    return Err(TransportError::NoSerialProfile);
                };
                let (read, write) = detect_roles(first, second)?;
                Ok(Resolution {
                    delegate: Self::Split,
                    read: read.clone(),
                    write: write.clone(),
                    setup: Vec::new(),
                })
            }
            CharacteristicLayout::Credit {
                data_write,
                data_read,
                credits_in,
                credits_out,
            } => {
                let find = |uuid: &Uuid, role: &'static str| {
                    service
                        .characteristic(uuid)
                        .ok_or(TransportError::CharacteristicNotFound { role })
                };
                let read = find(&data_read, "read")?;
                let write = find(&data_write, "write")?;
                let credits_in_characteristic = find(&credits_in, "read credits")?;
                find(&credits_out, "write credits")?;

                if !credits_in_characteristic.has_descriptor(&CCCD_UUID) {
                    return Err(TransportError::MissingCccd {
                        role: "read credits",
                    });
                }
                let setup = vec![
                    (
                        GattRequest::SetNotification {
                            characteristic: credits_in,
                            enable: true,
                        },
                        TransportError::NotificationUnsupported {
                            role: "read credits",
                        },
                    ),
                    (
                        GattRequest::WriteDescriptor {
                            characteristic: credits_in,
                            descriptor: CCCD_UUID,
                            value: CccdValue::EnableIndication,
                        },
                        TransportError::CccdNotWritable {
                            role: "read credits",
                        },
                    ),
                ];
                Ok(Resolution {
                    delegate: Self::Credit(CreditFlow::new(
                        data_read,
                        data_write,
                        credits_in,
                        credits_out,
                    )),
                    read: read.clone(),
                    write: write.clone(),
                    setup,
                })
            }
        }
    }

    /// Handles completion of a descriptor write.
    pub(crate) fn on_descriptor_written(
        &mut self,
        characteristic: Uuid,
        success: bool,
    ) -> Vec<DelegateAction> {
        let Self::Credit(flow) = self else {
            return Vec::new();
        };
        if characteristic == flow.credits_in {
            if success {
                return vec![DelegateAction::NegotiateMtu];
            }
            return vec![DelegateAction::Fail(
                TransportError::WriteCreditsDescriptorFailed,
            )];
        }
        if characteristic == flow.data_read && success {
            debug!("switching credit data characteristics to write without response");
            let mut actions = vec![DelegateAction::UseWriteWithoutResponse];
            actions.extend(flow.grant_read_credits());
            return actions;
        }
        Vec::new()
    }

    /// Handles a notification before it is forwarded as received data.
    pub(crate) fn on_characteristic_changed(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<DelegateAction> {
        let Self::Credit(flow) = self else {
            return Vec::new();
        };
        if characteristic == flow.credits_in {
            let Some(&granted) = value.first() else {
                warn!("empty credit notification ignored");
                return Vec::new();
            };
            flow.write_credits = flow.write_credits.saturating_add(u32::from(granted));
            trace!(granted, write_credits = flow.write_credits, "write credits received");
            return vec![DelegateAction::ResumeWrites];
        }
        if characteristic == flow.data_read {
            return flow.grant_read_credits().into_iter().collect();
        }
        Vec::new()
    }

    /// Handles completion of a successful characteristic write.
    pub(crate) fn on_characteristic_written(&mut self, characteristic: Uuid) {
        if let Self::Credit(flow) = self
            && characteristic == flow.data_write
        {
            flow.write_credits = flow.write_credits.saturating_sub(1);
        }
    }

    /// Returns whether the profile currently permits a data write.
    pub(crate) fn can_write(&self) -> bool {
        match self {
            Self::Single | Self::Split => true,
            Self::Credit(flow) => flow.write_credits > 0,
        }
    }

    /// Returns the credit counters for credit-flow profiles.
    #[cfg(test)]
    pub(crate) fn credits(&self) -> Option<&CreditFlow> {
        match self {
            Self::Credit(flow) => Some(flow),
            Self::Single | Self::Split => None,
        }
    }

    /// Resets profile state when the connection is torn down.
    pub(crate) fn release(&mut self) {
        if let Self::Credit(flow) = self {
            flow.read_credits = 0;
            flow.write_credits = 0;
        }
    }
}

/// Credit counters of a credit-flow profile.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct CreditFlow {
    data_read: Uuid,
    data_write: Uuid,
    credits_in: Uuid,
    credits_out: Uuid,
    read_credits: u32,
    write_credits: u32,
}

impl CreditFlow {
    fn new(data_read: Uuid, data_write: Uuid, credits_in: Uuid, credits_out: Uuid) -> Self {
        Self {
            data_read,
            data_write,
            credits_in,
            credits_out,
            read_credits: 0,
            write_credits: 0,
        }
    }

    /// Credits the peer may still spend sending to us.
    #[cfg(test)]
    pub(crate) fn read_credits(&self) -> u32 {
        self.read_credits
    }

    /// Credits we may still spend writing to the peer.
    #[cfg(test)]
    pub(crate) fn write_credits(&self) -> u32 {
        self.write_credits
    }

    /// Consumes one read credit and tops the peer back up when it runs low.
    fn grant_read_credits(&mut self) -> Option<DelegateAction> {
        self.read_credits = self.read_credits.saturating_sub(1);
        if self.read_credits > READ_CREDITS_LOW_WATER {
            return None;
        }
        let granted = READ_CREDITS_HIGH_WATER - self.read_credits;
        self.read_credits = READ_CREDITS_HIGH_WATER;
        trace!(granted, "granting read credits");
        Some(DelegateAction::GrantReadCredits {
            characteristic: self.credits_out,
            amount: u8::try_from(granted).unwrap_or(u8::MAX),
        })
    }
}

/// Picks the writable characteristic of a pair as the write side.
fn detect_roles<'a>(
    first: &'a GattCharacteristic,
    second: &'a GattCharacteristic,
) -> Result<(&'a GattCharacteristic, &'a GattCharacteristic), TransportError> {
    let first_writable = first.properties().contains(CharPropFlags::WRITE);
    let second_writable = second.properties().contains(CharPropFlags::WRITE);
    match (first_writable, second_writable) {
        (true, false) => Ok((second, first)),
        (false, true) => Ok((first, second)),
        (true, true) => Err(TransportError::MultipleWriteCharacteristics {
            first: property_labels(first.properties()),
            second: property_labels(second.properties()),
        }),
        (false, false) => Err(TransportError::NoWriteCharacteristic {
            first: property_labels(first.properties()),
            second: property_labels(second.properties()),
        }),
    }
}
