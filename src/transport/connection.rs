use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::error::{SerialError, TransportError};
use crate::event::{SerialEvent, SerialListener};
use crate::protocol::VendorProfile;
use crate::transport::gatt::{
    GattCallbacks, GattEvent, GattEventHandler, GattLink, GattRequest, PeripheralId, Radio,
};
use crate::transport::machine::{ConnectionState, Effect, Machine};

/// One serial session over a GATT link.
///
/// A connection is used for a single attempt; once it has been disconnected it stays
/// disconnected. Clones share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    peripheral: PeripheralId,
    shared: Mutex<Shared>,
    sink: Arc<dyn SerialListener>,
}

struct Shared {
    machine: Machine,
    link: Option<Arc<dyn GattLink>>,
}

impl Connection {
    /// Creates an idle connection that reports its events to `sink`.
    #[must_use]
    pub fn new(peripheral: PeripheralId, sink: Arc<dyn SerialListener>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                peripheral,
                shared: Mutex::new(Shared {
                    machine: Machine::default(),
                    link: None,
                }),
                sink,
            }),
        }
    }

    /// Opens the GATT link. Progress is reported through the event sink.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::AlreadyConnected`] if this connection was already used, or the
    /// radio error if the link could not be opened. A radio failure is also reported as a
    /// `ConnectError` event.
    pub fn connect(&self, radio: &dyn Radio) -> Result<(), SerialError> {
        let mut shared = self.inner.lock();
        shared
            .machine
            .begin_connect()
            .map_err(|_| SerialError::AlreadyConnected)?;
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let handler: Weak<dyn GattEventHandler> = weak;
        debug!(peripheral = %self.inner.peripheral, "opening gatt link");
        match radio.connect_gatt(&self.inner.peripheral, GattCallbacks::new(handler)) {
            Ok(link) => {
                shared.link = Some(link);
                Ok(())
            }
            Err(error) => {
                shared.machine.abort_connect();
                drop(shared);
                warn!(%error, peripheral = %self.inner.peripheral, "connectGatt failed");
                self.inner
                    .sink
                    .on_event(SerialEvent::ConnectError(TransportError::ConnectGattFailed));
                Err(error.into())
            }
        }
    }

    /// Sends bytes to the peripheral, fragmenting them to the negotiated payload size.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::NotConnected`] unless setup has completed.
    pub fn write(&self, data: &[u8]) -> Result<(), SerialError> {
        let effects = self
            .inner
            .lock()
            .machine
            .write(data)
            .map_err(|_| SerialError::NotConnected)?;
        self.inner.apply(effects);
        Ok(())
    }

    /// Tears the connection down. Safe to call more than once.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Returns the peripheral this connection targets.
    #[must_use]
    pub fn peripheral(&self) -> &PeripheralId {
        &self.inner.peripheral
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().machine.state()
    }

    /// Returns the current write payload budget in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.inner.lock().machine.payload_size()
    }

    /// Returns the vendor profile matched during service discovery.
    #[must_use]
    pub fn profile(&self) -> Option<VendorProfile> {
        self.inner.lock().machine.profile()
    }

    /// Returns whether the connection has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.lock().machine.is_canceled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peripheral", &self.inner.peripheral)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Applies effects in order with no lock held.
    ///
    /// A request the radio refuses is reported through the machine, and the rest of its
    /// batch is dropped. A deferred failure replaces whatever follows it.
    fn apply(&self, effects: Vec<Effect>) {
        let mut pending: VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Request { request, on_reject } => {
                    let link = self.lock().link.clone();
                    let Some(link) = link else {
                        debug!(?request, "request dropped, link released");
                        pending.clear();
                        continue;
                    };
                    if let Err(error) = link.submit(request) {
                        warn!(%error, "radio refused request");
                        pending = match on_reject {
                            Some(failure) => self.lock().machine.fail(failure).into(),
                            None => VecDeque::new(),
                        };
                    }
                }
                Effect::Emit(event) => self.sink.on_event(event),
                Effect::Fail(failure) => {
                    pending = self.lock().machine.fail(failure).into();
                }
                Effect::Disconnect => self.disconnect(),
            }
        }
    }

    fn disconnect(&self) {
        let link = {
            let mut shared = self.lock();
            if shared.machine.shutdown() {
                shared.link.take()
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };
        debug!(peripheral = %self.peripheral, "disconnecting");
        if let Err(error) = link.submit(GattRequest::Disconnect) {
            debug!(%error, "disconnect request failed");
        }
        link.close();
    }
}

impl GattEventHandler for ConnectionInner {
    fn handle_gatt_event(&self, event: GattEvent) {
        let effects = self.lock().machine.handle(event);
        self.apply(effects);
    }
}
