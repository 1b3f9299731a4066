use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, trace};

use crate::dispatch::dispatcher::EventDispatcher;
use crate::dispatch::foreground::ForegroundHandle;
use crate::error::SerialError;
use crate::event::{SerialEvent, SerialListener};
use crate::protocol::VendorProfile;
use crate::transport::{Connection, ConnectionState, PeripheralId, Radio};

/// Long-lived owner of a serial connection.
///
/// Accepts a consumer that may attach and detach at any time; events that arrive
/// while nobody listens are kept and replayed on the next attach. A fatal event
/// ends the connection whether or not anybody receives it, after which a new
/// `connect` may start right away.
#[derive(Clone)]
pub struct SerialService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    dispatcher: Arc<EventDispatcher>,
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
    attempt: AtomicU64,
}

/// Event sink handed to one connection attempt.
struct AttemptSink {
    service: Weak<ServiceInner>,
    attempt: u64,
}

impl SerialService {
    /// Creates a service whose consumer callbacks run on `foreground`.
    #[must_use]
    pub fn new(foreground: ForegroundHandle) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let service = weak.clone();
            let on_fatal_buffered = Arc::new(move || {
                if let Some(service) = service.upgrade() {
                    debug!("fatal event without consumer, disconnecting");
                    service.disconnect();
                }
            });
            ServiceInner {
                dispatcher: Arc::new(EventDispatcher::new(foreground, on_fatal_buffered)),
                connection: Mutex::new(None),
                connected: AtomicBool::new(false),
                attempt: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Starts connecting to `peripheral` through `radio`.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::AlreadyConnected`] while a previous connection is still
    /// active, or the radio error if the link could not be opened.
    pub fn connect(&self, radio: &dyn Radio, peripheral: PeripheralId) -> Result<(), SerialError> {
        let mut slot = self.inner.lock_connection();
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(SerialError::AlreadyConnected);
        }
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = Arc::new(AttemptSink {
            service: Arc::downgrade(&self.inner),
            attempt,
        });
        let connection = Connection::new(peripheral, sink);
        info!(peripheral = %connection.peripheral(), attempt, "connecting");
        self.inner.connected.store(true, Ordering::SeqCst);
        *slot = Some(connection.clone());
        drop(slot);
        if let Err(error) = connection.connect(radio) {
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.lock_connection().take();
            return Err(error);
        }
        Ok(())
    }

    /// Tears down the current connection, if any. Events still in transit are dropped.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Writes bytes to the peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::NotConnected`] unless a connection has completed setup.
    pub fn write(&self, data: &[u8]) -> Result<(), SerialError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(SerialError::NotConnected);
        }
        let connection = self
            .inner
            .lock_connection()
            .clone()
            .ok_or(SerialError::NotConnected)?;
        connection.write(data)
    }

    /// Installs `consumer` and replays buffered events to it.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::NotOnForeground`] when called off the foreground thread.
    pub fn attach(&self, consumer: Arc<dyn SerialListener>) -> Result<(), SerialError> {
        self.inner.dispatcher.attach(consumer)
    }

    /// Removes the consumer; later events are buffered until the next attach.
    pub fn detach(&self) {
        self.inner.dispatcher.detach();
    }

    /// Returns whether a connection is active and has not been torn down.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Returns the lifecycle state of the current connection.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner
            .lock_connection()
            .as_ref()
            .map(Connection::state)
    }

    /// Returns the peripheral of the current connection.
    #[must_use]
    pub fn peripheral(&self) -> Option<PeripheralId> {
        self.inner
            .lock_connection()
            .as_ref()
            .map(|connection| connection.peripheral().clone())
    }

    /// Returns the vendor profile of the current connection once discovered.
    #[must_use]
    pub fn profile(&self) -> Option<VendorProfile> {
        self.inner
            .lock_connection()
            .as_ref()
            .and_then(Connection::profile)
    }

    /// Returns the write payload budget of the current connection.
    #[must_use]
    pub fn payload_size(&self) -> Option<usize> {
        self.inner
            .lock_connection()
            .as_ref()
            .map(Connection::payload_size)
    }
}

impl fmt::Debug for SerialService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialService")
            .field("connected", &self.is_connected())
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

impl ServiceInner {
    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.connected.load(Ordering::SeqCst) && self.attempt.load(Ordering::SeqCst) == attempt
    }

    /// Forgets a connection that tore itself down after a fatal event, so a new
    /// attempt can start. Returns `false` if `attempt` was already superseded.
    fn release_attempt(&self, attempt: u64) -> bool {
        let mut slot = self.lock_connection();
        if !self.is_current(attempt) {
            return false;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(connection) = slot.take() {
            debug!(peripheral = %connection.peripheral(), attempt, "connection closed by fatal event");
        }
        true
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            info!(peripheral = %connection.peripheral(), "disconnecting");
            connection.disconnect();
        }
    }
}

impl SerialListener for AttemptSink {
    fn on_event(&self, event: SerialEvent) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        if !service.is_current(self.attempt) {
            trace!(kind = event.kind(), attempt = self.attempt, "stale event dropped");
            return;
        }
        if event.is_fatal() && !service.release_attempt(self.attempt) {
            trace!(kind = event.kind(), attempt = self.attempt, "stale event dropped");
            return;
        }
        service.dispatcher.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;
    use crate::dispatch::foreground::ForegroundLoop;
    use crate::error::{RadioError, TransportError};
    use crate::protocol::{CCCD_UUID, NORDIC_RW2_UUID, NORDIC_RW3_UUID, NORDIC_SERVICE_UUID};
    use crate::transport::{
        GattCallbacks, GattCharacteristic, GattEvent, GattLink, GattRequest, GattService,
        LinkState,
    };

    #[derive(Debug, Default)]
    struct ManualRadio {
        callbacks: Mutex<Option<GattCallbacks>>,
        link: Arc<ManualLink>,
    }

    #[derive(Debug, Default)]
    struct ManualLink {
        requests: Mutex<Vec<GattRequest>>,
    }

    impl GattLink for ManualLink {
        fn submit(&self, request: GattRequest) -> Result<(), RadioError> {
            self.requests.lock().expect("lock").push(request);
            Ok(())
        }

        fn close(&self) {}
    }

    impl Radio for ManualRadio {
        fn connect_gatt(
            &self,
            _peripheral: &PeripheralId,
            callbacks: GattCallbacks,
        ) -> Result<Arc<dyn GattLink>, RadioError> {
            *self.callbacks.lock().expect("lock") = Some(callbacks);
            Ok(self.link.clone())
        }
    }

    impl ManualRadio {
        fn deliver(&self, event: GattEvent) {
            let callbacks = self.callbacks.lock().expect("lock").clone();
            callbacks.expect("connected").deliver(event);
        }

        fn establish(&self) {
            self.deliver(GattEvent::ConnectionStateChanged {
                state: LinkState::Connected,
                status: 0,
            });
            self.deliver(GattEvent::ServicesDiscovered {
                services: vec![GattService::new(
                    NORDIC_SERVICE_UUID,
                    vec![
                        GattCharacteristic::new(NORDIC_RW2_UUID, CharPropFlags::WRITE, vec![]),
                        GattCharacteristic::new(
                            NORDIC_RW3_UUID,
                            CharPropFlags::NOTIFY,
                            vec![CCCD_UUID],
                        ),
                    ],
                )],
            });
            self.deliver(GattEvent::MtuChanged {
                mtu: 6,
                success: true,
            });
            self.deliver(GattEvent::DescriptorWritten {
                characteristic: NORDIC_RW3_UUID,
                descriptor: CCCD_UUID,
                success: true,
            });
        }

        fn notify(&self, value: &[u8]) {
            self.deliver(GattEvent::CharacteristicChanged {
                characteristic: NORDIC_RW3_UUID,
                value: value.to_vec(),
            });
        }

        fn written_chunks(&self) -> Vec<Vec<u8>> {
            self.link
                .requests
                .lock()
                .expect("lock")
                .iter()
                .filter_map(|request| match request {
                    GattRequest::WriteCharacteristic { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn consumer() -> (Arc<dyn SerialListener>, UnboundedReceiver<SerialEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Arc::new(sender), receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<SerialEvent>) -> Vec<SerialEvent> {
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    #[test]
    fn write_is_fragmented_to_payload_budget() {
        let mut foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let radio = ManualRadio::default();
        let (listener, mut received) = consumer();
        service.attach(listener).expect("foreground");

        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("connect");
        radio.establish();
        foreground.run_pending();
        assert_eq!(vec![SerialEvent::Connected], drain(&mut received));
        assert_eq!(Some(3), service.payload_size());

        service.write(b"AT\r\n").expect("write");
        radio.deliver(GattEvent::CharacteristicWritten {
            characteristic: NORDIC_RW2_UUID,
            success: true,
        });

        assert_eq!(
            vec![b"AT\r".to_vec(), b"\n".to_vec()],
            radio.written_chunks()
        );
    }

    #[test]
    fn detached_fatal_event_disconnects_and_replays_in_order() {
        let mut foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let radio = ManualRadio::default();
        let (listener, mut received) = consumer();
        service.attach(Arc::clone(&listener)).expect("foreground");
        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("connect");
        radio.establish();
        foreground.run_pending();
        drain(&mut received);

        service.detach();
        radio.notify(b"a");
        radio.deliver(GattEvent::ConnectionStateChanged {
            state: LinkState::Disconnected,
            status: 8,
        });
        radio.notify(b"b");

        assert!(!service.is_connected());
        assert_eq!(None, service.connection_state());

        service.attach(listener).expect("foreground");
        foreground.run_pending();
        assert_eq!(
            vec![
                SerialEvent::DataReceived(b"a".to_vec()),
                SerialEvent::IoError(TransportError::LinkLost { status: 8 }),
            ],
            drain(&mut received)
        );
    }

    #[rstest]
    #[case::during_setup(false, SerialEvent::ConnectError(TransportError::LinkLost { status: 133 }))]
    #[case::after_setup(true, SerialEvent::IoError(TransportError::LinkLost { status: 133 }))]
    fn delivered_fatal_event_frees_the_service_for_a_new_connect(
        #[case] established: bool,
        #[case] expected: SerialEvent,
    ) {
        let mut foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let radio = ManualRadio::default();
        let (listener, mut received) = consumer();
        service.attach(listener).expect("foreground");
        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("connect");
        if established {
            radio.establish();
        }

        radio.deliver(GattEvent::ConnectionStateChanged {
            state: LinkState::Disconnected,
            status: 133,
        });
        foreground.run_pending();

        assert_eq!(Some(&expected), drain(&mut received).last());
        assert!(!service.is_connected());
        assert_eq!(None, service.connection_state());
        assert_matches!(service.write(b"x"), Err(SerialError::NotConnected));

        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("reconnect without disconnect");
        assert!(service.is_connected());
        assert_eq!(Some(ConnectionState::Connecting), service.connection_state());
        radio.establish();
        foreground.run_pending();
        assert_eq!(vec![SerialEvent::Connected], drain(&mut received));
    }

    #[test]
    fn events_after_disconnect_are_dropped() {
        let mut foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let radio = ManualRadio::default();
        let (listener, mut received) = consumer();
        service.attach(listener).expect("foreground");
        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("connect");
        radio.establish();

        service.disconnect();
        radio.notify(b"late");
        foreground.run_pending();

        assert_eq!(vec![SerialEvent::Connected], drain(&mut received));
        assert_matches!(service.write(b"x"), Err(SerialError::NotConnected));
    }

    #[test]
    fn connect_twice_is_rejected_until_disconnect() {
        let foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let radio = ManualRadio::default();
        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("connect");

        assert_matches!(
            service.connect(&radio, PeripheralId::new("dev")),
            Err(SerialError::AlreadyConnected)
        );

        service.disconnect();
        service
            .connect(&radio, PeripheralId::new("dev"))
            .expect("reconnect");
        assert_eq!(Some(ConnectionState::Connecting), service.connection_state());
    }

    #[test]
    fn write_without_connection_is_rejected() {
        let foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());

        assert_matches!(service.write(b"x"), Err(SerialError::NotConnected));
    }
}
