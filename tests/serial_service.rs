use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use ble_serial::{
    ConnectionState, FakeRadio, ForegroundLoop, PeripheralId, SerialError, SerialEvent,
    SerialService, VendorProfile,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{sleep, timeout};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct Session {
    foreground: ForegroundLoop,
    service: SerialService,
    events: UnboundedReceiver<SerialEvent>,
}

impl Session {
    fn new() -> anyhow::Result<Self> {
        let foreground = ForegroundLoop::new();
        let service = SerialService::new(foreground.handle());
        let (sender, events) = unbounded_channel();
        service.attach(Arc::new(sender))?;
        Ok(Self {
            foreground,
            service,
            events,
        })
    }

    async fn open(radio: &FakeRadio) -> anyhow::Result<Self> {
        let mut session = Self::new()?;
        session
            .service
            .connect(radio, PeripheralId::new("AA:BB:CC"))?;
        assert_eq!(Some(SerialEvent::Connected), session.next_event().await);
        Ok(session)
    }

    /// Runs foreground work until the next event arrives or the wait times out.
    async fn next_event(&mut self) -> Option<SerialEvent> {
        let wait = async {
            loop {
                tokio::select! {
                    () = self.foreground.run_once() => {}
                    event = self.events.recv() => return event,
                }
            }
        };
        timeout(EVENT_TIMEOUT, wait).await.ok().flatten()
    }

    /// Collects received bytes until `expected_len` bytes have arrived.
    async fn read_exact(&mut self, expected_len: usize) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut received = 0;
        while received < expected_len {
            match self.next_event().await {
                Some(SerialEvent::DataReceived(chunk)) => {
                    received += chunk.len();
                    chunks.push(chunk);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
        chunks
    }

    /// Asserts that nothing is delivered for a short while.
    async fn assert_quiet(&mut self) {
        let wait = async {
            loop {
                tokio::select! {
                    () = self.foreground.run_once() => {}
                    event = self.events.recv() => return event,
                }
            }
        };
        let outcome = timeout(QUIET_PERIOD, wait).await;
        assert!(outcome.is_err(), "unexpected event: {outcome:?}");
    }
}

#[rstest]
#[case::cc254x(VendorProfile::Cc254x)]
#[case::rn4870(VendorProfile::Rn4870)]
#[case::nordic(VendorProfile::Nordic)]
#[case::telit_tio(VendorProfile::TelitTio)]
#[tokio::test]
async fn every_profile_connects_and_echoes(#[case] profile: VendorProfile) -> anyhow::Result<()> {
    let mut session = Session::open(&FakeRadio::new(profile)).await?;

    assert_eq!(Some(profile), session.service.profile());
    assert_eq!(
        Some(ConnectionState::Connected),
        session.service.connection_state()
    );
    session.service.write(b"AT\r\n")?;

    assert_eq!(vec![b"AT\r\n".to_vec()], session.read_exact(4).await);
    session.service.disconnect();
    Ok(())
}

#[rstest]
#[case::not_granted(None, 20)]
#[case::granted(Some(247), 244)]
#[case::tiny(Some(4), 1)]
#[tokio::test]
async fn payload_size_follows_mtu_negotiation(
    #[case] granted_mtu: Option<u16>,
    #[case] expected: usize,
) -> anyhow::Result<()> {
    let mut radio = FakeRadio::new(VendorProfile::Nordic);
    if let Some(mtu) = granted_mtu {
        radio = radio.with_granted_mtu(mtu);
    }

    let session = Session::open(&radio).await?;

    assert_eq!(Some(expected), session.service.payload_size());
    session.service.disconnect();
    Ok(())
}

#[tokio::test]
async fn long_writes_arrive_in_payload_sized_chunks() -> anyhow::Result<()> {
    let mut session = Session::open(&FakeRadio::new(VendorProfile::Nordic)).await?;
    let payload: Vec<u8> = (0..45).collect();

    session.service.write(&payload)?;

    let chunks = session.read_exact(payload.len()).await;
    assert_eq!(vec![20, 20, 5], chunks.iter().map(Vec::len).collect::<Vec<_>>());
    assert_eq!(payload, chunks.concat());
    Ok(())
}

#[tokio::test]
async fn fixture_notifications_follow_connected() -> anyhow::Result<()> {
    let radio =
        FakeRadio::new(VendorProfile::Cc254x).with_notifications(vec![b"READY".to_vec()]);

    let mut session = Session::open(&radio).await?;

    assert_eq!(
        Some(SerialEvent::DataReceived(b"READY".to_vec())),
        session.next_event().await
    );
    Ok(())
}

#[tokio::test]
async fn credit_flow_resumes_writes_as_credits_return() -> anyhow::Result<()> {
    let radio = FakeRadio::new(VendorProfile::TelitTio).with_write_credits(1);
    let mut session = Session::open(&radio).await?;
    let payload: Vec<u8> = (0..45).collect();

    session.service.write(&payload)?;

    assert_eq!(payload, session.read_exact(payload.len()).await.concat());
    Ok(())
}

#[tokio::test]
async fn credit_flow_holds_writes_without_credits() -> anyhow::Result<()> {
    let radio = FakeRadio::new(VendorProfile::TelitTio).with_write_credits(0);
    let mut session = Session::open(&radio).await?;

    session.service.write(b"held")?;

    session.assert_quiet().await;
    assert!(session.service.is_connected());
    Ok(())
}

#[tokio::test]
async fn events_received_while_detached_are_replayed_on_attach() -> anyhow::Result<()> {
    let mut session = Session::open(&FakeRadio::new(VendorProfile::Nordic)).await?;

    session.service.detach();
    session.service.write(b"ping")?;
    sleep(QUIET_PERIOD).await;
    session.foreground.run_pending();
    assert_matches!(session.events.try_recv(), Err(_));

    let (sender, mut replayed) = unbounded_channel();
    session.service.attach(Arc::new(sender))?;

    assert_eq!(
        SerialEvent::DataReceived(b"ping".to_vec()),
        replayed.try_recv()?
    );
    Ok(())
}

#[tokio::test]
async fn connect_twice_is_rejected_until_disconnected() -> anyhow::Result<()> {
    let radio = FakeRadio::new(VendorProfile::Rn4870);
    let mut session = Session::open(&radio).await?;

    let again = session
        .service
        .connect(&radio, PeripheralId::new("AA:BB:CC"));
    assert_matches!(again, Err(SerialError::AlreadyConnected));

    session.service.disconnect();
    assert!(!session.service.is_connected());
    session
        .service
        .connect(&radio, PeripheralId::new("AA:BB:CC"))?;
    assert_eq!(Some(SerialEvent::Connected), session.next_event().await);
    Ok(())
}

#[tokio::test]
async fn writes_after_disconnect_fail_and_late_events_are_dropped() -> anyhow::Result<()> {
    let mut session = Session::open(&FakeRadio::new(VendorProfile::Nordic)).await?;
    session.service.write(b"late")?;

    session.service.disconnect();

    assert_matches!(
        session.service.write(b"more"),
        Err(SerialError::NotConnected)
    );
    session.assert_quiet().await;
    Ok(())
}

#[tokio::test]
async fn write_without_connection_is_rejected() -> anyhow::Result<()> {
    let session = Session::new()?;

    assert_matches!(
        session.service.write(b"AT"),
        Err(SerialError::NotConnected)
    );
    assert_eq!(None, session.service.connection_state());
    Ok(())
}

#[tokio::test]
async fn attach_off_the_foreground_thread_is_rejected() -> anyhow::Result<()> {
    let session = Session::new()?;
    let service = session.service.clone();

    let result = std::thread::spawn(move || {
        let (sender, _events) = unbounded_channel::<SerialEvent>();
        service.attach(Arc::new(sender))
    })
    .join()
    .map_err(|_| anyhow::anyhow!("attach thread panicked"))?;

    assert_matches!(result, Err(SerialError::NotOnForeground));
    Ok(())
}
