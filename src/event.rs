use tokio::sync::mpsc::UnboundedSender;

use crate::error::TransportError;

/// Events a serial connection reports to its consumer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SerialEvent {
    /// Setup finished; writes are accepted from now on.
    Connected,
    /// Setup failed. The connection has been torn down.
    ConnectError(TransportError),
    /// Bytes received from the peripheral.
    DataReceived(Vec<u8>),
    /// The established session failed. The connection has been torn down.
    IoError(TransportError),
}

impl SerialEvent {
    /// Returns whether this event ends the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectError(_) | Self::IoError(_))
    }

    /// Short label used in logs and rendered output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::ConnectError(_) => "connect_error",
            Self::DataReceived(_) => "data",
            Self::IoError(_) => "io_error",
        }
    }
}

/// Consumer of serial events.
pub trait SerialListener: Send + Sync {
    fn on_event(&self, event: SerialEvent);
}

impl SerialListener for UnboundedSender<SerialEvent> {
    fn on_event(&self, event: SerialEvent) {
        if let Err(error) = self.send(event) {
            tracing::debug!(kind = error.0.kind(), "event receiver dropped");
        }
    }
}
