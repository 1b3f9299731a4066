use std::fmt::{self, Display, Formatter};

use crate::cli::console::{Direction, SessionSummary, StopReason};
use crate::hw::FoundDevice;
use crate::protocol::VendorProfile;
use crate::utils::{format_hex, format_text};

use super::device_view::DeviceView;
use super::painter::Painter;
use super::table::Table;

/// Renders the device and link details once the serial session is up.
pub(crate) struct ConnectedView<'a> {
    device: &'a FoundDevice,
    profile: Option<VendorProfile>,
    payload_size: Option<usize>,
    painter: &'a Painter,
}

impl<'a> ConnectedView<'a> {
    pub(crate) fn new(
        device: &'a FoundDevice,
        profile: Option<VendorProfile>,
        payload_size: Option<usize>,
        painter: &'a Painter,
    ) -> Self {
        Self {
            device,
            profile,
            payload_size,
            painter,
        }
    }
}

impl Display for ConnectedView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let unknown = || self.painter.warning("<unknown>");
        let session_table = Table::key_value(
            self.painter,
            vec![
                (
                    "profile",
                    self.profile
                        .map_or_else(unknown, |profile| self.painter.value(profile.to_string())),
                ),
                (
                    "payload_size",
                    self.payload_size
                        .map_or_else(unknown, |size| self.painter.value(size.to_string())),
                ),
            ],
        );

        write!(f, "{}", self.painter.heading("Connected device:"))?;
        write!(f, "\n{}", DeviceView::new(self.device, self.painter))?;
        writeln!(f)?;
        write!(f, "\n{}", self.painter.heading("Serial session:"))?;
        write!(f, "\n{session_table}")
    }
}

/// Renders one chunk of data sent or received.
pub(crate) struct DataView<'a> {
    direction: Direction,
    index: usize,
    payload: &'a [u8],
    painter: &'a Painter,
}

impl<'a> DataView<'a> {
    pub(crate) fn new(
        direction: Direction,
        index: usize,
        payload: &'a [u8],
        painter: &'a Painter,
    ) -> Self {
        Self {
            direction,
            index,
            payload,
            painter,
        }
    }
}

impl Display for DataView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let index_label = self.painter.muted(format!("[{:04}]", self.index));
        let direction = match self.direction {
            Direction::Rx => self.painter.success(self.direction.to_string()),
            Direction::Tx => self.painter.heading(self.direction.to_string()),
        };
        write!(
            f,
            "{index_label} {direction} {} {}",
            self.painter.value(format!("\"{}\"", format_text(self.payload))),
            self.painter
                .muted(format!("raw={}", format_hex(self.payload)))
        )
    }
}

/// Renders the session summary.
pub(crate) struct SummaryView<'a> {
    summary: &'a SessionSummary,
    painter: &'a Painter,
}

impl<'a> SummaryView<'a> {
    pub(crate) fn new(summary: &'a SessionSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for SummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stop_reason = self.summary.stop_reason();
        let stop_reason = match stop_reason {
            StopReason::ReachedLimit(_) | StopReason::InputClosed => {
                self.painter.success(stop_reason.to_string())
            }
            StopReason::Interrupted => self.painter.warning(stop_reason.to_string()),
            StopReason::ConnectionLost(_) => self.painter.error(stop_reason.to_string()),
        };
        write!(
            f,
            "{} {} {}",
            self.painter.heading("Stopped:"),
            stop_reason,
            self.painter.value(format!(
                "- received {} read(s), sent {} write(s)",
                self.summary.reads(),
                self.summary.writes()
            ))
        )
    }
}
