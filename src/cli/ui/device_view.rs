use std::fmt::{self, Display, Formatter};

use crate::hw::FoundDevice;
use crate::utils::format_rssi;

use super::painter::Painter;
use super::table::Table;

/// Renders a `FoundDevice` as a key-value table.
pub(crate) struct DeviceView<'a> {
    device: &'a FoundDevice,
    painter: &'a Painter,
}

impl<'a> DeviceView<'a> {
    pub(crate) fn new(device: &'a FoundDevice, painter: &'a Painter) -> Self {
        Self { device, painter }
    }
}

impl Display for DeviceView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let table = Table::key_value(
            self.painter,
            vec![
                ("adapter", self.painter.value(self.device.adapter_name())),
                (
                    "device_id",
                    self.painter.value(self.device.peripheral_id().as_str()),
                ),
                ("name", self.painter.value(self.device.display_name())),
                ("rssi", self.painter.value(format_rssi(self.device.rssi()))),
            ],
        );
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::transport::PeripheralId;

    #[test]
    fn device_view_renders_all_fields() {
        let device = FoundDevice::new(
            "hci0".into(),
            PeripheralId::new("AA:BB:CC"),
            Some("HMSoft".into()),
            Some(-43),
        );
        let painter = Painter::new(false);
        assert_snapshot!(DeviceView::new(&device, &painter).to_string(), @r"
        ╭───────────┬──────────╮
        │ field     │ value    │
        ├───────────┼──────────┤
        │ adapter   │ hci0     │
        │ device_id │ AA:BB:CC │
        │ name      │ HMSoft   │
        │ rssi      │ -43      │
        ╰───────────┴──────────╯
        ");
    }

    #[test]
    fn device_view_marks_missing_details() {
        let device = FoundDevice::new("hci0".into(), PeripheralId::new("AA:BB:CC"), None, None);
        let painter = Painter::new(false);
        let rendered = DeviceView::new(&device, &painter).to_string();
        assert!(rendered.contains("│ rssi      │ -        │"), "{rendered}");
    }
}
