use crate::transport::PeripheralId;

/// A discovered BLE peripheral that matched a scan predicate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FoundDevice {
    adapter_name: String,
    peripheral_id: PeripheralId,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl FoundDevice {
    /// Creates a new discovered-device record.
    pub(crate) fn new(
        adapter_name: String,
        peripheral_id: PeripheralId,
        local_name: Option<String>,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            adapter_name,
            peripheral_id,
            local_name,
            rssi,
        }
    }

    /// Returns the adapter name used to discover this device.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Returns the backend-specific peripheral identifier.
    #[must_use]
    pub fn peripheral_id(&self) -> &PeripheralId {
        &self.peripheral_id
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the latest observed RSSI value, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns the local name, or the peripheral identifier when none was advertised.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.local_name
            .as_deref()
            .unwrap_or_else(|| self.peripheral_id.as_str())
    }

    pub(crate) fn local_name_starts_with(&self, name_prefix: &str) -> bool {
        matches_name_prefix(self.local_name.as_deref(), name_prefix)
    }
}

/// Returns whether an advertised name matches a prefix; an empty prefix matches everything.
pub(crate) fn matches_name_prefix(local_name: Option<&str>, name_prefix: &str) -> bool {
    if name_prefix.is_empty() {
        return true;
    }

    local_name.is_some_and(|value| value.starts_with(name_prefix))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some("HMSoft"), "HM", true)]
    #[case(Some("HMSoft"), "", true)]
    #[case(None, "", true)]
    #[case(None, "HM", false)]
    #[case(Some("Nordic_UART"), "HM", false)]
    fn name_prefix_matching(
        #[case] local_name: Option<&str>,
        #[case] prefix: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, matches_name_prefix(local_name, prefix));
    }

    #[test]
    fn display_name_falls_back_to_peripheral_id() {
        let device = FoundDevice::new(
            "hci0".to_string(),
            PeripheralId::new("AA:BB"),
            None,
            Some(-40),
        );

        assert_eq!("AA:BB", device.display_name());
    }
}
