//! Human-readable status summaries for the connection manager.
//!
//! One line each for the connection state, the raw driver state, and the
//! interface addressing, suitable for a serial console or the remote
//! info handler.

use std::fmt::Write;

use crate::flash::storage::SettingsSource;
use crate::ports::WifiPort;

use super::{ConnectionManager, ConnectionState};

impl ConnectionManager {
    /// One-line summary of the connection state, naming the slot in use
    /// where one is selected.
    pub fn connect_status_text(&self, settings: &dyn SettingsSource) -> String {
        match self.state {
            ConnectionState::Uninitialised => "uninitialised".to_string(),
            ConnectionState::InitialisationError => {
                format!("init error: {}", self.hw_error_code)
            }
            ConnectionState::StorageEmptyError => {
                "No WiFi details have been stored - use the setup tool".to_string()
            }
            ConnectionState::Disconnected => "disconnected".to_string(),
            ConnectionState::TryToConnect => {
                "did not find any known WiFi hotspot, waiting to scan again".to_string()
            }
            ConnectionState::Scanning => "scanning for WiFi hotspots".to_string(),
            ConnectionState::Connecting => self.slot_text(settings, "connecting to"),
            ConnectionState::ConnectedIp => self.slot_text(settings, "connected to"),
        }
    }

    /// One-line summary of the raw driver state.
    pub fn hw_status_text(&self, wifi: &dyn WifiPort) -> String {
        if self.state == ConnectionState::Uninitialised {
            return String::new();
        }
        format!(
            "link status = {}, scan_active = {}",
            wifi.link_status().name(),
            wifi.scan_active()
        )
    }

    /// One-line summary of the interface addressing.
    pub fn ip_status_text(&self, wifi: &dyn WifiPort) -> String {
        if self.state == ConnectionState::Uninitialised {
            return String::new();
        }
        format!(
            "IPv4 address = {}, netmask = {}, gateway = {}",
            wifi.ipv4(),
            wifi.netmask(),
            wifi.gateway()
        )
    }

    /// One-word status of a hotspot slot, as shown by setup tooling.
    pub fn ssid_status(&self, index: usize) -> &'static str {
        self.slot_status(index).name()
    }

    fn slot_text(&self, settings: &dyn SettingsSource, verb: &str) -> String {
        let index = self.selected_slot;
        let mut out = String::new();
        let mut value = [0u8; 64];

        // A configured BSSID is what the join actually targeted, so it
        // wins over the SSID in the summary.
        if let Some(n) = settings.lookup(&format!("bssid{index}"), &mut value) {
            let _ = write!(
                out,
                "{verb} bssid{index}={}",
                String::from_utf8_lossy(&value[..n])
            );
        } else if let Some(n) = settings.lookup(&format!("ssid{index}"), &mut value) {
            let _ = write!(
                out,
                "{verb} ssid{index}={}",
                String::from_utf8_lossy(&value[..n])
            );
        } else {
            let _ = write!(out, "{verb} ssid{index}=?");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ConnectionManager, PERIODIC_TIME_MS};
    use crate::adapters::wifi::SimWifi;
    use crate::flash::storage::SettingsSource;
    use crate::ports::{LinkStatus, WifiPort};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapSettings(HashMap<String, Vec<u8>>);

    impl SettingsSource for MapSettings {
        fn lookup(&self, key: &str, out: &mut [u8]) -> Option<usize> {
            let value = self.0.get(key)?;
            let n = value.len().min(out.len());
            out[..n].copy_from_slice(&value[..n]);
            Some(n)
        }
    }

    fn settings(pairs: &[(&str, &str)]) -> MapSettings {
        MapSettings(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn uninitialised_summaries() {
        let manager = ConnectionManager::new();
        let wifi = SimWifi::new();
        assert_eq!(
            manager.connect_status_text(&MapSettings::default()),
            "uninitialised"
        );
        assert_eq!(manager.hw_status_text(&wifi), "");
        assert_eq!(manager.ip_status_text(&wifi), "");
    }

    #[test]
    fn error_states_name_the_cause() {
        let cfg = MapSettings::default();
        let mut wifi = SimWifi::new();
        wifi.fail_init_with = Some(123);
        let mut manager = ConnectionManager::new();
        let _ = manager.init(0, &mut wifi, &cfg);
        assert_eq!(manager.connect_status_text(&cfg), "init error: 123");

        let mut wifi = SimWifi::new();
        let mut manager = ConnectionManager::new();
        manager.init(0, &mut wifi, &cfg).unwrap();
        manager.connect();
        manager.periodic_tick(PERIODIC_TIME_MS, &mut wifi, &cfg);
        assert!(manager
            .connect_status_text(&cfg)
            .contains("No WiFi details have been stored"));
    }

    #[test]
    fn connected_summary_names_the_slot() {
        let cfg = settings(&[("ssid1", "HomeNet"), ("pass1", "password1")]);
        let mut wifi = SimWifi::new();
        let mut manager = ConnectionManager::new();
        manager.init(0, &mut wifi, &cfg).unwrap();
        manager.connect();

        let mut now = 0;
        let mut tick = |manager: &mut ConnectionManager, wifi: &mut SimWifi| {
            now += PERIODIC_TIME_MS;
            manager.periodic_tick(now, wifi, &cfg);
        };

        tick(&mut manager, &mut wifi);
        assert_eq!(
            manager.connect_status_text(&cfg),
            "scanning for WiFi hotspots"
        );

        wifi.push_scan_result(b"HomeNet", [0; 6]);
        wifi.finish_scan();
        tick(&mut manager, &mut wifi);
        assert_eq!(
            manager.connect_status_text(&cfg),
            "connecting to ssid1=HomeNet"
        );

        wifi.link = LinkStatus::Join;
        wifi.link_up = true;
        wifi.ip = "192.168.4.20".parse().unwrap();
        tick(&mut manager, &mut wifi);
        assert_eq!(
            manager.connect_status_text(&cfg),
            "connected to ssid1=HomeNet"
        );
        assert!(manager
            .ip_status_text(&wifi)
            .contains("IPv4 address = 192.168.4.20"));
    }

    #[test]
    fn bssid_takes_precedence_in_the_summary() {
        let cfg = settings(&[
            ("ssid1", "Ignore"),
            ("bssid1", "01:02:03:04:05:06"),
            ("pass1", "password1"),
        ]);
        let mut wifi = SimWifi::new();
        let mut manager = ConnectionManager::new();
        manager.init(0, &mut wifi, &cfg).unwrap();
        manager.connect();
        manager.periodic_tick(PERIODIC_TIME_MS, &mut wifi, &cfg);
        wifi.push_scan_result(b"whatever", [1, 2, 3, 4, 5, 6]);
        wifi.finish_scan();
        manager.periodic_tick(2 * PERIODIC_TIME_MS, &mut wifi, &cfg);

        assert_eq!(
            manager.connect_status_text(&cfg),
            "connecting to bssid1=01:02:03:04:05:06"
        );
    }

    #[test]
    fn hw_status_reports_link_and_scan() {
        let cfg = MapSettings::default();
        let mut wifi = SimWifi::new();
        let mut manager = ConnectionManager::new();
        manager.init(0, &mut wifi, &cfg).unwrap();

        assert_eq!(
            manager.hw_status_text(&wifi),
            "link status = LINK_DOWN, scan_active = false"
        );
        wifi.link = LinkStatus::Join;
        wifi.start_scan().unwrap();
        assert_eq!(
            manager.hw_status_text(&wifi),
            "link status = LINK_JOIN, scan_active = true"
        );
    }
}
