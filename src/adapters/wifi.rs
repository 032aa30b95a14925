//! WiFi station driver adapter.
//!
//! Implements [`WifiPort`].
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: real driver calls via
//!   `esp_idf_svc::sys` (`esp_wifi_*` / `esp_netif_*`).
//! - **all other targets**: [`SimWifi`], a fully scriptable driver. Tests
//!   set the link status, queue scan results, and read back a record of
//!   every join/leave, which is how the connection state machine is
//!   exercised tick by tick without hardware.

use std::net::Ipv4Addr;

#[cfg(target_os = "espidf")]
use log::info;

use crate::error::Result;
use crate::ports::{AuthMode, LinkStatus, ScanResult, WifiPort, WIFI_BSSID_SIZE};

// ───────────────────────────────────────────────────────────────
// Host simulation
// ───────────────────────────────────────────────────────────────

/// One recorded join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pub ssid: Option<Vec<u8>>,
    pub bssid: Option<[u8; WIFI_BSSID_SIZE]>,
    pub passphrase: Vec<u8>,
    pub auth: AuthMode,
}

/// Scriptable WiFi driver simulation.
pub struct SimWifi {
    /// Driver error injected into the next `init` call, if any.
    pub fail_init_with: Option<i32>,
    /// Scripted link status.
    pub link: LinkStatus,
    /// Scripted netif link state.
    pub link_up: bool,
    /// Scripted interface address.
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,

    pub country_code: Option<u32>,
    pub hostname: Option<String>,
    pub joins: Vec<JoinRecord>,
    pub leave_calls: u32,
    pub scan_starts: u32,

    initialised: bool,
    sta_enabled: bool,
    scanning: bool,
    scan_results: std::collections::VecDeque<ScanResult>,
}

impl SimWifi {
    pub fn new() -> Self {
        Self {
            fail_init_with: None,
            link: LinkStatus::Down,
            link_up: false,
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            country_code: None,
            hostname: None,
            joins: Vec::new(),
            leave_calls: 0,
            scan_starts: 0,
            initialised: false,
            sta_enabled: false,
            scanning: false,
            scan_results: std::collections::VecDeque::new(),
        }
    }

    /// Queue a scan result for the state machine to pick up.
    pub fn push_scan_result(&mut self, ssid: &[u8], bssid: [u8; WIFI_BSSID_SIZE]) {
        self.scan_results.push_back(ScanResult {
            ssid: heapless::Vec::from_slice(ssid).expect("ssid fits"),
            bssid,
        });
    }

    /// Mark the in-progress scan as complete.
    pub fn finish_scan(&mut self) {
        self.scanning = false;
    }

    pub fn last_join(&self) -> Option<&JoinRecord> {
        self.joins.last()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }
}

impl Default for SimWifi {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiPort for SimWifi {
    fn init(&mut self, country_code: u32) -> core::result::Result<(), i32> {
        if let Some(code) = self.fail_init_with {
            return Err(code);
        }
        self.initialised = true;
        self.country_code = Some(country_code);
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialised = false;
        self.sta_enabled = false;
        self.scanning = false;
    }

    fn enable_sta_mode(&mut self) {
        self.sta_enabled = true;
    }

    fn set_hostname(&mut self, name: &str) {
        self.hostname = Some(name.to_string());
    }

    fn start_scan(&mut self) -> Result<()> {
        self.scan_starts += 1;
        self.scanning = true;
        Ok(())
    }

    fn scan_active(&self) -> bool {
        self.scanning
    }

    fn next_scan_result(&mut self) -> Option<ScanResult> {
        self.scan_results.pop_front()
    }

    fn join(
        &mut self,
        ssid: Option<&[u8]>,
        bssid: Option<&[u8; WIFI_BSSID_SIZE]>,
        passphrase: &[u8],
        auth: AuthMode,
    ) -> Result<()> {
        self.joins.push(JoinRecord {
            ssid: ssid.map(<[u8]>::to_vec),
            bssid: bssid.copied(),
            passphrase: passphrase.to_vec(),
            auth,
        });
        Ok(())
    }

    fn leave(&mut self) {
        self.leave_calls += 1;
    }

    fn link_status(&self) -> LinkStatus {
        self.link
    }

    fn is_link_up(&self) -> bool {
        self.link_up
    }

    fn ipv4(&self) -> Ipv4Addr {
        self.ip
    }

    fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct EspWifi {
    netif: *mut esp_idf_svc::sys::esp_netif_obj,
    connecting: bool,
    scanning: bool,
}

#[cfg(target_os = "espidf")]
impl EspWifi {
    pub fn new() -> Self {
        Self {
            netif: core::ptr::null_mut(),
            connecting: false,
            scanning: false,
        }
    }
}

#[cfg(target_os = "espidf")]
impl WifiPort for EspWifi {
    fn init(&mut self, country_code: u32) -> core::result::Result<(), i32> {
        use esp_idf_svc::sys::*;
        unsafe {
            let ret = esp_netif_init();
            if ret != ESP_OK {
                return Err(ret);
            }
            let ret = esp_event_loop_create_default();
            if ret != ESP_OK && ret != ESP_ERR_INVALID_STATE {
                return Err(ret);
            }
            let cfg = wifi_init_config_t {
                ..Default::default()
            };
            let ret = esp_wifi_init(&cfg);
            if ret != ESP_OK {
                return Err(ret);
            }
            let country = wifi_country_t {
                cc: [
                    (country_code & 0xFF) as core::ffi::c_char,
                    ((country_code >> 8) & 0xFF) as core::ffi::c_char,
                    0,
                ],
                schan: 1,
                nchan: 11,
                max_tx_power: 0,
                policy: wifi_country_policy_t_WIFI_COUNTRY_POLICY_AUTO,
            };
            let ret = esp_wifi_set_country(&country);
            if ret != ESP_OK {
                return Err(ret);
            }
        }
        info!("wifi: driver initialised");
        Ok(())
    }

    fn deinit(&mut self) {
        // SAFETY: stop before deinit, matching the driver contract.
        unsafe {
            esp_idf_svc::sys::esp_wifi_stop();
            esp_idf_svc::sys::esp_wifi_deinit();
        }
        self.netif = core::ptr::null_mut();
    }

    fn enable_sta_mode(&mut self) {
        use esp_idf_svc::sys::*;
        unsafe {
            self.netif = esp_netif_create_default_wifi_sta();
            esp_wifi_set_mode(wifi_mode_t_WIFI_MODE_STA);
            esp_wifi_start();
        }
        info!("wifi: station mode enabled");
    }

    fn set_hostname(&mut self, name: &str) {
        use esp_idf_svc::sys::*;
        if self.netif.is_null() {
            return;
        }
        let mut buf = [0u8; 33];
        let len = name.len().min(32);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        // SAFETY: buf is NUL-terminated and outlives the call (the IDF
        // copies the string).
        unsafe {
            esp_netif_set_hostname(self.netif, buf.as_ptr().cast());
        }
    }

    fn start_scan(&mut self) -> Result<()> {
        use esp_idf_svc::sys::*;
        // SAFETY: a zeroed scan config selects an active scan of all
        // channels; non-blocking.
        let ret = unsafe { esp_wifi_scan_start(core::ptr::null(), false) };
        if ret != ESP_OK {
            return Err(crate::error::Error::Generic);
        }
        self.scanning = true;
        Ok(())
    }

    fn scan_active(&self) -> bool {
        self.scanning
    }

    fn next_scan_result(&mut self) -> Option<ScanResult> {
        use esp_idf_svc::sys::*;
        if !self.scanning {
            return None;
        }
        let mut count: u16 = 1;
        let mut record: wifi_ap_record_t = unsafe { core::mem::zeroed() };
        // SAFETY: record is a valid out-pointer for one AP record.
        let ret = unsafe { esp_wifi_scan_get_ap_records(&mut count, &mut record) };
        if ret != ESP_OK || count == 0 {
            self.scanning = false;
            return None;
        }
        let ssid_len = record
            .ssid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(record.ssid.len());
        Some(ScanResult {
            ssid: heapless::Vec::from_slice(&record.ssid[..ssid_len]).unwrap_or_default(),
            bssid: record.bssid,
        })
    }

    fn join(
        &mut self,
        ssid: Option<&[u8]>,
        bssid: Option<&[u8; WIFI_BSSID_SIZE]>,
        passphrase: &[u8],
        auth: AuthMode,
    ) -> Result<()> {
        use esp_idf_svc::sys::*;
        unsafe {
            let mut cfg: wifi_config_t = core::mem::zeroed();
            let sta = &mut cfg.sta;
            if let Some(ssid) = ssid {
                let len = ssid.len().min(sta.ssid.len());
                sta.ssid[..len].copy_from_slice(&ssid[..len]);
            }
            if let Some(bssid) = bssid {
                sta.bssid.copy_from_slice(bssid);
                sta.bssid_set = true;
            }
            let len = passphrase.len().min(sta.password.len());
            sta.password[..len].copy_from_slice(&passphrase[..len]);
            sta.threshold.authmode = match auth {
                AuthMode::Open => wifi_auth_mode_t_WIFI_AUTH_OPEN,
                AuthMode::Wpa2AesPsk => wifi_auth_mode_t_WIFI_AUTH_WPA2_PSK,
            };
            let ret = esp_wifi_set_config(wifi_interface_t_WIFI_IF_STA, &mut cfg);
            if ret != ESP_OK {
                return Err(crate::error::Error::Generic);
            }
            let ret = esp_wifi_connect();
            if ret != ESP_OK {
                return Err(crate::error::Error::Generic);
            }
        }
        self.connecting = true;
        Ok(())
    }

    fn leave(&mut self) {
        // SAFETY: disconnect is valid in any station state.
        unsafe {
            esp_idf_svc::sys::esp_wifi_disconnect();
        }
        self.connecting = false;
    }

    fn link_status(&self) -> LinkStatus {
        use esp_idf_svc::sys::*;
        let mut ap_info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
        // SAFETY: ap_info is a valid out-pointer.
        let ret = unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) };
        if ret == ESP_OK {
            if self.ipv4().is_unspecified() {
                LinkStatus::NoIp
            } else {
                LinkStatus::Up
            }
        } else if self.connecting {
            LinkStatus::Join
        } else {
            LinkStatus::Down
        }
    }

    fn is_link_up(&self) -> bool {
        use esp_idf_svc::sys::*;
        let mut ap_info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
        // SAFETY: ap_info is a valid out-pointer.
        unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) == ESP_OK }
    }

    fn ipv4(&self) -> Ipv4Addr {
        self.ip_info().map_or(Ipv4Addr::UNSPECIFIED, |i| {
            Ipv4Addr::from(u32::from_be(i.ip.addr))
        })
    }

    fn netmask(&self) -> Ipv4Addr {
        self.ip_info().map_or(Ipv4Addr::UNSPECIFIED, |i| {
            Ipv4Addr::from(u32::from_be(i.netmask.addr))
        })
    }

    fn gateway(&self) -> Ipv4Addr {
        self.ip_info().map_or(Ipv4Addr::UNSPECIFIED, |i| {
            Ipv4Addr::from(u32::from_be(i.gw.addr))
        })
    }
}

#[cfg(target_os = "espidf")]
impl EspWifi {
    fn ip_info(&self) -> Option<esp_idf_svc::sys::esp_netif_ip_info_t> {
        use esp_idf_svc::sys::*;
        if self.netif.is_null() {
            return None;
        }
        let mut info: esp_netif_ip_info_t = unsafe { core::mem::zeroed() };
        // SAFETY: netif was created by enable_sta_mode; info is a valid
        // out-pointer.
        let ret = unsafe { esp_netif_get_ip_info(self.netif, &mut info) };
        (ret == ESP_OK).then_some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_failure_is_injected() {
        let mut wifi = SimWifi::new();
        wifi.fail_init_with = Some(-7);
        assert_eq!(wifi.init(0x5553), Err(-7));
        assert!(!wifi.is_initialised());
    }

    #[test]
    fn init_records_country_code() {
        let mut wifi = SimWifi::new();
        wifi.init(0x5841).unwrap(); // "AX"
        assert_eq!(wifi.country_code, Some(0x5841));
    }

    #[test]
    fn scan_results_drain_in_order() {
        let mut wifi = SimWifi::new();
        wifi.start_scan().unwrap();
        assert!(wifi.scan_active());
        wifi.push_scan_result(b"First", [0; 6]);
        wifi.push_scan_result(b"Second", [1; 6]);
        assert_eq!(wifi.next_scan_result().unwrap().ssid.as_slice(), b"First");
        assert_eq!(wifi.next_scan_result().unwrap().ssid.as_slice(), b"Second");
        assert_eq!(wifi.next_scan_result(), None);
        wifi.finish_scan();
        assert!(!wifi.scan_active());
    }

    #[test]
    fn joins_are_recorded() {
        let mut wifi = SimWifi::new();
        wifi.join(Some(b"Net"), None, b"password", AuthMode::Wpa2AesPsk)
            .unwrap();
        let j = wifi.last_join().unwrap();
        assert_eq!(j.ssid.as_deref(), Some(b"Net".as_slice()));
        assert_eq!(j.bssid, None);
        assert_eq!(j.auth, AuthMode::Wpa2AesPsk);
    }
}
