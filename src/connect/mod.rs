//! WiFi connection manager.
//!
//! A periodic state machine that scans for access points, picks the
//! highest-priority configured hotspot, joins it, and watches link and IP
//! health. The embedding application calls [`ConnectionManager::periodic_tick`]
//! about once a second from its event loop; the manager is the sole
//! mutator of its own state, and every hardware dependency arrives as a
//! port parameter, so the whole machine runs unchanged against the
//! simulation driver.
//!
//! ```text
//!  DISCONNECTED ──connect()──▶ TRY_TO_CONNECT ──▶ SCANNING ──▶ CONNECTING ──▶ CONNECTED_IP
//!        ▲                      │        ▲            │  ▲          │               │
//!        │                      ▼        │            ▼  │          ▼               │
//!        │              STORAGE_EMPTY_ERROR           (retry loop: next FOUND slot) │
//!        └──────────────────────── link or IP lost ◀──────────────────────────────┘
//! ```
//!
//! Hotspot priority is the slot index: `ssid1`/`bssid1` is tried before
//! `ssid2`, and so on. A slot with a BSSID is matched by BSSID alone
//! during scans and joined by BSSID alone.

pub mod status;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::flash::storage::SettingsSource;
use crate::ports::{
    AuthMode, LinkStatus, ScanResult, WifiPort, WIFI_BSSID_SIZE, WIFI_PASSWORD_SIZE, WIFI_SSID_SIZE,
};

// ── Tunables ─────────────────────────────────────────────────

/// Number of configurable hotspot slots (`ssid1` .. `ssid8`).
pub const MAX_NUM_SSIDS: usize = 8;

/// Interval between periodic worker invocations.
pub const PERIODIC_TIME_MS: u64 = 1000;

/// Delay before the first tick after `init`.
pub const INITIAL_SETUP_TIME_MS: u64 = 1000;

/// How long a join attempt may stay in progress before it is abandoned.
pub const CONNECT_TIMEOUT_TIME_MS: u64 = 30_000;

/// Holdoff before rescanning once a scan (or every found hotspot) has
/// been exhausted.
pub const REPEAT_SCAN_TIME_MS: u64 = 30_000;

/// Worldwide regulatory default, used when the `country` key is absent
/// or malformed.
pub const DEFAULT_COUNTRY_CODE: u32 = encode_country(b'0', b'1');

/// Encode a two-letter country code the way the driver expects.
pub const fn encode_country(first: u8, second: u8) -> u32 {
    (first as u32) | ((second as u32) << 8)
}

// ── State ────────────────────────────────────────────────────

/// Lifecycle state of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialised,
    InitialisationError,
    StorageEmptyError,
    Disconnected,
    TryToConnect,
    Scanning,
    Connecting,
    ConnectedIp,
}

/// Per-slot outcome of the current scan/join cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStatus {
    #[default]
    NotFound,
    Found,
    Attempt,
    Failed,
    BadAuth,
    Timeout,
    Success,
    Lost,
}

impl SlotStatus {
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotFound => "NOT FOUND",
            Self::Found => "FOUND",
            Self::Attempt => "ATTEMPT",
            Self::Failed => "FAILED",
            Self::BadAuth => "BADAUTH",
            Self::Timeout => "TIMEOUT",
            Self::Success => "SUCCESS",
            Self::Lost => "LOST",
        }
    }
}

/// One configured hotspot slot, as read back from the settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub ssid: Option<heapless::Vec<u8, WIFI_SSID_SIZE>>,
    pub bssid: Option<[u8; WIFI_BSSID_SIZE]>,
    pub passphrase: heapless::Vec<u8, WIFI_PASSWORD_SIZE>,
}

impl SlotConfig {
    fn auth_mode(&self) -> AuthMode {
        if self.passphrase.is_empty() {
            AuthMode::Open
        } else {
            AuthMode::Wpa2AesPsk
        }
    }
}

/// Read slot `index` (1-based). `None` when neither `ssid<N>` nor
/// `bssid<N>` is configured.
pub fn read_slot(settings: &dyn SettingsSource, index: usize) -> Option<SlotConfig> {
    let mut buf = [0u8; WIFI_SSID_SIZE];
    let ssid = settings
        .lookup(&format!("ssid{index}"), &mut buf)
        .and_then(|n| heapless::Vec::from_slice(&buf[..n]).ok());

    let mut bssid_buf = [0u8; 17];
    let bssid = settings
        .lookup(&format!("bssid{index}"), &mut bssid_buf)
        .and_then(|n| parse_bssid(&bssid_buf[..n]));

    if ssid.is_none() && bssid.is_none() {
        return None;
    }

    let mut pass_buf = [0u8; WIFI_PASSWORD_SIZE];
    let passphrase = settings
        .lookup(&format!("pass{index}"), &mut pass_buf)
        .and_then(|n| heapless::Vec::from_slice(&pass_buf[..n]).ok())
        .unwrap_or_default();

    Some(SlotConfig {
        ssid,
        bssid,
        passphrase,
    })
}

/// Parse `xx:xx:xx:xx:xx:xx` (either hex case) into MAC bytes.
pub fn parse_bssid(text: &[u8]) -> Option<[u8; WIFI_BSSID_SIZE]> {
    if text.len() != 17 {
        return None;
    }
    let mut out = [0u8; WIFI_BSSID_SIZE];
    for (i, chunk) in text.chunks(3).enumerate() {
        if i < WIFI_BSSID_SIZE - 1 && chunk[2] != b':' {
            return None;
        }
        let hi = hex_nibble(chunk[0])?;
        let lo = hex_nibble(chunk[1])?;
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ── Manager ──────────────────────────────────────────────────

/// The connection manager singleton. Construct with [`Self::new`], bring
/// up with [`Self::init`], then drive with [`Self::periodic_tick`].
pub struct ConnectionManager {
    state: ConnectionState,
    /// 1-based slot being joined or held; 0 = none.
    selected_slot: usize,
    slot_status: [SlotStatus; MAX_NUM_SSIDS + 1],
    scan_holdoff_deadline: u64,
    connect_timeout_deadline: u64,
    hw_error_code: i32,
    hostname: heapless::String<32>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Uninitialised,
            selected_slot: 0,
            slot_status: [SlotStatus::NotFound; MAX_NUM_SSIDS + 1],
            scan_holdoff_deadline: 0,
            connect_timeout_deadline: 0,
            hw_error_code: 0,
            hostname: heapless::String::new(),
        }
    }

    /// Initialise the WiFi hardware and enter `Disconnected`.
    ///
    /// The country code comes from the `country` key (two ASCII letters);
    /// anything else selects the worldwide default. Fails with
    /// `InvalidState` when already initialised; a driver failure stores
    /// the raw code (see [`Self::hw_error_code`]) and leaves the manager
    /// in `InitialisationError` until `deinit`.
    pub fn init(
        &mut self,
        now_ms: u64,
        wifi: &mut dyn WifiPort,
        settings: &dyn SettingsSource,
    ) -> Result<()> {
        if self.state != ConnectionState::Uninitialised {
            return Err(Error::InvalidState);
        }

        if let Err(code) = wifi.init(read_country_code(settings)) {
            warn!("wifi init failed with driver code {code}");
            self.hw_error_code = code;
            self.state = ConnectionState::InitialisationError;
            return Err(Error::Generic);
        }
        wifi.enable_sta_mode();

        self.hostname = read_hostname(settings);
        wifi.set_hostname(&self.hostname);

        self.scan_holdoff_deadline = now_ms + INITIAL_SETUP_TIME_MS;
        self.connect_timeout_deadline = now_ms + CONNECT_TIMEOUT_TIME_MS;
        self.state = ConnectionState::Disconnected;
        info!("wifi connection manager initialised as '{}'", self.hostname);
        Ok(())
    }

    /// Tear down. Idempotent: a second `deinit` is a no-op.
    pub fn deinit(&mut self, wifi: &mut dyn WifiPort) {
        if self.state == ConnectionState::Uninitialised {
            return;
        }
        if self.state != ConnectionState::InitialisationError {
            wifi.leave();
            wifi.deinit();
        }
        self.state = ConnectionState::Uninitialised;
        self.selected_slot = 0;
        self.slot_status = [SlotStatus::NotFound; MAX_NUM_SSIDS + 1];
        info!("wifi connection manager deinitialised");
    }

    /// Request a connection. Only meaningful from `Disconnected`.
    pub fn connect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::TryToConnect;
        }
    }

    /// Force-leave and stay down until the next `connect`.
    pub fn disconnect(&mut self, wifi: &mut dyn WifiPort) {
        if self.state == ConnectionState::Uninitialised {
            return;
        }
        wifi.leave();
        self.selected_slot = 0;
        self.state = ConnectionState::Disconnected;
    }

    /// Whether the manager holds an address and the interface is up.
    pub fn is_connected(&self, wifi: &dyn WifiPort) -> bool {
        self.state == ConnectionState::ConnectedIp && wifi.is_link_up()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The slot being joined or held (1-based); 0 when none.
    pub fn selected_slot(&self) -> usize {
        self.selected_slot
    }

    pub fn slot_status(&self, index: usize) -> SlotStatus {
        self.slot_status.get(index).copied().unwrap_or_default()
    }

    /// Raw driver code captured when `init` failed.
    pub fn hw_error_code(&self) -> i32 {
        self.hw_error_code
    }

    /// Hostname chosen at `init` (the `name` key, or the board default).
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// True when not even the first slot is configured.
    pub fn has_no_wifi_details(settings: &dyn SettingsSource) -> bool {
        read_slot(settings, 1).is_none()
    }

    // ── Periodic worker ──────────────────────────────────────

    /// Advance the state machine. Call about every [`PERIODIC_TIME_MS`];
    /// returns the delay until the next invocation.
    pub fn periodic_tick(
        &mut self,
        now_ms: u64,
        wifi: &mut dyn WifiPort,
        settings: &dyn SettingsSource,
    ) -> u64 {
        match self.state {
            ConnectionState::Uninitialised
            | ConnectionState::InitialisationError
            | ConnectionState::Disconnected => {}

            ConnectionState::StorageEmptyError => {
                if any_slot_configured(settings) {
                    info!("hotspot details appeared, reconnecting");
                    self.state = ConnectionState::TryToConnect;
                }
            }

            ConnectionState::TryToConnect => {
                if !any_slot_configured(settings) {
                    wifi.leave();
                    warn!("no hotspot details stored");
                    self.state = ConnectionState::StorageEmptyError;
                } else if now_ms >= self.scan_holdoff_deadline {
                    wifi.leave();
                    self.slot_status = [SlotStatus::NotFound; MAX_NUM_SSIDS + 1];
                    self.selected_slot = 0;
                    match wifi.start_scan() {
                        Ok(()) => {
                            info!("scan started");
                            self.state = ConnectionState::Scanning;
                        }
                        Err(e) => warn!("scan failed to start: {e}"),
                    }
                }
            }

            ConnectionState::Scanning => {
                while let Some(result) = wifi.next_scan_result() {
                    self.handle_scan_result(settings, &result);
                }
                if !wifi.scan_active() {
                    wifi.leave();
                    self.begin_connection(now_ms, wifi, settings);
                }
            }

            ConnectionState::Connecting => match wifi.link_status() {
                LinkStatus::BadAuth => {
                    warn!("slot {} rejected the credentials", self.selected_slot);
                    self.mark_selected(SlotStatus::BadAuth);
                    self.state = ConnectionState::Scanning;
                }
                LinkStatus::Down | LinkStatus::Fail | LinkStatus::NoNet => {
                    warn!("join of slot {} failed", self.selected_slot);
                    self.mark_selected(SlotStatus::Failed);
                    self.state = ConnectionState::Scanning;
                }
                LinkStatus::Join | LinkStatus::NoIp | LinkStatus::Up => {
                    if wifi.is_link_up() && !wifi.ipv4().is_unspecified() {
                        info!("slot {} connected, address {}", self.selected_slot, wifi.ipv4());
                        self.mark_selected(SlotStatus::Success);
                        self.state = ConnectionState::ConnectedIp;
                    } else if now_ms >= self.connect_timeout_deadline {
                        warn!("join of slot {} timed out", self.selected_slot);
                        self.mark_selected(SlotStatus::Timeout);
                        self.state = ConnectionState::Scanning;
                    }
                }
            },

            ConnectionState::ConnectedIp => {
                if !wifi.is_link_up() || wifi.ipv4().is_unspecified() {
                    warn!("connection to slot {} lost", self.selected_slot);
                    self.mark_selected(SlotStatus::Lost);
                    self.state = ConnectionState::TryToConnect;
                }
            }
        }
        PERIODIC_TIME_MS
    }

    /// Record one scan result against the configured slots. A slot with a
    /// BSSID matches by BSSID alone; only `NotFound` becomes `Found`, so
    /// slots already attempted this cycle stay consumed.
    pub fn handle_scan_result(&mut self, settings: &dyn SettingsSource, result: &ScanResult) {
        for index in 1..=MAX_NUM_SSIDS {
            if self.slot_status[index] != SlotStatus::NotFound {
                continue;
            }
            let Some(config) = read_slot(settings, index) else {
                continue;
            };
            let matched = match (&config.bssid, &config.ssid) {
                (Some(bssid), _) => *bssid == result.bssid,
                (None, Some(ssid)) => ssid.as_slice() == result.ssid.as_slice(),
                (None, None) => false,
            };
            if matched {
                info!("scan: slot {index} found");
                self.slot_status[index] = SlotStatus::Found;
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────

    /// Pick the lowest-index `Found` slot and start joining it. With no
    /// candidate left, fall back to `TryToConnect` behind the rescan
    /// holdoff.
    fn begin_connection(
        &mut self,
        now_ms: u64,
        wifi: &mut dyn WifiPort,
        settings: &dyn SettingsSource,
    ) {
        let Some(index) = (1..=MAX_NUM_SSIDS).find(|&i| self.slot_status[i] == SlotStatus::Found)
        else {
            self.selected_slot = 0;
            self.scan_holdoff_deadline = now_ms + REPEAT_SCAN_TIME_MS;
            self.state = ConnectionState::TryToConnect;
            return;
        };

        self.slot_status[index] = SlotStatus::Attempt;

        // Re-read the slot: the settings file may have been rewritten
        // since the scan matched it.
        let Some(config) = read_slot(settings, index) else {
            warn!("slot {index} vanished from settings, rescanning");
            self.selected_slot = 0;
            self.state = ConnectionState::TryToConnect;
            return;
        };

        let joined = match (&config.bssid, &config.ssid) {
            (Some(bssid), _) => wifi.join(None, Some(bssid), &config.passphrase, config.auth_mode()),
            (None, Some(ssid)) => {
                wifi.join(Some(ssid.as_slice()), None, &config.passphrase, config.auth_mode())
            }
            (None, None) => unreachable!("read_slot yielded neither ssid nor bssid"),
        };
        match joined {
            Ok(()) => {
                info!("joining slot {index}");
                self.selected_slot = index;
                self.connect_timeout_deadline = now_ms + CONNECT_TIMEOUT_TIME_MS;
                self.state = ConnectionState::Connecting;
            }
            Err(e) => {
                warn!("join of slot {index} refused by driver: {e}");
                self.slot_status[index] = SlotStatus::Failed;
                self.state = ConnectionState::Scanning;
            }
        }
    }

    fn mark_selected(&mut self, status: SlotStatus) {
        if (1..=MAX_NUM_SSIDS).contains(&self.selected_slot) {
            self.slot_status[self.selected_slot] = status;
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

// ── Settings helpers ─────────────────────────────────────────

fn any_slot_configured(settings: &dyn SettingsSource) -> bool {
    (1..=MAX_NUM_SSIDS).any(|i| read_slot(settings, i).is_some())
}

fn read_country_code(settings: &dyn SettingsSource) -> u32 {
    let mut buf = [0u8; 3];
    match settings.lookup("country", &mut buf) {
        Some(2) if buf[..2].iter().all(u8::is_ascii_uppercase) => {
            encode_country(buf[0], buf[1])
        }
        _ => DEFAULT_COUNTRY_CODE,
    }
}

fn read_hostname(settings: &dyn SettingsSource) -> heapless::String<32> {
    let mut buf = [0u8; 32];
    if let Some(n) = settings.lookup("name", &mut buf) {
        if n > 0 {
            if let Ok(text) = core::str::from_utf8(&buf[..n]) {
                if let Ok(name) = heapless::String::try_from(text) {
                    return name;
                }
            }
        }
    }
    let id = crate::adapters::device_id::read_board_id();
    crate::adapters::device_id::default_hostname(&id)
}
