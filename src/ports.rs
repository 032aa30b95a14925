//! Port traits — the hexagonal boundary between the library core and the
//! platform.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ ConnectionManager / RemoteService
//! ```
//!
//! Driven adapters (flash, WiFi driver, system control) implement these
//! traits. The core consumes them as `&mut dyn` parameters threaded
//! through each call, so the domain logic never touches hardware directly
//! and every state machine runs unchanged on the host simulation.
//!
//! - **`target_os = "espidf"`**: real driver calls via `esp_idf_svc::sys`.
//! - **all other targets**: simulation adapters for host-side tests.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::flash::range::FlashLayout;

// ───────────────────────────────────────────────────────────────
// Flash port (driven adapter: core ↔ raw flash)
// ───────────────────────────────────────────────────────────────

/// Raw flash access plus the device geometry.
///
/// Offsets are flash-relative (0 = start of flash). Erase granularity is
/// [`crate::flash::FLASH_SECTOR_SIZE`]; programming granularity is
/// [`crate::flash::FLASH_PAGE_SIZE`]. Programming can only clear bits, so
/// callers erase first.
pub trait FlashPort {
    /// Device geometry: capacity, program image size, logical base.
    fn layout(&self) -> FlashLayout;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Erase `size` bytes starting at `offset` (both sector-aligned).
    fn erase(&mut self, offset: u32, size: u32) -> Result<()>;

    /// Program one or more whole pages starting at `offset`.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// The CPU-addressable SRAM window as `(base, end)` bus addresses.
    fn sram_window(&self) -> (u32, u32);

    /// Read from a bus address inside the SRAM window.
    fn read_sram(&self, address: u32, buf: &mut [u8]) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────
// System port (driven adapter: core → interrupts / watchdog / reset)
// ───────────────────────────────────────────────────────────────

/// Execution-context control for flash writes and reset paths.
///
/// `lock_out` quiesces every other execution context (second core,
/// interrupts) so that flash erase/program cannot race code fetching from
/// flash. Every `lock_out` that returns `true` must be paired with
/// `unlock`, except on paths that end in a reset.
pub trait SystemPort {
    /// Whether the other core can currently be stopped.
    fn can_lock_out(&self) -> bool;

    /// Stop the other core and disable interrupts. Returns `false` if the
    /// lock-out could not be acquired within the platform timeout.
    fn lock_out(&mut self) -> bool;

    /// Undo `lock_out`.
    fn unlock(&mut self);

    /// Arm the hardware watchdog.
    fn watchdog_arm(&mut self, timeout_ms: u32);

    /// Reload the watchdog counter without re-arming.
    fn watchdog_feed(&mut self);

    /// Reset the chip into the user firmware. On hardware this does not
    /// return; the simulation records the request and returns.
    fn reboot(&mut self);

    /// Reset the chip into the ROM bootloader.
    fn reboot_to_bootloader(&mut self);
}

// ───────────────────────────────────────────────────────────────
// WiFi port (driven adapter: core ↔ station-mode driver)
// ───────────────────────────────────────────────────────────────

/// Maximum SSID length accepted by the driver, in bytes.
pub const WIFI_SSID_SIZE: usize = 32;

/// BSSID (access-point MAC) length in bytes.
pub const WIFI_BSSID_SIZE: usize = 6;

/// Maximum passphrase length in bytes.
pub const WIFI_PASSWORD_SIZE: usize = 64;

/// Link state reported by the station driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No join in progress.
    Down,
    /// Join handshake in progress.
    Join,
    /// Associated, no IP yet.
    NoIp,
    /// Associated with IP.
    Up,
    /// Join failed for an unspecified reason.
    Fail,
    /// The target network was not found.
    NoNet,
    /// The access point rejected the credentials.
    BadAuth,
}

impl LinkStatus {
    /// Driver-style name used in diagnostic text.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Down => "LINK_DOWN",
            Self::Join => "LINK_JOIN",
            Self::NoIp => "LINK_NOIP",
            Self::Up => "LINK_UP",
            Self::Fail => "LINK_FAIL",
            Self::NoNet => "LINK_NONET",
            Self::BadAuth => "LINK_BADAUTH",
        }
    }
}

/// Authentication mode for a join attempt, inferred from the passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    Wpa2AesPsk,
}

/// One access point reported by an active scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: heapless::Vec<u8, WIFI_SSID_SIZE>,
    pub bssid: [u8; WIFI_BSSID_SIZE],
}

/// Station-mode WiFi driver.
pub trait WifiPort {
    /// Initialise the radio with an encoded regulatory country code
    /// (`first_letter | second_letter << 8`, or the platform default).
    /// Returns the raw driver error code on failure.
    fn init(&mut self, country_code: u32) -> core::result::Result<(), i32>;

    /// Shut the radio down. Only valid after a successful `init`.
    fn deinit(&mut self);

    /// Enable station mode and bring up the network interface.
    fn enable_sta_mode(&mut self);

    /// Set the hostname advertised over DHCP.
    fn set_hostname(&mut self, name: &str);

    /// Begin an active scan. Results arrive via `next_scan_result`.
    fn start_scan(&mut self) -> Result<()>;

    /// Whether a scan started by `start_scan` is still running.
    fn scan_active(&self) -> bool;

    /// Pop the next pending scan result, if any.
    fn next_scan_result(&mut self) -> Option<ScanResult>;

    /// Begin joining. Exactly one of `ssid` / `bssid` is given: when the
    /// BSSID is known the driver targets it directly and ignores SSIDs.
    fn join(
        &mut self,
        ssid: Option<&[u8]>,
        bssid: Option<&[u8; WIFI_BSSID_SIZE]>,
        passphrase: &[u8],
        auth: AuthMode,
    ) -> Result<()>;

    /// Force-leave any association or join attempt. Idempotent.
    fn leave(&mut self);

    /// Current driver link status.
    fn link_status(&self) -> LinkStatus;

    /// Whether the network interface reports link-up.
    fn is_link_up(&self) -> bool;

    /// Interface IPv4 address; unspecified (0.0.0.0) when none is held.
    fn ipv4(&self) -> Ipv4Addr;

    /// Interface netmask.
    fn netmask(&self) -> Ipv4Addr;

    /// Default gateway.
    fn gateway(&self) -> Ipv4Addr;
}
