//! Board identity derived from the flash chip's factory unique id.
//!
//! Produces a stable 16-character uppercase-hex board id. This id is:
//! - Deterministic across reboots (factory-programmed in the flash die)
//! - Reported in the remote-service greeting and info handler
//! - Matched (by substring) by the UDP discovery responder
//! - Used to derive the default DHCP hostname

/// Raw unique id length in bytes (16 hex characters).
pub const BOARD_ID_SIZE: usize = 8;

/// The 8-byte factory unique id.
pub type BoardId = [u8; BOARD_ID_SIZE];

/// Rendered form: 16 uppercase hex characters.
pub type BoardIdHex = heapless::String<{ BOARD_ID_SIZE * 2 }>;

/// Read the factory unique id from the flash chip.
#[cfg(target_os = "espidf")]
pub fn read_board_id() -> BoardId {
    let mut unique: u64 = 0;
    // SAFETY: esp_flash_read_unique_chip_id writes one u64 for the
    // default chip; the pointer is valid and exclusively owned.
    unsafe {
        esp_idf_svc::sys::esp_flash_read_unique_chip_id(
            esp_idf_svc::sys::esp_flash_default_chip,
            &mut unique,
        );
    }
    unique.to_be_bytes()
}

/// Simulation stub — a fixed, recognisable id.
#[cfg(not(target_os = "espidf"))]
pub fn read_board_id() -> BoardId {
    [0xE6, 0x61, 0x48, 0x54, 0xD3, 0x88, 0x5D, 0x30]
}

/// Render a board id as 16 uppercase hex characters.
pub fn board_id_hex(id: &BoardId) -> BoardIdHex {
    use core::fmt::Write;
    let mut out = BoardIdHex::new();
    for b in id {
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// Default DHCP hostname when the settings file has no `name` key:
/// `wifi-settings-XXXX` from the last two id bytes.
pub fn default_hostname(id: &BoardId) -> heapless::String<32> {
    use core::fmt::Write;
    let mut name = heapless::String::new();
    let _ = write!(
        name,
        "wifi-settings-{:02X}{:02X}",
        id[BOARD_ID_SIZE - 2],
        id[BOARD_ID_SIZE - 1]
    );
    name
}
