//! Built-in handlers: device info, settings update, update-and-reboot.
//!
//! These cover the reserved message types that every build carries. The
//! flash/RAM access and OTA handlers live in [`super::memory_access`]
//! behind the `memory-access` feature.

use std::fmt::Write;

use log::info;

use crate::adapters::device_id::board_id_hex;
use crate::error::Error;
use crate::flash::storage::SettingsSource;
use crate::flash::{update, FLASH_SECTOR_SIZE};
use crate::ports::{FlashPort, SystemPort, WifiPort};

use super::registry::{HandlerCtx, HandlerIo, HandlerTable};
use super::{
    ID_INFO_HANDLER, ID_UPDATE_HANDLER, ID_UPDATE_REBOOT_HANDLER, MAX_DATA_SIZE,
};

/// Install every built-in handler into `table`.
pub fn install_builtin_handlers(table: &mut HandlerTable) -> crate::error::Result<()> {
    table.set_handler(ID_INFO_HANDLER, Box::new(info_handler))?;
    table.set_handler(ID_UPDATE_HANDLER, Box::new(update_handler))?;
    table.set_two_stage_handler(
        ID_UPDATE_REBOOT_HANDLER,
        None,
        Box::new(update_reboot_commit),
    )?;

    #[cfg(feature = "memory-access")]
    super::memory_access::install_memory_access_handlers(table)?;

    Ok(())
}

// ── Info ─────────────────────────────────────────────────────

/// Newline-separated `key=value` diagnostics: flash geometry, identity,
/// addressing, versions. Takes no input.
pub fn info_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) -> i32 {
    if io.input_size != 0 || io.parameter != 0 {
        io.output_size = 0;
        return Error::InvalidArg.code();
    }

    let layout = ctx.flash.layout();
    let mut text = String::new();
    let mut add = |key: &str, value: &str| {
        if !value.is_empty() {
            let _ = writeln!(text, "{key}={value}");
        }
    };

    // Geometry first: this is what reflashing tools need.
    add("flash_sector_size", &format!("{FLASH_SECTOR_SIZE:#010x}"));
    add("max_data_size", &format!("{MAX_DATA_SIZE:#010x}"));
    for (key, range) in [
        ("flash_all", layout.all()),
        ("flash_reusable", layout.reusable()),
        ("flash_settings_file", layout.settings_file()),
        ("flash_program", layout.program()),
    ] {
        add(key, &format!("{:#010x}:{:#010x}", range.start, range.end()));
    }
    add("logical_offset", &format!("{:#010x}", layout.logical_base));
    #[cfg(feature = "memory-access")]
    add("memory_access", "1");

    add("board_id", board_id_hex(&ctx.board_id).as_str());

    // Network identity.
    let mut name = [0u8; 32];
    if let Some(n) = ctx.settings_lookup("name", &mut name) {
        add("name", &String::from_utf8_lossy(&name[..n]));
    }
    let ip = ctx.wifi.ipv4();
    if !ip.is_unspecified() {
        add("ip", &ip.to_string());
    }

    add("wifi_settings_version", env!("CARGO_PKG_VERSION"));
    add("program", env!("CARGO_PKG_NAME"));

    io.set_output(text.as_bytes());
    0
}

// ── Settings update ──────────────────────────────────────────

/// Atomically replace the settings file with the request payload. On
/// success the reply parameter is the written size, and the hashed
/// secret and hostname are refreshed from the new file.
pub fn update_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) -> i32 {
    io.output_size = 0;
    if io.parameter != 0 {
        return Error::InvalidArg.code();
    }

    let size = io.input_size;
    if let Err(e) = update::update_settings_file(ctx.flash, ctx.system, &io.data[..size]) {
        return e.code();
    }

    refresh_identity(ctx);
    info!("remote settings update applied ({size} bytes)");
    size as i32
}

/// Re-derive everything that depends on the settings file contents.
pub(super) fn refresh_identity(ctx: &mut HandlerCtx<'_>) {
    let Ok(snapshot) = ctx.settings() else {
        return;
    };
    ctx.secret.refresh(&snapshot);

    let mut buf = [0u8; 32];
    match snapshot.lookup("name", &mut buf) {
        Some(n) if n > 0 => {
            if let Ok(name) = core::str::from_utf8(&buf[..n]) {
                ctx.wifi.set_hostname(name);
            }
        }
        _ => {
            let default = crate::adapters::device_id::default_hostname(&ctx.board_id);
            ctx.wifi.set_hostname(&default);
        }
    }
}

// ── Update and reboot ────────────────────────────────────────

/// Commit stage of the update-and-reboot request. Runs after the reply
/// header has been flushed and the connection closed; never returns on
/// hardware. An empty payload reboots without touching the settings.
pub fn update_reboot_commit(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) {
    // From here on nothing else may run: the settings write below uses
    // the already-quiesced path.
    let _ = ctx.system.lock_out();

    if io.input_size != 0 {
        let _ = update::update_settings_file_unsafe(ctx.flash, &io.data[..io.input_size]);
    }
    #[cfg(feature = "memory-access")]
    if io.parameter == 1 {
        ctx.system.reboot_to_bootloader();
        return;
    }
    ctx.system.watchdog_arm(1);
    ctx.system.reboot();
}
