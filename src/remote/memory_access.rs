//! Memory-access handlers: raw read, sector write, OTA firmware update.
//!
//! These give an authenticated client direct reach into flash and RAM,
//! so they are compiled in only with the `memory-access` feature. The
//! guard rails are address-window checks, not permissions: reads must
//! fall inside mapped flash or SRAM, writes inside the reusable region,
//! and an OTA target may overwrite the program but never the staged
//! image or the settings file.

use log::{info, warn};

use crate::error::Error;
use crate::flash::range::{FlashRange, LogicalRange};
use crate::flash::FLASH_SECTOR_SIZE;
use crate::ports::{FlashPort, SystemPort};

use super::registry::{HandlerCtx, HandlerIo, HandlerTable};
use super::{
    ID_OTA_FIRMWARE_UPDATE_HANDLER, ID_READ_HANDLER, ID_WRITE_FLASH_HANDLER, MAX_DATA_SIZE,
};

/// SHA-256 length carried in an OTA request.
pub const OTA_HASH_SIZE: usize = 32;

/// Wire size of a read request.
pub const READ_REQUEST_SIZE: usize = 8;

/// Wire size of an OTA request.
pub const OTA_REQUEST_SIZE: usize = 16 + OTA_HASH_SIZE;

pub fn install_memory_access_handlers(table: &mut HandlerTable) -> crate::error::Result<()> {
    table.set_handler(ID_READ_HANDLER, Box::new(read_handler))?;
    table.set_handler(ID_WRITE_FLASH_HANDLER, Box::new(write_flash_handler))?;
    table.set_two_stage_handler(
        ID_OTA_FIRMWARE_UPDATE_HANDLER,
        Some(Box::new(ota_verify_handler)),
        Box::new(ota_commit_handler),
    )?;
    Ok(())
}

// ── Request layouts ──────────────────────────────────────────

/// Request payload of [`read_handler`]: one bus-address window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub window: LogicalRange,
}

impl ReadRequest {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != READ_REQUEST_SIZE {
            return None;
        }
        Some(Self {
            window: LogicalRange {
                start: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
                size: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            },
        })
    }

    pub fn encode(&self) -> [u8; READ_REQUEST_SIZE] {
        let mut out = [0u8; READ_REQUEST_SIZE];
        out[0..4].copy_from_slice(&self.window.start.to_le_bytes());
        out[4..8].copy_from_slice(&self.window.size.to_le_bytes());
        out
    }
}

/// Request payload of the OTA handlers: staged source, target, and the
/// expected SHA-256 of the staged image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaRequest {
    pub copy_from: FlashRange,
    pub copy_to: FlashRange,
    pub sha256: [u8; OTA_HASH_SIZE],
}

impl OtaRequest {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OTA_REQUEST_SIZE {
            return None;
        }
        let mut sha256 = [0u8; OTA_HASH_SIZE];
        sha256.copy_from_slice(&bytes[16..]);
        Some(Self {
            copy_from: FlashRange {
                start: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
                size: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            },
            copy_to: FlashRange {
                start: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
                size: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
            },
            sha256,
        })
    }

    pub fn encode(&self) -> [u8; OTA_REQUEST_SIZE] {
        let mut out = [0u8; OTA_REQUEST_SIZE];
        out[0..4].copy_from_slice(&self.copy_from.start.to_le_bytes());
        out[4..8].copy_from_slice(&self.copy_from.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.copy_to.start.to_le_bytes());
        out[12..16].copy_from_slice(&self.copy_to.size.to_le_bytes());
        out[16..].copy_from_slice(&self.sha256);
        out
    }
}

/// `BadAlignment` when the start is off-sector, `InvalidArg` when the
/// size is not a whole number of sectors. The caller must supply aligned
/// values; nothing is rounded on their behalf.
fn check_alignment(range: &FlashRange) -> Result<(), Error> {
    let aligned = range.align_to_sector();
    if aligned.start != range.start {
        return Err(Error::BadAlignment);
    }
    if aligned.size != range.size {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

// ── Read ─────────────────────────────────────────────────────

/// Copy from an arbitrary bus address. The window must translate to
/// flash or fall wholly inside SRAM; anything else would fault, so it
/// is refused instead. Oversized requests are truncated to the reply
/// buffer.
pub fn read_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) -> i32 {
    if io.input_size != READ_REQUEST_SIZE || io.parameter != 0 {
        io.output_size = 0;
        return Error::InvalidArg.code();
    }
    let Some(request) = ReadRequest::decode(io.input()) else {
        io.output_size = 0;
        return Error::InvalidArg.code();
    };

    let copy_size = (request.window.size as usize).min(MAX_DATA_SIZE);
    let window = LogicalRange {
        start: request.window.start,
        size: copy_size as u32,
    };

    let layout = ctx.flash.layout();
    let outcome = if let Some(fr) = layout.to_flash(&window) {
        ctx.flash.read(fr.start, &mut io.data[..copy_size])
    } else {
        ctx.flash.read_sram(window.start, &mut io.data[..copy_size])
    };

    match outcome {
        Ok(()) => {
            io.output_size = copy_size;
            copy_size as i32
        }
        Err(_) => {
            io.output_size = 0;
            Error::InvalidAddress.code()
        }
    }
}

// ── Write ────────────────────────────────────────────────────

/// Rewrite whole sectors inside the reusable region. The parameter is
/// the target flash offset; the payload is the new contents.
pub fn write_flash_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) -> i32 {
    io.output_size = 0;

    let target = FlashRange {
        start: io.parameter as u32,
        size: io.input_size as u32,
    };
    if let Err(e) = check_alignment(&target) {
        return e.code();
    }
    let layout = ctx.flash.layout();
    if !target.is_contained_in(&layout.reusable()) {
        warn!("remote write outside reusable flash refused: {target:?}");
        return Error::InvalidAddress.code();
    }

    if !ctx.system.lock_out() {
        return Error::Timeout.code();
    }
    let written = ctx
        .flash
        .erase(target.start, target.size)
        .and_then(|()| ctx.flash.program(target.start, &io.data[..io.input_size]));
    ctx.system.unlock();
    if let Err(e) = written {
        return e.code();
    }

    // Readback: flash that lies about a write is worse than an error.
    let mut readback = [0u8; 256];
    for (i, chunk) in io.data[..io.input_size].chunks(readback.len()).enumerate() {
        let offset = target.start + (i * readback.len()) as u32;
        let readback = &mut readback[..chunk.len()];
        if ctx.flash.read(offset, readback).is_err() || readback != chunk {
            return Error::InvalidData.code();
        }
    }
    info!("remote flash write: {} bytes at {:#x}", target.size, target.start);
    0
}

// ── OTA ──────────────────────────────────────────────────────

/// Verify stage: every address constraint plus the staged-image hash,
/// with nothing modified yet. The commit stage re-runs only on a zero
/// result.
pub fn ota_verify_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) -> i32 {
    // The request bytes stay in the buffer for the commit stage.
    io.output_size = io.input_size;

    if io.input_size != OTA_REQUEST_SIZE || io.parameter != 0 {
        return Error::InvalidArg.code();
    }
    let Some(request) = OtaRequest::decode(io.input()) else {
        return Error::InvalidArg.code();
    };
    if !ctx.system.can_lock_out() {
        return Error::NotPermitted.code();
    }
    if request.copy_from.size != request.copy_to.size {
        return Error::InvalidArg.code();
    }
    if let Err(e) = check_alignment(&request.copy_from) {
        return e.code();
    }
    if let Err(e) = check_alignment(&request.copy_to) {
        return e.code();
    }

    let layout = ctx.flash.layout();
    if !request.copy_from.is_contained_in(&layout.reusable()) {
        return Error::InvalidAddress.code();
    }
    // The target may overwrite the running program, but never the staged
    // image it is being copied from, and never the settings file.
    if !request.copy_to.is_contained_in(&layout.all()) {
        return Error::InvalidAddress.code();
    }
    if request.copy_from.overlaps(&request.copy_to) {
        return Error::InvalidAddress.code();
    }
    if layout.settings_file().overlaps(&request.copy_to) {
        return Error::InvalidAddress.code();
    }

    match staged_image_hash(ctx, &request) {
        Ok(digest) => {
            if !super::crypto::constant_time_eq(&digest, &request.sha256) {
                warn!("ota: staged image hash mismatch");
                return Error::ModifiedData.code();
            }
        }
        Err(e) => return e.code(),
    }
    info!(
        "ota: verified {} bytes staged at {:#x} for {:#x}",
        request.copy_from.size, request.copy_from.start, request.copy_to.start
    );
    0
}

fn staged_image_hash(
    ctx: &mut HandlerCtx<'_>,
    request: &OtaRequest,
) -> Result<[u8; OTA_HASH_SIZE], Error> {
    let mut hash = hmac_sha256::Hash::new();
    let mut buf = [0u8; 256];
    let mut remaining = request.copy_from.size;
    let mut offset = request.copy_from.start;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u32);
        ctx.flash
            .read(offset, &mut buf[..n as usize])
            .map_err(|_| Error::Generic)?;
        hash.update(&buf[..n as usize]);
        offset += n;
        remaining -= n;
    }
    Ok(hash.finalize())
}

/// Commit stage: runs after the acknowledgment has left the device and
/// the connection is closed. Locks everything out, keeps the watchdog
/// fed per sector, copies the staged image over the target, and lets a
/// short watchdog reset the chip. Never returns on hardware.
pub fn ota_commit_handler(ctx: &mut HandlerCtx<'_>, _msg_type: u8, io: &mut HandlerIo<'_>) {
    // A failed verify stage still reaches this point (the reply has to
    // be sent either way); its result gates the destructive part.
    if io.parameter != 0 {
        return;
    }
    let Some(request) = OtaRequest::decode(&io.data[..io.input_size.min(MAX_DATA_SIZE)]) else {
        return;
    };
    if !ctx.system.lock_out() {
        return;
    }

    // The watchdog stays armed with a generous period; each sector feeds
    // it, and anything that wedges from here on ends in a reset rather
    // than a half-written image running forever.
    ctx.system.watchdog_arm(1000);

    let mut offset = 0u32;
    while offset < request.copy_to.size {
        ctx.system.watchdog_feed();
        if ctx
            .flash
            .erase(request.copy_to.start + offset, FLASH_SECTOR_SIZE)
            .is_err()
        {
            break;
        }
        offset += FLASH_SECTOR_SIZE;
    }

    let sector = FLASH_SECTOR_SIZE as usize;
    let mut offset = 0u32;
    while offset < request.copy_to.size {
        ctx.system.watchdog_feed();
        let staged = request.copy_from.start + offset;
        if ctx.flash.read(staged, &mut io.data[..sector]).is_err() {
            break;
        }
        if ctx
            .flash
            .program(request.copy_to.start + offset, &io.data[..sector])
            .is_err()
        {
            break;
        }
        offset += FLASH_SECTOR_SIZE;
    }

    ctx.system.watchdog_arm(1);
    ctx.system.reboot();
}
