//! Atomic replacement of the settings file in flash.
//!
//! The sequence is erase → program page-by-page → verify by readback.
//! From the CPU's point of view the file contents change once, when the
//! final page lands and verification passes; a reader that raced the
//! update sees either the old file or the new one.

use log::{info, warn};

use crate::error::{Error, Result};
use crate::ports::{FlashPort, SystemPort};

use super::{FLASH_ERASED_BYTE, FLASH_PAGE_SIZE, SETTINGS_FILE_SIZE};

/// Replace the settings file, quiescing other execution contexts for the
/// duration of the erase/program sequence.
pub fn update_settings_file(
    flash: &mut dyn FlashPort,
    system: &mut dyn SystemPort,
    file: &[u8],
) -> Result<()> {
    // Size check happens before the lock-out so an oversized file cannot
    // cost an erase cycle.
    if file.len() > SETTINGS_FILE_SIZE {
        return Err(Error::InvalidArg);
    }
    if !system.lock_out() {
        warn!("settings update: lock-out failed, flash untouched");
        return Err(Error::Timeout);
    }
    let result = update_settings_file_unsafe(flash, file);
    system.unlock();
    result
}

/// Replace the settings file without the lock-out scope. Only valid when
/// every other execution context is already stopped (the reboot path).
pub fn update_settings_file_unsafe(flash: &mut dyn FlashPort, file: &[u8]) -> Result<()> {
    let region = flash.layout().settings_file();
    if file.len() > region.size as usize {
        return Err(Error::InvalidArg);
    }

    flash.erase(region.start, region.size)?;

    let page = FLASH_PAGE_SIZE as usize;
    let mut offset = 0usize;
    while offset < file.len() {
        let remaining = &file[offset..];
        if remaining.len() >= page {
            flash.program(region.start + offset as u32, &remaining[..page])?;
        } else {
            // The final short page is padded with the erased-byte value
            // so the byte after the file reads as a terminator.
            let mut page_copy = [FLASH_ERASED_BYTE; FLASH_PAGE_SIZE as usize];
            page_copy[..remaining.len()].copy_from_slice(remaining);
            flash.program(region.start + offset as u32, &page_copy)?;
        }
        offset += page;
    }

    if !verify(flash, region.start, file)? {
        warn!("settings update: verify mismatch after program");
        return Err(Error::InvalidData);
    }
    if file.len() < region.size as usize {
        // The byte after the file must be the terminator, or lookups
        // would run on into stale data.
        if !verify(flash, region.start + file.len() as u32, &[FLASH_ERASED_BYTE])? {
            warn!("settings update: missing file terminator");
            return Err(Error::InvalidData);
        }
    }

    info!("settings update: wrote {} bytes", file.len());
    Ok(())
}

/// Compare a flash region against `expected`, reading back in page-sized
/// chunks to keep the stack bounded.
fn verify(flash: &dyn FlashPort, start: u32, expected: &[u8]) -> Result<bool> {
    let mut readback = [0u8; FLASH_PAGE_SIZE as usize];
    for (i, chunk) in expected.chunks(FLASH_PAGE_SIZE as usize).enumerate() {
        let offset = start + (i * FLASH_PAGE_SIZE as usize) as u32;
        let readback = &mut readback[..chunk.len()];
        flash.read(offset, readback)?;
        if readback != chunk {
            return Ok(false);
        }
    }
    Ok(true)
}
