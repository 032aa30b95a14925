//! Flash adapter.
//!
//! Implements [`FlashPort`] — raw erase/program/read plus the device
//! geometry.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: real SPI flash calls via
//!   `esp_idf_svc::sys` (`esp_flash_*`).
//! - **all other targets**: [`SimFlash`], an in-memory device with
//!   erased-state semantics (`0xFF`, programming only clears bits), an
//!   operation log for asserting erase/program sequences, corruption
//!   injection, and a simulated SRAM window for the remote read handler.

use log::warn;

use crate::error::{Error, Result};
use crate::flash::range::FlashLayout;
use crate::flash::{FLASH_ERASED_BYTE, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};
use crate::ports::FlashPort;

// ───────────────────────────────────────────────────────────────
// Host simulation
// ───────────────────────────────────────────────────────────────

/// Simulated flash capacity (4 MB).
pub const SIM_FLASH_CAPACITY: u32 = 4 * 1024 * 1024;

/// Simulated program image size.
pub const SIM_PROGRAM_SIZE: u32 = 0x40000;

/// Bus address of the simulated memory-mapped flash window.
pub const SIM_LOGICAL_BASE: u32 = 0x1000_0000;

/// Simulated SRAM window.
pub const SIM_SRAM_BASE: u32 = 0x2000_0000;
const SIM_SRAM_SIZE: u32 = 0x40000;

/// One recorded flash mutation, for test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase { offset: u32, size: u32 },
    Program { offset: u32, len: u32 },
}

/// In-memory flash simulation.
pub struct SimFlash {
    storage: Vec<u8>,
    sram: Vec<u8>,
    layout: FlashLayout,
    ops: Vec<FlashOp>,
    corrupt_next_program: bool,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            storage: vec![FLASH_ERASED_BYTE; SIM_FLASH_CAPACITY as usize],
            sram: vec![0; SIM_SRAM_SIZE as usize],
            layout: FlashLayout {
                capacity: SIM_FLASH_CAPACITY,
                program_size: SIM_PROGRAM_SIZE,
                logical_base: SIM_LOGICAL_BASE,
            },
            ops: Vec::new(),
            corrupt_next_program: false,
        }
    }

    /// Flash contents for test verification.
    pub fn contents(&self, offset: u32, len: usize) -> &[u8] {
        &self.storage[offset as usize..offset as usize + len]
    }

    /// Overwrite flash directly, bypassing erase semantics. Used by tests
    /// to seed a settings file without going through an update cycle.
    pub fn seed(&mut self, offset: u32, data: &[u8]) {
        self.storage[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    /// Seed the settings sector: `text` followed by erased bytes.
    pub fn seed_settings(&mut self, text: &[u8]) {
        let region = self.layout.settings_file();
        assert!(text.len() <= region.size as usize);
        let start = region.start as usize;
        self.storage[start..start + region.size as usize].fill(FLASH_ERASED_BYTE);
        self.storage[start..start + text.len()].copy_from_slice(text);
    }

    /// Write into the simulated SRAM window.
    pub fn seed_sram(&mut self, address: u32, data: &[u8]) {
        let at = (address - SIM_SRAM_BASE) as usize;
        self.sram[at..at + data.len()].copy_from_slice(data);
    }

    /// Recorded erase/program operations, oldest first.
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Drop the recorded operation history.
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Flip one bit in the next programmed page, simulating a write that
    /// did not stick. The following verify pass must catch it.
    pub fn corrupt_next_program(&mut self) {
        self.corrupt_next_program = true;
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        if (offset as usize).checked_add(len).is_none()
            || offset as usize + len > self.storage.len()
        {
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashPort for SimFlash {
    fn layout(&self) -> FlashLayout {
        self.layout
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.storage[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, size: u32) -> Result<()> {
        if offset % FLASH_SECTOR_SIZE != 0 || size % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::BadAlignment);
        }
        self.check_range(offset, size as usize)?;
        self.storage[offset as usize..(offset + size) as usize].fill(FLASH_ERASED_BYTE);
        self.ops.push(FlashOp::Erase { offset, size });
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if offset % FLASH_PAGE_SIZE != 0 || data.len() % FLASH_PAGE_SIZE as usize != 0 {
            return Err(Error::BadAlignment);
        }
        self.check_range(offset, data.len())?;
        // NOR semantics: programming can only clear bits.
        for (i, &b) in data.iter().enumerate() {
            self.storage[offset as usize + i] &= b;
        }
        if self.corrupt_next_program {
            self.corrupt_next_program = false;
            self.storage[offset as usize] ^= 0x01;
            warn!("sim flash: injected single-bit corruption at {offset:#x}");
        }
        self.ops.push(FlashOp::Program {
            offset,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn sram_window(&self) -> (u32, u32) {
        (SIM_SRAM_BASE, SIM_SRAM_BASE + SIM_SRAM_SIZE)
    }

    fn read_sram(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let (base, end) = self.sram_window();
        let read_end = address
            .checked_add(buf.len() as u32)
            .ok_or(Error::InvalidAddress)?;
        if address < base || read_end > end {
            return Err(Error::InvalidAddress);
        }
        let at = (address - base) as usize;
        buf.copy_from_slice(&self.sram[at..at + buf.len()]);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF
// ───────────────────────────────────────────────────────────────

/// Bus address of the memory-mapped flash window.
#[cfg(target_os = "espidf")]
const ESP_LOGICAL_BASE: u32 = 0x3C00_0000;

/// Internal data SRAM window.
#[cfg(target_os = "espidf")]
const ESP_SRAM_BASE: u32 = 0x3FC8_8000;
#[cfg(target_os = "espidf")]
const ESP_SRAM_END: u32 = 0x3FD0_0000;

#[cfg(target_os = "espidf")]
pub struct EspFlash {
    layout: FlashLayout,
}

#[cfg(target_os = "espidf")]
impl EspFlash {
    pub fn new() -> Result<Self> {
        use esp_idf_svc::sys::*;

        let mut capacity: u32 = 0;
        // SAFETY: esp_flash_get_size reads the default chip descriptor,
        // initialised by the IDF startup code before user code runs.
        let ret = unsafe { esp_flash_get_size(esp_flash_default_chip, &mut capacity) };
        if ret != ESP_OK {
            return Err(Error::Generic);
        }

        // The running partition's end bounds the "program" region; the
        // bootloader and partition table live below it and are covered
        // by the same region.
        let running = unsafe { esp_ota_get_running_partition() };
        if running.is_null() {
            return Err(Error::Generic);
        }
        let program_size = unsafe { (*running).address + (*running).size };

        Ok(Self {
            layout: FlashLayout {
                capacity,
                program_size,
                logical_base: ESP_LOGICAL_BASE,
            },
        })
    }
}

#[cfg(target_os = "espidf")]
impl FlashPort for EspFlash {
    fn layout(&self) -> FlashLayout {
        self.layout
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        use esp_idf_svc::sys::*;
        // SAFETY: buf is valid for buf.len() bytes and exclusively owned.
        let ret = unsafe {
            esp_flash_read(
                esp_flash_default_chip,
                buf.as_mut_ptr().cast(),
                offset,
                buf.len() as u32,
            )
        };
        if ret != ESP_OK {
            return Err(Error::Generic);
        }
        Ok(())
    }

    fn erase(&mut self, offset: u32, size: u32) -> Result<()> {
        use esp_idf_svc::sys::*;
        if offset % FLASH_SECTOR_SIZE != 0 || size % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::BadAlignment);
        }
        let ret = unsafe { esp_flash_erase_region(esp_flash_default_chip, offset, size) };
        if ret != ESP_OK {
            return Err(Error::Generic);
        }
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        use esp_idf_svc::sys::*;
        if offset % FLASH_PAGE_SIZE != 0 || data.len() % FLASH_PAGE_SIZE as usize != 0 {
            return Err(Error::BadAlignment);
        }
        // SAFETY: data is valid for data.len() bytes for the duration.
        let ret = unsafe {
            esp_flash_write(
                esp_flash_default_chip,
                data.as_ptr().cast(),
                offset,
                data.len() as u32,
            )
        };
        if ret != ESP_OK {
            return Err(Error::Generic);
        }
        Ok(())
    }

    fn sram_window(&self) -> (u32, u32) {
        (ESP_SRAM_BASE, ESP_SRAM_END)
    }

    fn read_sram(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let (base, end) = self.sram_window();
        let read_end = address
            .checked_add(buf.len() as u32)
            .ok_or(Error::InvalidAddress)?;
        if address < base || read_end > end {
            return Err(Error::InvalidAddress);
        }
        // SAFETY: the window check above restricts the source to mapped
        // internal SRAM; buf is valid and exclusively owned.
        unsafe {
            core::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}
