//! Flash geometry, the settings file, and atomic replacement.
//!
//! The settings file is a single flash sector of UTF-8 `key=value` lines,
//! always placed in the last sector of the device. Reads go straight
//! through [`crate::ports::FlashPort`]; writes replace the whole sector
//! (erase, page-program, verify) under the platform lock-out scope.

pub mod editor;
pub mod range;
pub mod storage;
pub mod update;

/// Erase granularity in bytes.
pub const FLASH_SECTOR_SIZE: u32 = 4096;

/// Program granularity in bytes.
pub const FLASH_PAGE_SIZE: u32 = 256;

/// Size of the settings file region (one erase sector).
pub const SETTINGS_FILE_SIZE: usize = FLASH_SECTOR_SIZE as usize;

/// The byte value of erased flash, which doubles as the file terminator.
pub const FLASH_ERASED_BYTE: u8 = 0xFF;
