//! Authenticated remote-control service.
//!
//! A TCP service (port 1404) offering challenge-response mutual
//! authentication from a pre-shared secret, then an AES-256-CBC
//! encrypted, SHA-256 integrity-checked command channel, plus a UDP
//! discovery responder on the same port.
//!
//! Module split:
//! - [`crypto`] — secret stretching, HMAC challenge binding, CBC state
//! - [`header`] — the 16-byte authenticated message header
//! - [`registry`] — the table of one-shot / two-stage handlers
//! - [`handlers`] — built-in handlers (info, settings update, reboot)
//! - [`memory_access`] — flash read/write and OTA handlers (feature)
//! - [`session`] — the per-connection state machine
//! - [`discovery`] — the UDP identity responder
//! - [`service`] — sockets, accept policy, event pump

pub mod crypto;
pub mod discovery;
pub mod handlers;
pub mod header;
#[cfg(feature = "memory-access")]
pub mod memory_access;
pub mod registry;
pub mod service;
pub mod session;

/// Wire protocol version carried in the greeting.
pub const PROTOCOL_VERSION: u8 = 1;

/// TCP and UDP port of the service.
pub const REMOTE_PORT: u16 = 1404;

/// Every wire unit is one AES block.
pub const BLOCK_SIZE: usize = 16;

/// Upper bound on a request or reply payload.
pub const MAX_DATA_SIZE: usize = 4096;

/// Challenge and truncated-HMAC length (block size minus the id byte).
pub const CHALLENGE_SIZE: usize = 15;

// ── Message ids ──────────────────────────────────────────────
// Handshake (cleartext), server→client unless noted.

/// First block of a connection.
pub const ID_GREETING: u8 = 70;
/// Client→server: client challenge.
pub const ID_REQUEST: u8 = 71;
/// Server challenge.
pub const ID_CHALLENGE: u8 = 72;
/// Client→server: client authentication proof.
pub const ID_AUTHENTICATION: u8 = 73;
/// Server authentication proof.
pub const ID_RESPONSE: u8 = 74;
/// Client→server: handshake complete, switch to the encrypted channel.
pub const ID_ACKNOWLEDGE: u8 = 75;

/// Successful encrypted reply.
pub const ID_OK: u8 = 76;
/// Authentication proof mismatch.
pub const ID_AUTH_ERROR: u8 = 77;
/// Protocol version mismatch.
pub const ID_VERSION_ERROR: u8 = 78;
/// Unexpected message id for the current state.
pub const ID_BAD_MSG_ERROR: u8 = 79;
/// Request parameters out of range.
pub const ID_BAD_PARAM_ERROR: u8 = 80;
/// No handler registered for the message type.
pub const ID_BAD_HANDLER_ERROR: u8 = 81;
/// The device has no `update_secret` configured.
pub const ID_NO_SECRET_ERROR: u8 = 82;
/// Integrity hash mismatch on the encrypted channel.
pub const ID_CORRUPT_ERROR: u8 = 83;
/// Anything else.
pub const ID_UNKNOWN_ERROR: u8 = 84;

// ── Handler ids ──────────────────────────────────────────────

/// First id routed through the handler table.
pub const ID_FIRST_HANDLER: u8 = 120;
/// Built-in: device / flash-layout information.
pub const ID_INFO_HANDLER: u8 = 120;
/// Built-in: atomic settings file replacement.
pub const ID_UPDATE_HANDLER: u8 = 121;
/// Built-in: arbitrary flash/RAM read (memory-access builds).
pub const ID_READ_HANDLER: u8 = 122;
/// Built-in: settings replacement followed by a reboot.
pub const ID_UPDATE_REBOOT_HANDLER: u8 = 124;
/// Built-in: sector-aligned flash write (memory-access builds).
pub const ID_WRITE_FLASH_HANDLER: u8 = 125;
/// Built-in: staged over-the-air firmware update (memory-access builds).
pub const ID_OTA_FIRMWARE_UPDATE_HANDLER: u8 = 127;
/// First id available to the embedding application.
pub const ID_FIRST_USER_HANDLER: u8 = 128;
/// Last id available to the embedding application.
pub const ID_LAST_USER_HANDLER: u8 = 143;

/// Size of the handler table.
pub const NUM_HANDLERS: usize = (ID_LAST_USER_HANDLER - ID_FIRST_HANDLER + 1) as usize;
