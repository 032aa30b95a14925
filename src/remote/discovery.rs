//! UDP discovery responder.
//!
//! Listens on the service port for identity queries so host tooling can
//! find boards on the local network without knowing their addresses.
//!
//! Request: `"PWS?"` followed by up to 16 ASCII hex characters and a NUL
//! terminator — a prefix (or any substring) of the queried board id, or
//! nothing to match every board. Reply: `"PWS:"` plus the full 16-char
//! board id. Malformed or non-matching packets get no reply at all, so
//! a scan of the subnet stays quiet.

use crate::adapters::device_id::BOARD_ID_SIZE;

/// Query magic.
pub const REQUEST_MAGIC: &[u8; 4] = b"PWS?";

/// Reply magic.
pub const REPLY_MAGIC: &[u8; 4] = b"PWS:";

/// Packet size: magic, board-id hex, NUL.
pub const PACKET_SIZE: usize = 4 + BOARD_ID_SIZE * 2 + 1;

/// Handle one datagram. Returns the reply packet when the query matches
/// this board, `None` otherwise.
pub fn handle_packet(board_id_hex: &str, packet: &[u8]) -> Option<[u8; PACKET_SIZE]> {
    // Short packets are padded with zeros, long ones truncated; the
    // query is whatever fits the fixed window.
    let mut window = [0u8; PACKET_SIZE];
    let n = packet.len().min(PACKET_SIZE);
    window[..n].copy_from_slice(&packet[..n]);

    if &window[..4] != REQUEST_MAGIC {
        return None;
    }

    let query = &window[4..4 + BOARD_ID_SIZE * 2];
    let query_len = query.iter().position(|&b| b == 0).unwrap_or(query.len());
    let query = core::str::from_utf8(&query[..query_len]).ok()?;
    if !board_id_hex.contains(query) {
        return None;
    }

    let mut reply = [0u8; PACKET_SIZE];
    reply[..4].copy_from_slice(REPLY_MAGIC);
    reply[4..4 + BOARD_ID_SIZE * 2].copy_from_slice(board_id_hex.as_bytes());
    Some(reply)
}
