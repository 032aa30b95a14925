//! The authenticated header of the encrypted channel.
//!
//! Wire format (one AES block, little-endian — explicitly, so the same
//! client tooling works against any device endianness):
//!
//! ```text
//! ┌──────────────┬─────────────────────┬──────────┬──────────────┐
//! │ data_size    │ parameter_or_result │ msg_type │ data_hash    │
//! │ u32 LE (4 B) │ i32 LE (4 B)        │ u8 (1 B) │ 7 B          │
//! └──────────────┴─────────────────────┴──────────┴──────────────┘
//! ```
//!
//! `data_hash` is the first [`DATA_HASH_SIZE`] bytes of
//! `SHA256(header[0..9] || data[0..data_size])`: integrity inside an
//! already-encrypted channel, cheap enough to verify per request.

use super::BLOCK_SIZE;

/// Truncated-hash length.
pub const DATA_HASH_SIZE: usize = 7;

/// Length of the hashed header prefix (everything before the hash).
pub const HEADER_PREFIX_SIZE: usize = 9;

/// Decoded header of an encrypted request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub data_size: u32,
    pub parameter_or_result: i32,
    pub msg_type: u8,
    pub data_hash: [u8; DATA_HASH_SIZE],
}

impl MessageHeader {
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> Self {
        let mut data_hash = [0u8; DATA_HASH_SIZE];
        data_hash.copy_from_slice(&block[HEADER_PREFIX_SIZE..]);
        Self {
            data_size: u32::from_le_bytes([block[0], block[1], block[2], block[3]]),
            parameter_or_result: i32::from_le_bytes([block[4], block[5], block[6], block[7]]),
            msg_type: block[8],
            data_hash,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&self.data_size.to_le_bytes());
        block[4..8].copy_from_slice(&self.parameter_or_result.to_le_bytes());
        block[8] = self.msg_type;
        block[HEADER_PREFIX_SIZE..].copy_from_slice(&self.data_hash);
        block
    }

    /// The bytes covered by the data hash, besides the payload.
    pub fn prefix(&self) -> [u8; HEADER_PREFIX_SIZE] {
        let block = self.encode();
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        prefix.copy_from_slice(&block[..HEADER_PREFIX_SIZE]);
        prefix
    }
}

/// The truncated integrity hash over a header prefix and its payload.
pub fn compute_data_hash(
    prefix: &[u8; HEADER_PREFIX_SIZE],
    data: &[u8],
) -> [u8; DATA_HASH_SIZE] {
    let mut hash = hmac_sha256::Hash::new();
    hash.update(prefix);
    hash.update(data);
    let digest = hash.finalize();
    let mut out = [0u8; DATA_HASH_SIZE];
    out.copy_from_slice(&digest[..DATA_HASH_SIZE]);
    out
}

impl MessageHeader {
    /// Fill in `data_hash` for this header over `data`.
    pub fn seal(&mut self, data: &[u8]) {
        self.data_hash = compute_data_hash(&self.prefix(), data);
    }

    /// Whether `data_hash` matches this header and `data`, compared in
    /// constant time.
    pub fn verify(&self, data: &[u8]) -> bool {
        let expected = compute_data_hash(&self.prefix(), data);
        super::crypto::constant_time_eq(&expected, &self.data_hash)
    }
}
