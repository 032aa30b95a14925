//! Crypto core of the remote service.
//!
//! Stateless helpers plus two small stateful pieces:
//!
//! - **Secret stretching** — `update_secret` is iterated through 4096
//!   rounds of SHA-256 into a fixed 32-byte key, so a captured flash
//!   image does not hand out the raw secret and brute force pays the
//!   stretch per guess.
//! - **Challenge binding** — HMAC-SHA-256 keyed by the stretched secret
//!   over `client_challenge || server_challenge || tag`, where the
//!   two-byte ASCII tag separates the four derived values (client proof,
//!   server proof, and the two direction keys).
//! - **Block crypto** — AES-256-CBC with a zero initial IV; the IV
//!   chains across blocks *within one direction for the whole session*,
//!   which is why this is an explicit IV-carrying state rather than a
//!   one-shot CBC API.
//!
//! Hashing and HMAC come from the `hmac-sha256` crate — pure Rust,
//! constant-time verification, identical on ESP-IDF and host targets.
//! The block cipher is the RustCrypto `aes` crate.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::flash::storage::{SettingsSource, MAX_SECRET_SIZE};

use super::{BLOCK_SIZE, CHALLENGE_SIZE};

/// AES-256 key length.
pub const AES_KEY_SIZE: usize = 32;

/// SHA-256 digest length.
pub const HMAC_DIGEST_SIZE: usize = 32;

/// Rounds of SHA-256 applied to the raw secret.
pub const SECRET_STRETCH_ROUNDS: usize = 4096;

// ── Secret state ─────────────────────────────────────────────

/// The stretched `update_secret`, refreshed at service start and after
/// every settings update.
#[derive(Clone)]
pub struct SecretState {
    hashed: [u8; HMAC_DIGEST_SIZE],
    valid: bool,
}

impl SecretState {
    /// No secret: authentication disabled until `refresh` finds one.
    pub fn empty() -> Self {
        Self {
            hashed: [0; HMAC_DIGEST_SIZE],
            valid: false,
        }
    }

    /// Re-read `update_secret` and stretch it. An absent or empty value
    /// invalidates the state (the service then answers every client
    /// with `NO_SECRET_ERROR`).
    pub fn refresh(&mut self, settings: &dyn SettingsSource) {
        self.hashed = [0; HMAC_DIGEST_SIZE];
        self.valid = false;

        let mut secret = [0u8; MAX_SECRET_SIZE];
        let Some(secret_size) = settings.lookup("update_secret", &mut secret) else {
            return;
        };
        if secret_size == 0 {
            return;
        }

        self.hashed = stretch_secret(&secret[..secret_size]);
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The stretched key. All zeros while invalid.
    pub fn hashed_key(&self) -> &[u8; HMAC_DIGEST_SIZE] {
        &self.hashed
    }
}

/// 4096 rounds of `digest = SHA256(digest || secret)` from a zeroed
/// starting digest.
pub fn stretch_secret(secret: &[u8]) -> [u8; HMAC_DIGEST_SIZE] {
    let mut digest = [0u8; HMAC_DIGEST_SIZE];
    for _ in 0..SECRET_STRETCH_ROUNDS {
        let mut hash = hmac_sha256::Hash::new();
        hash.update(&digest);
        hash.update(secret);
        digest = hash.finalize();
    }
    digest
}

// ── Challenge binding ────────────────────────────────────────

/// HMAC-SHA-256 over both challenges and a two-byte context tag,
/// truncated to `out.len()`. Tags in use: `CA`/`SA` (authentication
/// proofs, 15 bytes) and `CK`/`SK` (direction keys, 32 bytes).
pub fn generate_auth(
    hashed_key: &[u8; HMAC_DIGEST_SIZE],
    client_challenge: &[u8; CHALLENGE_SIZE],
    server_challenge: &[u8; CHALLENGE_SIZE],
    tag: &[u8; 2],
    out: &mut [u8],
) {
    debug_assert!(out.len() <= HMAC_DIGEST_SIZE);
    let mut hmac = hmac_sha256::HMAC::new(hashed_key);
    hmac.update(client_challenge);
    hmac.update(server_challenge);
    hmac.update(tag);
    let digest = hmac.finalize();
    out.copy_from_slice(&digest[..out.len()]);
}

/// Constant-time equality for truncated MACs and hashes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

// ── Block crypto ─────────────────────────────────────────────

/// One direction of the encrypted channel: an AES-256 key schedule plus
/// the running CBC IV.
pub struct CbcState {
    cipher: Aes256,
    iv: [u8; BLOCK_SIZE],
}

impl CbcState {
    /// A fresh direction state with a zero IV.
    pub fn new(key: &[u8; AES_KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            iv: [0; BLOCK_SIZE],
        }
    }

    /// Encrypt one block, advancing the IV chain.
    pub fn encrypt_block(&mut self, plaintext: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_SIZE {
            block[i] = plaintext[i] ^ self.iv[i];
        }
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut block));
        self.iv = block;
        block
    }

    /// Decrypt one block, advancing the IV chain.
    pub fn decrypt_block(&mut self, ciphertext: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = *ciphertext;
        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(&mut block));
        for i in 0..BLOCK_SIZE {
            block[i] ^= self.iv[i];
        }
        self.iv = *ciphertext;
        block
    }
}

// ── Randomness ───────────────────────────────────────────────

/// Fill `out` with random bytes from the hardware RNG.
#[cfg(target_os = "espidf")]
pub fn fill_random(out: &mut [u8]) {
    // SAFETY: esp_fill_random writes exactly out.len() bytes into the
    // exclusively-owned buffer.
    unsafe {
        esp_idf_svc::sys::esp_fill_random(out.as_mut_ptr().cast(), out.len());
    }
}

/// Simulation stub — `RandomState`-derived entropy, not cryptographic,
/// but unpredictable enough for loopback testing.
#[cfg(not(target_os = "espidf"))]
pub fn fill_random(out: &mut [u8]) {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    for chunk in out.chunks_mut(8) {
        let value = RandomState::new().build_hasher().finish().to_le_bytes();
        chunk.copy_from_slice(&value[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSettings(HashMap<String, Vec<u8>>);

    impl SettingsSource for MapSettings {
        fn lookup(&self, key: &str, out: &mut [u8]) -> Option<usize> {
            let value = self.0.get(key)?;
            let n = value.len().min(out.len());
            out[..n].copy_from_slice(&value[..n]);
            Some(n)
        }
    }

    fn settings_with_secret(secret: &[u8]) -> MapSettings {
        let mut map = HashMap::new();
        map.insert("update_secret".to_string(), secret.to_vec());
        MapSettings(map)
    }

    #[test]
    fn stretch_is_deterministic_and_secret_dependent() {
        let a = stretch_secret(b"secret-one");
        let b = stretch_secret(b"secret-one");
        let c = stretch_secret(b"secret-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, [0u8; HMAC_DIGEST_SIZE]);
    }

    #[test]
    fn refresh_tracks_the_settings_file() {
        let mut state = SecretState::empty();
        assert!(!state.is_valid());

        state.refresh(&settings_with_secret(b"hunter2"));
        assert!(state.is_valid());
        assert_eq!(state.hashed_key(), &stretch_secret(b"hunter2"));

        state.refresh(&settings_with_secret(b""));
        assert!(!state.is_valid());
        assert_eq!(state.hashed_key(), &[0u8; HMAC_DIGEST_SIZE]);

        state.refresh(&MapSettings(HashMap::new()));
        assert!(!state.is_valid());
    }

    #[test]
    fn auth_tags_separate_the_derived_values() {
        let key = stretch_secret(b"shared");
        let client = [1u8; CHALLENGE_SIZE];
        let server = [2u8; CHALLENGE_SIZE];

        let mut ca = [0u8; CHALLENGE_SIZE];
        let mut sa = [0u8; CHALLENGE_SIZE];
        generate_auth(&key, &client, &server, b"CA", &mut ca);
        generate_auth(&key, &client, &server, b"SA", &mut sa);
        assert_ne!(ca, sa);

        let mut ck = [0u8; AES_KEY_SIZE];
        let mut sk = [0u8; AES_KEY_SIZE];
        generate_auth(&key, &client, &server, b"CK", &mut ck);
        generate_auth(&key, &client, &server, b"SK", &mut sk);
        assert_ne!(ck, sk);
    }

    #[test]
    fn auth_matches_plain_hmac_over_the_concatenation() {
        let key = stretch_secret(b"shared");
        let client = [3u8; CHALLENGE_SIZE];
        let server = [4u8; CHALLENGE_SIZE];

        let mut message = Vec::new();
        message.extend_from_slice(&client);
        message.extend_from_slice(&server);
        message.extend_from_slice(b"CA");
        let expected = hmac_sha256::HMAC::mac(&message, &key);

        let mut out = [0u8; CHALLENGE_SIZE];
        generate_auth(&key, &client, &server, b"CA", &mut out);
        assert_eq!(out, expected[..CHALLENGE_SIZE]);
    }

    #[test]
    fn cbc_round_trip_with_chained_iv() {
        let key = [7u8; AES_KEY_SIZE];
        let mut enc = CbcState::new(&key);
        let mut dec = CbcState::new(&key);

        let blocks = [[0x11u8; BLOCK_SIZE], [0x22; BLOCK_SIZE], [0x33; BLOCK_SIZE]];
        let mut ciphertexts = Vec::new();
        for b in &blocks {
            ciphertexts.push(enc.encrypt_block(b));
        }
        // Chaining: identical plaintext blocks yield distinct ciphertext.
        assert_ne!(ciphertexts[0], ciphertexts[1]);
        for (c, b) in ciphertexts.iter().zip(&blocks) {
            assert_eq!(&dec.decrypt_block(c), b);
        }
    }

    #[test]
    fn cbc_decrypt_desynchronises_on_loss() {
        let key = [9u8; AES_KEY_SIZE];
        let mut enc = CbcState::new(&key);
        let mut dec = CbcState::new(&key);

        let first = enc.encrypt_block(&[0xAAu8; BLOCK_SIZE]);
        let second = enc.encrypt_block(&[0xBBu8; BLOCK_SIZE]);
        let _ = first; // dropped block
        assert_ne!(dec.decrypt_block(&second), [0xBBu8; BLOCK_SIZE]);
    }

    #[test]
    fn constant_time_eq_behaviour() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn fill_random_varies() {
        let mut a = [0u8; CHALLENGE_SIZE];
        let mut b = [0u8; CHALLENGE_SIZE];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }
}
