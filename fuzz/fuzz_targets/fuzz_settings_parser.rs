//! Fuzz the settings file parser: arbitrary file bytes, arbitrary key,
//! arbitrary (small) output buffer. The parser must never panic and
//! must never report more bytes than the buffer holds.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wifi_settings::flash::storage::{find_next_key, get_value_for_key_within_file};

fuzz_target!(|input: &[u8]| {
    if input.len() < 2 {
        return;
    }
    let (meta, file) = input.split_at(2);
    let key_len = (meta[0] as usize).min(file.len());
    let cap = meta[1] as usize;

    let (key_bytes, file) = file.split_at(key_len);
    if let Ok(key) = core::str::from_utf8(key_bytes) {
        let mut buf = vec![0u8; cap];
        if let Some(n) = get_value_for_key_within_file(file, key, &mut buf) {
            assert!(n <= cap);
        }
    }

    // Enumeration must terminate and stay in bounds.
    let mut cursor = 0;
    let mut steps = 0;
    while let Some(span) = find_next_key(file, cursor) {
        assert!(span.key_start < span.value_start);
        assert!(span.value_start <= span.end);
        assert!(span.end <= file.len());
        cursor = span.end;
        steps += 1;
        assert!(steps <= file.len() + 1);
    }
});
