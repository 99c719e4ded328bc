// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The base32 variant used for store path digests and hash rendering.
//!
//! The alphabet omits `E O U T` to avoid accidental words, and digits are
//! emitted in reverse bit order relative to RFC 4648.

// omitted: E O U T
pub const BASE32_CHARS: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// 256-entry lookup table: `true` for bytes in the base32 alphabet.
pub const BASE32_VALID: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0;
    while i < BASE32_CHARS.len() {
        table[BASE32_CHARS[i] as usize] = true;
        i += 1;
    }
    table
};

/// Encoded length for `len` input bytes.
pub const fn encode_len(len: usize) -> usize {
    if len == 0 { 0 } else { (len * 8 - 1) / 5 + 1 }
}

/// Encode bytes to the store base32 representation.
pub fn encode(bytes: &[u8]) -> String {
    let len = encode_len(bytes.len());

    let chars = (0..len).rev().map(|n| {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        // bits from the lower byte
        let v1 = if i < bytes.len() {
            bytes[i].checked_shr(j as u32).unwrap_or(0)
        } else {
            0
        };
        // bits from the upper byte
        let v2 = if i + 1 < bytes.len() {
            bytes[i + 1].checked_shl((8 - j) as u32).unwrap_or(0)
        } else {
            0
        };
        BASE32_CHARS[((v1 | v2) & 0x1f) as usize] as char
    });

    chars.collect()
}

/// Decode a store base32 string back to bytes.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, String> {
    let output_len = (input.len() * 5) / 8;
    let mut output = vec![0u8; output_len];

    for (i, &c) in input.iter().rev().enumerate() {
        let digit = BASE32_CHARS
            .iter()
            .position(|&b| b == c)
            .ok_or_else(|| format!("invalid base32 character: {}", c as char))?;

        let b = i * 5;
        let i = b / 8;
        let j = b % 8;

        if i < output_len {
            output[i] |= (digit as u8) << j;

            if i + 1 < output_len && j > 3 {
                output[i + 1] |= (digit as u8) >> (8 - j);
            }
        }
    }

    Ok(output)
}
