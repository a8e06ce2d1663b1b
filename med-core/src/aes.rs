//! AES-128 in ECB mode, as MED applies it to header regions, metadata
//! sections, records, and (optionally) block payloads.
//!
//! The format encrypts in place with no padding: a buffer whose length is
//! not a multiple of 16 gets its trailing partial block handled by a
//! shifted window — the final 16 bytes of the buffer are ciphered as one
//! block after the whole blocks, overlapping the tail of the last whole
//! block. Decryption inverts the two steps in reverse order, so any
//! length ≥ 16 round-trips exactly. Buffers shorter than one block are
//! left unciphered.
//!
//! Keys are 176-byte expanded schedules; see [`crate::password`] for the
//! password-to-key derivation.

use once_cell::sync::Lazy;

pub const BLOCK_BYTES: usize = 16;
pub const KEY_BYTES: usize = 16;
pub const EXPANDED_KEY_BYTES: usize = 176; // (rounds + 1) * 16

const ROUNDS: usize = 10;

#[rustfmt::skip]
const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

// Inverse S-box, derived rather than transcribed.
static RSBOX: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut inv = [0u8; 256];
    for (i, &v) in SBOX.iter().enumerate() {
        inv[v as usize] = i as u8;
    }
    inv
});

// Round constants for key expansion.
static RCON: Lazy<[u8; 11]> = Lazy::new(|| {
    let mut rcon = [0u8; 11];
    let mut v = 1u8;
    for entry in rcon.iter_mut().skip(1) {
        *entry = v;
        v = xtime(v);
    }
    rcon
});

#[inline]
fn xtime(x: u8) -> u8 {
    (x << 1) ^ (((x >> 7) & 1) * 0x1b)
}

// Multiplication in GF(2^8) modulo the AES polynomial.
#[inline]
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            p ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    p
}

/// Expand a 16-byte key into the 176-byte round-key schedule.
pub fn expand_key(key: &[u8; KEY_BYTES]) -> [u8; EXPANDED_KEY_BYTES] {
    let mut w = [0u8; EXPANDED_KEY_BYTES];
    w[..KEY_BYTES].copy_from_slice(key);
    for i in 4..44 {
        let mut temp = [
            w[4 * (i - 1)],
            w[4 * (i - 1) + 1],
            w[4 * (i - 1) + 2],
            w[4 * (i - 1) + 3],
        ];
        if i % 4 == 0 {
            temp.rotate_left(1);
            for b in temp.iter_mut() {
                *b = SBOX[*b as usize];
            }
            temp[0] ^= RCON[i / 4];
        }
        for j in 0..4 {
            w[4 * i + j] = w[4 * (i - 4) + j] ^ temp[j];
        }
    }
    w
}

fn add_round_key(state: &mut [u8; 16], round_key: &[u8]) {
    for (s, k) in state.iter_mut().zip(round_key) {
        *s ^= k;
    }
}

fn shift_rows(state: &mut [u8; 16]) {
    // Row r (bytes r, r+4, r+8, r+12) rotates left by r.
    let s = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[r + 4 * c] = s[r + 4 * ((c + r) % 4)];
        }
    }
}

fn inv_shift_rows(state: &mut [u8; 16]) {
    let s = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[r + 4 * ((c + r) % 4)] = s[r + 4 * c];
        }
    }
}

fn mix_columns(state: &mut [u8; 16]) {
    for c in 0..4 {
        let col: [u8; 4] = state[4 * c..4 * c + 4].try_into().unwrap();
        state[4 * c] = gmul(col[0], 2) ^ gmul(col[1], 3) ^ col[2] ^ col[3];
        state[4 * c + 1] = col[0] ^ gmul(col[1], 2) ^ gmul(col[2], 3) ^ col[3];
        state[4 * c + 2] = col[0] ^ col[1] ^ gmul(col[2], 2) ^ gmul(col[3], 3);
        state[4 * c + 3] = gmul(col[0], 3) ^ col[1] ^ col[2] ^ gmul(col[3], 2);
    }
}

fn inv_mix_columns(state: &mut [u8; 16]) {
    for c in 0..4 {
        let col: [u8; 4] = state[4 * c..4 * c + 4].try_into().unwrap();
        state[4 * c] =
            gmul(col[0], 14) ^ gmul(col[1], 11) ^ gmul(col[2], 13) ^ gmul(col[3], 9);
        state[4 * c + 1] =
            gmul(col[0], 9) ^ gmul(col[1], 14) ^ gmul(col[2], 11) ^ gmul(col[3], 13);
        state[4 * c + 2] =
            gmul(col[0], 13) ^ gmul(col[1], 9) ^ gmul(col[2], 14) ^ gmul(col[3], 11);
        state[4 * c + 3] =
            gmul(col[0], 11) ^ gmul(col[1], 13) ^ gmul(col[2], 9) ^ gmul(col[3], 14);
    }
}

/// Encrypt one 16-byte block in place.
pub fn encrypt_block(block: &mut [u8; 16], expanded_key: &[u8; EXPANDED_KEY_BYTES]) {
    add_round_key(block, &expanded_key[..16]);
    for round in 1..ROUNDS {
        for b in block.iter_mut() {
            *b = SBOX[*b as usize];
        }
        shift_rows(block);
        mix_columns(block);
        add_round_key(block, &expanded_key[16 * round..16 * (round + 1)]);
    }
    for b in block.iter_mut() {
        *b = SBOX[*b as usize];
    }
    shift_rows(block);
    add_round_key(block, &expanded_key[16 * ROUNDS..]);
}

/// Decrypt one 16-byte block in place.
pub fn decrypt_block(block: &mut [u8; 16], expanded_key: &[u8; EXPANDED_KEY_BYTES]) {
    add_round_key(block, &expanded_key[16 * ROUNDS..]);
    for round in (1..ROUNDS).rev() {
        inv_shift_rows(block);
        for b in block.iter_mut() {
            *b = RSBOX[*b as usize];
        }
        add_round_key(block, &expanded_key[16 * round..16 * (round + 1)]);
        inv_mix_columns(block);
    }
    inv_shift_rows(block);
    for b in block.iter_mut() {
        *b = RSBOX[*b as usize];
    }
    add_round_key(block, &expanded_key[..16]);
}

/// Encrypt a buffer in place. Whole blocks first, then the shifted tail
/// window when the length is not a multiple of 16.
pub fn encrypt(data: &mut [u8], expanded_key: &[u8; EXPANDED_KEY_BYTES]) {
    let len = data.len();
    if len < BLOCK_BYTES {
        return;
    }
    let whole = len / BLOCK_BYTES;
    for i in 0..whole {
        let block: &mut [u8; 16] = (&mut data[16 * i..16 * (i + 1)]).try_into().unwrap();
        encrypt_block(block, expanded_key);
    }
    if len % BLOCK_BYTES != 0 {
        let block: &mut [u8; 16] = (&mut data[len - 16..]).try_into().unwrap();
        encrypt_block(block, expanded_key);
    }
}

/// Decrypt a buffer encrypted by [`encrypt`], inverting the steps in
/// reverse order.
pub fn decrypt(data: &mut [u8], expanded_key: &[u8; EXPANDED_KEY_BYTES]) {
    let len = data.len();
    if len < BLOCK_BYTES {
        return;
    }
    if len % BLOCK_BYTES != 0 {
        let block: &mut [u8; 16] = (&mut data[len - 16..]).try_into().unwrap();
        decrypt_block(block, expanded_key);
    }
    let whole = len / BLOCK_BYTES;
    for i in 0..whole {
        let block: &mut [u8; 16] = (&mut data[16 * i..16 * (i + 1)]).try_into().unwrap();
        decrypt_block(block, expanded_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix C.1 example vectors.
    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
        0x0e, 0x0f,
    ];
    const PLAIN: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
        0xee, 0xff,
    ];
    const CIPHER: [u8; 16] = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
        0xc5, 0x5a,
    ];

    #[test]
    fn fips_known_answer() {
        let key = expand_key(&KEY);
        let mut block = PLAIN;
        encrypt_block(&mut block, &key);
        assert_eq!(block, CIPHER);
        decrypt_block(&mut block, &key);
        assert_eq!(block, PLAIN);
    }

    #[test]
    fn buffer_round_trip_with_partial_tail() {
        let key = expand_key(&KEY);
        for len in [16usize, 17, 31, 32, 33, 48, 55, 100] {
            let original: Vec<u8> = (0..len as u32).map(|i| (i * 11 + 3) as u8).collect();
            let mut data = original.clone();
            encrypt(&mut data, &key);
            assert_ne!(data, original, "len = {len}");
            decrypt(&mut data, &key);
            assert_eq!(data, original, "len = {len}");
        }
    }

    #[test]
    fn tail_bytes_are_ciphered() {
        // The final partial block must not remain plaintext.
        let key = expand_key(&KEY);
        let original: Vec<u8> = (0..37u8).collect();
        let mut data = original.clone();
        encrypt(&mut data, &key);
        assert_ne!(&data[32..], &original[32..]);
    }

    #[test]
    fn short_buffers_pass_through() {
        let key = expand_key(&KEY);
        let original: Vec<u8> = (0..10u8).collect();
        let mut data = original.clone();
        encrypt(&mut data, &key);
        assert_eq!(data, original);
    }
}
