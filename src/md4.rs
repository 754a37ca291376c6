//! The MD4 message digest (RFC 1320).
//!
//! MD4 is broken as a general-purpose hash, but NTLM is built on it: the NTLM hash of a password is
//! the MD4 digest of its UTF-16LE encoding, and the NTLM user session key is the MD4 digest of that
//! hash.


const BLOCK_LEN: usize = 64;
const INITIAL_STATE: [u32; 4] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476];

const ROUND2_CONSTANT: u32 = 0x5A82_7999;
const ROUND3_CONSTANT: u32 = 0x6ED9_EBA1;


/// Incremental MD4 state.
#[derive(Clone)]
pub struct Md4 {
    state: [u32; 4],
    buffer: [u8; BLOCK_LEN],
    buffer_len: usize,
    total_len: u64,
}
impl Md4 {
    /// Begins a new MD4 computation.
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            buffer: [0; BLOCK_LEN],
            buffer_len: 0,
            total_len: 0,
        }
    }

    /// Feeds more data into the digest.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len = self.total_len.wrapping_add(data.len() as u64);

        // top up a partially filled block first
        if self.buffer_len > 0 {
            let take = (BLOCK_LEN - self.buffer_len).min(data.len());
            self.buffer[self.buffer_len..self.buffer_len + take].copy_from_slice(&data[..take]);
            self.buffer_len += take;
            data = &data[take..];

            if self.buffer_len < BLOCK_LEN {
                return;
            }
            let block = self.buffer;
            compress(&mut self.state, &block);
            self.buffer_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            compress(&mut self.state, block.try_into().unwrap());
        }

        let rest = blocks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffer_len = rest.len();
    }

    /// Pads the message and returns the 16-byte digest.
    pub fn finalize(mut self) -> [u8; 16] {
        let bit_len = self.total_len.wrapping_mul(8);

        // 0x80, then zeroes up to 56 mod 64, then the bit length (little-endian)
        let pad_len = if self.buffer_len < 56 {
            56 - self.buffer_len
        } else {
            BLOCK_LEN + 56 - self.buffer_len
        };
        let mut padding = [0u8; BLOCK_LEN + 8];
        padding[0] = 0x80;
        padding[pad_len..pad_len + 8].copy_from_slice(&bit_len.to_le_bytes());

        // update() would also count the padding towards the length; restore it afterwards
        let total_len = self.total_len;
        self.update(&padding[..pad_len + 8]);
        self.total_len = total_len;
        debug_assert_eq!(self.buffer_len, 0);

        let mut digest = [0u8; 16];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(self.state.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        digest
    }
}
impl Default for Md4 {
    fn default() -> Self {
        Self::new()
    }
}


/// Computes the MD4 digest of `data` in one go.
pub fn md4(data: &[u8]) -> [u8; 16] {
    let mut state = Md4::new();
    state.update(data);
    state.finalize()
}


#[inline]
fn f(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (!x & z)
}

#[inline]
fn g(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (x & z) | (y & z)
}

#[inline]
fn h(x: u32, y: u32, z: u32) -> u32 {
    x ^ y ^ z
}

/// Runs the three 16-step rounds over one 512-bit block.
fn compress(state: &mut [u32; 4], block: &[u8; BLOCK_LEN]) {
    let mut x = [0u32; 16];
    for (word, chunk) in x.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }

    let [mut a, mut b, mut c, mut d] = *state;

    // round 1: F, words in order
    for &i in &[0usize, 4, 8, 12] {
        a = a.wrapping_add(f(b, c, d)).wrapping_add(x[i]).rotate_left(3);
        d = d.wrapping_add(f(a, b, c)).wrapping_add(x[i + 1]).rotate_left(7);
        c = c.wrapping_add(f(d, a, b)).wrapping_add(x[i + 2]).rotate_left(11);
        b = b.wrapping_add(f(c, d, a)).wrapping_add(x[i + 3]).rotate_left(19);
    }

    // round 2: G, words by column
    for i in 0..4 {
        a = a.wrapping_add(g(b, c, d)).wrapping_add(x[i]).wrapping_add(ROUND2_CONSTANT).rotate_left(3);
        d = d.wrapping_add(g(a, b, c)).wrapping_add(x[i + 4]).wrapping_add(ROUND2_CONSTANT).rotate_left(5);
        c = c.wrapping_add(g(d, a, b)).wrapping_add(x[i + 8]).wrapping_add(ROUND2_CONSTANT).rotate_left(9);
        b = b.wrapping_add(g(c, d, a)).wrapping_add(x[i + 12]).wrapping_add(ROUND2_CONSTANT).rotate_left(13);
    }

    // round 3: H, words in bit-reversed order
    for &i in &[0usize, 2, 1, 3] {
        a = a.wrapping_add(h(b, c, d)).wrapping_add(x[i]).wrapping_add(ROUND3_CONSTANT).rotate_left(3);
        d = d.wrapping_add(h(a, b, c)).wrapping_add(x[i + 8]).wrapping_add(ROUND3_CONSTANT).rotate_left(9);
        c = c.wrapping_add(h(d, a, b)).wrapping_add(x[i + 4]).wrapping_add(ROUND3_CONSTANT).rotate_left(11);
        b = b.wrapping_add(h(c, d, a)).wrapping_add(x[i + 12]).wrapping_add(ROUND3_CONSTANT).rotate_left(15);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use proptest::prelude::*;

    #[test]
    fn test_rfc1320_suite() {
        let vectors: [(&[u8], [u8; 16]); 7] = [
            (b"", hex!("31d6cfe0d16ae931b73c59d7e0c089c0")),
            (b"a", hex!("bde52cb31de33e46245e05fbdbd6fb24")),
            (b"abc", hex!("a448017aaf21d8525fc10ae87aa6729d")),
            (b"message digest", hex!("d9130a8164549fe818874806e1c7014b")),
            (b"abcdefghijklmnopqrstuvwxyz", hex!("d79e1c308aa5bbcdeea8ed63df412da9")),
            (b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789", hex!("043f8582f241db351ce627e153e7f0e4")),
            (b"12345678901234567890123456789012345678901234567890123456789012345678901234567890", hex!("e33b4ddc9c38f2199c3e7b164fcc0536")),
        ];
        for (input, expected) in vectors {
            assert_eq!(md4(input), expected, "input {:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn test_padding_boundaries() {
        // 55, 56 and 64 bytes exercise the one-block and two-block padding paths
        for len in [55usize, 56, 63, 64, 65, 119, 120] {
            let data = vec![0x61u8; len];
            let expected: [u8; 16] = <::md4::Md4 as digest::Digest>::digest(&data).into();
            assert_eq!(md4(&data), expected, "length {}", len);
        }
    }

    proptest! {
        #[test]
        fn matches_reference_implementation(data in proptest::collection::vec(any::<u8>(), 0..300), split in 0usize..300) {
            let split = split.min(data.len());
            let mut state = Md4::new();
            state.update(&data[..split]);
            state.update(&data[split..]);

            let expected: [u8; 16] = <::md4::Md4 as digest::Digest>::digest(&data).into();
            prop_assert_eq!(state.finalize(), expected);
        }
    }
}
