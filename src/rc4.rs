//! The RC4 stream cipher.
//!
//! NTLM uses RC4 to wrap the randomly generated session key when key exchange is negotiated.


use std::fmt;


/// RC4 keystream generator.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}
impl Rc4 {
    /// Runs the key-scheduling algorithm.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty.
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "RC4 key must not be empty");

        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, usize::from(j));
        }

        Self { s, i: 0, j: 0 }
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[usize::from(self.i)]);
        self.s.swap(usize::from(self.i), usize::from(self.j));
        let idx = self.s[usize::from(self.i)].wrapping_add(self.s[usize::from(self.j)]);
        self.s[usize::from(idx)]
    }

    /// XORs the keystream into `data` in place.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.next_byte();
        }
    }

    /// Encrypts (or, equivalently, decrypts) `data` into a new buffer.
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut ret = Vec::from(data);
        self.apply_keystream(&mut ret);
        ret
    }
}
impl fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the permutation is key material
        f.debug_struct("Rc4")
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_wikipedia_vectors() {
        assert_eq!(Rc4::new(b"Key").process(b"Plaintext"), hex!("BBF316E8D940AF0AD3"));
        assert_eq!(Rc4::new(b"Wiki").process(b"pedia"), hex!("1021BF0420"));
        assert_eq!(Rc4::new(b"Secret").process(b"Attack at dawn"), hex!("45A01F645FC35B383552544B9BF5"));
    }

    #[test]
    fn test_keystream_continues_across_calls() {
        let mut whole = Rc4::new(b"Key");
        let expected = whole.process(b"Plaintext");

        let mut split = Rc4::new(b"Key");
        let mut first = split.process(b"Plain");
        first.extend(split.process(b"text"));
        assert_eq!(first, expected);
    }

    #[test]
    fn test_roundtrip() {
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let ciphertext = Rc4::new(&key).process(b"session key data");
        assert_eq!(Rc4::new(&key).process(&ciphertext), b"session key data");
    }
}
