//! String encoding functions.
//!
//! NTLM strings are either UTF-16 in little-endian byte order (when `NEGOTIATE_UNICODE` is set) or
//! a single-byte "OEM" encoding. The single-byte encoding used here is plain ASCII; like most
//! NTLM implementations, characters outside of ASCII are replaced by `?` instead of failing.


use crate::Flags;


const REPLACEMENT_BYTE: u8 = b'?';


/// Encodes the string as UTF-16 in little-endian byte order without a Byte Order Mark.
pub(crate) fn utf16_le_bytes(string: &str) -> Vec<u8> {
    string.encode_utf16()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

/// Decodes UTF-16 values stored as bytes in little-endian format.
///
/// Unpaired surrogates and a dangling odd byte decode to U+FFFD.
pub(crate) fn utf16_le_bytes_to_string(bytes: &[u8]) -> String {
    let chunks = bytes.chunks_exact(2);
    let dangling = !chunks.remainder().is_empty();
    let u16s: Vec<u16> = chunks
        .map(|chk| u16::from_le_bytes([chk[0], chk[1]]))
        .collect();
    let mut ret = String::from_utf16_lossy(&u16s);
    if dangling {
        ret.push(char::REPLACEMENT_CHARACTER);
    }
    ret
}

/// Converts the string to uppercase one character at a time.
///
/// Characters whose uppercase form consists of more than one character (such as `ß`) are kept
/// as they are, so the length of the string in UTF-16 code units does not change.
pub(crate) fn to_uppercase_per_char(string: &str) -> String {
    string.chars()
        .map(|c| {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(u), None) => u,
                _ => c,
            }
        })
        .collect()
}

/// Encodes the string as ASCII, replacing every non-ASCII character with `?`.
pub(crate) fn ascii_bytes(string: &str) -> Vec<u8> {
    string.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT_BYTE })
        .collect()
}

/// Decodes ASCII bytes, replacing every byte above 0x7F with `?`.
pub(crate) fn ascii_bytes_to_string(bytes: &[u8]) -> String {
    bytes.iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { char::from(REPLACEMENT_BYTE) })
        .collect()
}

/// Encodes a string using the character set selected by `flags`.
pub(crate) fn encode_for_flags(flags: Flags, string: &str) -> Vec<u8> {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        utf16_le_bytes(string)
    } else {
        ascii_bytes(string)
    }
}

/// Decodes a string using the character set selected by `flags`.
pub(crate) fn decode_for_flags(flags: Flags, bytes: &[u8]) -> String {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        utf16_le_bytes_to_string(bytes)
    } else {
        ascii_bytes_to_string(bytes)
    }
}

/// Removes everything from the first `.` onwards, turning a DNS name into a NetBIOS-style name.
pub(crate) fn strip_dot_suffix(name: &str) -> &str {
    match name.find('.') {
        Some(index) => &name[..index],
        None => name,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_roundtrip() {
        let bytes = utf16_le_bytes("Grüße");
        assert_eq!(bytes.len(), 10);
        assert_eq!(utf16_le_bytes_to_string(&bytes), "Grüße");
    }

    #[test]
    fn test_utf16_lenient_decoding() {
        // lone high surrogate followed by a dangling byte
        assert_eq!(utf16_le_bytes_to_string(&[0x41, 0x00, 0x00, 0xD8, 0x42]), "A\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn test_ascii_replacement() {
        assert_eq!(ascii_bytes("pässword"), b"p?ssword");
        assert_eq!(ascii_bytes_to_string(&[0x61, 0xE4, 0x62]), "a?b");
    }

    #[test]
    fn test_uppercase_keeps_length() {
        assert_eq!(to_uppercase_per_char("straße"), "STRAßE");
        assert_eq!(to_uppercase_per_char("\u{FB01}le"), "\u{FB01}LE");
        assert_eq!(to_uppercase_per_char("Ärger"), "ÄRGER");
        assert_eq!(utf16_le_bytes(&to_uppercase_per_char("straße")).len(), 12);
    }

    #[test]
    fn test_strip_dot_suffix() {
        assert_eq!(strip_dot_suffix("workstation.example.com"), "workstation");
        assert_eq!(strip_dot_suffix("WORKSTATION"), "WORKSTATION");
        assert_eq!(strip_dot_suffix(".local"), "");
    }

    #[test]
    fn test_encode_for_flags() {
        assert_eq!(encode_for_flags(Flags::NEGOTIATE_UNICODE, "ab"), vec![0x61, 0x00, 0x62, 0x00]);
        assert_eq!(encode_for_flags(Flags::NEGOTIATE_OEM, "ab"), b"ab");
        assert_eq!(decode_for_flags(Flags::empty(), b"ab"), "ab");
    }
}
