//! Target information: the attribute-value list sent by the server in its Challenge message.
//!
//! The list is carried opaquely into the NTLMv2 blob. The only modification the client makes is
//! inserting a flags entry and a channel bindings entry before the terminator when the handshake
//! is bound to a TLS channel.


use md5::Md5;
use sha2::{Digest, Sha256};

use crate::encoding::{utf16_le_bytes, utf16_le_bytes_to_string};


/// Flag in the `Flags` entry announcing that the Authenticate message carries a message integrity
/// code.
pub const AV_FLAG_CLIENT_PROVIDES_MIC: u32 = 0x0000_0002;

/// Prefix of the application data in a `tls-server-end-point` channel binding (RFC 5929).
const TLS_SERVER_END_POINT_PREFIX: &[u8] = b"tls-server-end-point:";

/// Length of an entry header: 16-bit type and 16-bit length.
const ENTRY_HEADER_LEN: usize = 4;


/// The type of additional target information included in the Challenge message.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TargetInfoType {
    Terminator,
    NtServer,
    NtDomain,
    DnsServer,
    DnsDomain,
    DnsForest,
    Flags,
    Timestamp,
    SingleHost,
    TargetName,
    ChannelBindings,
    Unknown(u16),
}
impl From<TargetInfoType> for u16 {
    fn from(t: TargetInfoType) -> Self {
        match t {
            TargetInfoType::Terminator => 0x0000,
            TargetInfoType::NtServer => 0x0001,
            TargetInfoType::NtDomain => 0x0002,
            TargetInfoType::DnsServer => 0x0003,
            TargetInfoType::DnsDomain => 0x0004,
            TargetInfoType::DnsForest => 0x0005,
            TargetInfoType::Flags => 0x0006,
            TargetInfoType::Timestamp => 0x0007,
            TargetInfoType::SingleHost => 0x0008,
            TargetInfoType::TargetName => 0x0009,
            TargetInfoType::ChannelBindings => 0x000A,
            TargetInfoType::Unknown(w) => w,
        }
    }
}
impl From<u16> for TargetInfoType {
    fn from(w: u16) -> Self {
        match w {
            0x0000 => TargetInfoType::Terminator,
            0x0001 => TargetInfoType::NtServer,
            0x0002 => TargetInfoType::NtDomain,
            0x0003 => TargetInfoType::DnsServer,
            0x0004 => TargetInfoType::DnsDomain,
            0x0005 => TargetInfoType::DnsForest,
            0x0006 => TargetInfoType::Flags,
            0x0007 => TargetInfoType::Timestamp,
            0x0008 => TargetInfoType::SingleHost,
            0x0009 => TargetInfoType::TargetName,
            0x000A => TargetInfoType::ChannelBindings,
            other => TargetInfoType::Unknown(other),
        }
    }
}

/// An entry of additional target information included in the Challenge message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetInfoEntry {
    pub entry_type: TargetInfoType,
    pub data: Vec<u8>,
}
impl TargetInfoEntry {
    /// Serializes the target info entry into bytes.
    ///
    /// # Panics
    ///
    /// Panics if the data is longer than 65535 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let entry_type_u16: u16 = self.entry_type.into();
        let bytes_len: u16 = self.data.len().try_into().expect("length of bytes does not fit into u16");

        let mut ret = Vec::with_capacity(ENTRY_HEADER_LEN + self.data.len());
        ret.extend_from_slice(&entry_type_u16.to_le_bytes());
        ret.extend_from_slice(&bytes_len.to_le_bytes());
        ret.extend_from_slice(&self.data);
        ret
    }

    /// Creates a target info entry from an entry type and a string, which is always encoded as
    /// UTF-16LE regardless of the negotiated flags.
    pub fn from_string(entry_type: TargetInfoType, string: &str) -> Self {
        Self {
            entry_type,
            data: utf16_le_bytes(string),
        }
    }

    /// Interprets the data within this target info entry as a UTF-16LE string.
    pub fn data_as_string(&self) -> String {
        utf16_le_bytes_to_string(&self.data)
    }

    /// The terminating entry of every target info list.
    pub fn terminator() -> Self {
        Self {
            entry_type: TargetInfoType::Terminator,
            data: Vec::new(),
        }
    }
}


/// Splits a target info blob into its entries.
///
/// Parsing stops at the terminator (which is included in the result) or at the first entry that
/// does not fit into the remaining bytes.
pub fn parse_target_info(mut bytes: &[u8]) -> Vec<TargetInfoEntry> {
    let mut entries = Vec::new();
    while bytes.len() >= ENTRY_HEADER_LEN {
        let entry_type: TargetInfoType = u16::from_le_bytes([bytes[0], bytes[1]]).into();
        let length = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        let Some(data) = bytes.get(ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + length) else {
            break;
        };

        entries.push(TargetInfoEntry {
            entry_type,
            data: Vec::from(data),
        });
        bytes = &bytes[ENTRY_HEADER_LEN + length..];

        if entry_type == TargetInfoType::Terminator {
            break;
        }
    }
    entries
}

/// Serializes a list of entries into a target info blob.
pub fn target_info_to_bytes(entries: &[TargetInfoEntry]) -> Vec<u8> {
    entries.iter()
        .flat_map(|e| e.to_bytes())
        .collect()
}


/// Computes the `tls-server-end-point` channel bindings hash for the server certificate.
///
/// The hash is MD5 over a GSS-API channel bindings structure whose initiator and acceptor
/// addresses are empty and whose application data is the RFC 5929 prefix followed by the SHA-256
/// digest of the DER-encoded certificate.
pub fn channel_bindings_hash(certificate_der: &[u8]) -> [u8; 16] {
    let certificate_hash = Sha256::digest(certificate_der);
    let application_data_len = (TLS_SERVER_END_POINT_PREFIX.len() + certificate_hash.len()) as u32;

    let mut structure = Vec::with_capacity(20 + application_data_len as usize);
    // initiator address type and length, acceptor address type and length
    structure.extend_from_slice(&[0u8; 16]);
    structure.extend_from_slice(&application_data_len.to_le_bytes());
    structure.extend_from_slice(TLS_SERVER_END_POINT_PREFIX);
    structure.extend_from_slice(&certificate_hash);

    Md5::digest(&structure).into()
}

/// Inserts the message-integrity flag and the channel bindings hash before the terminator of a
/// target info blob.
///
/// The final four bytes of `target_info` are assumed to be the terminator and are replaced by a
/// new one; a missing or shorter blob is treated as an empty list.
pub fn append_channel_bindings(target_info: Option<&[u8]>, certificate_der: &[u8]) -> Vec<u8> {
    let original = target_info.unwrap_or(&[]);
    let keep = original.len().saturating_sub(ENTRY_HEADER_LEN);

    let flags_entry = TargetInfoEntry {
        entry_type: TargetInfoType::Flags,
        data: AV_FLAG_CLIENT_PROVIDES_MIC.to_le_bytes().to_vec(),
    };
    let bindings_entry = TargetInfoEntry {
        entry_type: TargetInfoType::ChannelBindings,
        data: channel_bindings_hash(certificate_der).to_vec(),
    };

    let mut ret = Vec::with_capacity(keep + 8 + 20 + ENTRY_HEADER_LEN);
    ret.extend_from_slice(&original[..keep]);
    ret.extend(flags_entry.to_bytes());
    ret.extend(bindings_entry.to_bytes());
    ret.extend(TargetInfoEntry::terminator().to_bytes());
    ret
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<TargetInfoEntry> {
        vec![
            TargetInfoEntry::from_string(TargetInfoType::NtDomain, "DOMAIN"),
            TargetInfoEntry::from_string(TargetInfoType::NtServer, "SERVER"),
            TargetInfoEntry::terminator(),
        ]
    }

    #[test]
    fn test_parse_serialized_list() {
        let bytes = target_info_to_bytes(&sample_entries());
        assert_eq!(bytes.len(), 4 + 12 + 4 + 12 + 4);
        let parsed = parse_target_info(&bytes);
        assert_eq!(parsed, sample_entries());
        assert_eq!(parsed[0].data_as_string(), "DOMAIN");
    }

    #[test]
    fn test_parse_stops_at_truncated_entry() {
        let mut bytes = target_info_to_bytes(&sample_entries()[0..1]);
        // entry claiming 0x40 bytes of data that are not there
        bytes.extend_from_slice(&[0x01, 0x00, 0x40, 0x00, 0x53]);
        let parsed = parse_target_info(&bytes);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].entry_type, TargetInfoType::NtDomain);
    }

    #[test]
    fn test_append_channel_bindings() {
        let original = target_info_to_bytes(&sample_entries());
        let certificate = b"not really DER, but hashed all the same";
        let appended = append_channel_bindings(Some(original.as_slice()), certificate);

        assert_eq!(appended.len(), original.len() + 8 + 20);
        assert_eq!(&appended[..original.len() - 4], &original[..original.len() - 4]);

        let parsed = parse_target_info(&appended);
        let types: Vec<TargetInfoType> = parsed.iter().map(|e| e.entry_type).collect();
        assert_eq!(types, vec![
            TargetInfoType::NtDomain,
            TargetInfoType::NtServer,
            TargetInfoType::Flags,
            TargetInfoType::ChannelBindings,
            TargetInfoType::Terminator,
        ]);
        assert_eq!(parsed[2].data, vec![0x02, 0x00, 0x00, 0x00]);
        assert_eq!(parsed[3].data, channel_bindings_hash(certificate).to_vec());
    }

    #[test]
    fn test_channel_bindings_structure() {
        let certificate = b"certificate";
        let mut structure = vec![0u8; 16];
        structure.extend_from_slice(&[0x35, 0x00, 0x00, 0x00]);
        structure.extend_from_slice(b"tls-server-end-point:");
        structure.extend_from_slice(&Sha256::digest(certificate));
        let expected: [u8; 16] = Md5::digest(&structure).into();
        assert_eq!(channel_bindings_hash(certificate), expected);
    }

    #[test]
    fn test_append_to_missing_target_info() {
        let appended = append_channel_bindings(None, b"cert");
        assert_eq!(appended.len(), 8 + 20 + 4);
        assert_eq!(parse_target_info(&appended).len(), 3);
    }
}
