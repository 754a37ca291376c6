//! The Negotiate (type 1) message.


use tracing::debug;

use crate::{Flags, OsVersion};
use crate::encoding::{ascii_bytes, ascii_bytes_to_string, strip_dot_suffix, to_uppercase_per_char};
use crate::error::{ParsingError, StoringError};
use crate::framer::{COMMON_HEADER_LEN, MessageReader, MessageType, MessageWriter, SecurityBuffer};


const HEADER_LEN: usize
    = COMMON_HEADER_LEN
    + 4 // flags
    + SecurityBuffer::LEN // supplied domain
    + SecurityBuffer::LEN // supplied workstation
    + OsVersion::LEN
    ;


/// The contents of an NTLM Negotiate message.
///
/// The Negotiate message is the first message in an NTLM challenge-response process and is sent by
/// the client to the server; the server is expected to respond with a Challenge message.
///
/// Domain and workstation are always transferred in the single-byte encoding, regardless of
/// `NEGOTIATE_UNICODE`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NegotiateMessage {
    /// Stores which information has been specified and which NTLM behavior should be negotiated.
    pub flags: Flags,

    /// The domain against which the client wishes to authenticate.
    pub supplied_domain: Option<String>,

    /// The NetBIOS hostname of the client.
    pub supplied_workstation: Option<String>,

    /// Version information about the client's operating system.
    pub os_version: OsVersion,
}
impl NegotiateMessage {
    /// Creates a Negotiate message with the default flags ([`Flags::default_negotiate`]).
    ///
    /// Anything from the first `.` onwards is removed from both names, and the domain is
    /// converted to uppercase.
    pub fn new(domain: Option<&str>, workstation: Option<&str>) -> Self {
        Self {
            flags: Flags::default_negotiate(),
            supplied_domain: domain.map(|d| to_uppercase_per_char(strip_dot_suffix(d))),
            supplied_workstation: workstation.map(|w| strip_dot_suffix(w).to_owned()),
            os_version: OsVersion::default(),
        }
    }

    /// Replaces the flags to negotiate.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Serializes the Negotiate message into bytes, including magic and message type.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let domain_bytes = self.supplied_domain.as_deref()
            .map(ascii_bytes)
            .unwrap_or_default();
        let workstation_bytes = self.supplied_workstation.as_deref()
            .map(ascii_bytes)
            .unwrap_or_default();

        let mut writer = MessageWriter::new(MessageType::Negotiate, HEADER_LEN);
        writer.write_u32(self.flags.bits());
        writer.write_security_buffer(&domain_bytes)?;
        writer.write_security_buffer(&workstation_bytes)?;
        writer.write_bytes(&self.os_version.to_bytes());
        let bytes = writer.finish();

        debug!(flags = ?self.flags, length = bytes.len(), "built Negotiate message");
        Ok(bytes)
    }
}
impl TryFrom<&[u8]> for NegotiateMessage {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let reader = MessageReader::new(value, MessageType::Negotiate)?;

        let flags = Flags::from_bits_retain(reader.read_u32(12));
        let supplied_domain = reader.read_security_buffer(16);
        let supplied_workstation = reader.read_security_buffer(24);
        let os_version = if flags.contains(Flags::NEGOTIATE_VERSION) && reader.len() >= HEADER_LEN {
            OsVersion::from_bytes(&value[32..40])
        } else {
            OsVersion::default()
        };

        let as_option = |bytes: Vec<u8>| if bytes.is_empty() {
            None
        } else {
            Some(ascii_bytes_to_string(&bytes))
        };

        Ok(Self {
            flags,
            supplied_domain: as_option(supplied_domain),
            supplied_workstation: as_option(supplied_workstation),
            os_version,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::{BASE64_STANDARD, Engine};

    #[test]
    fn test_default_negotiate() {
        let bytes = NegotiateMessage::new(None, None).to_bytes().unwrap();
        assert_eq!(
            BASE64_STANDARD.encode(&bytes),
            "TlRMTVNTUAABAAAAAYIIogAAAAAoAAAAAAAAACgAAAAFASgKAAAADw==",
        );
    }

    #[test]
    fn test_names_are_normalized() {
        let msg = NegotiateMessage::new(Some("corp.example.com"), Some("ws01.corp.example.com"));
        assert_eq!(msg.supplied_domain.as_deref(), Some("CORP"));
        assert_eq!(msg.supplied_workstation.as_deref(), Some("ws01"));

        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), 40 + 4 + 4);
        // domain first, then workstation
        assert_eq!(&bytes[16..24], &[0x04, 0x00, 0x04, 0x00, 0x28, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[24..32], &[0x04, 0x00, 0x04, 0x00, 0x2C, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[40..], b"CORPws01");
    }

    #[test]
    fn test_domain_uppercase_keeps_length() {
        let msg = NegotiateMessage::new(Some("straße.example"), None);
        assert_eq!(msg.supplied_domain.as_deref(), Some("STRAßE"));
    }

    #[test]
    fn test_parse_built_message() {
        let msg = NegotiateMessage::new(Some("corp"), Some("ws01"))
            .with_flags(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_VERSION);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(NegotiateMessage::try_from(bytes.as_slice()).unwrap(), msg);
    }

    #[test]
    fn test_parse_without_version() {
        let msg = NegotiateMessage::new(None, Some("ws01"))
            .with_flags(Flags::NEGOTIATE_NTLM);
        let bytes = msg.to_bytes().unwrap();
        let parsed = NegotiateMessage::try_from(bytes.as_slice()).unwrap();
        assert_eq!(parsed.supplied_domain, None);
        assert_eq!(parsed.supplied_workstation.as_deref(), Some("ws01"));
        assert_eq!(parsed.os_version, OsVersion::default());
    }

    #[test]
    fn test_wrong_type() {
        let mut bytes = NegotiateMessage::new(None, None).to_bytes().unwrap();
        bytes[8] = 0x02;
        assert_eq!(
            NegotiateMessage::try_from(bytes.as_slice()).unwrap_err(),
            ParsingError::MessageTypeMismatch { expected: 1, obtained: 2 },
        );
    }
}
