//! The Challenge (type 2) message.


use base64::prelude::{BASE64_STANDARD, Engine};
use tracing::{debug, trace};

use crate::{Flags, OsVersion};
use crate::encoding::{decode_for_flags, encode_for_flags};
use crate::error::{ParsingError, StoringError};
use crate::framer::{COMMON_HEADER_LEN, MessageReader, MessageType, MessageWriter, SecurityBuffer};
use crate::target_info::{parse_target_info, TargetInfoEntry};


const TARGET_NAME_POSITION: usize = 12;
const FLAGS_POSITION: usize = 20;
const CHALLENGE_POSITION: usize = 24;
const TARGET_INFO_POSITION: usize = 40;
const VERSION_POSITION: usize = 48;


/// The contents of an NTLM Challenge message.
///
/// The Challenge message is sent by the server in response to the client's Negotiate message; the
/// client is expected to respond with an Authenticate message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChallengeMessage {
    /// The challenge value.
    pub challenge: [u8; 8],

    /// Stores which NTLM behavior has been accepted by the server from the client's request.
    pub flags: Flags,

    /// The name of the server or domain against which the client is authenticating.
    pub target_name: Option<String>,

    /// The raw target information blob.
    pub target_info: Option<Vec<u8>>,
}
impl ChallengeMessage {
    /// Decodes a base64-encoded Challenge message, as found in a `WWW-Authenticate: NTLM ...`
    /// header.
    pub fn from_base64(encoded: &str) -> Result<Self, ParsingError> {
        let bytes = BASE64_STANDARD.decode(encoded.trim())
            .map_err(|e| ParsingError::InvalidBase64 { message: e.to_string() })?;
        Self::try_from(bytes.as_slice())
    }

    /// Splits the target information blob into its entries.
    pub fn target_information(&self) -> Vec<TargetInfoEntry> {
        self.target_info.as_deref()
            .map(parse_target_info)
            .unwrap_or_default()
    }

    /// Serializes the Challenge message into bytes, including magic and message type.
    ///
    /// The context field is zeroed. A version structure is appended to the header if
    /// `NEGOTIATE_VERSION` is set.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let with_version = self.flags.contains(Flags::NEGOTIATE_VERSION);
        let header_len
            = COMMON_HEADER_LEN
            + SecurityBuffer::LEN // target name
            + 4 // flags
            + 8 // challenge
            + 8 // context
            + SecurityBuffer::LEN // target information
            + if with_version { OsVersion::LEN } else { 0 }
            ;

        let target_name_bytes = self.target_name.as_deref()
            .map(|n| encode_for_flags(self.flags, n))
            .unwrap_or_default();

        let mut writer = MessageWriter::new(MessageType::Challenge, header_len);
        writer.write_security_buffer(&target_name_bytes)?;
        writer.write_u32(self.flags.bits());
        writer.write_bytes(&self.challenge);
        writer.write_bytes(&[0u8; 8]);
        writer.write_security_buffer(self.target_info.as_deref().unwrap_or(&[]))?;
        if with_version {
            writer.write_bytes(&OsVersion::default().to_bytes());
        }
        Ok(writer.finish())
    }
}
impl TryFrom<&[u8]> for ChallengeMessage {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let reader = MessageReader::new(value, MessageType::Challenge)?;

        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(reader.read_bytes(CHALLENGE_POSITION, 8)?);

        let flags = Flags::from_bits_retain(reader.read_u32(FLAGS_POSITION));

        let target_name = if reader.len() >= TARGET_NAME_POSITION + SecurityBuffer::LEN {
            let bytes = reader.read_security_buffer(TARGET_NAME_POSITION);
            if bytes.is_empty() {
                None
            } else {
                Some(decode_for_flags(flags, &bytes))
            }
        } else {
            None
        };

        let target_info = if reader.len() >= VERSION_POSITION {
            let bytes = reader.read_security_buffer(TARGET_INFO_POSITION);
            if bytes.is_empty() {
                None
            } else {
                Some(bytes)
            }
        } else {
            trace!(length = reader.len(), "Challenge message too short for target info");
            None
        };

        debug!(
            flags = ?flags,
            has_target_name = target_name.is_some(),
            target_info_len = target_info.as_ref().map(|ti| ti.len()).unwrap_or(0),
            "parsed Challenge message",
        );
        Ok(Self {
            challenge,
            flags,
            target_name,
            target_info,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::target_info::TargetInfoType;
    use hex_literal::hex;
    use proptest::prelude::*;

    const CHALLENGE_B64: &str = "TlRMTVNTUAACAAAAHgAeADgAAAAFgoqiHZv9GyiTGzEAAAAAAAAAAJgAmABWAAAACgDOSQAAAA9EAEUAUwBLAFQATwBQAC0ANQAzADYAMQA5ADQASQACAB4ARABFAFMASwBUAE8AUAAtADUAMwA2ADEAOQA0AEkAAQAeAEQARQBTAEsAVABPAFAALQA1ADMANgAxADkANABJAAQAHgBEAEUAUwBLAFQATwBQAC0ANQAzADYAMQA5ADQASQADAB4ARABFAFMASwBUAE8AUAAtADUAMwA2ADEAOQA0AEkABwAIAPD8+wtgC9UBAAAAAA==";
    const TARGET_INFO_B64: &str = "AgAeAEQARQBTAEsAVABPAFAALQA1ADMANgAxADkANABJAAEAHgBEAEUAUwBLAFQATwBQAC0ANQAzADYAMQA5ADQASQAEAB4ARABFAFMASwBUAE8AUAAtADUAMwA2ADEAOQA0AEkAAwAeAEQARQBTAEsAVABPAFAALQA1ADMANgAxADkANABJAAcACADw/PsLYAvVAQAAAAA=";

    #[test]
    fn test_parse_server_challenge() {
        let msg = ChallengeMessage::from_base64(CHALLENGE_B64).unwrap();
        assert_eq!(msg.challenge, hex!("1d9bfd1b28931b31"));
        assert_eq!(msg.flags.bits(), 0xa28a8205);
        assert_eq!(msg.target_name.as_deref(), Some("DESKTOP-536194I"));
        assert_eq!(
            msg.target_info.as_deref().map(|ti| BASE64_STANDARD.encode(ti)),
            Some(TARGET_INFO_B64.to_owned()),
        );

        let entries = msg.target_information();
        let types: Vec<TargetInfoType> = entries.iter().map(|e| e.entry_type).collect();
        assert_eq!(types, vec![
            TargetInfoType::NtDomain,
            TargetInfoType::NtServer,
            TargetInfoType::DnsDomain,
            TargetInfoType::DnsServer,
            TargetInfoType::Timestamp,
            TargetInfoType::Terminator,
        ]);
        assert_eq!(entries[1].data_as_string(), "DESKTOP-536194I");
    }

    #[test]
    fn test_short_message_has_no_target() {
        // header, empty target name buffer, flags, challenge
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"NTLMSSP\0");
        bytes.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&0x0000_0201u32.to_le_bytes());
        bytes.extend_from_slice(&hex!("0123456789abcdef"));

        let msg = ChallengeMessage::try_from(bytes.as_slice()).unwrap();
        assert_eq!(msg.challenge, hex!("0123456789abcdef"));
        assert_eq!(msg.flags, Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM);
        assert_eq!(msg.target_name, None);
        assert_eq!(msg.target_info, None);
    }

    #[test]
    fn test_missing_challenge_fails() {
        let bytes = BASE64_STANDARD.decode(CHALLENGE_B64).unwrap();
        assert!(matches!(
            ChallengeMessage::try_from(&bytes[0..30]),
            Err(ParsingError::Truncated { position: 24, length: 8, .. }),
        ));
    }

    #[test]
    fn test_target_info_beyond_message_reads_zeroes() {
        let mut bytes = BASE64_STANDARD.decode(CHALLENGE_B64).unwrap();
        bytes.truncate(0x56);
        let msg = ChallengeMessage::try_from(bytes.as_slice()).unwrap();
        assert_eq!(msg.target_name.as_deref(), Some("DESKTOP-536194I"));
        assert_eq!(msg.target_info, Some(vec![0u8; 0x98]));
    }

    #[test]
    fn test_oem_target_name() {
        let msg = ChallengeMessage {
            challenge: hex!("0123456789abcdef"),
            flags: Flags::NEGOTIATE_OEM | Flags::REQUEST_TARGET,
            target_name: Some("SERVER".to_owned()),
            target_info: None,
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(&bytes[48..], b"SERVER");
        assert_eq!(ChallengeMessage::try_from(bytes.as_slice()).unwrap(), msg);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            ChallengeMessage::from_base64("not base64!"),
            Err(ParsingError::InvalidBase64 { .. }),
        ));
    }

    #[test]
    fn test_reencode_server_challenge() {
        let msg = ChallengeMessage::from_base64(CHALLENGE_B64).unwrap();
        let reparsed = ChallengeMessage::try_from(msg.to_bytes().unwrap().as_slice()).unwrap();
        assert_eq!(reparsed, msg);
    }

    proptest! {
        #[test]
        fn parsing_never_panics(tail in proptest::collection::vec(any::<u8>(), 0..128)) {
            let mut bytes = Vec::from(&b"NTLMSSP\0\x02\x00\x00\x00"[..]);
            bytes.extend_from_slice(&tail);
            let parsed = ChallengeMessage::try_from(bytes.as_slice());
            prop_assert_eq!(parsed.is_ok(), bytes.len() >= 32);
        }
    }
}
