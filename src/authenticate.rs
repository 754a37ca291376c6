//! The Authenticate (type 3) message and the logic answering a server challenge.


use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::debug;

use crate::{Credentials, Flags, OsVersion};
use crate::challenge::ChallengeMessage;
use crate::encoding::{decode_for_flags, encode_for_flags, strip_dot_suffix, to_uppercase_per_char};
use crate::engine::{CipherEngine, hmac_md5};
use crate::error::{CipherError, ConfigurationError, Error, ParsingError, StoringError};
use crate::framer::{COMMON_HEADER_LEN, MessageReader, MessageType, MessageWriter, SecurityBuffer};
use crate::target_info::append_channel_bindings;


const HEADER_LEN: usize
    = COMMON_HEADER_LEN
    + SecurityBuffer::LEN // LM response
    + SecurityBuffer::LEN // NTLM response
    + SecurityBuffer::LEN // domain name
    + SecurityBuffer::LEN // user name
    + SecurityBuffer::LEN // workstation name
    + SecurityBuffer::LEN // session key
    + 4 // flags
    + OsVersion::LEN
    ;

const MIC_LEN: usize = 16;


/// The contents of an NTLM Authenticate message.
///
/// The Authenticate message is sent by the client in response to the server's Challenge message;
/// once it is accepted by the server, the authentication has succeeded.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AuthenticateMessage {
    pub lm_response: Vec<u8>,
    pub ntlm_response: Vec<u8>,
    pub domain_name: String,
    pub user_name: String,
    pub workstation_name: String,
    pub session_key: Vec<u8>,
    pub flags: Flags,
    pub os_version: OsVersion,

    /// The message integrity code; if present, it follows the version in the header.
    pub mic: Option<[u8; MIC_LEN]>,
}
impl AuthenticateMessage {
    /// Serializes the Authenticate message into bytes, including magic and message type.
    ///
    /// Strings are encoded according to `NEGOTIATE_UNICODE` in [`Self::flags`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        let header_len = HEADER_LEN + if self.mic.is_some() { MIC_LEN } else { 0 };

        let mut writer = MessageWriter::new(MessageType::Authenticate, header_len);
        writer.write_security_buffer(&self.lm_response)?;
        writer.write_security_buffer(&self.ntlm_response)?;
        writer.write_security_buffer(&encode_for_flags(self.flags, &self.domain_name))?;
        writer.write_security_buffer(&encode_for_flags(self.flags, &self.user_name))?;
        writer.write_security_buffer(&encode_for_flags(self.flags, &self.workstation_name))?;
        writer.write_security_buffer(&self.session_key)?;
        writer.write_u32(self.flags.bits());
        writer.write_bytes(&self.os_version.to_bytes());
        if let Some(mic) = &self.mic {
            writer.write_bytes(mic);
        }
        Ok(writer.finish())
    }
}
impl TryFrom<&[u8]> for AuthenticateMessage {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let reader = MessageReader::new(value, MessageType::Authenticate)?;

        let flags = Flags::from_bits_retain(reader.read_u32(60));
        let buffer_positions = [12, 20, 28, 36, 44, 52];
        let os_version = if reader.len() >= HEADER_LEN {
            OsVersion::from_bytes(&value[64..72])
        } else {
            OsVersion::default()
        };

        // the MIC is only present if no payload starts before its end
        let payload_start = buffer_positions.iter()
            .map(|&p| reader.read_security_buffer_header(p))
            .filter(|sb| sb.length > 0)
            .map(|sb| sb.offset as usize)
            .min()
            .unwrap_or(reader.len());
        let mic = if payload_start >= HEADER_LEN + MIC_LEN && reader.len() >= HEADER_LEN + MIC_LEN {
            let mut mic = [0u8; MIC_LEN];
            mic.copy_from_slice(reader.read_bytes(HEADER_LEN, MIC_LEN)?);
            Some(mic)
        } else {
            None
        };

        Ok(Self {
            lm_response: reader.read_security_buffer(12),
            ntlm_response: reader.read_security_buffer(20),
            domain_name: decode_for_flags(flags, &reader.read_security_buffer(28)),
            user_name: decode_for_flags(flags, &reader.read_security_buffer(36)),
            workstation_name: decode_for_flags(flags, &reader.read_security_buffer(44)),
            session_key: reader.read_security_buffer(52),
            flags,
            os_version,
            mic,
        })
    }
}


/// The response algorithm chosen for a challenge.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResponseKind {
    /// LMv2 and NTLMv2 responses.
    NtlmV2,

    /// NTLM2 session response with the client challenge in the LM slot.
    Ntlm2Session,

    /// Classic LM and NTLM responses.
    NtlmV1,
}
impl ResponseKind {
    /// Chooses the response algorithm from the flags and contents of the server's challenge.
    pub fn for_challenge(challenge: &ChallengeMessage) -> Self {
        if challenge.flags.contains(Flags::NEGOTIATE_TARGET_INFO)
                && challenge.target_name.is_some()
                && challenge.target_info.is_some() {
            Self::NtlmV2
        } else if challenge.flags.contains(Flags::NEGOTIATE_NTLM2_KEY) {
            Self::Ntlm2Session
        } else {
            Self::NtlmV1
        }
    }
}


/// The response to an NTLM challenge.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChallengeResponse {
    /// The response algorithm that was used.
    pub kind: ResponseKind,

    /// The value of the LM response field.
    pub lm_response: Vec<u8>,

    /// The value of the NTLM response field.
    pub ntlm_response: Vec<u8>,

    /// The user session key derived alongside the responses.
    pub user_session_key: [u8; 16],
}
impl ChallengeResponse {
    /// Calculates the responses and user session key for the server challenge the engine was
    /// created with.
    ///
    /// For NTLMv2, the NTLMv2 response is calculated before the LMv2 response, so the second
    /// client challenge is the first value drawn from the random number generator.
    pub fn calculate<R: RngCore>(engine: &mut CipherEngine<R>, kind: ResponseKind, flags: Flags) -> Result<Self, CipherError> {
        let (lm_response, ntlm_response, path_key) = match kind {
            ResponseKind::NtlmV2 => {
                let ntlm_response = engine.ntlm_v2_response()?;
                let lm_response = engine.lm_v2_response()?;
                (lm_response, ntlm_response, engine.ntlm_v2_user_session_key()?)
            },
            ResponseKind::Ntlm2Session => {
                let ntlm_response = engine.ntlm2_session_response()?;
                let lm_response = engine.lm2_session_response();
                (lm_response.to_vec(), ntlm_response.to_vec(), engine.ntlm2_session_user_session_key()?)
            },
            ResponseKind::NtlmV1 => {
                let ntlm_response = engine.ntlm_response()?;
                let lm_response = engine.lm_response()?;
                (lm_response.to_vec(), ntlm_response.to_vec(), engine.ntlm_user_session_key())
            },
        };

        let user_session_key = if flags.contains(Flags::NEGOTIATE_LANMAN_KEY) {
            engine.lan_manager_session_key()?
        } else {
            path_key
        };

        Ok(Self {
            kind,
            lm_response,
            ntlm_response,
            user_session_key,
        })
    }
}


/// A finished Authenticate message together with the key material negotiated along with it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Authentication {
    /// The Authenticate message to send to the server.
    pub message: AuthenticateMessage,

    /// The response algorithm that was used.
    pub kind: ResponseKind,

    /// The session key for subsequent signing and sealing; only available if signing was
    /// negotiated.
    pub exported_session_key: Option<[u8; 16]>,
}
impl Authentication {
    /// Serializes the Authenticate message into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        self.message.to_bytes()
    }
}


/// Material required to bind the authentication to a TLS channel and protect it with a message
/// integrity code.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ChannelBinding {
    certificate_der: Vec<u8>,
    negotiate_message: Vec<u8>,
    challenge_message: Vec<u8>,
}


/// Assembles the Authenticate message answering a server challenge.
///
/// The response algorithm and the session key handling are derived from the flags of the
/// challenge, which are also echoed in the Authenticate message.
#[derive(Clone, Debug)]
pub struct AuthenticateMessageBuilder<'a> {
    credentials: &'a Credentials,
    challenge: &'a ChallengeMessage,
    workstation: Option<String>,
    channel_binding: Option<ChannelBinding>,
    client_challenge: Option<[u8; 8]>,
    client_challenge2: Option<[u8; 8]>,
    secondary_key: Option<[u8; 16]>,
    timestamp: Option<[u8; 8]>,
}
impl<'a> AuthenticateMessageBuilder<'a> {
    /// Prepares an answer to `challenge` using `credentials`.
    ///
    /// An empty domain in the credentials is sent as an empty field.
    pub fn new(credentials: &'a Credentials, challenge: &'a ChallengeMessage) -> Self {
        Self {
            credentials,
            challenge,
            workstation: None,
            channel_binding: None,
            client_challenge: None,
            client_challenge2: None,
            secondary_key: None,
            timestamp: None,
        }
    }

    /// Sets the name of the client machine; anything from the first `.` onwards is removed.
    pub fn workstation(mut self, workstation: &str) -> Self {
        self.workstation = Some(strip_dot_suffix(workstation).to_owned());
        self
    }

    /// Binds the authentication to the TLS channel whose server presented `certificate_der`, and
    /// requests a message integrity code over all three messages of the handshake.
    ///
    /// Signing (`NEGOTIATE_SIGN`) must have been negotiated; otherwise [`Self::build`] fails with
    /// [`ConfigurationError::MissingExportedSessionKey`].
    pub fn channel_binding(mut self, certificate_der: &[u8], negotiate_message: &[u8], challenge_message: &[u8]) -> Self {
        self.channel_binding = Some(ChannelBinding {
            certificate_der: Vec::from(certificate_der),
            negotiate_message: Vec::from(negotiate_message),
            challenge_message: Vec::from(challenge_message),
        });
        self
    }

    /// Fixes the client challenge instead of drawing it from the random number generator.
    pub fn client_challenge(mut self, client_challenge: [u8; 8]) -> Self {
        self.client_challenge = Some(client_challenge);
        self
    }

    /// Fixes the second (NTLMv2 blob) client challenge.
    pub fn client_challenge2(mut self, client_challenge2: [u8; 8]) -> Self {
        self.client_challenge2 = Some(client_challenge2);
        self
    }

    /// Fixes the secondary key used for key exchange.
    pub fn secondary_key(mut self, secondary_key: [u8; 16]) -> Self {
        self.secondary_key = Some(secondary_key);
        self
    }

    /// Fixes the timestamp bytes of the NTLMv2 blob instead of deriving them from `now`.
    pub fn timestamp(mut self, timestamp: [u8; 8]) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn engine<R: RngCore>(&self, rng: R, now: DateTime<Utc>, domain: &str) -> CipherEngine<R> {
        let creds = Credentials {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            domain: domain.to_owned(),
        };
        let target_info = match &self.channel_binding {
            Some(cb) => Some(append_channel_bindings(self.challenge.target_info.as_deref(), &cb.certificate_der)),
            None => self.challenge.target_info.clone(),
        };

        let mut engine = CipherEngine::new(rng, now, &creds, self.challenge.challenge, target_info.as_deref());
        if let Some(cc) = self.client_challenge {
            engine = engine.with_client_challenge(cc);
        }
        if let Some(cc2) = self.client_challenge2 {
            engine = engine.with_client_challenge2(cc2);
        }
        if let Some(key) = self.secondary_key {
            engine = engine.with_secondary_key(key);
        }
        if let Some(ts) = self.timestamp {
            engine = engine.with_timestamp(ts);
        }
        engine
    }

    /// Calculates the responses and assembles the Authenticate message.
    ///
    /// `rng` supplies the client challenges and the secondary key unless they have been fixed;
    /// `now` becomes the NTLMv2 timestamp.
    pub fn build<R: RngCore>(&self, rng: R, now: DateTime<Utc>) -> Result<Authentication, Error> {
        let flags = self.challenge.flags;
        let domain = strip_dot_suffix(&self.credentials.domain);
        let mut engine = self.engine(rng, now, domain);

        // the algorithm is chosen on the target info as sent by the server
        let kind = ResponseKind::for_challenge(self.challenge);
        let response = ChallengeResponse::calculate(&mut engine, kind, flags)?;

        let (session_key, exported_session_key) = if flags.contains(Flags::NEGOTIATE_SIGN) {
            if flags.contains(Flags::NEGOTIATE_KEY_EXCHANGE) {
                let exported = engine.secondary_key();
                let encrypted = engine.encrypt_session_key(&response.user_session_key);
                (encrypted.to_vec(), Some(exported))
            } else {
                (response.user_session_key.to_vec(), Some(response.user_session_key))
            }
        } else {
            if self.channel_binding.is_some() {
                return Err(ConfigurationError::MissingExportedSessionKey.into());
            }
            (Vec::new(), None)
        };

        let mut message = AuthenticateMessage {
            lm_response: response.lm_response,
            ntlm_response: response.ntlm_response,
            domain_name: to_uppercase_per_char(domain),
            user_name: self.credentials.username.clone(),
            workstation_name: self.workstation.clone().unwrap_or_default(),
            session_key,
            flags,
            os_version: OsVersion::default(),
            mic: self.channel_binding.as_ref().map(|_| [0u8; MIC_LEN]),
        };

        if let (Some(cb), Some(key)) = (&self.channel_binding, &exported_session_key) {
            let unsigned = message.to_bytes()?;
            let mic = hmac_md5(key, &[&cb.negotiate_message, &cb.challenge_message, &unsigned])?;
            message.mic = Some(mic);
        }

        debug!(
            kind = ?kind,
            flags = ?flags,
            key_exchange = flags.contains(Flags::NEGOTIATE_KEY_EXCHANGE),
            mic = message.mic.is_some(),
            "built Authenticate message",
        );
        Ok(Authentication {
            message,
            kind,
            exported_session_key,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hex_literal::hex;
    use rand::rngs::mock::StepRng;

    use crate::engine::{lm_hash, ntlm_hash, v1_response};
    use crate::rc4::Rc4;

    const CLIENT_CHALLENGE: [u8; 8] = hex!("ffffff0011223344");
    const SECONDARY_KEY: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");

    fn creds() -> Credentials {
        Credentials {
            username: "user".to_owned(),
            password: "SecREt01".to_owned(),
            domain: "domain.example.com".to_owned(),
        }
    }

    fn challenge(flags: Flags) -> ChallengeMessage {
        ChallengeMessage {
            challenge: hex!("0123456789abcdef"),
            flags,
            target_name: Some("DOMAIN".to_owned()),
            target_info: Some(hex!("02000c0044004f004d00410049004e0000000000").to_vec()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2003, 6, 17, 6, 0, 0).unwrap()
    }

    fn build(creds: &Credentials, challenge: &ChallengeMessage) -> Result<Authentication, Error> {
        AuthenticateMessageBuilder::new(creds, challenge)
            .workstation("ws01.example.com")
            .client_challenge(CLIENT_CHALLENGE)
            .client_challenge2(CLIENT_CHALLENGE)
            .secondary_key(SECONDARY_KEY)
            .build(StepRng::new(0, 1), now())
    }

    #[test]
    fn test_path_selection() {
        let v2 = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_TARGET_INFO | Flags::NEGOTIATE_NTLM2_KEY);
        assert_eq!(ResponseKind::for_challenge(&v2), ResponseKind::NtlmV2);

        let mut no_target = v2.clone();
        no_target.target_name = None;
        assert_eq!(ResponseKind::for_challenge(&no_target), ResponseKind::Ntlm2Session);

        let mut no_info = v2.clone();
        no_info.target_info = None;
        no_info.flags.remove(Flags::NEGOTIATE_NTLM2_KEY);
        assert_eq!(ResponseKind::for_challenge(&no_info), ResponseKind::NtlmV1);
    }

    #[test]
    fn test_ntlm_v1_message() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM);
        let auth = build(&creds(), &chal).unwrap();
        assert_eq!(auth.kind, ResponseKind::NtlmV1);
        assert_eq!(auth.exported_session_key, None);

        let msg = &auth.message;
        assert_eq!(msg.lm_response, v1_response(&lm_hash("SecREt01").unwrap(), &chal.challenge).unwrap().to_vec());
        assert_eq!(msg.ntlm_response, v1_response(&ntlm_hash("SecREt01"), &chal.challenge).unwrap().to_vec());
        assert_eq!(msg.domain_name, "DOMAIN");
        assert_eq!(msg.workstation_name, "ws01");
        assert!(msg.session_key.is_empty());

        let bytes = auth.to_bytes().unwrap();
        assert_eq!(&bytes[12..20], &[24, 0, 24, 0, 72, 0, 0, 0]);
        assert_eq!(AuthenticateMessage::try_from(bytes.as_slice()).unwrap(), auth.message);
    }

    #[test]
    fn test_ntlm2_session_message() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM2_KEY | Flags::NEGOTIATE_SIGN);
        let auth = build(&creds(), &chal).unwrap();
        assert_eq!(auth.kind, ResponseKind::Ntlm2Session);
        assert_eq!(&auth.message.lm_response[0..8], &CLIENT_CHALLENGE);
        assert_eq!(&auth.message.lm_response[8..], &[0u8; 16]);
        assert_eq!(auth.message.ntlm_response, hex!("10d550832d12b2ccb79d5ad1f4eed3df82aca4c3681dd455").to_vec());
        // without key exchange the user session key is sent as is
        assert_eq!(auth.message.session_key, hex!("a96f44d84cb68cfb23fc04bbaf381e54").to_vec());
        assert_eq!(auth.exported_session_key, Some(hex!("a96f44d84cb68cfb23fc04bbaf381e54")));
    }

    #[test]
    fn test_key_exchange() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_SIGN | Flags::NEGOTIATE_KEY_EXCHANGE);
        let auth = build(&creds(), &chal).unwrap();
        assert_eq!(auth.exported_session_key, Some(SECONDARY_KEY));

        let mut user_session_key = auth.message.session_key.clone();
        Rc4::new(&SECONDARY_KEY).apply_keystream(&mut user_session_key);
        assert_eq!(user_session_key, hex!("3f373ea8e4af954f14faa506f8eebdc4").to_vec());
    }

    #[test]
    fn test_lanman_key_overrides_user_session_key() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM | Flags::NEGOTIATE_SIGN | Flags::NEGOTIATE_LANMAN_KEY);
        let auth = build(&creds(), &chal).unwrap();
        assert_eq!(auth.message.session_key, hex!("8cc1065bc799112ca1171d50fde4f5de").to_vec());
    }

    #[test]
    fn test_oem_strings() {
        let chal = challenge(Flags::NEGOTIATE_OEM | Flags::NEGOTIATE_NTLM);
        let bytes = build(&creds(), &chal).unwrap().to_bytes().unwrap();
        // LM and NTLM responses, then domain, user and workstation in single-byte encoding
        assert_eq!(&bytes[72 + 48..], b"DOMAINuserws01");
    }

    #[test]
    fn test_domain_uppercase_keeps_length() {
        let mut creds = creds();
        creds.domain = "straße.example".to_owned();
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_NTLM);
        let auth = build(&creds, &chal).unwrap();
        assert_eq!(auth.message.domain_name, "STRAßE");
    }

    #[test]
    fn test_mic_without_signing_fails() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_TARGET_INFO);
        let result = AuthenticateMessageBuilder::new(&creds(), &chal)
            .channel_binding(b"certificate", b"type 1", b"type 2")
            .build(StepRng::new(0, 1), now());
        assert_eq!(result.unwrap_err(), Error::Configuration(ConfigurationError::MissingExportedSessionKey));
    }

    #[test]
    fn test_mic() {
        let chal = challenge(Flags::NEGOTIATE_UNICODE | Flags::NEGOTIATE_TARGET_INFO | Flags::NEGOTIATE_SIGN | Flags::NEGOTIATE_KEY_EXCHANGE);
        let auth = AuthenticateMessageBuilder::new(&creds(), &chal)
            .channel_binding(b"certificate", b"type 1", b"type 2")
            .secondary_key(SECONDARY_KEY)
            .build(StepRng::new(0, 1), now())
            .unwrap();
        assert_eq!(auth.kind, ResponseKind::NtlmV2);

        let bytes = auth.to_bytes().unwrap();
        assert_eq!(&bytes[12..20], &[24, 0, 24, 0, 88, 0, 0, 0]);

        let mut unsigned = bytes.clone();
        unsigned[72..88].fill(0);
        let expected = hmac_md5(&SECONDARY_KEY, &[b"type 1", b"type 2", &unsigned]).unwrap();
        assert_eq!(&bytes[72..88], &expected);

        let parsed = AuthenticateMessage::try_from(bytes.as_slice()).unwrap();
        assert_eq!(parsed.mic, Some(expected));
        assert_eq!(parsed, auth.message);
    }
}
