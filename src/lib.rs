//! An NTLM message engine for Rust.
//!
//! Builds the Negotiate and Authenticate messages of the NTLM challenge-response handshake, parses
//! the server's Challenge message and derives every LM, NTLM, LMv2, NTLMv2 and NTLM2 session value
//! in between.
//!
//! Sample usage:
//! ```
//! use ntlmengine::{AuthenticateMessageBuilder, ChallengeMessage, Credentials, Message, NegotiateMessage};
//!
//! const EWS_URL: &str = "https://example.com/EWS/Exchange.asmx";
//!
//! async fn initialize_authed_client(username: &str, password: &str, domain: &str, local_hostname: &str) -> reqwest::Client {
//!     let nego_msg = Message::Negotiate(NegotiateMessage::new(Some(domain), Some(local_hostname)));
//!     let nego_value = nego_msg.authorization_value()
//!         .expect("failed to encode NTLM negotiation message");
//!
//!     let client = reqwest::Client::builder()
//!         .cookie_store(true)
//!         .build()
//!         .expect("failed to build client");
//!     let resp = client.get(EWS_URL)
//!         .header("Authorization", nego_value)
//!         .send().await
//!         .expect("failed to send challenge request to Exchange");
//!     let challenge_header = resp.headers().get("www-authenticate")
//!         .expect("response missing challenge header");
//!
//!     // we might have been redirected to a specialized authentication URL
//!     let auth_url = resp.url();
//!
//!     let challenge_b64 = challenge_header.to_str()
//!         .expect("challenge header not a string")
//!         .split(" ")
//!         .nth(1).expect("second chunk of challenge header missing");
//!     let challenge = ChallengeMessage::from_base64(challenge_b64)
//!         .expect("decoding challenge message failed");
//!
//!     // calculate the response
//!     let creds = Credentials {
//!         username: username.to_owned(),
//!         password: password.to_owned(),
//!         domain: domain.to_owned(),
//!     };
//!     let auth = AuthenticateMessageBuilder::new(&creds, &challenge)
//!         .workstation(local_hostname)
//!         .build(rand::rngs::OsRng, chrono::Utc::now())
//!         .expect("failed to answer NTLM challenge");
//!     let auth_value = Message::Authenticate(auth.message).authorization_value()
//!         .expect("failed to encode NTLM authentication message");
//!
//!     client.get(auth_url.clone())
//!         .header("Authorization", auth_value)
//!         .send().await
//!         .expect("failed to send authentication request to Exchange")
//!         .error_for_status()
//!         .expect("error response to authentication message");
//!
//!     // try calling again, without the auth stuff (thanks to cookies)
//!     client.get(EWS_URL)
//!         .send().await
//!         .expect("failed to send refresher request to Exchange")
//!         .error_for_status()
//!         .expect("error response to refresher message");
//!
//!     client
//! }
//! ```


mod authenticate;
mod challenge;
mod encoding;
pub mod engine;
mod error;
mod framer;
pub mod md4;
mod negotiate;
pub mod rc4;
pub mod target_info;


use base64::prelude::{BASE64_STANDARD, Engine};
use bitflags::bitflags;

pub use crate::authenticate::{
    AuthenticateMessage, AuthenticateMessageBuilder, Authentication, ChallengeResponse, ResponseKind,
};
pub use crate::challenge::ChallengeMessage;
pub use crate::engine::{CipherEngine, ntlm_timestamp};
pub use crate::error::{CipherError, CipherOperation, ConfigurationError, Error, ParsingError, StoringError};
pub use crate::framer::{MessageType, NTLMSSP_MAGIC, SecurityBuffer};
pub use crate::negotiate::NegotiateMessage;
pub use crate::target_info::{TargetInfoEntry, TargetInfoType};

use crate::framer::peek_message_type;


/// The authentication scheme name used in HTTP `Authorization` and `WWW-Authenticate` headers.
pub const AUTHORIZATION_SCHEME: &str = "NTLM";


/// Standard NTLM credentials, consisting of username, password and domain.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Credentials {
    /// The username part of the credentials.
    pub username: String,

    /// The password part of the credentials.
    pub password: String,

    /// The domain part of the credentials.
    ///
    /// Often specified in combination with the username as `<DOMAIN>\<USERNAME>`. In credentials
    /// without a domain, the domain is an empty string.
    pub domain: String,
}
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}


bitflags! {
    /// NTLM operation flags.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, Ord, PartialEq, PartialOrd)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const UNKNOWN_8 = 0x0000_0008;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LANMAN_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const UNKNOWN_400 = 0x0000_0400;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        const NEGOTIATE_NTLM2_KEY = 0x0008_0000;
        const REQUEST_INIT_RESPONSE = 0x0010_0000;
        const REQUEST_ACCEPT_RESPONSE = 0x0020_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const UNKNOWN_1000000 = 0x0100_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const UNKNOWN_4000000 = 0x0400_0000;
        const UNKNOWN_8000000 = 0x0800_0000;
        const UNKNOWN_10000000 = 0x1000_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}
impl Flags {
    /// The flags sent in a Negotiate message unless others are requested.
    pub fn default_negotiate() -> Self {
        Self::NEGOTIATE_NTLM
            | Self::NEGOTIATE_NTLM2_KEY
            | Self::NEGOTIATE_VERSION
            | Self::NEGOTIATE_ALWAYS_SIGN
            | Self::NEGOTIATE_128BIT
            | Self::NEGOTIATE_56BIT
            | Self::NEGOTIATE_UNICODE
    }
}


/// A structure representing the version of an operating system as well as the NTLM revision used.
///
/// The client always reports Windows XP (5.1.2600); the field is informational only.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OsVersion {
    pub major_version: u8,
    pub minor_version: u8,
    pub build_number: u16,
    pub reserved: [u8; 3],
    pub ntlm_revision: u8,
}
impl OsVersion {
    /// Length of a serialized version structure.
    pub const LEN: usize = 8;

    /// The NTLMSSP revision of this implementation.
    pub const NTLM_REVISION_CURRENT: u8 = 0x0F;

    pub fn new(major_version: u8, minor_version: u8, build_number: u16) -> Self {
        Self {
            major_version,
            minor_version,
            build_number,
            reserved: [0, 0, 0],
            ntlm_revision: Self::NTLM_REVISION_CURRENT,
        }
    }

    /// Serializes the OS version structure into bytes.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let build = self.build_number.to_le_bytes();
        [
            self.major_version,
            self.minor_version,
            build[0],
            build[1],
            self.reserved[0],
            self.reserved[1],
            self.reserved[2],
            self.ntlm_revision,
        ]
    }

    /// Reads a version structure from the first 8 bytes of `bytes`; missing bytes read as 0.
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::LEN];
        let available = bytes.len().min(Self::LEN);
        buf[..available].copy_from_slice(&bytes[..available]);
        Self {
            major_version: buf[0],
            minor_version: buf[1],
            build_number: u16::from_le_bytes([buf[2], buf[3]]),
            reserved: [buf[4], buf[5], buf[6]],
            ntlm_revision: buf[7],
        }
    }
}
impl Default for OsVersion {
    fn default() -> Self {
        Self::new(5, 1, 2600)
    }
}


/// An NTLM message.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Message {
    Negotiate(NegotiateMessage),
    Challenge(ChallengeMessage),
    Authenticate(AuthenticateMessage),
}
impl Message {
    /// Returns the type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Negotiate(_) => MessageType::Negotiate,
            Self::Challenge(_) => MessageType::Challenge,
            Self::Authenticate(_) => MessageType::Authenticate,
        }
    }

    /// Serializes the NTLM message into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoringError> {
        match self {
            Self::Negotiate(t1m) => t1m.to_bytes(),
            Self::Challenge(t2m) => t2m.to_bytes(),
            Self::Authenticate(t3m) => t3m.to_bytes(),
        }
    }

    /// Serializes the NTLM message and encodes it using base64.
    pub fn to_base64(&self) -> Result<String, StoringError> {
        Ok(BASE64_STANDARD.encode(self.to_bytes()?))
    }

    /// Returns the value of an `Authorization` header carrying this message.
    pub fn authorization_value(&self) -> Result<String, StoringError> {
        Ok(format!("{} {}", AUTHORIZATION_SCHEME, self.to_base64()?))
    }

    /// Decodes a base64-encoded NTLM message of any type.
    pub fn from_base64(encoded: &str) -> Result<Self, ParsingError> {
        let bytes = BASE64_STANDARD.decode(encoded.trim())
            .map_err(|e| ParsingError::InvalidBase64 { message: e.to_string() })?;
        Self::try_from(bytes.as_slice())
    }
}
impl TryFrom<&[u8]> for Message {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match peek_message_type(value)? {
            0x0000_0001 => NegotiateMessage::try_from(value)
                .map(Message::Negotiate),
            0x0000_0002 => ChallengeMessage::try_from(value)
                .map(Message::Challenge),
            0x0000_0003 => AuthenticateMessage::try_from(value)
                .map(Message::Authenticate),
            other => Err(ParsingError::UnknownMessageType { obtained: other }),
        }
    }
}
