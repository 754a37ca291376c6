//! Error types.
//!
//! Parsing a message that is not a well-formed NTLM message of the expected type yields a
//! [`ParsingError`]; a failing cryptographic primitive yields a [`CipherError`]; asking for a
//! message integrity code without the key material to compute one yields a
//! [`ConfigurationError`]. None of these are transient.


use std::fmt;

use digest::InvalidLength;


/// An error that may occur while parsing existing NTLM packets.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ParsingError {
    /// The header is shorter than expected.
    ShortHeader { expected_min_len: usize, obtained_len: usize },

    /// The magic value does not match the expected one.
    MagicMismatch { expected: [u8; 8], obtained: Vec<u8> },

    /// The message type does not match the expected one.
    MessageTypeMismatch { expected: u32, obtained: u32 },

    /// The message type is not one of Negotiate, Challenge or Authenticate.
    UnknownMessageType { obtained: u32 },

    /// A fixed-position field extends beyond the end of the message.
    Truncated { position: usize, length: usize, message_length: usize },

    /// The message was supplied as base64 but could not be decoded.
    InvalidBase64 { message: String },
}
impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortHeader { expected_min_len, obtained_len }
                => write!(f, "header too short (expected at least {} bytes, obtained {})", expected_min_len, obtained_len),
            Self::MagicMismatch { expected, obtained }
                => write!(f, "mismatched magic (expected {:?}, obtained {:?})", expected, obtained),
            Self::MessageTypeMismatch { expected, obtained }
                => write!(f, "NTLM type {} message expected, obtained type {}", expected, obtained),
            Self::UnknownMessageType { obtained }
                => write!(f, "unknown NTLM message type {}", obtained),
            Self::Truncated { position, length, message_length }
                => write!(f, "message too short to contain {} bytes at position {} (message has {} bytes)", length, position, message_length),
            Self::InvalidBase64 { message }
                => write!(f, "failed to decode base64 message: {}", message),
        }
    }
}
impl std::error::Error for ParsingError {
}


/// The cryptographic operation that failed inside a [`CipherError`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherOperation {
    LmHash,
    V1Response,
    V2Response,
    HmacMd5,
    LanManagerSessionKey,
}
impl fmt::Display for CipherOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LmHash => write!(f, "LM hash"),
            Self::V1Response => write!(f, "v1 response"),
            Self::V2Response => write!(f, "v2 response"),
            Self::HmacMd5 => write!(f, "HMAC-MD5"),
            Self::LanManagerSessionKey => write!(f, "LAN Manager session key"),
        }
    }
}

/// A cryptographic primitive failed while deriving an NTLM value.
///
/// The original failure is available through [`std::error::Error::source`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CipherError {
    operation: CipherOperation,
    cause: InvalidLength,
}
impl CipherError {
    pub(crate) fn new(operation: CipherOperation, cause: InvalidLength) -> Self {
        Self {
            operation,
            cause,
        }
    }

    /// The derivation step that failed.
    pub fn operation(&self) -> CipherOperation {
        self.operation
    }
}
impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to calculate {}: {}", self.operation, self.cause)
    }
}
impl std::error::Error for CipherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}


/// The caller requested something the negotiated flags cannot provide.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ConfigurationError {
    /// A message integrity code was requested, but signing was not negotiated, so there is no
    /// exported session key to compute it with.
    MissingExportedSessionKey,
}
impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingExportedSessionKey
                => write!(f, "cannot sign/seal: no exported session key"),
        }
    }
}
impl std::error::Error for ConfigurationError {
}


/// An error that may occur while writing an NTLM packet.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StoringError {
    /// A variable-length field does not fit into the 16-bit length of a security buffer.
    FieldTooLong { length: usize },
}
impl fmt::Display for StoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldTooLong { length }
                => write!(f, "field of {} bytes does not fit into a security buffer", length),
        }
    }
}
impl std::error::Error for StoringError {
}


/// Any error raised while producing an NTLM message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    Parsing(ParsingError),
    Cipher(CipherError),
    Configuration(ConfigurationError),
    Storing(StoringError),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parsing(e) => write!(f, "parsing error: {}", e),
            Self::Cipher(e) => write!(f, "cipher calculation error: {}", e),
            Self::Configuration(e) => write!(f, "configuration error: {}", e),
            Self::Storing(e) => write!(f, "storing error: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parsing(e) => Some(e),
            Self::Cipher(e) => Some(e),
            Self::Configuration(e) => Some(e),
            Self::Storing(e) => Some(e),
        }
    }
}
impl From<ParsingError> for Error {
    fn from(e: ParsingError) -> Self { Self::Parsing(e) }
}
impl From<CipherError> for Error {
    fn from(e: CipherError) -> Self { Self::Cipher(e) }
}
impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Self { Self::Configuration(e) }
}
impl From<StoringError> for Error {
    fn from(e: StoringError) -> Self { Self::Storing(e) }
}
