//! Binary framing shared by all NTLM messages.
//!
//! Every message starts with the magic value `NTLMSSP\0` and a 32-bit message type. Variable-length
//! fields are stored in a data block after the fixed-size header and located through
//! [`SecurityBuffer`]s in the header.
//!
//! Reading is lenient: integers beyond the end of the message read as 0, and security buffers
//! pointing outside of the message read as zero-filled data of the declared length.


use tracing::trace;

use crate::error::{ParsingError, StoringError};


/// The magic value at the start of every NTLMSSP data packet.
pub const NTLMSSP_MAGIC: [u8; 8] = *b"NTLMSSP\0";

/// Length of the common header: magic and message type.
pub(crate) const COMMON_HEADER_LEN: usize = 8 + 4;


/// The type of an NTLM message, as stored after the magic value.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MessageType {
    Negotiate,
    Challenge,
    Authenticate,
}
impl MessageType {
    /// Returns the 32-bit message number identifying this message type.
    pub fn message_number(&self) -> u32 {
        match self {
            Self::Negotiate => 0x0000_0001,
            Self::Challenge => 0x0000_0002,
            Self::Authenticate => 0x0000_0003,
        }
    }
}


/// An NTLM security buffer, pointing to data contained later in the message.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SecurityBuffer {
    pub length: u16,
    pub capacity: u16,
    pub offset: u32,
}
impl SecurityBuffer {
    /// Length of a serialized security buffer.
    pub const LEN: usize = 8;

    /// Generates a security buffer for the given slice of bytes located at `offset`.
    ///
    /// The length and capacity are both set to the length of the slice.
    pub fn for_slice(slice: &[u8], offset: u32) -> Result<Self, StoringError> {
        let len_u16: u16 = slice.len()
            .try_into()
            .or(Err(StoringError::FieldTooLong { length: slice.len() }))?;
        Ok(Self {
            length: len_u16,
            capacity: len_u16,
            offset,
        })
    }

    /// Serializes the security buffer into bytes.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut ret = [0u8; Self::LEN];
        ret[0..2].copy_from_slice(&self.length.to_le_bytes());
        ret[2..4].copy_from_slice(&self.capacity.to_le_bytes());
        ret[4..8].copy_from_slice(&self.offset.to_le_bytes());
        ret
    }
}


/// Checks the length and magic of a message header and returns the raw message type number.
pub(crate) fn peek_message_type(message: &[u8]) -> Result<u32, ParsingError> {
    if message.len() < COMMON_HEADER_LEN {
        return Err(ParsingError::ShortHeader { expected_min_len: COMMON_HEADER_LEN, obtained_len: message.len() });
    }
    if message[0..8] != NTLMSSP_MAGIC {
        return Err(ParsingError::MagicMismatch { expected: NTLMSSP_MAGIC, obtained: Vec::from(&message[0..8]) });
    }
    Ok(u32::from_le_bytes([message[8], message[9], message[10], message[11]]))
}


/// Lenient reader over a complete NTLM message, including magic and message type.
///
/// All positions are relative to the start of the message.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MessageReader<'a> {
    message: &'a [u8],
}
impl<'a> MessageReader<'a> {
    /// Checks magic and message type before any other field is trusted.
    pub fn new(message: &'a [u8], expected_type: MessageType) -> Result<Self, ParsingError> {
        let message_type = peek_message_type(message)?;
        if message_type != expected_type.message_number() {
            return Err(ParsingError::MessageTypeMismatch { expected: expected_type.message_number(), obtained: message_type });
        }
        Ok(Self { message })
    }

    /// Total length of the message.
    pub fn len(&self) -> usize {
        self.message.len()
    }

    /// Reads a little-endian `u16`, or 0 if the message is too short.
    pub fn read_u16(&self, position: usize) -> u16 {
        match self.message.get(position..position.saturating_add(2)) {
            Some(bs) => u16::from_le_bytes([bs[0], bs[1]]),
            None => 0,
        }
    }

    /// Reads a little-endian `u32`, or 0 if the message is too short.
    pub fn read_u32(&self, position: usize) -> u32 {
        match self.message.get(position..position.saturating_add(4)) {
            Some(bs) => u32::from_le_bytes([bs[0], bs[1], bs[2], bs[3]]),
            None => 0,
        }
    }

    /// Reads a fixed-size field; unlike the other readers, a missing field is an error.
    pub fn read_bytes(&self, position: usize, length: usize) -> Result<&'a [u8], ParsingError> {
        self.message.get(position..position.saturating_add(length))
            .ok_or(ParsingError::Truncated { position, length, message_length: self.message.len() })
    }

    /// Reads the security buffer header stored at `position`.
    pub fn read_security_buffer_header(&self, position: usize) -> SecurityBuffer {
        SecurityBuffer {
            length: self.read_u16(position),
            capacity: self.read_u16(position + 2),
            offset: self.read_u32(position + 4),
        }
    }

    /// Reads the data referenced by the security buffer at `position`.
    ///
    /// If the referenced data lies (partially) outside of the message, a zero-filled buffer of the
    /// declared length is returned instead.
    pub fn read_security_buffer(&self, position: usize) -> Vec<u8> {
        let secbuf = self.read_security_buffer_header(position);
        let length = usize::from(secbuf.length);
        let start = secbuf.offset as usize;
        match self.message.get(start..start.saturating_add(length)) {
            Some(bs) => Vec::from(bs),
            None => {
                trace!(position, offset = secbuf.offset, length, message_length = self.message.len(), "security buffer outside of message; substituting zeroes");
                vec![0u8; length]
            },
        }
    }
}


/// Two-pass writer for NTLM messages.
///
/// The length of the fixed-size header is supplied up front, so the offset of every payload is
/// known when its security buffer is written into the header. Payloads are collected in a
/// separate data block in offset order and appended by [`MessageWriter::finish`].
#[derive(Clone, Debug)]
pub(crate) struct MessageWriter {
    header: Vec<u8>,
    header_len: usize,
    data_block: Vec<u8>,
}
impl MessageWriter {
    /// Starts a message of the given type whose fixed header (including magic and message type)
    /// is `header_len` bytes long.
    pub fn new(message_type: MessageType, header_len: usize) -> Self {
        let mut header = Vec::with_capacity(header_len);
        header.extend_from_slice(&NTLMSSP_MAGIC);
        header.extend_from_slice(&message_type.message_number().to_le_bytes());
        Self {
            header,
            header_len,
            data_block: Vec::new(),
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.header.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes fixed-size bytes into the header.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.header.extend_from_slice(bytes);
    }

    /// Writes a security buffer into the header and queues `data` in the data block.
    pub fn write_security_buffer(&mut self, data: &[u8]) -> Result<(), StoringError> {
        let offset = self.header_len + self.data_block.len();
        let offset_u32: u32 = offset.try_into()
            .or(Err(StoringError::FieldTooLong { length: offset }))?;
        let secbuf = SecurityBuffer::for_slice(data, offset_u32)?;
        self.header.extend_from_slice(&secbuf.to_bytes());
        self.data_block.extend_from_slice(data);
        Ok(())
    }

    /// Joins header and data block into the complete message.
    pub fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(self.header.len(), self.header_len, "header length mismatch");
        self.header.append(&mut self.data_block);
        self.header
    }
}
