use crate::error::{DriverError, DriverResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

pub const HEADER_SIZE: usize = 24;
pub const MAX_KEY_LEN: usize = 65535;
pub const MAX_EXTRAS_LEN: usize = 255;

/// Response flag bit marking a gzip-compressed value.
const FLAG_GZIP: u32 = 0x0002;
/// Response flags word marking a boolean value.
const FLAG_BOOLEAN: u32 = 0x0100;
/// Exclusive upper bound of the flags range marking an unsigned integer.
const FLAG_NUMBER_CEIL: u32 = 0x0600;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
}

impl From<Magic> for u8 {
    #[inline]
    fn from(magic: Magic) -> Self {
        magic as u8
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    Touch = 0x1c,
    Hello = 0x1f,
    SaslList = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    GetClusterConfig = 0xb5,
}

impl Opcode {
    /// The quiet counterpart used when pipelining, where one is defined.
    /// Quiet opcodes instruct the server to suppress success replies.
    #[inline]
    pub fn quiet(self) -> Option<Opcode> {
        match self {
            Opcode::Get => Some(Opcode::GetQ),
            Opcode::Set => Some(Opcode::SetQ),
            Opcode::Add => Some(Opcode::AddQ),
            Opcode::Replace => Some(Opcode::ReplaceQ),
            Opcode::Delete => Some(Opcode::DeleteQ),
            Opcode::Increment => Some(Opcode::IncrementQ),
            Opcode::Decrement => Some(Opcode::DecrementQ),
            Opcode::Quit => Some(Opcode::QuitQ),
            Opcode::Flush => Some(Opcode::FlushQ),
            Opcode::GetK => Some(Opcode::GetKQ),
            _ => None,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Opcode> {
        let opcode = match raw {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x13 => Opcode::ReplaceQ,
            0x14 => Opcode::DeleteQ,
            0x15 => Opcode::IncrementQ,
            0x16 => Opcode::DecrementQ,
            0x17 => Opcode::QuitQ,
            0x18 => Opcode::FlushQ,
            0x1c => Opcode::Touch,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslList,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x83 => Opcode::GetReplica,
            0x89 => Opcode::SelectBucket,
            0xb5 => Opcode::GetClusterConfig,
            _ => return None,
        };
        Some(opcode)
    }
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    Ok,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArgs,
    NotStored,
    BadDelta,
    NotMyVbucket,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    Busy,
    Other(u16),
}

impl Status {
    pub fn from_u16(raw: u16) -> Status {
        match raw {
            0x0000 => Status::Ok,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArgs,
            0x0005 => Status::NotStored,
            0x0006 => Status::BadDelta,
            0x0007 => Status::NotMyVbucket,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0085 => Status::Busy,
            other => Status::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::Ok => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArgs => 0x0004,
            Status::NotStored => 0x0005,
            Status::BadDelta => 0x0006,
            Status::NotMyVbucket => 0x0007,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Busy => 0x0085,
            Status::Other(raw) => raw,
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::NotStored => write!(f, "not stored"),
            Status::BadDelta => write!(f, "bad delta"),
            Status::NotMyVbucket => write!(f, "not my vbucket"),
            Status::AuthError => write!(f, "authentication error"),
            Status::AuthContinue => write!(f, "authentication continue"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::Busy => write!(f, "busy"),
            Status::Other(raw) => write!(f, "status 0x{:04x}", raw),
        }
    }
}

/// Decoded response value, derived from the 4-byte flags word that leads the
/// extras of Get-family responses.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    /// Raw value bytes.
    Bytes(Vec<u8>),
    /// Raw value bytes the server flagged as gzip-compressed. Surfacing the
    /// content encoding is the caller's concern.
    Gzipped(Vec<u8>),
    Bool(bool),
    /// Unsigned integer transmitted as big-endian bytes, 1 to 8 bytes wide.
    Uint(u64),
    /// Response with an empty value; carries the reply status instead.
    Status(Status),
}

/// A single protocol packet: the fixed 24-byte header plus its owned
/// variable-length sections. Requests and responses share the layout; the
/// sixth header word holds the vbucket id on requests and the status on
/// responses.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: Opcode,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Routing-only flag: target the vbucket replica instead of the primary.
    /// Never serialized.
    pub is_replica: bool,
}

impl Packet {
    /// A zeroed request packet for `opcode`.
    #[inline]
    pub fn request(opcode: Opcode) -> Packet {
        Packet {
            magic: Magic::Request,
            opcode,
            data_type: 0,
            vbucket_or_status: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
            is_replica: false,
        }
    }

    /// The reply status. Only meaningful on response packets.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u16(self.vbucket_or_status)
    }

    /// Serializes the packet. The three length fields are recomputed from
    /// the actual payload sections before writing; the header integers are
    /// big-endian.
    pub fn encode<W: Write>(&self, stream: &mut W) -> DriverResult<()> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(DriverError::KeyTooLarge(self.key.len()));
        }

        if self.extras.len() > MAX_EXTRAS_LEN {
            return Err(DriverError::ExtrasTooLarge(self.extras.len()));
        }

        let total = self.extras.len() + self.key.len() + self.value.len();

        stream.write_u8(self.magic.into())?;
        stream.write_u8(self.opcode.into())?;
        stream.write_u16::<BigEndian>(self.key.len() as u16)?;
        stream.write_u8(self.extras.len() as u8)?;
        stream.write_u8(self.data_type)?;
        stream.write_u16::<BigEndian>(self.vbucket_or_status)?;
        stream.write_u32::<BigEndian>(total as u32)?;
        stream.write_u32::<BigEndian>(self.opaque)?;
        stream.write_u64::<BigEndian>(self.cas)?;
        stream.write_all(&self.extras)?;
        stream.write_all(&self.key)?;
        stream.write_all(&self.value)?;

        Ok(())
    }

    /// Reads exactly one packet off the stream: 24 header bytes, then the
    /// extras, key and value sections in that order. Any sub-read returning
    /// fewer bytes than required fails with `ShortRead`.
    pub fn decode<R: Read>(stream: &mut R) -> DriverResult<Packet> {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header)?;

        let mut cursor = &header[..];
        let magic = match cursor.read_u8()? {
            0x80 => Magic::Request,
            0x81 => Magic::Response,
            raw => return Err(DriverError::BadMagic(raw)),
        };
        let opcode_raw = cursor.read_u8()?;
        let opcode = Opcode::from_u8(opcode_raw).ok_or(DriverError::UnknownOpcode(opcode_raw))?;
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let extras_len = cursor.read_u8()? as usize;
        let data_type = cursor.read_u8()?;
        let vbucket_or_status = cursor.read_u16::<BigEndian>()?;
        let total_len = cursor.read_u32::<BigEndian>()?;
        let opaque = cursor.read_u32::<BigEndian>()?;
        let cas = cursor.read_u64::<BigEndian>()?;

        if (total_len as usize) < extras_len + key_len {
            return Err(DriverError::BadLength(total_len));
        }

        let value_len = total_len as usize - extras_len - key_len;

        let mut extras = vec![0u8; extras_len];
        stream.read_exact(&mut extras)?;
        let mut key = vec![0u8; key_len];
        stream.read_exact(&mut key)?;
        let mut value = vec![0u8; value_len];
        stream.read_exact(&mut value)?;

        Ok(Packet {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
            is_replica: false,
        })
    }

    /// Interprets the response value according to the leading flags word of
    /// the extras. Responses without a 4-byte flags word are raw bytes.
    pub fn decoded_value(&self) -> Value {
        if self.extras.len() < 4 {
            return Value::Bytes(self.value.clone());
        }

        let flags = BigEndian::read_u32(&self.extras[..4]);

        if flags & FLAG_GZIP != 0 {
            return Value::Gzipped(self.value.clone());
        }

        if flags == FLAG_BOOLEAN {
            return Value::Bool(self.value.first() == Some(&0x31));
        }

        let is_number = flags > FLAG_BOOLEAN && flags < FLAG_NUMBER_CEIL;

        if is_number && !self.value.is_empty() && self.value.len() <= 8 {
            let number = self
                .value
                .iter()
                .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
            return Value::Uint(number);
        }

        Value::Bytes(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let mut packet = Packet::request(Opcode::Set);
        packet.vbucket_or_status = 0x0123;
        packet.opaque = 0xdead_beef;
        packet.cas = 0x0102_0304_0506_0708;
        packet.extras = vec![0, 0, 0, 0, 0, 0, 0, 60];
        packet.key = b"user:42".to_vec();
        packet.value = b"{\"n\":1}".to_vec();
        packet
    }

    #[test]
    fn test_roundtrip_preserves_all_fields() {
        let packet = sample_packet();

        let mut buffer = Vec::new();
        packet.encode(&mut buffer).unwrap();

        let decoded = Packet::decode(&mut &buffer[..]).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_encode_recomputes_lengths() {
        let packet = sample_packet();

        let mut buffer = Vec::new();
        packet.encode(&mut buffer).unwrap();

        assert_eq!(&buffer[2..4], &[0x00, 0x07]);
        assert_eq!(buffer[4], 8);

        let total = BigEndian::read_u32(&buffer[8..12]) as usize;
        assert_eq!(total, 8 + 7 + 7);
        assert_eq!(buffer.len(), HEADER_SIZE + total);
    }

    #[test]
    fn test_encode_rejects_oversized_key() {
        let mut packet = Packet::request(Opcode::Get);
        packet.key = vec![0u8; MAX_KEY_LEN + 1];

        let mut buffer = Vec::new();
        match packet.encode(&mut buffer) {
            Err(DriverError::KeyTooLarge(len)) => assert_eq!(len, MAX_KEY_LEN + 1),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_oversized_extras() {
        let mut packet = Packet::request(Opcode::Get);
        packet.extras = vec![0u8; MAX_EXTRAS_LEN + 1];

        let mut buffer = Vec::new();
        assert!(packet.encode(&mut buffer).is_err());
    }

    #[test]
    fn test_decode_short_header() {
        let result = Packet::decode(&mut &[0x81u8, 0x00][..]);

        match result {
            Err(DriverError::ShortRead) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_short_body() {
        let packet = sample_packet();
        let mut buffer = Vec::new();
        packet.encode(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 1);

        match Packet::decode(&mut &buffer[..]) {
            Err(DriverError::ShortRead) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut buffer = vec![0u8; HEADER_SIZE];
        buffer[0] = 0x55;

        match Packet::decode(&mut &buffer[..]) {
            Err(DriverError::BadMagic(0x55)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_inconsistent_lengths() {
        let mut packet = Packet::request(Opcode::Get);
        packet.key = b"k".to_vec();

        let mut buffer = Vec::new();
        packet.encode(&mut buffer).unwrap();

        // Claim a total length smaller than the key section.
        buffer[8..12].copy_from_slice(&[0, 0, 0, 0]);

        match Packet::decode(&mut &buffer[..]) {
            Err(DriverError::BadLength(0)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_quiet_table() {
        assert_eq!(Opcode::Get.quiet(), Some(Opcode::GetQ));
        assert_eq!(Opcode::Set.quiet(), Some(Opcode::SetQ));
        assert_eq!(Opcode::Add.quiet(), Some(Opcode::AddQ));
        assert_eq!(Opcode::Replace.quiet(), Some(Opcode::ReplaceQ));
        assert_eq!(Opcode::Delete.quiet(), Some(Opcode::DeleteQ));
        assert_eq!(Opcode::Increment.quiet(), Some(Opcode::IncrementQ));
        assert_eq!(Opcode::Decrement.quiet(), Some(Opcode::DecrementQ));
        assert_eq!(Opcode::Quit.quiet(), Some(Opcode::QuitQ));
        assert_eq!(Opcode::Flush.quiet(), Some(Opcode::FlushQ));
        assert_eq!(Opcode::GetK.quiet(), Some(Opcode::GetKQ));
        assert_eq!(Opcode::Hello.quiet(), None);
        assert_eq!(Opcode::SaslAuth.quiet(), None);
    }

    fn response_with_flags(flags: u32, value: &[u8]) -> Packet {
        let mut packet = Packet::request(Opcode::Get);
        packet.magic = Magic::Response;
        packet.extras = flags.to_be_bytes().to_vec();
        packet.value = value.to_vec();
        packet
    }

    #[test]
    fn test_value_plain_bytes() {
        let mut packet = Packet::request(Opcode::Get);
        packet.value = b"payload".to_vec();

        assert_eq!(packet.decoded_value(), Value::Bytes(b"payload".to_vec()));
    }

    #[test]
    fn test_value_gzip_flag() {
        let packet = response_with_flags(0x0002, b"gz");
        assert_eq!(packet.decoded_value(), Value::Gzipped(b"gz".to_vec()));

        // The gzip bit wins even when combined with other bits.
        let packet = response_with_flags(0x0102, b"gz");
        assert_eq!(packet.decoded_value(), Value::Gzipped(b"gz".to_vec()));
    }

    #[test]
    fn test_value_boolean_flag() {
        assert_eq!(
            response_with_flags(0x0100, b"1").decoded_value(),
            Value::Bool(true)
        );
        assert_eq!(
            response_with_flags(0x0100, b"0").decoded_value(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_value_number_flags() {
        assert_eq!(
            response_with_flags(0x0200, &[0x2a]).decoded_value(),
            Value::Uint(42)
        );
        assert_eq!(
            response_with_flags(0x0400, &[0x01, 0x00, 0x00, 0x00, 0x00]).decoded_value(),
            Value::Uint(0x01_0000_0000)
        );
        // 0x0100 itself is boolean, not a number.
        assert_eq!(
            response_with_flags(0x0100, &[0x31]).decoded_value(),
            Value::Bool(true)
        );
        // Flags at or past the ceiling fall back to raw bytes.
        assert_eq!(
            response_with_flags(0x0600, &[0x2a]).decoded_value(),
            Value::Bytes(vec![0x2a])
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::from_u16(0x0000), Status::Ok);
        assert_eq!(Status::from_u16(0x0007), Status::NotMyVbucket);
        assert_eq!(Status::from_u16(0x0020), Status::AuthError);
        assert_eq!(Status::from_u16(0x0021), Status::AuthContinue);
        assert_eq!(Status::from_u16(0x4242), Status::Other(0x4242));
        assert_eq!(Status::Other(0x4242).as_u16(), 0x4242);
        assert!(Status::Ok.is_ok());
        assert!(!Status::Busy.is_ok());
    }
}
