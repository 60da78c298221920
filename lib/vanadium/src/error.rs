use crate::net::codec::Status;
use hashbrown::HashMap;
use std::error;
use std::fmt;
use std::io;

pub type DriverResult<T> = Result<T, DriverError>;

/// Error taxonomy of the driver. Every facade operation returns either a
/// value or one of these; nothing panics across the crate boundary.
#[derive(Debug)]
pub enum DriverError {
    /// All config seeds were exhausted, or no seed produced a JSON body.
    ConfigFetch(String),
    /// The bucket is a memcached-type bucket, which has no vbucket map.
    UnsupportedBucketType(String),
    /// The routing table is not initialized, or a replica read targeted a
    /// vbucket with no replica configured.
    NoRoute,
    /// TCP connect failure. A refused connection additionally triggers a
    /// bounded topology reload at the call site.
    Connect { message: String, refused: bool },
    /// A SASL handshake step failed.
    Auth(String),
    /// The SCRAM server signature did not match the expected value.
    BadServerSignature,
    /// A frame sub-read returned fewer bytes than required.
    ShortRead,
    /// The leading magic byte was neither request nor response.
    BadMagic(u8),
    /// A response carried an opcode this driver never sends.
    UnknownOpcode(u8),
    /// The header total length is smaller than the extras and key sections.
    BadLength(u32),
    /// A key exceeded the 16-bit length field.
    KeyTooLarge(usize),
    /// Extras exceeded the 8-bit length field.
    ExtrasTooLarge(usize),
    /// Non-zero status in a response. The message is the response value.
    Server { status: Status, message: String },
    /// The N1QL service rejected or garbled a query.
    Query(String),
    /// Per-packet failures of a multi-packet batch, keyed by request opaque.
    Aggregated(HashMap<u32, DriverError>),
    Io(io::ErrorKind),
}

impl DriverError {
    /// True for server responses that indicate the contacted node no longer
    /// owns the key's vbucket.
    #[inline]
    pub fn is_not_my_vbucket(&self) -> bool {
        match self {
            DriverError::Server { status, .. } => *status == Status::NotMyVbucket,
            _ => false,
        }
    }
}

impl From<io::Error> for DriverError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::UnexpectedEof => DriverError::ShortRead,
            kind => DriverError::Io(kind),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverError::ConfigFetch(detail) => write!(f, "config fetch failed: {}", detail),
            DriverError::UnsupportedBucketType(name) => {
                write!(f, "bucket `{}` is a memcached bucket, which is unsupported", name)
            }
            DriverError::NoRoute => write!(f, "no route: vbucket map not initialized"),
            DriverError::Connect { message, .. } => write!(f, "connect failed: {}", message),
            DriverError::Auth(detail) => write!(f, "authentication failed: {}", detail),
            DriverError::BadServerSignature => {
                write!(f, "authentication failed: bad server signature")
            }
            DriverError::ShortRead => write!(f, "short read on the wire"),
            DriverError::BadMagic(raw) => write!(f, "bad magic byte 0x{:02x}", raw),
            DriverError::UnknownOpcode(raw) => write!(f, "unknown opcode 0x{:02x}", raw),
            DriverError::BadLength(total) => {
                write!(f, "total length {} shorter than extras and key", total)
            }
            DriverError::KeyTooLarge(len) => write!(f, "key length {} exceeds 65535", len),
            DriverError::ExtrasTooLarge(len) => write!(f, "extras length {} exceeds 255", len),
            DriverError::Server { status, message } => match message.is_empty() {
                true => write!(f, "server error: {}", status),
                _ => write!(f, "server error: {}: {}", status, message),
            },
            DriverError::Query(detail) => write!(f, "query failed: {}", detail),
            DriverError::Aggregated(errors) => {
                write!(f, "batch failed for {} packet(s)", errors.len())
            }
            DriverError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

impl error::Error for DriverError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_folds_to_short_read() {
        let err: DriverError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        match err {
            DriverError::ShortRead => (),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_other_io_errors_keep_their_kind() {
        let err: DriverError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        match err {
            DriverError::Io(io::ErrorKind::TimedOut) => (),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_not_my_vbucket_detection() {
        let err = DriverError::Server {
            status: Status::NotMyVbucket,
            message: String::new(),
        };
        assert!(err.is_not_my_vbucket());
        assert!(!DriverError::NoRoute.is_not_my_vbucket());
    }

    #[test]
    fn test_display_server_error() {
        let err = DriverError::Server {
            status: Status::KeyNotFound,
            message: "Not found".into(),
        };
        assert_eq!(err.to_string(), "server error: key not found: Not found");
    }
}
