//! All possible protocol errors and the SCP wire status codes.

use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Status codes carried in reuse-handshake responses. The numeric values
/// are fixed on the wire.
pub mod status {
    /// The handshake succeeded.
    pub const OK: u16 = 200;
    /// The request did not parse.
    pub const BAD_REQUEST: u16 = 400;
    /// The request MAC did not verify.
    pub const UNAUTHORIZED: u16 = 401;
    /// The handshake counter was not newer than the session's.
    pub const EXPIRED: u16 = 403;
    /// No live session carries the requested id.
    pub const ID_NOT_FOUND: u16 = 404;
    /// The retransmit gap exceeds the replay buffer.
    pub const NOT_ACCEPTABLE: u16 = 406;
    /// Other, usually network-level, failure.
    pub const NETWORK_ERROR: u16 = 501;
}

/// Enumeration of all errors surfaced by sessions, handshakes and the
/// stream wrapper.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A handshake message did not parse, or carried an impossible value
    /// such as a zero public key (wire code 400).
    IllegalMessage,

    /// The reuse request MAC did not verify against the session secret
    /// (wire code 401).
    Unauthorized,

    /// The reuse handshake counter was not strictly newer than the
    /// session's, so the request is a replay or arrived out of order
    /// (wire code 403).
    Expired,

    /// No live session carries the requested id (wire code 404).
    IdNotFound,

    /// The retransmit gap exceeds what the replay buffer still holds
    /// (wire code 406).
    NotAcceptable,

    /// The peer reported a failure that maps to no specific status
    /// (wire code 501).
    NetworkError,

    /// The handshake deadline elapsed before the session went live.
    HandshakeTimeout,

    /// A response signature was required by configuration but was absent
    /// or failed verification.
    BadSignature,

    /// The session is frozen. I/O is refused until a replacement transport
    /// is spliced in; nothing was consumed or recorded.
    Frozen,

    /// The session or stream was closed for good.
    Closed,

    /// An I/O error on the underlying transport.
    Io(ErrorKind),
}

impl Error {
    /// The wire status code this error travels as.
    pub fn code(&self) -> u16 {
        match self {
            Error::IllegalMessage => status::BAD_REQUEST,
            Error::Unauthorized => status::UNAUTHORIZED,
            Error::Expired => status::EXPIRED,
            Error::IdNotFound => status::ID_NOT_FOUND,
            Error::NotAcceptable => status::NOT_ACCEPTABLE,
            _ => status::NETWORK_ERROR,
        }
    }

    /// Maps a non-success wire status code back to an error. Codes this
    /// implementation does not know are reported as [`Error::NetworkError`].
    pub(crate) fn from_status(code: u16) -> Error {
        match code {
            status::BAD_REQUEST => Error::IllegalMessage,
            status::UNAUTHORIZED => Error::Unauthorized,
            status::EXPIRED => Error::Expired,
            status::ID_NOT_FOUND => Error::IdNotFound,
            status::NOT_ACCEPTABLE => Error::NotAcceptable,
            _ => Error::NetworkError,
        }
    }

    /// `Ok` for a success status, the mapped error otherwise.
    pub(crate) fn check_status(code: u16) -> Result<(), Error> {
        if code == status::OK {
            Ok(())
        } else {
            Err(Error::from_status(code))
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::IllegalMessage => write!(f, "400 illegal message"),
            Error::Unauthorized => write!(f, "401 unauthorized"),
            Error::Expired => write!(f, "403 handshake counter expired"),
            Error::IdNotFound => write!(f, "404 session id not found"),
            Error::NotAcceptable => write!(f, "406 not acceptable"),
            Error::NetworkError => write!(f, "501 network error"),
            Error::HandshakeTimeout => write!(f, "handshake timed out"),
            Error::BadSignature => write!(f, "response signature missing or invalid"),
            Error::Frozen => write!(f, "session frozen, waiting for transport replacement"),
            Error::Closed => write!(f, "session closed"),
            Error::Io(kind) => write!(f, "transport error: {}", kind),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Frozen => ErrorKind::ConnectionAborted,
            Error::Closed => ErrorKind::NotConnected,
            Error::HandshakeTimeout => ErrorKind::TimedOut,
            Error::Io(kind) => *kind,
            _ => ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}
