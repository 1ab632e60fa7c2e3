use std::fmt::{Debug, Display};
use std::net::AddrParseError;
use std::sync::PoisonError;
use std::{fmt, io, result};

use crate::dbbat::store::FailureReason;

#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    ClosedError,
    PoisonError,
    ProtocolError(String),
    StringError(String),
    /// An authentication/authorization failure with its taxonomy entry.
    /// The message is safe to surface to the client.
    AuthError(FailureReason, String),
    CryptoError(String),
    IOError(io::Error),
    YAMLError(serde_yaml::Error),
    TlsError(rustls::Error),
    UTF8Error(std::str::Utf8Error),
    ArrayFromSliceError(std::array::TryFromSliceError),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::ProtocolError(s.to_string())),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn auth<S: ToString>(reason: FailureReason, msg: S) -> Self {
        Error {
            err: Box::new(ErrorKind::AuthError(reason, msg.to_string())),
        }
    }

    pub fn crypto<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::CryptoError(s.to_string())),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.err, ErrorKind::ClosedError)
    }

    /// Returns the failure_reason taxonomy entry for auth/authz errors.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &*self.err {
            ErrorKind::AuthError(reason, _) => Some(*reason),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::new(err)
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::new(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::TlsError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err)),
        }
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Error {
            err: Box::new(ErrorKind::ArrayFromSliceError(err)),
        }
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::new(err)
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ClosedError => f.write_str("socket/file is closed"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::ProtocolError(s) => write!(f, "protocol violation: {}", s),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::AuthError(reason, s) => write!(f, "{} ({})", s, reason),
            ErrorKind::CryptoError(s) => f.write_str(s),
            ErrorKind::IOError(e) => Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => Display::fmt(&e, f),
            ErrorKind::TlsError(e) => Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => Display::fmt(&e, f),
            ErrorKind::ArrayFromSliceError(e) => Display::fmt(&e, f),
        }
    }
}
