use std::fmt;
use std::fmt::{Display, Formatter};

use strum::EnumString;

use crate::dbbat::common::{Error, Result};
use crate::dbbat::pg::protocol::{Message, Tag};

#[derive(EnumString, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum ErrorSeverity {
    Log,
    Info,
    Debug,
    Notice,
    Warning,
    Error,
    Panic,
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorSeverity::Fatal => "FATAL",
            ErrorSeverity::Panic => "PANIC",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Notice => "NOTICE",
            ErrorSeverity::Debug => "DEBUG",
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Log => "LOG",
        }
    }
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ErrorSeverity {
    fn default() -> Self {
        ErrorSeverity::Error
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ErrorFieldTag(u8);

impl ErrorFieldTag {
    pub const NULL_TERMINATOR: ErrorFieldTag = ErrorFieldTag(0);
    pub const LOCALIZED_SEVERITY: ErrorFieldTag = ErrorFieldTag(b'S');
    pub const SEVERITY: ErrorFieldTag = ErrorFieldTag(b'V');
    pub const CODE: ErrorFieldTag = ErrorFieldTag(b'C');
    pub const MESSAGE: ErrorFieldTag = ErrorFieldTag(b'M');
    pub const MESSAGE_DETAIL: ErrorFieldTag = ErrorFieldTag(b'D');
    pub const MESSAGE_HINT: ErrorFieldTag = ErrorFieldTag(b'H');

    pub const fn new_unchecked(b: u8) -> Self {
        ErrorFieldTag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// An ErrorResponse or NoticeResponse decoded far enough to log, record on a
/// pending query, and match on the SQLSTATE code.
#[derive(Debug, Clone, Default)]
pub struct PostgresError {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl PostgresError {
    pub fn parse(msg: &Message) -> Result<Self> {
        debug_assert!(msg.tag() == Tag::ERROR_RESPONSE || msg.tag() == Tag::NOTICE_RESPONSE);
        let mut r = msg.reader();
        let mut err = PostgresError::default();
        loop {
            let field = r.read_byte();
            r.error()?;
            if field == ErrorFieldTag::NULL_TERMINATOR.as_u8() {
                break;
            }
            let value = r.read_str()?;
            match ErrorFieldTag::new_unchecked(field) {
                ErrorFieldTag::SEVERITY => err.severity = value.to_string(),
                // Fall back to the localized severity for pre-9.6 servers
                ErrorFieldTag::LOCALIZED_SEVERITY => {
                    if err.severity.is_empty() {
                        err.severity = value.to_string();
                    }
                }
                ErrorFieldTag::CODE => err.code = value.to_string(),
                ErrorFieldTag::MESSAGE => err.message = value.to_string(),
                _ => (), // detail, hint, position, ... not needed for auditing
            }
        }
        if err.code.is_empty() && err.message.is_empty() {
            return Err(Error::protocol_error("error response with no code or message"));
        }
        Ok(err)
    }
}

impl Display for PostgresError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}
