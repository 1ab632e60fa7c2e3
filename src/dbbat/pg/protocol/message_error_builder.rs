use crate::dbbat::pg::protocol::{ErrorFieldTag, ErrorSeverity, Message, MessageBuilder, Tag};

/// A builder for constructing Postgres wire protocol error messages.
pub struct MessageErrorBuilder(MessageBuilder);

impl MessageErrorBuilder {
    /// Construct a new message builder for Postgres errors
    pub fn new(severity: ErrorSeverity, code: &str, msg: &str) -> Self {
        let tag = if severity <= ErrorSeverity::Warning {
            Tag::NOTICE_RESPONSE
        } else {
            Tag::ERROR_RESPONSE
        };
        let mut builder = MessageErrorBuilder(MessageBuilder::new(tag));
        builder
            .write_field(ErrorFieldTag::SEVERITY, severity.as_str())
            .write_field(ErrorFieldTag::LOCALIZED_SEVERITY, severity.as_str())
            .write_field(ErrorFieldTag::CODE, code)
            .write_field(ErrorFieldTag::MESSAGE, msg);
        builder
    }

    /// Write an error field with the given tag and value
    pub fn write_field(&mut self, field: ErrorFieldTag, s: &str) -> &mut Self {
        self.0.write_byte(field.as_u8());
        self.0.write_str(s);
        self
    }

    /// Complete the message and return it
    pub fn finish(mut self) -> Message {
        self.0.write_byte(ErrorFieldTag::NULL_TERMINATOR.as_u8());
        self.0.finish()
    }
}

/// Return a new ErrorResponse message with severity ERROR.
pub fn new_error(code: &str, msg: &str) -> Message {
    MessageErrorBuilder::new(ErrorSeverity::Error, code, msg).finish()
}

/// Return a new ErrorResponse message with severity FATAL, as sent before
/// closing a client connection during startup.
pub fn new_fatal(code: &str, msg: &str) -> Message {
    MessageErrorBuilder::new(ErrorSeverity::Fatal, code, msg).finish()
}
