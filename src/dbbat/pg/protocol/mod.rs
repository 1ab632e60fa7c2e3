mod auth_md5;
mod auth_type;
mod command_tag;
pub mod error_codes;
mod errors;
mod message;
mod message_builder;
mod message_error_builder;
mod message_parser;
mod message_reader;
mod row_description;
mod startup_params;
mod tag;

pub use self::auth_md5::hash_md5_password;
pub use self::auth_type::AuthType;
pub use self::command_tag::{parse_command_tag, rows_affected};
pub use self::errors::{ErrorFieldTag, ErrorSeverity, PostgresError};
pub use self::message::Message;
pub use self::message_builder::MessageBuilder;
pub use self::message_error_builder::{new_error, new_fatal, MessageErrorBuilder};
pub use self::message_parser::{Header, MessageParser, MAX_MESSAGE_LEN, MAX_STARTUP_PACKET_LEN, MIN_MESSAGE_LEN};
pub use self::message_reader::MessageReader;
pub use self::row_description::{parse_row_description, FieldDescription, FormatCode};
pub use self::startup_params::{build_application_name, StartupParams, MAX_NAME_LEN};
pub use self::tag::{
    Tag, CANCEL_REQUEST, GSSENC_REQUEST, PROTOCOL_VERSION, SSL_ALLOWED, SSL_NOT_ALLOWED, SSL_REQUEST,
};
