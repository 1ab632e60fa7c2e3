use std::fmt;
use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, Bytes};

use crate::dbbat::pg::protocol::{MessageReader, Tag};

/// A single complete Postgres wire protocol message, backed by a shared
/// buffer so forwarding it verbatim is zero-copy.
#[derive(Clone)]
pub struct Message {
    data: Bytes,
    untagged: bool,
}

impl Message {
    /// Wraps a buffer holding one complete tagged message (tag byte + length frame + body).
    pub fn new(buf: Bytes) -> Self {
        Message {
            data: buf,
            untagged: false,
        }
    }

    /// Wraps a buffer holding one complete startup-style message (length frame + body, no tag).
    pub fn new_untagged(buf: Bytes) -> Self {
        Message {
            data: buf,
            untagged: true,
        }
    }

    /// The message Tag, or Tag::UNTAGGED for startup-style messages.
    /// Panics if is_empty().
    pub fn tag(&self) -> Tag {
        if self.untagged {
            Tag::UNTAGGED
        } else {
            Tag::new_unchecked(*self.data.first().expect("empty Message"))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The length of the message including the tag byte and length frame.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Offset of the message body (past the tag byte and length frame).
    pub fn body_start(&self) -> u32 {
        if self.untagged {
            4
        } else {
            5
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.chunk()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Consumes the Message and returns the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn reader(&self) -> MessageReader {
        MessageReader::new(self)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Message{empty}")
        } else {
            write!(f, "Message{{{}, len={}}}", self.tag(), self.len())
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
