use std::convert::TryInto;
use std::num::NonZeroU32;

use bytes::{Buf, BytesMut};

use crate::dbbat::common::{Error, Result};
use crate::dbbat::pg::protocol::{Message, Tag};

pub const MIN_MESSAGE_LEN: u32 = 5;
/// Largest tagged message we accept from either peer. Postgres itself caps
/// messages at 1GB; anything bigger is a corrupt or hostile stream.
pub const MAX_MESSAGE_LEN: u32 = 1 << 30;
/// Postgres rejects startup packets larger than 10000 bytes, so do we.
pub const MAX_STARTUP_PACKET_LEN: u32 = 10000;

pub struct Header {
    pub tag: Tag,
    pub length: NonZeroU32,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>> {
        if (bytes.len() as u32) < MIN_MESSAGE_LEN {
            return Ok(None);
        }
        let tag = Tag::new(bytes[0])?;
        let len = u32::from_be_bytes((&bytes[1..5]).try_into().unwrap());
        if len < 4 || len > MAX_MESSAGE_LEN {
            return Err(Error::protocol_error(format!(
                "invalid length {} for {} message frame",
                len, tag
            )));
        }
        Ok(Some(Header {
            tag,
            length: NonZeroU32::new(len).unwrap(),
        }))
    }

    /// Total message length including the tag byte.
    pub fn len(&self) -> u32 {
        self.length.get() + 1
    }
}

/// Incremental parser splitting complete protocol messages off a receive buffer.
/// Tagged framing is the steady state; the length-only startup framing is
/// handled by next_startup.
pub struct MessageParser {
    data: BytesMut,
}

impl MessageParser {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the next complete tagged message, None if more data is needed.
    pub fn next(&mut self) -> Option<Result<Message>> {
        match Header::parse(self.data.chunk()) {
            Err(e) => Some(Err(e)),
            Ok(None) => None,
            Ok(Some(hdr)) => {
                let msg_len = hdr.len();
                if msg_len <= self.data.len() as u32 {
                    Some(Ok(Message::new(self.data.split_to(msg_len as usize).freeze())))
                } else {
                    // We don't have the full message, make sure the buffer can hold it
                    self.data.reserve(msg_len as usize - self.data.len());
                    None
                }
            }
        }
    }

    /// Returns the next complete startup-style message (4-byte length frame,
    /// no tag byte), None if more data is needed.
    pub fn next_startup(&mut self) -> Option<Result<Message>> {
        let chunk = self.data.chunk();
        if chunk.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes((&chunk[..4]).try_into().unwrap());
        if len < 8 || len > MAX_STARTUP_PACKET_LEN {
            return Some(Err(Error::protocol_error(format!(
                "invalid startup packet length {}",
                len
            ))));
        }
        if len <= self.data.len() as u32 {
            Some(Ok(Message::new_untagged(
                self.data.split_to(len as usize).freeze(),
            )))
        } else {
            self.data.reserve(len as usize - self.data.len());
            None
        }
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}
