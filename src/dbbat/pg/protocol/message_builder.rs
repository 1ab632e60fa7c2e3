use bytes::{BufMut, BytesMut};

use crate::dbbat::pg::protocol::{Message, Tag};

/// Builds one or more wire protocol messages into a single buffer so they can
/// be written to a socket in one atomic send. The length frame is patched in
/// when the next message starts or the builder is finished.
pub struct MessageBuilder {
    data: BytesMut,
    start: usize, // start position of the current message being built
    cur_untagged: bool,
    first_untagged: bool,
}

impl MessageBuilder {
    pub fn new(tag: Tag) -> Self {
        let mut builder = MessageBuilder {
            data: BytesMut::with_capacity(256), // typically we build short messages
            start: 0,
            cur_untagged: false,
            first_untagged: tag == Tag::UNTAGGED,
        };
        builder.add_new(tag);
        builder
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Completes the current message and starts a new one with the given tag.
    pub fn add_new(&mut self, tag: Tag) {
        let len = self.len();
        if len != 0 {
            self.complete_message();
            self.start = len;
        }
        self.cur_untagged = tag == Tag::UNTAGGED;
        if !self.cur_untagged {
            self.data.put_u8(tag.as_u8());
        }
        self.data.put_i32(0); // length placeholder
    }

    /// Completes the last message and returns the whole batch.
    /// The Message returned may contain multiple wire messages; it reports
    /// the tag of the first one.
    pub fn finish(mut self) -> Message {
        self.complete_message();
        let untagged = self.first_untagged;
        let buf = self.data.freeze();
        if untagged {
            Message::new_untagged(buf)
        } else {
            Message::new(buf)
        }
    }

    fn complete_message(&mut self) {
        let mut len = self.len() - self.start;
        let mut pos = self.start;
        if !self.cur_untagged {
            pos += 1;
            len -= 1;
        }
        assert!(len >= 4, "message too short");
        self.data[pos..pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
    }

    pub fn write_byte(&mut self, b: u8) {
        self.data.put_u8(b);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_byte(0);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_i16(&mut self, i: i16) {
        self.data.put_i16(i);
    }

    pub fn write_i32(&mut self, i: i32) {
        self.data.put_i32(i);
    }
}
