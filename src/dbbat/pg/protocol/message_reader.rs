use std::convert::TryInto;

use crate::dbbat::common::{Error, Result};
use crate::dbbat::pg::protocol::Message;

/// A reader for reading the content of a Postgres wire protocol message sequentially.
pub struct MessageReader<'a> {
    msg: &'a Message,
    pos: u32, // track position for the read_xxx methods
    read_past_end: bool,
}

impl<'a> MessageReader<'a> {
    /// Create a new Reader positioned at the start of the message body.
    pub fn new(msg: &'a Message) -> Self {
        MessageReader {
            msg,
            pos: msg.body_start(),
            read_past_end: false,
        }
    }

    pub fn len(&self) -> u32 {
        self.msg.len()
    }

    /// Returns an Error if has_error() is true
    pub fn error(&self) -> Result<()> {
        if self.has_error() {
            Err(Error::protocol_error(format!(
                "attempted to read past end of {:?}",
                self.msg
            )))
        } else {
            Ok(())
        }
    }

    /// Returns true if any of the read_* methods attempted to read beyond the end of the Message
    pub fn has_error(&self) -> bool {
        self.read_past_end
    }

    /// Peek at the next byte without changing the position. None if at end.
    pub fn peek(&self) -> Option<u8> {
        self.msg.as_slice().get(self.pos as usize).cloned()
    }

    /// Reads a single byte. Returns 0 past the end, use error() or has_error()
    /// to distinguish that from an actual 0.
    pub fn read_byte(&mut self) -> u8 {
        match self.msg.as_slice().get(self.pos as usize) {
            Some(&b) => {
                self.pos += 1;
                b
            }
            None => {
                self.read_past_end = true;
                0
            }
        }
    }

    /// Reads an i16. Returns 0 past the end, see read_byte.
    pub fn read_i16(&mut self) -> i16 {
        let pos = self.pos as usize;
        match self.msg.as_slice().get(pos..pos + 2) {
            Some(bytes) => {
                self.pos += 2;
                i16::from_be_bytes(bytes.try_into().unwrap())
            }
            None => {
                self.read_past_end = true;
                0
            }
        }
    }

    /// Reads an i32. Returns 0 past the end, see read_byte.
    pub fn read_i32(&mut self) -> i32 {
        let pos = self.pos as usize;
        match self.msg.as_slice().get(pos..pos + 4) {
            Some(bytes) => {
                self.pos += 4;
                i32::from_be_bytes(bytes.try_into().unwrap())
            }
            None => {
                self.read_past_end = true;
                0
            }
        }
    }

    /// Reads and returns a null-terminated utf-8 string
    pub fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_null_terminated_bytes()?;
        std::str::from_utf8(bytes).map_err(Error::from)
    }

    /// Reads and returns a null-terminated slice of bytes
    pub fn read_null_terminated_bytes(&mut self) -> Result<&'a [u8]> {
        let pos = self.pos as usize;
        let bytes = &self.msg.as_slice()[pos..];
        if let Some(i) = memchr::memchr(0, bytes) {
            self.pos = (pos + i + 1) as u32;
            Ok(&bytes[..i])
        } else {
            self.read_past_end = true;
            Err(self.error().unwrap_err())
        }
    }

    /// Reads and returns a slice of bytes of the specified length
    pub fn read_bytes(&mut self, len: u32) -> Result<&'a [u8]> {
        let pos = self.pos;
        let new_pos = pos + len;
        self.seek(new_pos)?;
        Ok(&self.msg.as_slice()[pos as usize..new_pos as usize])
    }

    /// Reads and returns the remainder of the message as a &[u8]
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let pos = self.pos as usize;
        let bytes = &self.msg.as_slice()[pos..];
        self.pos = self.len();
        bytes
    }

    /// Seek to pos, and return the old position.
    /// Returns an error if out of range without changing the position.
    pub fn seek(&mut self, pos: u32) -> Result<u32> {
        if pos > self.len() {
            self.read_past_end = true;
            return Err(self.error().unwrap_err());
        }
        Ok(std::mem::replace(&mut self.pos, pos))
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }
}
