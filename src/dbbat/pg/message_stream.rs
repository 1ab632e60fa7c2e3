use tokio::io::{AsyncRead, AsyncReadExt};

use crate::dbbat::common::{Error, Result};
use crate::dbbat::pg::protocol::{Message, MessageParser};

/// Reads complete protocol messages off one side of the proxied connection.
pub struct MessageStream<R> {
    conn: R,
    parser: MessageParser,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    pub fn new(conn: R, recv_buffer_size: usize) -> Self {
        Self {
            conn,
            parser: MessageParser::new(recv_buffer_size),
        }
    }

    /// The next tagged message. Err(closed) on clean EOF.
    pub async fn next(&mut self) -> Result<Message> {
        loop {
            if let Some(result) = self.parser.next() {
                return result;
            }
            self.fill().await?;
        }
    }

    /// The next startup-style message (length-only framing): StartupMessage,
    /// SSLRequest, GSSENCRequest or CancelRequest.
    pub async fn next_startup(&mut self) -> Result<Message> {
        loop {
            if let Some(result) = self.parser.next_startup() {
                return result;
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self.conn.read_buf(self.parser.bytes_mut()).await?;
        if n == 0 {
            return Err(Error::closed());
        }
        Ok(())
    }
}
