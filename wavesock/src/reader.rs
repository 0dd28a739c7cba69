//! Streaming inbound message reader
//!
//! Presents one inbound message as a lazy byte stream that spans frame
//! boundaries: when the current frame is exhausted and FIN has not been
//! seen, the reader drives the connection's frame loop to fetch the next
//! CONTINUATION. Bytes are unmasked with the current frame's key, indexed
//! by their offset within that frame. Finishing early drains and discards
//! the remainder so the connection state machine stays synchronized.

use crate::connection::ReaderState;
use wavesock_core::error::{Error, Result};
use wavesock_core::status::close_code;

/// Lazy byte stream over one inbound message
pub struct MessageReader<'a> {
    state: &'a mut ReaderState,
    is_text: bool,
    seq: u64,
    done: bool,
}

impl std::fmt::Debug for MessageReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("is_text", &self.is_text)
            .field("done", &self.done)
            .finish()
    }
}

impl<'a> MessageReader<'a> {
    pub(crate) fn new(state: &'a mut ReaderState, is_text: bool) -> Self {
        let seq = state.message_seq();
        Self {
            state,
            is_text,
            seq,
            done: false,
        }
    }

    /// True when the message is a text message
    pub fn is_text(&self) -> bool {
        self.is_text
    }

    /// Read up to `buf.len()` message bytes. Returns 0 at end of message.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state.read_payload(buf).await {
                Ok(0) => {
                    if self.state.message_final() {
                        self.done = true;
                        return Ok(0);
                    }
                    // drive the frame loop for the next continuation
                    match self.state.wait_data_frame().await {
                        None => {
                            self.done = true;
                            let error = self
                                .state
                                .connection()
                                .close_due_to(
                                    close_code::PROTOCOL_ERROR,
                                    Error::MessageTruncated,
                                )
                                .await;
                            return Err(error);
                        }
                        Some(is_text) if self.state.message_seq() != self.seq => {
                            // a fresh message arrived after this one was
                            // aborted; hand its first frame back untouched
                            self.state.push_back(is_text);
                            self.done = true;
                            return Err(Error::MessageTruncated);
                        }
                        Some(_) => {}
                    }
                }
                Ok(n) => return Ok(n),
                Err(error) => {
                    self.done = true;
                    let error = self
                        .state
                        .connection()
                        .close_due_to(close_code::PROTOCOL_ERROR, error)
                        .await;
                    return Err(error);
                }
            }
        }
    }

    /// Collect the remainder of the message into a buffer
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Collect the remainder of the message as UTF-8 text
    pub async fn read_to_string(&mut self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Drain and discard the unread remainder of the message
    pub async fn finish(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        while self.read(&mut chunk).await? > 0 {}
        Ok(())
    }
}
