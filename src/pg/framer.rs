//! Message framing.
//!
//! Every backend message is a type byte, an i32 length that counts itself, and
//! the body. The framer buffers reads until a whole message is present and
//! never hands out a partial one. Outgoing messages are collected in a write
//! buffer and sent on [`MessageFramer::flush`].

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::error::{PgError, PgResult};
use super::protocol::{BackendMessage, FrontendMessage};
use super::transport::Transport;

/// Upper bound on a single backend message (the server's own limit is 1 GiB).
const MAX_MESSAGE_LEN: usize = 1 << 30;

const READ_CHUNK: usize = 8192;

pub struct MessageFramer {
    stream: Box<dyn Transport>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl MessageFramer {
    pub fn new(stream: Box<dyn Transport>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Queue a frontend message without sending it.
    pub fn buffer<M: FrontendMessage>(&mut self, msg: &M) {
        msg.encode_to(&mut self.write_buf);
    }

    /// Queue a raw tagged message.
    pub fn buffer_raw(&mut self, tag: u8, payload: &[u8]) {
        self.write_buf.extend_from_slice(&[tag]);
        self.write_buf
            .extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        self.write_buf.extend_from_slice(payload);
    }

    /// Queue and send a single message.
    pub fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer(msg);
        self.flush()
    }

    /// Write out everything buffered.
    pub fn flush(&mut self) -> PgResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        trace!(bytes = self.write_buf.len(), "flush");
        let result = self
            .stream
            .write_all(&self.write_buf)
            .and_then(|_| self.stream.flush());
        self.write_buf.clear();
        result.map_err(PgError::Io)
    }

    /// Receive one raw frame: the type byte and the body.
    pub fn receive(&mut self) -> PgResult<(u8, Bytes)> {
        loop {
            if self.read_buf.len() >= 5 {
                let tag = self.read_buf[0];
                let length = i32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]);
                let length = usize::try_from(length)
                    .ok()
                    .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
                    .ok_or_else(|| {
                        PgError::protocol(format!(
                            "lost synchronization with server: message {:?} has length {}",
                            tag as char, length
                        ))
                    })?;

                let total_len = 1 + length;
                if self.read_buf.len() >= total_len {
                    let mut frame = self.read_buf.split_to(total_len);
                    let body = frame.split_off(5).freeze();
                    trace!(tag = %(tag as char), len = body.len(), "frame");
                    return Ok((tag, body));
                }
                self.read_buf.reserve(total_len - self.read_buf.len());
            }

            self.fill()?;
        }
    }

    /// Receive and decode one backend message.
    pub fn receive_message(&mut self) -> PgResult<BackendMessage> {
        let (tag, body) = self.receive()?;
        BackendMessage::decode(tag, body)
    }

    /// Whether part of a message is already buffered.
    pub fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    fn fill(&mut self) -> PgResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(if self.read_buf.is_empty() {
                        PgError::ConnectionClosed
                    } else {
                        PgError::protocol("server closed the connection in the middle of a message")
                    })
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PgError::Io(e)),
            }
        }
    }

    pub fn into_inner(self) -> Box<dyn Transport> {
        self.stream
    }
}

impl std::fmt::Debug for MessageFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFramer")
            .field("buffered_in", &self.read_buf.len())
            .field("buffered_out", &self.write_buf.len())
            .finish()
    }
}
