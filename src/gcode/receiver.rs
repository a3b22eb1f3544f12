// src/gcode/receiver.rs - Receive-side producer: bytes in, parsed commands queued
use std::sync::Arc;
use tokio::sync::Notify;

use super::parser::{parse_line, ParserConfig};
use super::queue::{Enqueued, SharedQueue};

/// Bounded accumulation buffer for one incoming line.
///
/// Bytes past the capacity are discarded until the next terminator, so an
/// over-long line is truncated rather than spilling into the following one. A
/// truncated line normally fails its checksum and is recovered by resend.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    capacity: usize,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Feed one byte. Returns the completed line on `\n` or `\r`.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\n' | b'\r' => {
                if self.buf.is_empty() && !self.overflowed {
                    return None;
                }
                if self.overflowed {
                    tracing::warn!("Received line longer than {} bytes, truncated", self.capacity);
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                self.overflowed = false;
                Some(line)
            }
            _ if self.buf.len() < self.capacity => {
                self.buf.push(byte);
                None
            }
            _ => {
                self.overflowed = true;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Producer handle owned by whatever delivers transport bytes.
///
/// It only parses and enqueues; responses are always written by the main loop.
#[derive(Debug)]
pub struct CommandReceiver {
    line: LineBuffer,
    queue: SharedQueue,
    parser: ParserConfig,
    wake: Arc<Notify>,
}

impl CommandReceiver {
    pub fn new(queue: SharedQueue, parser: ParserConfig, line_capacity: usize, wake: Arc<Notify>) -> Self {
        Self {
            line: LineBuffer::new(line_capacity),
            queue,
            parser,
            wake,
        }
    }

    /// Feed raw transport bytes; every completed line is parsed and enqueued.
    pub fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if let Some(line) = self.line.push(byte) {
                self.receive_line(&line);
            }
        }
    }

    /// Parse and enqueue one complete line.
    pub fn receive_line(&mut self, line: &str) -> Option<Enqueued> {
        let command = parse_line(line, &self.parser);
        if command.is_empty() {
            return None;
        }
        tracing::debug!("Received: {}", command);
        let outcome = self.queue.lock().enqueue(command);
        self.wake.notify_one();
        Some(outcome)
    }
}
