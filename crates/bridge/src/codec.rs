use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Splits a byte stream into newline-terminated frames.
///
/// Partial lines stay buffered across `push` calls. A trailing `\r` is
/// stripped so CRLF clients work, and blank lines are skipped. A line longer
/// than `max_frame_bytes` yields a single [`FrameError::TooLong`] and the rest
/// of it is discarded up to the next newline.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') else {
                if !self.discarding && self.buffer.len() > self.max_frame_bytes {
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Err(FrameError::TooLong {
                        limit: self.max_frame_bytes,
                    }));
                }
                if self.discarding {
                    self.buffer.clear();
                }
                return None;
            };

            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_frame_bytes {
                return Some(Err(FrameError::TooLong {
                    limit: self.max_frame_bytes,
                }));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8));
        }
    }

    pub fn frames(&mut self) -> Frames<'_> {
        Frames { codec: self }
    }

    /// Terminates whatever partial line is buffered so the next `frames()`
    /// call yields it. Used at end of stream and after each WebSocket message.
    pub fn finish(&mut self) {
        if self.discarding {
            self.buffer.clear();
            self.discarding = false;
            return;
        }
        if !self.buffer.is_empty() && self.buffer.last() != Some(&b'\n') {
            self.buffer.push(b'\n');
        }
    }
}

pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
}

impl Iterator for Frames<'_> {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.next_frame()
    }
}

/// Serializes `value` as one line, newline included.
pub fn encode_frame<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}
