//! Length-prefixed framing of the control channel.
//!
//! Wire format:
//! ```text
//! [length:4, big-endian][payload:length]
//! ```

use crate::error::{ControlError, Result};

/// Size of the length header
pub const HEADER_SIZE: usize = 4;

/// Largest payload either side may send
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

const INITIAL_CAPACITY: usize = 256;

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ControlError::OversizeMessage(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental deframer.
///
/// Bytes may arrive split at any position; each complete payload is handed
/// to the callback exactly once, in order.
#[derive(Debug)]
pub struct FrameDecoder {
    header: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    /// Declared length of the payload being read, `None` while in the header
    expected: Option<usize>,
    filled: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            header: [0; HEADER_SIZE],
            payload: vec![0; INITIAL_CAPACITY],
            expected: None,
            filled: 0,
        }
    }

    /// Current payload buffer capacity
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.expected.is_none() && self.filled == 0
    }

    /// Consume `data`, calling `on_frame` for every payload it completes.
    ///
    /// An oversize length header, or an error returned by `on_frame`, stops
    /// processing; the decoder must not be fed again afterwards.
    pub fn feed<F>(&mut self, mut data: &[u8], mut on_frame: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        while !data.is_empty() {
            match self.expected {
                None => {
                    let n = (HEADER_SIZE - self.filled).min(data.len());
                    self.header[self.filled..self.filled + n].copy_from_slice(&data[..n]);
                    self.filled += n;
                    data = &data[n..];
                    if self.filled < HEADER_SIZE {
                        continue;
                    }

                    let length = u32::from_be_bytes(self.header) as usize;
                    if length > MAX_MESSAGE_SIZE {
                        return Err(ControlError::OversizeMessage(length));
                    }
                    if length > self.payload.len() {
                        let capacity = length.next_power_of_two().min(MAX_MESSAGE_SIZE);
                        self.payload = vec![0; capacity];
                    }
                    self.filled = 0;
                    if length == 0 {
                        on_frame(&[])?;
                    } else {
                        self.expected = Some(length);
                    }
                }
                Some(length) => {
                    let n = (length - self.filled).min(data.len());
                    self.payload[self.filled..self.filled + n].copy_from_slice(&data[..n]);
                    self.filled += n;
                    data = &data[n..];
                    if self.filled == length {
                        self.expected = None;
                        self.filled = 0;
                        on_frame(&self.payload[..length])?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
