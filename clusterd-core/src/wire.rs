//! Framing: encrypted token followed by a literal terminator. Receivers scan for the
//! terminator byte-for-byte; there is no length prefix.

use crate::cipher::{self, CipherError, ClusterKey};

/// End-of-message marker appended after every token.
pub const TERMINATOR: &[u8] = b"\n\t\t\n";

/// Largest write handed to the socket in one call.
pub const SEND_CHUNK_SIZE: usize = 4096;

/// Largest unterminated frame a receiver will buffer.
pub const MAX_FRAME_LEN: usize = 128 * 1024 * 1024; // 128 MiB

/// Encrypt `plaintext` and append the terminator.
pub fn encode_frame(key: &ClusterKey, plaintext: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = cipher::encrypt(key, plaintext)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.extend_from_slice(TERMINATOR);
    Ok(out)
}

/// Error encoding a frame (encryption or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encrypt error: {0}")]
    Encrypt(#[from] CipherError),
    #[error("frame too large")]
    TooLarge,
}

/// Decrypt one ciphertext unit taken from a [`FrameBuffer`].
pub fn decode_frame(key: &ClusterKey, token: &[u8]) -> Result<Vec<u8>, FrameDecodeError> {
    Ok(cipher::decrypt(key, token)?)
}

/// Error decoding a frame (oversized buffer or failed decryption).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("decrypt error: {0}")]
    Decrypt(#[from] CipherError),
}

/// Position of the first terminator in `haystack`.
pub fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
}

/// Accumulates raw socket chunks until a terminator shows up.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Bytes already searched; a terminator can still straddle this point.
    scanned: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FrameDecodeError> {
        if self.buf.len() + chunk.len() > MAX_FRAME_LEN + TERMINATOR.len() {
            return Err(FrameDecodeError::TooLarge);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Remove and return everything before the first terminator, dropping the terminator.
    /// Bytes after it stay buffered. Returns `None` until a full terminator has arrived.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        let from = self.scanned.saturating_sub(TERMINATOR.len() - 1);
        match find_terminator(&self.buf[from..]) {
            Some(pos) => {
                let end = from + pos;
                let frame = self.buf[..end].to_vec();
                self.buf.drain(..end + TERMINATOR.len());
                self.scanned = 0;
                Some(frame)
            }
            None => {
                self.scanned = self.buf.len();
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
