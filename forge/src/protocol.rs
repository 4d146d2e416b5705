//! Wire-level framing for the fastboot protocol
//!
//! Replies are fixed 64-byte frames: a four-byte code (`INFO`, `OKAY`,
//! `FAIL`, `DATA`) followed by up to 60 bytes of ASCII payload, NUL
//! padded. Commands arrive as a single bulk write of 1..64 ASCII bytes.

use crate::error::{FastbootError, Result};

/// Reply frame size on the wire.
pub const MAGIC_LENGTH: usize = 64;

/// Length of the reply code prefix.
pub const CODE_LENGTH: usize = 4;

/// Payload capacity of a reply frame.
pub const INFO_PAYLOAD: usize = MAGIC_LENGTH - CODE_LENGTH;

/// Maximum number of tokens in a command line.
pub const MAX_ARGS: usize = 16;

/// Reply code of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Info,
    Okay,
    Fail,
}

impl ReplyCode {
    pub fn as_bytes(self) -> &'static [u8; CODE_LENGTH] {
        match self {
            ReplyCode::Info => b"INFO",
            ReplyCode::Okay => b"OKAY",
            ReplyCode::Fail => b"FAIL",
        }
    }
}

/// One 64-byte reply frame. The size invariant is structural: a frame
/// cannot exist at any other length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame([u8; MAGIC_LENGTH]);

impl ReplyFrame {
    /// Build a frame from a code and payload; payloads over 60 bytes are
    /// truncated.
    pub fn new(code: ReplyCode, payload: &str) -> Self {
        let mut frame = [0u8; MAGIC_LENGTH];
        frame[..CODE_LENGTH].copy_from_slice(code.as_bytes());
        let body = payload.as_bytes();
        let len = body.len().min(INFO_PAYLOAD);
        frame[CODE_LENGTH..CODE_LENGTH + len].copy_from_slice(&body[..len]);
        Self(frame)
    }

    pub fn as_bytes(&self) -> &[u8; MAGIC_LENGTH] {
        &self.0
    }

    /// Frame rendered for logs: code plus payload up to the padding.
    pub fn display(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(MAGIC_LENGTH);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

/// The `DATA%08x` reply sent before a bulk download; 12 ASCII bytes, not
/// a full frame.
pub fn data_reply(size: usize) -> Vec<u8> {
    format!("DATA{size:08x}").into_bytes()
}

/// Split a command line into tokens.
///
/// The command name ends at the first `:` or space; the remaining
/// arguments split on single spaces. At most [`MAX_ARGS`] tokens; any
/// trailing token past that is an error.
pub fn split_command(line: &str) -> Result<Vec<&str>> {
    let (name, rest) = match line.find([':', ' ']) {
        Some(at) => (&line[..at], Some(&line[at + 1..])),
        None => (line, None),
    };

    if name.is_empty() {
        return Err(FastbootError::InvalidParameter);
    }

    let mut args = vec![name];
    if let Some(rest) = rest {
        for token in rest.split(' ').filter(|t| !t.is_empty()) {
            if args.len() == MAX_ARGS {
                return Err(FastbootError::InvalidParameter);
            }
            args.push(token);
        }
    }

    Ok(args)
}
