//! Netstring framing: `{decimal length}:{bytes},`.
//!
//! Every byte stream between the kernel and an out-of-process vat worker is a
//! sequence of netstrings. [`decode`] handles one buffer; [`NetstringDecoder`]
//! keeps the leftover between reads so frames may be split anywhere.

use thiserror::Error;

/// Length prefixes longer than this cannot describe a sane frame and are
/// rejected before any payload is buffered.
const MAX_PREFIX_DIGITS: usize = 15;

/// Largest payload a frame may announce unless a decoder says otherwise.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetstringError {
    #[error("netstring length prefix is not a non-negative decimal: {0:?}")]
    BadLength(String),
    #[error("netstring length prefix too long")]
    LengthOverflow,
    #[error("netstring frame of {len} bytes not terminated by comma")]
    MissingComma { len: usize },
    #[error("netstring frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Output of [`decode`]: every complete payload plus the unconsumed tail.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Decoded {
    pub payloads: Vec<Vec<u8>>,
    pub leftover: Vec<u8>,
}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let prefix = payload.len().to_string();
    let mut out = Vec::with_capacity(prefix.len() + payload.len() + 2);
    out.extend_from_slice(prefix.as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Decode as many complete frames as `buffer` holds.
pub fn decode(buffer: &[u8]) -> Result<Decoded, NetstringError> {
    decode_bounded(buffer, DEFAULT_MAX_FRAME)
}

fn decode_bounded(buffer: &[u8], max_frame: usize) -> Result<Decoded, NetstringError> {
    let mut payloads = Vec::new();
    let mut start = 0;
    while let Some((payload, consumed)) = decode_one(&buffer[start..], max_frame)? {
        payloads.push(payload.to_vec());
        start += consumed;
    }
    Ok(Decoded {
        payloads,
        leftover: buffer[start..].to_vec(),
    })
}

/// Decode the frame at the head of `buffer`. `Ok(None)` means more bytes are
/// needed; malformed prefixes and oversized frames fail as soon as they are
/// visible, before their payload is buffered.
fn decode_one(buffer: &[u8], max_frame: usize) -> Result<Option<(&[u8], usize)>, NetstringError> {
    let colon = buffer.iter().position(|b| *b == b':');
    let prefix = match colon {
        Some(idx) => &buffer[..idx],
        None => buffer,
    };
    if let Some(bad) = prefix.iter().position(|b| !b.is_ascii_digit()) {
        let shown = String::from_utf8_lossy(&prefix[..=bad]).into_owned();
        return Err(NetstringError::BadLength(shown));
    }
    if prefix.len() > MAX_PREFIX_DIGITS {
        return Err(NetstringError::LengthOverflow);
    }
    let Some(colon) = colon else {
        return Ok(None);
    };
    if prefix.is_empty() {
        return Err(NetstringError::BadLength(String::new()));
    }
    let text = std::str::from_utf8(prefix).map_err(|_| NetstringError::LengthOverflow)?;
    let len: usize = text.parse().map_err(|_| NetstringError::LengthOverflow)?;
    if len > max_frame {
        return Err(NetstringError::FrameTooLarge { len, max: max_frame });
    }
    let body_start = colon + 1;
    let comma = body_start + len;
    if buffer.len() <= comma {
        return Ok(None);
    }
    if buffer[comma] != b',' {
        return Err(NetstringError::MissingComma { len });
    }
    Ok(Some((&buffer[body_start..comma], comma + 1)))
}

/// Streaming decoder that buffers partial frames across chunks.
#[derive(Debug)]
pub struct NetstringDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl Default for NetstringDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl NetstringDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse frames announcing more than `max_frame` payload bytes.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Append `chunk` and return every payload completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, NetstringError> {
        self.buffer.extend_from_slice(chunk);
        let Decoded { payloads, leftover } = decode_bounded(&self.buffer, self.max_frame)?;
        self.buffer = leftover;
        Ok(payloads)
    }

    /// Bytes received but not yet forming a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}
