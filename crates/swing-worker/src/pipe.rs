use std::collections::VecDeque;
use std::io::{Read, Write};

use swing_abi::{KernelToWorker, WorkerToKernel};
use swing_codec::{CodecError, NetstringDecoder};

use crate::WorkerError;

const READ_CHUNK: usize = 8 * 1024;

/// Both directions of the kernel link, framed as netstrings.
pub(crate) struct Pipe {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    decoder: NetstringDecoder,
    ready: VecDeque<Vec<u8>>,
}

impl Pipe {
    pub(crate) fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader,
            writer,
            decoder: NetstringDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn send(&mut self, message: &WorkerToKernel) -> Result<(), WorkerError> {
        let frame = message.encode()?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Next kernel message, or `None` on a clean end of input.
    pub(crate) fn recv(&mut self) -> Result<Option<KernelToWorker>, WorkerError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(KernelToWorker::decode(&payload)?));
            }
            let n = self.reader.read(&mut buf)?;
            if n == 0 {
                return if self.decoder.pending().is_empty() {
                    Ok(None)
                } else {
                    Err(WorkerError::Truncated)
                };
            }
            let payloads = self.decoder.feed(&buf[..n]).map_err(CodecError::from)?;
            self.ready.extend(payloads);
        }
    }
}
