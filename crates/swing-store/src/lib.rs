//! Kernel-side storage: the key-value store behind the kernel and vat keepers,
//! and the per-vat transcript logs used for replay.

mod fs_transcript;
mod kv;
mod mem_transcript;
mod transcript;

pub use fs_transcript::FsTranscriptStore;
pub use kv::{KvStore, MemKvStore};
pub use mem_transcript::MemTranscriptStore;
pub use transcript::{TranscriptEntry, TranscriptPosition, TranscriptStore, TranscriptSyscall};

use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynKvStore = Arc<dyn KvStore>;
pub type DynTranscriptStore = Arc<dyn TranscriptStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt transcript: {0}")]
    Corrupt(String),
    #[error("transcript position {position} out of range for {vat_id} (length {len})")]
    PositionOutOfRange {
        vat_id: String,
        position: TranscriptPosition,
        len: TranscriptPosition,
    },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
