//! SwingSet kernel: vat c-lists and reference counts, the run queue, the
//! syscall gate with its transcripts, and the vat managers that run vat code
//! in-process, on threads, or in worker processes.

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod kernel_keeper;
pub mod manager;
pub mod meter;
pub mod slog;
pub mod syscall_handler;
pub mod transcript;
pub mod translator;
pub mod vat_keeper;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{KernelConfig, ManagerType, VatOptions};
pub use device::{Device, DeviceTable};
pub use error::{KernelError, ManagerError};
pub use kernel::{Kernel, KernelBuilder};
pub use kernel_keeper::{KernelKeeper, KernelPromise, KernelStats, PromiseStatus, RefCount, RunQueueItem};
pub use manager::{ManagerState, VatManager};
pub use meter::{ComputronMeter, MeterRecord};
pub use slog::{DynSlog, MemorySlog, NullSlog, Slog, SlogEvent, TracingSlog};
pub use vat_keeper::{ClistEntry, MapOptions, VatKeeper, VatStats};

/// Kernel state stays usable after a panic elsewhere; every mutation is a
/// single kv write.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
