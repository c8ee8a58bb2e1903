//! In-vat runtime: the object/promise tables that translate between a vat's
//! heap and its vat slots, the marshaller, a cooperative job queue, and the
//! dispatch surface the kernel delivers into.
//!
//! Vat code sees a [`VatContext`]. Eventual sends (`E(x).foo()`) are
//! [`VatContext::send`]; `.then` is [`VatContext::then`]; device calls are
//! [`VatContext::call_now`]. References are dropped explicitly with
//! [`VatContext::forget`] and reclaimed at `bringOutYourDead`.

mod bundle;
mod context;
mod liveslots;
mod marshal;
mod meter;
mod object;
mod value;

pub use bundle::{BundleLoader, BundleRegistry, VatBundle};
pub use context::{PromiseStatus, Settlement, VatContext};
pub use liveslots::LiveSlots;
pub use object::{Far, VatObject, VatResult, arg};
pub use value::{PromiseId, RefId, Value};

use swing_abi::{SlotError, VatSlot, VatSyscall, VatSyscallResult};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LiveSlotsError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("marshal error: {0}")]
    Marshal(String),
    #[error("I don't remember allocating {0}")]
    UnknownExport(VatSlot),
    #[error("unknown promiseID {0}")]
    UnknownPromise(VatSlot),
    #[error("syscall.{name} failed: {reason}")]
    SyscallFailed { name: &'static str, reason: String },
    #[error("meter exhausted: used {used} computrons of {budget}")]
    MeterExhausted { used: u64, budget: u64 },
    #[error("bundle {0:?} not found")]
    UnknownBundle(String),
    #[error("root object must be a local remotable, got {0}")]
    BadRoot(&'static str),
    #[error("bad delivery: {0}")]
    BadDelivery(String),
    #[error("vat error: {0}")]
    Vat(String),
}

/// The kernel side of a vat, as liveslots sees it. Implementations either
/// call the kernel directly or relay over a worker pipe.
pub trait Syscall: Send {
    fn call(&mut self, syscall: VatSyscall) -> VatSyscallResult;
}

impl<F> Syscall for F
where
    F: FnMut(VatSyscall) -> VatSyscallResult + Send,
{
    fn call(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        self(syscall)
    }
}
