//! Shared vocabulary between the kernel, vat managers, vat workers and
//! liveslots: slots, capdata, deliveries, syscalls and the worker protocol.

pub mod capdata;
pub mod delivery;
pub mod slots;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use capdata::{CapData, KernelCapData, QCLASS, VatCapData};
pub use delivery::{
    KernelMessage, KernelSyscallResult, Message, Resolution, SyscallData, SyscallResult, Usage,
    VatDelivery, VatDeliveryResult, VatMessage, VatSyscall, VatSyscallResult,
};
pub use slots::{KernelSlot, SlotError, SlotKind, VatSlot};
pub use worker::{KernelToWorker, WorkerToKernel};

/// Kernel-assigned vat identifier (`v1`, `v2`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatId(String);

impl VatId {
    pub fn from_index(index: u64) -> Self {
        VatId(format!("v{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VatId {
    fn from(value: &str) -> Self {
        VatId(value.to_string())
    }
}
