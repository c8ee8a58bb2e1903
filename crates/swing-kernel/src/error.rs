use swing_abi::{KernelSlot, SlotError, VatId, VatSlot};
use swing_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("vat manager error: {0}")]
    Manager(#[from] ManagerError),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("vat {0} has been terminated")]
    VatTerminated(VatId),
    #[error("unknown kernel promise {0}")]
    UnknownPromise(KernelSlot),
    #[error("unknown kernel object {0}")]
    UnknownObject(KernelSlot),
    #[error("unknown device {0}")]
    UnknownDevice(KernelSlot),
    #[error("{vat_id} has no c-list entry for {slot}")]
    MissingClistEntry { vat_id: VatId, slot: String },
    #[error("{vat_id}: {slot} is not reachable")]
    Unreachable { vat_id: VatId, slot: String },
    #[error("{vat_id} c-list: {reason}")]
    Clist { vat_id: VatId, reason: String },
    #[error("{vat_id} is not the decider of {kpid}")]
    NotDecider { vat_id: VatId, kpid: KernelSlot },
    #[error("kernel promise {0} is already resolved")]
    AlreadyResolved(KernelSlot),
    #[error("corrupt kernel state at {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("bundle error: {0}")]
    Bundle(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KernelError {
    pub(crate) fn clist(vat_id: &VatId, reason: impl Into<String>) -> Self {
        KernelError::Clist {
            vat_id: vat_id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(vat_id: &VatId, slot: impl ToString) -> Self {
        KernelError::MissingClistEntry {
            vat_id: vat_id.clone(),
            slot: slot.to_string(),
        }
    }

    pub(crate) fn unreachable(vat_id: &VatId, slot: &VatSlot) -> Self {
        KernelError::Unreachable {
            vat_id: vat_id.clone(),
            slot: slot.to_string(),
        }
    }
}

/// Failures at the vat-manager boundary. Every one of them is fatal to the
/// vat, never to the kernel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("anachrophobia in {vat_id}: {reason}")]
    Anachrophobia { vat_id: VatId, reason: String },
    #[error("worker for {0} exited")]
    WorkerExited(VatId),
    #[error("delivery to {vat_id} timed out after {timeout_ms}ms")]
    DeliveryTimeout { vat_id: VatId, timeout_ms: u64 },
    #[error("worker transport for {vat_id}: {reason}")]
    Transport { vat_id: VatId, reason: String },
    #[error("vat {vat_id} failed to start: {reason}")]
    Startup { vat_id: VatId, reason: String },
    #[error("transcript store: {0}")]
    Store(String),
    #[error("vat manager for {0} is shut down")]
    ShutDown(VatId),
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        ManagerError::Store(err.to_string())
    }
}
