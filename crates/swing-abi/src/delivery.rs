//! Kernel→vat deliveries, vat→kernel syscalls, and their results.

use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, VatCapData};
use crate::slots::{KernelSlot, VatSlot};

/// An eventual send: method name, arguments, and the promise for its result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S> {
    pub method: String,
    pub args: CapData<S>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<S>,
}

pub type VatMessage = Message<VatSlot>;
pub type KernelMessage = Message<KernelSlot>;

impl<S> Message<S> {
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }
}

impl<S: Clone> Message<S> {
    /// Every slot the message mentions, in wire order.
    pub fn slots(&self) -> Vec<S> {
        let mut slots = self.args.slots.clone();
        slots.extend(self.result.clone());
        slots
    }
}

/// Terminal state of a promise. `redirected` has no variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Resolution<S> {
    FulfilledToPresence { slot: S },
    FulfilledToData { data: CapData<S> },
    Rejected { data: CapData<S> },
}

impl<S: Clone> Resolution<S> {
    pub fn slots(&self) -> Vec<S> {
        match self {
            Resolution::FulfilledToPresence { slot } => vec![slot.clone()],
            Resolution::FulfilledToData { data } | Resolution::Rejected { data } => {
                data.slots.clone()
            }
        }
    }

    pub fn map_slots<T, E>(&self, mut f: impl FnMut(&S) -> Result<T, E>) -> Result<Resolution<T>, E> {
        Ok(match self {
            Resolution::FulfilledToPresence { slot } => {
                Resolution::FulfilledToPresence { slot: f(slot)? }
            }
            Resolution::FulfilledToData { data } => Resolution::FulfilledToData {
                data: data.map_slots(f)?,
            },
            Resolution::Rejected { data } => Resolution::Rejected {
                data: data.map_slots(f)?,
            },
        })
    }
}

impl<S> Resolution<S> {
    pub fn state_name(&self) -> &'static str {
        match self {
            Resolution::FulfilledToPresence { .. } => "fulfilledToPresence",
            Resolution::FulfilledToData { .. } => "fulfilledToData",
            Resolution::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VatDelivery {
    Message { target: VatSlot, msg: VatMessage },
    Notify { vpid: VatSlot, resolution: Resolution<VatSlot> },
    DropExports { vrefs: Vec<VatSlot> },
    RetireExports { vrefs: Vec<VatSlot> },
    RetireImports { vrefs: Vec<VatSlot> },
    BringOutYourDead,
    /// Building the root object. Only ever appears as the first transcript
    /// entry, holding the syscalls the bundle made while starting.
    StartVat,
}

impl VatDelivery {
    pub fn kind_name(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
            VatDelivery::StartVat => "startVat",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VatSlot,
        msg: VatMessage,
    },
    CallNow {
        target: VatSlot,
        method: String,
        args: VatCapData,
    },
    Subscribe {
        vpid: VatSlot,
    },
    Resolve {
        vpid: VatSlot,
        resolution: Resolution<VatSlot>,
    },
    Exit {
        is_failure: bool,
        info: VatCapData,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    VatstoreGetAfter {
        prior_key: String,
        lower_bound: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper_bound: Option<String>,
    },
    DropImports {
        vrefs: Vec<VatSlot>,
    },
    RetireImports {
        vrefs: Vec<VatSlot>,
    },
    RetireExports {
        vrefs: Vec<VatSlot>,
    },
}

impl VatSyscall {
    /// GC syscalls are re-derivable and never recorded in transcripts.
    pub fn is_gc(&self) -> bool {
        matches!(
            self,
            VatSyscall::DropImports { .. }
                | VatSyscall::RetireImports { .. }
                | VatSyscall::RetireExports { .. }
        )
    }

    /// Syscalls whose caller needs a typed answer before continuing.
    pub fn requires_result(&self) -> bool {
        matches!(
            self,
            VatSyscall::CallNow { .. }
                | VatSyscall::VatstoreGet { .. }
                | VatSyscall::VatstoreGetAfter { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::CallNow { .. } => "callNow",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::VatstoreGetAfter { .. } => "vatstoreGetAfter",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
        }
    }
}

/// Payload of a successful syscall.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyscallData<S> {
    Null,
    CapData(CapData<S>),
    Value(Option<String>),
    Entry(Option<(String, String)>),
}

/// `['ok', data]` or `['error', reason]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "camelCase")]
pub enum SyscallResult<S> {
    Ok(SyscallData<S>),
    Error(String),
}

pub type VatSyscallResult = SyscallResult<VatSlot>;
pub type KernelSyscallResult = SyscallResult<KernelSlot>;

impl<S> SyscallResult<S> {
    pub fn ok() -> Self {
        SyscallResult::Ok(SyscallData::Null)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        SyscallResult::Error(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SyscallResult::Ok(_))
    }

    pub fn map_slots<T, E>(&self, f: impl FnMut(&S) -> Result<T, E>) -> Result<SyscallResult<T>, E> {
        Ok(match self {
            SyscallResult::Ok(SyscallData::Null) => SyscallResult::Ok(SyscallData::Null),
            SyscallResult::Ok(SyscallData::CapData(data)) => {
                SyscallResult::Ok(SyscallData::CapData(data.map_slots(f)?))
            }
            SyscallResult::Ok(SyscallData::Value(value)) => {
                SyscallResult::Ok(SyscallData::Value(value.clone()))
            }
            SyscallResult::Ok(SyscallData::Entry(entry)) => {
                SyscallResult::Ok(SyscallData::Entry(entry.clone()))
            }
            SyscallResult::Error(reason) => SyscallResult::Error(reason.clone()),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub computrons: u64,
}

/// `['ok', null, usage?]` or `['error', message, usage?]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum VatDeliveryResult {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl VatDeliveryResult {
    pub fn ok(usage: Option<Usage>) -> Self {
        VatDeliveryResult::Ok { usage }
    }

    pub fn error(message: impl Into<String>, usage: Option<Usage>) -> Self {
        VatDeliveryResult::Error {
            message: message.into(),
            usage,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, VatDeliveryResult::Ok { .. })
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            VatDeliveryResult::Ok { usage } | VatDeliveryResult::Error { usage, .. } => *usage,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            VatDeliveryResult::Error { message, .. } => Some(message),
            VatDeliveryResult::Ok { .. } => None,
        }
    }
}
