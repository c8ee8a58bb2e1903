//! Moves deliveries into a vat's slot space and syscalls out of it,
//! updating the vat's c-list as each one passes.

use swing_abi::{
    KernelCapData, KernelMessage, KernelSlot, KernelSyscallResult, Message, Resolution, SlotKind,
    VatDelivery, VatId, VatSlot, VatSyscall, VatSyscallResult,
};

use crate::KernelError;
use crate::kernel_keeper::KernelKeeper;
use crate::vat_keeper::{MapOptions, VatKeeper};

/// A syscall in kernel terms, ready to execute.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelSyscall {
    Send {
        target: KernelSlot,
        msg: KernelMessage,
    },
    Invoke {
        device: KernelSlot,
        method: String,
        args: KernelCapData,
    },
    Subscribe {
        kpid: KernelSlot,
    },
    Resolve {
        kpid: KernelSlot,
        resolution: Resolution<KernelSlot>,
    },
    Exit {
        is_failure: bool,
        info: KernelCapData,
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
        upper_bound: Option<String>,
    },
    /// GC syscalls finish their c-list work during translation.
    Done,
}

/// Whether a vat forgets a promise ID once it learns this resolution:
/// always for a presence, and for data only when the data names no promises.
pub fn retires_promise_id(resolution: &Resolution<VatSlot>) -> bool {
    match resolution {
        Resolution::FulfilledToPresence { .. } => true,
        Resolution::FulfilledToData { data } | Resolution::Rejected { data } => {
            !data.slots.iter().any(|slot| slot.kind == SlotKind::Promise)
        }
    }
}

pub struct Translator<'a> {
    keeper: &'a mut KernelKeeper,
    vat_id: &'a VatId,
}

impl<'a> Translator<'a> {
    pub fn new(keeper: &'a mut KernelKeeper, vat_id: &'a VatId) -> Self {
        Self { keeper, vat_id }
    }

    fn vat(&mut self) -> VatKeeper<'_> {
        self.keeper.vat(self.vat_id)
    }

    fn to_vat(&mut self, kref: KernelSlot) -> Result<VatSlot, KernelError> {
        self.vat().map_kernel_to_vat(kref, MapOptions::default())
    }

    fn to_kernel(&mut self, vref: VatSlot) -> Result<KernelSlot, KernelError> {
        self.vat().map_vat_to_kernel(vref, MapOptions::default())
    }

    fn lookup(&mut self, vref: VatSlot) -> Result<KernelSlot, KernelError> {
        self.vat().map_vat_to_kernel(vref, MapOptions::LOOKUP)
    }

    fn insist_decider(&self, kpid: KernelSlot) -> Result<(), KernelError> {
        let promise = self.keeper.promise(kpid)?;
        if promise.is_resolved() {
            return Err(KernelError::AlreadyResolved(kpid));
        }
        if promise.decider.as_ref() != Some(self.vat_id) {
            return Err(KernelError::NotDecider {
                vat_id: self.vat_id.clone(),
                kpid,
            });
        }
        Ok(())
    }

    // kernel -> vat

    /// A message for one of this vat's exports. The vat becomes the decider
    /// of the result promise.
    pub fn message(&mut self, target: KernelSlot, msg: &KernelMessage) -> Result<VatDelivery, KernelError> {
        let vat_target = self.to_vat(target)?;
        if !vat_target.allocated_by_vat {
            return Err(KernelError::clist(
                self.vat_id,
                format!("message target {target} is not exported by this vat"),
            ));
        }
        let args = msg.args.map_slots(|kref| self.to_vat(*kref))?;
        let result = match msg.result {
            Some(kpid) => {
                let mut promise = self.keeper.promise(kpid)?;
                if promise.is_resolved() {
                    return Err(KernelError::AlreadyResolved(kpid));
                }
                if let Some(decider) = &promise.decider {
                    return Err(KernelError::clist(
                        self.vat_id,
                        format!("result promise {kpid} is already decided by {decider}"),
                    ));
                }
                promise.decider = Some(self.vat_id.clone());
                self.keeper.set_promise(kpid, &promise)?;
                Some(self.to_vat(kpid)?)
            }
            None => None,
        };
        Ok(VatDelivery::Message {
            target: vat_target,
            msg: Message::new(msg.method.clone(), args, result),
        })
    }

    /// `None` when the vat no longer knows the promise.
    pub fn notify(&mut self, kpid: KernelSlot) -> Result<Option<VatDelivery>, KernelError> {
        let Some((_, vpid)) = self.vat().entry(kpid) else {
            return Ok(None);
        };
        let resolution = self.keeper.promise(kpid)?.resolution.ok_or_else(|| {
            KernelError::clist(self.vat_id, format!("notify for unresolved {kpid}"))
        })?;
        let resolution = resolution.map_slots(|kref| self.to_vat(*kref))?;
        if retires_promise_id(&resolution) {
            self.vat().delete_clist_entry(kpid, vpid)?;
        }
        Ok(Some(VatDelivery::Notify { vpid, resolution }))
    }

    pub fn drop_exports(&mut self, krefs: &[KernelSlot]) -> Result<VatDelivery, KernelError> {
        let mut vrefs = Vec::with_capacity(krefs.len());
        for &kref in krefs {
            let vref = self.vat().map_kernel_to_vat(kref, MapOptions::LOOKUP)?;
            self.vat().clear_reachable_flag(kref)?;
            vrefs.push(vref);
        }
        Ok(VatDelivery::DropExports { vrefs })
    }

    pub fn retire_exports(&mut self, krefs: &[KernelSlot]) -> Result<VatDelivery, KernelError> {
        let mut vrefs = Vec::with_capacity(krefs.len());
        for &kref in krefs {
            let vref = self.vat().map_kernel_to_vat(kref, MapOptions::LOOKUP)?;
            self.vat().delete_clist_entry(kref, vref)?;
            self.keeper.delete_kernel_object(kref);
            vrefs.push(vref);
        }
        Ok(VatDelivery::RetireExports { vrefs })
    }

    pub fn retire_imports(&mut self, krefs: &[KernelSlot]) -> Result<VatDelivery, KernelError> {
        let mut vrefs = Vec::with_capacity(krefs.len());
        for &kref in krefs {
            let vref = self.vat().map_kernel_to_vat(kref, MapOptions::LOOKUP)?;
            self.vat().delete_clist_entry(kref, vref)?;
            vrefs.push(vref);
        }
        Ok(VatDelivery::RetireImports { vrefs })
    }

    // vat -> kernel

    pub fn syscall(&mut self, syscall: &VatSyscall) -> Result<KernelSyscall, KernelError> {
        Ok(match syscall {
            VatSyscall::Send { target, msg } => {
                let target = self.to_kernel(*target)?;
                let args = msg.args.map_slots(|vref| self.to_kernel(*vref))?;
                let result = match msg.result {
                    Some(vpid) => {
                        vpid.insist_kind(SlotKind::Promise)?;
                        let kpid = self.to_kernel(vpid)?;
                        self.insist_decider(kpid)?;
                        // whoever receives the message decides it now
                        let mut promise = self.keeper.promise(kpid)?;
                        promise.decider = None;
                        self.keeper.set_promise(kpid, &promise)?;
                        Some(kpid)
                    }
                    None => None,
                };
                KernelSyscall::Send {
                    target,
                    msg: Message::new(msg.method.clone(), args, result),
                }
            }
            VatSyscall::CallNow { target, method, args } => {
                target.insist_kind(SlotKind::Device)?;
                if let Some(promise) = args.slots.iter().find(|slot| slot.kind == SlotKind::Promise) {
                    return Err(KernelError::clist(
                        self.vat_id,
                        format!("cannot pass promise {promise} to a device"),
                    ));
                }
                let device = self.to_kernel(*target)?;
                let args = args.map_slots(|vref| self.to_kernel(*vref))?;
                KernelSyscall::Invoke {
                    device,
                    method: method.clone(),
                    args,
                }
            }
            VatSyscall::Subscribe { vpid } => {
                vpid.insist_kind(SlotKind::Promise)?;
                KernelSyscall::Subscribe {
                    kpid: self.to_kernel(*vpid)?,
                }
            }
            VatSyscall::Resolve { vpid, resolution } => {
                vpid.insist_kind(SlotKind::Promise)?;
                let kpid = self.lookup(*vpid)?;
                self.insist_decider(kpid)?;
                let kernel_resolution = resolution.map_slots(|vref| self.to_kernel(*vref))?;
                if retires_promise_id(resolution) {
                    self.vat().delete_clist_entry(kpid, *vpid)?;
                }
                KernelSyscall::Resolve {
                    kpid,
                    resolution: kernel_resolution,
                }
            }
            VatSyscall::Exit { is_failure, info } => KernelSyscall::Exit {
                is_failure: *is_failure,
                info: info.map_slots(|vref| self.to_kernel(*vref))?,
            },
            VatSyscall::VatstoreGet { key } => KernelSyscall::VatstoreGet { key: key.clone() },
            VatSyscall::VatstoreSet { key, value } => KernelSyscall::VatstoreSet {
                key: key.clone(),
                value: value.clone(),
            },
            VatSyscall::VatstoreDelete { key } => KernelSyscall::VatstoreDelete { key: key.clone() },
            VatSyscall::VatstoreGetAfter {
                prior_key,
                lower_bound,
                upper_bound,
            } => KernelSyscall::VatstoreGetAfter {
                prior_key: prior_key.clone(),
                lower_bound: lower_bound.clone(),
                upper_bound: upper_bound.clone(),
            },
            VatSyscall::DropImports { vrefs } => {
                for &vref in vrefs {
                    self.insist_object(vref, false, "dropImports")?;
                    let kref = self.lookup(vref)?;
                    self.vat().clear_reachable_flag(kref)?;
                }
                KernelSyscall::Done
            }
            VatSyscall::RetireImports { vrefs } => {
                for &vref in vrefs {
                    self.insist_object(vref, false, "retireImports")?;
                    let kref = self.lookup(vref)?;
                    if self.vat().reachable_flag(kref) {
                        return Err(KernelError::clist(
                            self.vat_id,
                            format!("retireImports: {vref} is still reachable"),
                        ));
                    }
                    self.vat().delete_clist_entry(kref, vref)?;
                }
                KernelSyscall::Done
            }
            VatSyscall::RetireExports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for &vref in vrefs {
                    self.insist_object(vref, true, "retireExports")?;
                    let kref = self.lookup(vref)?;
                    if self.vat().reachable_flag(kref) {
                        return Err(KernelError::clist(
                            self.vat_id,
                            format!("retireExports: {vref} is still reachable"),
                        ));
                    }
                    self.vat().delete_clist_entry(kref, vref)?;
                    krefs.push(kref);
                }
                self.keeper.retire_kernel_objects(&krefs)?;
                KernelSyscall::Done
            }
        })
    }

    fn insist_object(&self, vref: VatSlot, export: bool, syscall: &str) -> Result<(), KernelError> {
        if vref.kind == SlotKind::Object && vref.allocated_by_vat == export {
            return Ok(());
        }
        let expected = if export { "export" } else { "import" };
        Err(KernelError::clist(
            self.vat_id,
            format!("{syscall}: {vref} is not an object {expected}"),
        ))
    }

    /// Map a syscall's answer back into the vat's slot space.
    pub fn syscall_result(&mut self, result: &KernelSyscallResult) -> Result<VatSyscallResult, KernelError> {
        result.map_slots(|kref| self.to_vat(*kref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VatOptions;
    use std::sync::Arc;
    use swing_abi::CapData;
    use swing_store::MemKvStore;

    fn setup() -> (KernelKeeper, VatId, VatId) {
        let mut keeper = KernelKeeper::new(Arc::new(MemKvStore::new()));
        let a = keeper.allocate_vat_id().unwrap();
        keeper.add_vat(&a, &VatOptions::new("echo")).unwrap();
        let b = keeper.allocate_vat_id().unwrap();
        keeper.add_vat(&b, &VatOptions::new("echo")).unwrap();
        (keeper, a, b)
    }

    fn slot(text: &str) -> VatSlot {
        text.parse().unwrap()
    }

    fn send(target: &str, result: Option<&str>, slots: &[&str]) -> VatSyscall {
        VatSyscall::Send {
            target: slot(target),
            msg: Message::new(
                "go",
                CapData::new("[]", slots.iter().map(|s| slot(s)).collect()),
                result.map(slot),
            ),
        }
    }

    #[test]
    fn result_promises_change_hands_with_the_message() {
        let (mut keeper, a, b) = setup();
        let target = keeper.vat(&b).map_vat_to_kernel(slot("o+0"), MapOptions::default()).unwrap();
        let import = keeper.vat(&a).map_kernel_to_vat(target, MapOptions::default()).unwrap();

        let KernelSyscall::Send { msg, .. } = Translator::new(&mut keeper, &a)
            .syscall(&send(&import.to_string(), Some("p+5"), &[]))
            .unwrap()
        else {
            panic!("expected a send");
        };
        let kpid = msg.result.unwrap();
        assert_eq!(keeper.promise(kpid).unwrap().decider, None);

        let delivery = Translator::new(&mut keeper, &b).message(target, &msg).unwrap();
        let VatDelivery::Message { target: vat_target, msg } = delivery else {
            panic!("expected a message");
        };
        assert_eq!(vat_target, slot("o+0"));
        assert_eq!(msg.result, Some(slot("p-1")));
        assert_eq!(keeper.promise(kpid).unwrap().decider, Some(b.clone()));

        // a gave the promise away and may no longer resolve it
        let err = Translator::new(&mut keeper, &a)
            .syscall(&VatSyscall::Resolve {
                vpid: slot("p+5"),
                resolution: Resolution::FulfilledToData { data: CapData::new("1", vec![]) },
            })
            .unwrap_err();
        assert!(matches!(err, KernelError::NotDecider { .. }));
    }

    #[test]
    fn resolving_to_a_presence_retires_the_promise_id() {
        let (mut keeper, a, _) = setup();
        let mut translator = Translator::new(&mut keeper, &a);
        let KernelSyscall::Subscribe { kpid } =
            translator.syscall(&VatSyscall::Subscribe { vpid: slot("p+5") }).unwrap()
        else {
            panic!("expected subscribe");
        };
        let resolved = translator
            .syscall(&VatSyscall::Resolve {
                vpid: slot("p+5"),
                resolution: Resolution::FulfilledToPresence { slot: slot("o+1") },
            })
            .unwrap();
        assert!(matches!(resolved, KernelSyscall::Resolve { kpid: k, .. } if k == kpid));
        assert!(keeper.vat(&a).lookup_vat_slot(slot("p+5")).is_none());
    }

    #[test]
    fn data_naming_promises_keeps_the_promise_id() {
        let with_promise = Resolution::FulfilledToData {
            data: CapData::new("[]", vec![slot("p+6")]),
        };
        let plain = Resolution::Rejected {
            data: CapData::new("[]", vec![slot("o-1")]),
        };
        assert!(!retires_promise_id(&with_promise));
        assert!(retires_promise_id(&plain));
    }

    #[test]
    fn gc_syscalls_check_direction_and_reachability() {
        let (mut keeper, a, b) = setup();
        let kref = keeper.vat(&b).map_vat_to_kernel(slot("o+1"), MapOptions::default()).unwrap();
        let import = keeper.vat(&a).map_kernel_to_vat(kref, MapOptions::default()).unwrap();
        let mut translator = Translator::new(&mut keeper, &a);

        let err = translator
            .syscall(&VatSyscall::RetireImports { vrefs: vec![import] })
            .unwrap_err();
        assert!(err.to_string().contains("still reachable"), "{err}");
        assert!(translator.syscall(&VatSyscall::DropImports { vrefs: vec![slot("o+3")] }).is_err());

        assert_eq!(
            translator.syscall(&VatSyscall::DropImports { vrefs: vec![import] }).unwrap(),
            KernelSyscall::Done
        );
        assert_eq!(
            translator.syscall(&VatSyscall::RetireImports { vrefs: vec![import] }).unwrap(),
            KernelSyscall::Done
        );
        assert!(!keeper.vat(&a).has_entry(kref));
    }

    #[test]
    fn devices_refuse_promises_and_non_devices() {
        let (mut keeper, a, _) = setup();
        let device = keeper.add_device("clock").unwrap();
        let vref = keeper.vat(&a).map_kernel_to_vat(device, MapOptions::default()).unwrap();
        assert_eq!(vref, slot("d-1"));
        let mut translator = Translator::new(&mut keeper, &a);

        let call = |target: VatSlot, slots: Vec<VatSlot>| VatSyscall::CallNow {
            target,
            method: "now".into(),
            args: CapData::new("[]", slots),
        };
        assert!(matches!(
            translator.syscall(&call(vref, vec![])).unwrap(),
            KernelSyscall::Invoke { device: d, .. } if d == device
        ));
        assert!(translator.syscall(&call(vref, vec![slot("p+5")])).is_err());
        assert!(translator.syscall(&call(slot("o+1"), vec![])).is_err());
    }

    #[test]
    fn notify_skips_vats_that_forgot_the_promise() {
        let (mut keeper, a, b) = setup();
        let kpid = keeper.add_kernel_promise(None).unwrap();
        keeper
            .resolve_kernel_promise(kpid, Resolution::FulfilledToData { data: CapData::new("7", vec![]) }, None)
            .unwrap();
        assert_eq!(Translator::new(&mut keeper, &a).notify(kpid).unwrap(), None);

        let vpid = keeper.vat(&b).map_kernel_to_vat(kpid, MapOptions::default()).unwrap();
        let delivery = Translator::new(&mut keeper, &b).notify(kpid).unwrap().unwrap();
        assert_eq!(
            delivery,
            VatDelivery::Notify {
                vpid,
                resolution: Resolution::FulfilledToData { data: CapData::new("7", vec![]) },
            }
        );
        assert!(!keeper.vat(&b).has_entry(kpid));
    }
}
