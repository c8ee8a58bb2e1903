use std::sync::{Arc, Mutex};

use swing_abi::{
    KernelSyscallResult, SyscallData, SyscallResult, VatId, VatSyscall, VatSyscallResult,
};

use crate::device::DeviceTable;
use crate::kernel_keeper::{KernelKeeper, RunQueueItem, VatExit};
use crate::translator::{KernelSyscall, Translator};
use crate::{KernelError, lock};

/// Live answers to a vat's syscalls.
pub trait SyscallHandler: Send {
    fn handle(&mut self, syscall: &VatSyscall) -> VatSyscallResult;
}

impl<F> SyscallHandler for F
where
    F: FnMut(&VatSyscall) -> VatSyscallResult + Send,
{
    fn handle(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        self(syscall)
    }
}

/// Executes one vat's syscalls against shared kernel state.
pub struct KernelSyscallHandler {
    vat_id: VatId,
    keeper: Arc<Mutex<KernelKeeper>>,
    devices: DeviceTable,
}

impl KernelSyscallHandler {
    pub fn new(vat_id: VatId, keeper: Arc<Mutex<KernelKeeper>>, devices: DeviceTable) -> Self {
        Self {
            vat_id,
            keeper,
            devices,
        }
    }

    fn run(&self, keeper: &mut KernelKeeper, syscall: &VatSyscall) -> Result<VatSyscallResult, KernelError> {
        let translated = Translator::new(keeper, &self.vat_id).syscall(syscall)?;
        let result = self.execute(keeper, translated)?;
        Translator::new(keeper, &self.vat_id).syscall_result(&result)
    }

    fn execute(
        &self,
        keeper: &mut KernelKeeper,
        syscall: KernelSyscall,
    ) -> Result<KernelSyscallResult, KernelError> {
        let vat_id = &self.vat_id;
        match syscall {
            KernelSyscall::Send { target, msg } => {
                keeper.push_run_queue(RunQueueItem::Send { target, msg })?;
            }
            KernelSyscall::Invoke { device, method, args } => {
                return Ok(match self.devices.invoke(device, &method, &args) {
                    Ok(data) => SyscallResult::Ok(SyscallData::CapData(data)),
                    Err(reason) => SyscallResult::error(reason),
                });
            }
            KernelSyscall::Subscribe { kpid } => keeper.subscribe(vat_id, kpid)?,
            KernelSyscall::Resolve { kpid, resolution } => {
                keeper.resolve_kernel_promise(kpid, resolution, Some(vat_id))?;
            }
            KernelSyscall::Exit { is_failure, info } => {
                log::debug!("{vat_id} asked to exit (failure: {is_failure})");
                keeper.record_exit(vat_id, VatExit { is_failure, info });
            }
            KernelSyscall::VatstoreGet { key } => {
                let value = keeper.vat(vat_id).vatstore_get(&key);
                return Ok(SyscallResult::Ok(SyscallData::Value(value)));
            }
            KernelSyscall::VatstoreSet { key, value } => keeper.vat(vat_id).vatstore_set(&key, &value),
            KernelSyscall::VatstoreDelete { key } => keeper.vat(vat_id).vatstore_delete(&key),
            KernelSyscall::VatstoreGetAfter {
                prior_key,
                lower_bound,
                upper_bound,
            } => {
                let entry = keeper.vat(vat_id).vatstore_get_after(
                    &prior_key,
                    &lower_bound,
                    upper_bound.as_deref(),
                );
                return Ok(SyscallResult::Ok(SyscallData::Entry(entry)));
            }
            KernelSyscall::Done => {}
        }
        Ok(SyscallResult::ok())
    }
}

impl SyscallHandler for KernelSyscallHandler {
    fn handle(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        let mut keeper = lock(&self.keeper);
        if !keeper.is_live_vat(&self.vat_id) {
            return SyscallResult::error(format!("{} has been terminated", self.vat_id));
        }
        keeper.note_syscall(syscall.kind_name());
        match self.run(&mut keeper, syscall) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("{}: syscall.{} failed: {err}", self.vat_id, syscall.kind_name());
                SyscallResult::error(err.to_string())
            }
        }
    }
}
