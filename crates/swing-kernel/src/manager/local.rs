use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use swing_abi::{VatDelivery, VatDeliveryResult, VatId, VatSyscall};
use swing_liveslots::{LiveSlots, VatBundle};

use super::VatWorker;
use crate::error::ManagerError;
use crate::slog;
use crate::transcript::SyscallGate;

/// Runs liveslots on the kernel's own thread. Syscalls go straight to the
/// gate, so they may block for answers.
pub struct LocalWorker {
    vat_id: VatId,
    bundle: Arc<dyn VatBundle>,
    params: serde_json::Value,
    vat: Option<LiveSlots>,
}

impl LocalWorker {
    pub fn new(vat_id: VatId, bundle: Arc<dyn VatBundle>, params: serde_json::Value) -> Self {
        Self {
            vat_id,
            bundle,
            params,
            vat: None,
        }
    }
}

#[async_trait]
impl VatWorker for LocalWorker {
    async fn start(&mut self, gate: &SyscallGate) -> Result<(), ManagerError> {
        let relay = gate.clone();
        let console = gate.slog();
        let console_vat = self.vat_id.clone();
        let mut vat = LiveSlots::new(
            self.vat_id.to_string(),
            Box::new(move |syscall: VatSyscall| relay.syscall(syscall)),
        )
        .with_console(move |line| slog::vat_console(&console, &console_vat, line));
        vat.start(self.bundle.as_ref(), &self.params)
            .map_err(|err| ManagerError::Startup {
                vat_id: self.vat_id.clone(),
                reason: err.to_string(),
            })?;
        self.vat = Some(vat);
        Ok(())
    }

    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        budget: Option<u64>,
        _gate: &SyscallGate,
    ) -> Result<VatDeliveryResult, ManagerError> {
        let vat = self
            .vat
            .as_mut()
            .ok_or_else(|| ManagerError::WorkerExited(self.vat_id.clone()))?;
        match panic::catch_unwind(AssertUnwindSafe(|| vat.dispatch(delivery, budget))) {
            Ok(result) => Ok(result),
            Err(_) => {
                log::warn!("{}: vat code panicked; dropping its liveslots", self.vat_id);
                self.vat = None;
                Err(ManagerError::WorkerExited(self.vat_id.clone()))
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), ManagerError> {
        self.vat = None;
        Ok(())
    }
}
