//! Vat managers: one per vat, hiding where the vat's code runs behind a
//! single delivery/replay/shutdown contract.
//!
//! A [`ManagedVat`] owns the parts every strategy shares (transcript,
//! meter, slog) and drives a [`VatWorker`] that does the actual running:
//! [`LocalWorker`] in-process, or a [`RemoteWorker`] over a thread or
//! process [`Transport`].

mod local;
mod remote;
mod subprocess;
mod thread;

use async_trait::async_trait;
use swing_abi::{VatDelivery, VatDeliveryResult, VatId};
use swing_store::{DynTranscriptStore, TranscriptEntry, TranscriptPosition};

use crate::error::ManagerError;
use crate::meter::{self, MeterRecord};
use crate::slog::{self, SlogEvent};
use crate::transcript::SyscallGate;

pub use local::LocalWorker;
pub use remote::{RemoteWorker, Transport};
pub use subprocess::ProcessTransport;
pub use thread::ThreadTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    LoadingBundle,
    Ready,
    Delivering,
    ShutDown,
}

#[async_trait]
pub trait VatManager: Send {
    fn vat_id(&self) -> &VatId;

    fn state(&self) -> ManagerState;

    /// Run one delivery to completion. Vat-level failures come back as an
    /// error result; `Err` means the vat's worker itself is gone or broken.
    async fn deliver(&mut self, delivery: VatDelivery) -> Result<VatDeliveryResult, ManagerError>;

    /// Re-run recorded deliveries from `start`, checking every syscall
    /// against the transcript. `None` when the vat keeps no transcript.
    async fn replay_transcript(
        &mut self,
        start: Option<TranscriptPosition>,
    ) -> Result<Option<u64>, ManagerError>;

    async fn shutdown(&mut self) -> Result<(), ManagerError>;
}

/// Somewhere a vat's code runs.
#[async_trait]
pub trait VatWorker: Send {
    /// Load the bundle and build the root object.
    async fn start(&mut self, gate: &SyscallGate) -> Result<(), ManagerError>;

    /// Apply one delivery, routing every syscall through `gate`.
    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        budget: Option<u64>,
        gate: &SyscallGate,
    ) -> Result<VatDeliveryResult, ManagerError>;

    async fn shutdown(&mut self) -> Result<(), ManagerError>;
}

pub struct ManagedVat<W> {
    vat_id: VatId,
    worker: W,
    gate: SyscallGate,
    meter: Box<dyn MeterRecord>,
    transcripts: Option<DynTranscriptStore>,
    state: ManagerState,
    deliveries: u64,
}

/// Where a starting worker's syscalls are answered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// A new vat. Startup syscalls reach the kernel and are recorded as the
    /// transcript's `startVat` entry.
    Fresh,
    /// A reloaded vat. Startup syscalls are checked against the recorded
    /// `startVat` entry instead.
    Reload,
}

impl<W: VatWorker> ManagedVat<W> {
    /// Start `worker` and return a manager ready for deliveries.
    pub async fn start(
        worker: W,
        gate: SyscallGate,
        meter: Box<dyn MeterRecord>,
        transcripts: Option<DynTranscriptStore>,
        mode: StartMode,
    ) -> Result<Self, ManagerError> {
        let mut vat = Self {
            vat_id: gate.vat_id(),
            worker,
            gate,
            meter,
            transcripts,
            state: ManagerState::Uninitialized,
            deliveries: 0,
        };
        vat.state = ManagerState::LoadingBundle;
        if let Err(err) = vat.start_worker(mode).await {
            vat.state = ManagerState::ShutDown;
            if let Err(shutdown_err) = vat.worker.shutdown().await {
                tracing::debug!(vat = %vat.vat_id, "shutdown after failed start: {shutdown_err}");
            }
            return Err(err);
        }
        vat.state = ManagerState::Ready;
        Ok(vat)
    }

    async fn start_worker(&mut self, mode: StartMode) -> Result<(), ManagerError> {
        let recorded = match (mode, &self.transcripts) {
            (StartMode::Reload, Some(store)) => Some(recorded_startup(store, &self.vat_id)?),
            _ => None,
        };
        let Some(entry) = recorded else {
            self.gate.start_dispatch(&VatDelivery::StartVat);
            self.worker.start(&self.gate).await?;
            if let Some(reason) = self.gate.take_failure() {
                return Err(ManagerError::Startup {
                    vat_id: self.vat_id.clone(),
                    reason,
                });
            }
            return self.gate.finish_dispatch();
        };
        self.gate.start_replay(entry);
        let started = self.worker.start(&self.gate).await;
        // A divergence stays in the gate and fails every later delivery.
        if let Err(err) = self.gate.finish_replay() {
            log::debug!("{}: startup replay failed: {err}", self.vat_id);
            return Ok(());
        }
        started
    }

    async fn run_delivery(
        &mut self,
        delivery: VatDelivery,
        replay: bool,
    ) -> Result<VatDeliveryResult, ManagerError> {
        let slog = self.gate.slog();
        let finish = slog::delivery(&slog, &self.vat_id, self.deliveries, &delivery, replay);
        self.deliveries += 1;
        self.state = ManagerState::Delivering;
        let outcome = self
            .worker
            .deliver(delivery, self.meter.budget(), &self.gate)
            .await;
        self.state = ManagerState::Ready;
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                finish.finish(&VatDeliveryResult::error(err.to_string(), None));
                return Err(err);
            }
        };
        let result = match self.gate.take_failure() {
            Some(reason) => VatDeliveryResult::error(reason, result.usage()),
            None => result,
        };
        let result = meter::settle(self.meter.as_mut(), result);
        finish.finish(&result);
        Ok(result)
    }
}

#[async_trait]
impl<W: VatWorker> VatManager for ManagedVat<W> {
    fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn state(&self) -> ManagerState {
        self.state
    }

    async fn deliver(&mut self, delivery: VatDelivery) -> Result<VatDeliveryResult, ManagerError> {
        if self.state == ManagerState::ShutDown {
            return Err(ManagerError::ShutDown(self.vat_id.clone()));
        }
        if let Some(err) = self.gate.replay_error() {
            return Err(err);
        }
        self.gate.start_dispatch(&delivery);
        let result = self.run_delivery(delivery, false).await?;
        self.gate.finish_dispatch()?;
        Ok(result)
    }

    async fn replay_transcript(
        &mut self,
        start: Option<TranscriptPosition>,
    ) -> Result<Option<u64>, ManagerError> {
        let Some(store) = self.transcripts.clone() else {
            return Ok(None);
        };
        if let Some(err) = self.gate.replay_error() {
            return Err(err);
        }
        let start = start.unwrap_or(0);
        let entries = store.read_from(&self.vat_id, start)?;
        let slog = self.gate.slog();
        slog.write(&SlogEvent::ReplayStart {
            vat_id: self.vat_id.clone(),
            start,
        });
        let mut replayed = 0;
        for (position, entry) in entries {
            // Already consumed when the worker started.
            if matches!(entry.delivery, VatDelivery::StartVat) {
                continue;
            }
            let delivery = entry.delivery.clone();
            self.gate.start_replay(entry);
            let result = self.run_delivery(delivery, true).await?;
            self.gate.finish_replay()?;
            if let Some(message) = result.error_message() {
                log::debug!("{}: replayed delivery {position} failed again: {message}", self.vat_id);
            }
            replayed += 1;
        }
        slog.write(&SlogEvent::ReplayDone {
            vat_id: self.vat_id.clone(),
            deliveries: replayed,
        });
        Ok(Some(replayed))
    }

    async fn shutdown(&mut self) -> Result<(), ManagerError> {
        if self.state == ManagerState::ShutDown {
            return Ok(());
        }
        self.state = ManagerState::ShutDown;
        self.worker.shutdown().await
    }
}

/// The `startVat` entry at the head of a vat's transcript. A vat whose
/// bundle made no startup syscalls may have none.
fn recorded_startup(store: &DynTranscriptStore, vat_id: &VatId) -> Result<TranscriptEntry, ManagerError> {
    let first = store.read_from(vat_id, 0)?.into_iter().next();
    Ok(match first {
        Some((_, entry)) if matches!(entry.delivery, VatDelivery::StartVat) => entry,
        _ => TranscriptEntry::new(VatDelivery::StartVat),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::ComputronMeter;
    use crate::slog::NullSlog;
    use std::sync::Arc;
    use swing_abi::{SyscallResult, Usage, VatSyscall, VatSyscallResult};
    use swing_store::{MemTranscriptStore, TranscriptStore};

    /// Spends a fixed number of computrons per delivery, making one
    /// vatstore read along the way.
    struct Spender {
        computrons: u64,
        read_at_start: bool,
    }

    impl Spender {
        fn new(computrons: u64) -> Self {
            Self {
                computrons,
                read_at_start: false,
            }
        }
    }

    #[async_trait]
    impl VatWorker for Spender {
        async fn start(&mut self, gate: &SyscallGate) -> Result<(), ManagerError> {
            if self.read_at_start {
                gate.syscall(VatSyscall::VatstoreGet { key: "boot".into() });
            }
            Ok(())
        }

        async fn deliver(
            &mut self,
            _delivery: VatDelivery,
            _budget: Option<u64>,
            gate: &SyscallGate,
        ) -> Result<VatDeliveryResult, ManagerError> {
            gate.syscall(VatSyscall::VatstoreGet { key: "k".into() });
            Ok(VatDeliveryResult::ok(Some(Usage {
                computrons: self.computrons,
            })))
        }

        async fn shutdown(&mut self) -> Result<(), ManagerError> {
            Ok(())
        }
    }

    fn gate_with(transcripts: Option<DynTranscriptStore>) -> SyscallGate {
        let handler = |_: &VatSyscall| -> VatSyscallResult { SyscallResult::ok() };
        SyscallGate::new(VatId::from_index(1), Box::new(handler), transcripts, Arc::new(NullSlog))
    }

    fn gate() -> SyscallGate {
        gate_with(None)
    }

    #[tokio::test]
    async fn exhausted_meter_fails_only_that_delivery() {
        let meter = Box::new(ComputronMeter::new(Some(5)));
        let mut vat = ManagedVat::start(Spender::new(9), gate(), meter, None, StartMode::Fresh)
            .await
            .unwrap();
        let result = vat.deliver(VatDelivery::BringOutYourDead).await.unwrap();
        assert_eq!(
            result.error_message(),
            Some("meter exhausted: used 9 computrons of 5")
        );
        assert_eq!(result.usage(), Some(Usage { computrons: 9 }));

        vat.worker.computrons = 2;
        let result = vat.deliver(VatDelivery::BringOutYourDead).await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn no_transcript_means_no_replay() {
        let meter = Box::new(ComputronMeter::unlimited());
        let mut vat = ManagedVat::start(Spender::new(1), gate(), meter, None, StartMode::Fresh)
            .await
            .unwrap();
        assert_eq!(vat.replay_transcript(None).await.unwrap(), None);
        vat.shutdown().await.unwrap();
        assert_eq!(vat.state(), ManagerState::ShutDown);
        assert!(matches!(
            vat.deliver(VatDelivery::BringOutYourDead).await,
            Err(ManagerError::ShutDown(_))
        ));
    }

    #[tokio::test]
    async fn startup_syscalls_are_recorded_then_replayed() {
        let transcripts: DynTranscriptStore = Arc::new(MemTranscriptStore::new());
        let start = |worker: Spender, mode: StartMode| {
            let transcripts = Arc::clone(&transcripts);
            let gate = gate_with(Some(Arc::clone(&transcripts)));
            ManagedVat::start(worker, gate, Box::new(ComputronMeter::unlimited()), Some(transcripts), mode)
        };
        let reader = || Spender {
            computrons: 1,
            read_at_start: true,
        };

        start(reader(), StartMode::Fresh).await.unwrap();
        let recorded = transcripts.read_from(&VatId::from_index(1), 0).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1.delivery, VatDelivery::StartVat);
        assert_eq!(recorded[0].1.syscalls.len(), 1);

        let mut vat = start(reader(), StartMode::Reload).await.unwrap();
        assert_eq!(vat.replay_transcript(None).await.unwrap(), Some(0));
        assert_eq!(transcripts.len(&VatId::from_index(1)).unwrap(), 1);

        // This time the worker skips the read the transcript expects.
        let mut vat = start(Spender::new(1), StartMode::Reload).await.unwrap();
        assert!(matches!(
            vat.deliver(VatDelivery::BringOutYourDead).await,
            Err(ManagerError::Anachrophobia { .. })
        ));
    }
}
