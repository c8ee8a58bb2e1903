//! The syscall gate: every syscall a vat makes passes through here, either
//! to the live kernel (and into the transcript) or, during replay, against
//! the recorded transcript.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use swing_abi::{SyscallResult, VatDelivery, VatId, VatSyscall, VatSyscallResult};
use swing_codec::djson;
use swing_store::{DynTranscriptStore, TranscriptEntry, TranscriptSyscall};

use crate::error::ManagerError;
use crate::lock;
use crate::slog::{self, DynSlog};
use crate::syscall_handler::SyscallHandler;

/// Builds one transcript entry per delivery and checks replayed syscalls.
pub struct TranscriptRecorder {
    vat_id: VatId,
    store: Option<DynTranscriptStore>,
    current: Option<TranscriptEntry>,
    expected: Option<VecDeque<TranscriptSyscall>>,
    replay_error: Option<ManagerError>,
}

impl TranscriptRecorder {
    /// Without a store nothing is recorded and replay is unavailable.
    pub fn new(vat_id: VatId, store: Option<DynTranscriptStore>) -> Self {
        Self {
            vat_id,
            store,
            current: None,
            expected: None,
            replay_error: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_replaying(&self) -> bool {
        self.expected.is_some()
    }

    pub fn replay_error(&self) -> Option<&ManagerError> {
        self.replay_error.as_ref()
    }

    pub fn start_dispatch(&mut self, delivery: &VatDelivery) {
        self.current = Some(TranscriptEntry::new(delivery.clone()));
    }

    /// GC syscalls are left out.
    pub fn add_syscall(&mut self, request: &VatSyscall, response: &VatSyscallResult) {
        if request.is_gc() {
            return;
        }
        if let Some(entry) = self.current.as_mut() {
            entry.syscalls.push(TranscriptSyscall {
                request: request.clone(),
                response: response.clone(),
            });
        }
    }

    pub fn finish_dispatch(&mut self) -> Result<(), ManagerError> {
        let Some(entry) = self.current.take() else {
            return Ok(());
        };
        if let Some(store) = &self.store {
            store.append(&self.vat_id, &entry)?;
        }
        Ok(())
    }

    pub fn start_replay(&mut self, entry: TranscriptEntry) {
        self.current = None;
        self.expected = Some(entry.syscalls.into());
    }

    /// The recorded answer to `request`, if it is the syscall the
    /// transcript says comes next.
    pub fn simulate_syscall(&mut self, request: &VatSyscall) -> Result<VatSyscallResult, ManagerError> {
        if let Some(err) = &self.replay_error {
            return Err(err.clone());
        }
        if request.is_gc() {
            return Ok(SyscallResult::ok());
        }
        match self.expected.as_mut().and_then(VecDeque::pop_front) {
            Some(expected) if djson::equal(&expected.request, request).unwrap_or(false) => {
                Ok(expected.response)
            }
            Some(expected) => Err(self.diverged(format!(
                "expected {} but vat made {}",
                describe(&expected.request),
                describe(request)
            ))),
            None => Err(self.diverged(format!("unexpected extra {}", describe(request)))),
        }
    }

    pub fn finish_replay(&mut self) -> Result<(), ManagerError> {
        if let Some(err) = &self.replay_error {
            return Err(err.clone());
        }
        let leftover = self.expected.take().map_or(0, |queue| queue.len());
        if leftover > 0 {
            return Err(self.diverged(format!("delivery ended with {leftover} recorded syscalls unmade")));
        }
        Ok(())
    }

    fn diverged(&mut self, reason: String) -> ManagerError {
        log::error!("{}: replay diverged: {reason}", self.vat_id);
        let err = ManagerError::Anachrophobia {
            vat_id: self.vat_id.clone(),
            reason,
        };
        self.replay_error = Some(err.clone());
        err
    }
}

fn describe(syscall: &VatSyscall) -> String {
    djson::stringify(syscall).unwrap_or_else(|_| syscall.kind_name().to_string())
}

struct GateState {
    vat_id: VatId,
    handler: Box<dyn SyscallHandler>,
    recorder: TranscriptRecorder,
    slog: DynSlog,
    failure: Option<String>,
}

/// Shared by a vat's manager and whatever runs the vat's syscalls.
#[derive(Clone)]
pub struct SyscallGate {
    state: Arc<Mutex<GateState>>,
}

impl SyscallGate {
    pub fn new(
        vat_id: VatId,
        handler: Box<dyn SyscallHandler>,
        transcripts: Option<DynTranscriptStore>,
        slog: DynSlog,
    ) -> Self {
        let recorder = TranscriptRecorder::new(vat_id.clone(), transcripts);
        Self {
            state: Arc::new(Mutex::new(GateState {
                vat_id,
                handler,
                recorder,
                slog,
                failure: None,
            })),
        }
    }

    /// Answer one syscall. A live error is also remembered so the delivery
    /// can be failed once it returns.
    pub fn syscall(&self, request: VatSyscall) -> VatSyscallResult {
        let mut state = lock(&self.state);
        let replay = state.recorder.is_replaying();
        let finish = slog::syscall(&state.slog, &state.vat_id, &request, replay);
        let result = if replay {
            state
                .recorder
                .simulate_syscall(&request)
                .unwrap_or_else(|err| SyscallResult::error(err.to_string()))
        } else {
            let result = state.handler.handle(&request);
            match &result {
                SyscallResult::Ok(_) => state.recorder.add_syscall(&request, &result),
                SyscallResult::Error(reason) => {
                    if state.failure.is_none() {
                        state.failure = Some(format!("syscall.{} failed: {reason}", request.kind_name()));
                    }
                }
            }
            result
        };
        finish.finish(&result);
        result
    }

    pub fn vat_id(&self) -> VatId {
        lock(&self.state).vat_id.clone()
    }

    pub fn slog(&self) -> DynSlog {
        Arc::clone(&lock(&self.state).slog)
    }

    pub fn transcript_enabled(&self) -> bool {
        lock(&self.state).recorder.is_enabled()
    }

    pub fn start_dispatch(&self, delivery: &VatDelivery) {
        let mut state = lock(&self.state);
        state.failure = None;
        state.recorder.start_dispatch(delivery);
    }

    pub fn finish_dispatch(&self) -> Result<(), ManagerError> {
        lock(&self.state).recorder.finish_dispatch()
    }

    pub fn start_replay(&self, entry: TranscriptEntry) {
        lock(&self.state).recorder.start_replay(entry);
    }

    pub fn finish_replay(&self) -> Result<(), ManagerError> {
        lock(&self.state).recorder.finish_replay()
    }

    pub fn replay_error(&self) -> Option<ManagerError> {
        lock(&self.state).recorder.replay_error().cloned()
    }

    /// The first live syscall failure since the delivery started.
    pub fn take_failure(&self) -> Option<String> {
        lock(&self.state).failure.take()
    }
}

impl std::fmt::Debug for SyscallGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SyscallGate")
            .field("vat_id", &state.vat_id)
            .field("replaying", &state.recorder.is_replaying())
            .finish()
    }
}
