//! Vat side of a worker: reads kernel frames from a byte stream, drives one
//! [`LiveSlots`] instance, and relays its syscalls back over the same stream.
//!
//! The same loop serves worker threads (over [`byte_channel`]) and worker
//! processes (over stdin/stdout).

mod channel;
pub mod fixtures;
mod pipe;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use swing_abi::{KernelToWorker, VatId, VatSyscall, VatSyscallResult, WorkerToKernel};
use swing_codec::CodecError;
use swing_liveslots::{BundleLoader, LiveSlots, LiveSlotsError, Syscall};
use thiserror::Error;

pub use channel::{ChannelReader, ChannelWriter, byte_channel};
use pipe::Pipe;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pipe I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("kernel pipe closed mid-frame")]
    Truncated,
    #[error("unexpected {0} from kernel")]
    Unexpected(&'static str),
    #[error("delivery before setBundle")]
    NoBundle,
}

/// Serve kernel requests until `shutdown` or end of input.
pub fn run_worker<R, W>(reader: R, writer: W, loader: Arc<dyn BundleLoader>) -> Result<(), WorkerError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let pipe = Arc::new(Mutex::new(Pipe::new(Box::new(reader), Box::new(writer))));
    let mut vat: Option<LiveSlots> = None;
    loop {
        let Some(message) = lock(&pipe).recv()? else {
            tracing::debug!("kernel closed the worker pipe");
            return Ok(());
        };
        match message {
            KernelToWorker::SetBundle {
                vat_id,
                bundle,
                vat_parameters,
                blocking,
            } => {
                let reply = match start_vat(&pipe, loader.as_ref(), &vat_id, &bundle, &vat_parameters, blocking) {
                    Ok(started) => {
                        tracing::info!(vat = %vat_id, bundle = %bundle, blocking, "vat started in worker");
                        vat = Some(started);
                        WorkerToKernel::GotBundle
                    }
                    Err(err) => {
                        tracing::warn!(vat = %vat_id, bundle = %bundle, "vat failed to start: {err}");
                        WorkerToKernel::BundleError {
                            message: err.to_string(),
                        }
                    }
                };
                lock(&pipe).send(&reply)?;
            }
            KernelToWorker::Deliver { delivery, budget } => {
                let vat = vat.as_mut().ok_or(WorkerError::NoBundle)?;
                let result = vat.dispatch(delivery, budget);
                lock(&pipe).send(&WorkerToKernel::DeliverDone { result })?;
            }
            KernelToWorker::SyscallResponse { .. } => {
                return Err(WorkerError::Unexpected("syscallResponse"));
            }
            KernelToWorker::Shutdown => {
                tracing::debug!("worker shutdown requested");
                return Ok(());
            }
        }
    }
}

fn start_vat(
    pipe: &Arc<Mutex<Pipe>>,
    loader: &dyn BundleLoader,
    vat_id: &VatId,
    bundle: &str,
    vat_parameters: &serde_json::Value,
    blocking: bool,
) -> Result<LiveSlots, LiveSlotsError> {
    let code = loader.import_bundle(bundle)?;
    let relay = RelaySyscall {
        pipe: Arc::clone(pipe),
        blocking,
    };
    let console = Arc::clone(pipe);
    let mut vat = LiveSlots::new(vat_id.to_string(), Box::new(relay)).with_console(move |line| {
        let console_line = WorkerToKernel::Console {
            line: line.to_string(),
        };
        if let Err(err) = lock(&console).send(&console_line) {
            tracing::warn!("dropped console line: {err}");
        }
    });
    vat.start(code.as_ref(), vat_parameters)?;
    Ok(vat)
}

/// Forwards syscalls to the kernel. A blocking worker waits for each
/// answer; a non-blocking one cannot serve syscalls that need one.
struct RelaySyscall {
    pipe: Arc<Mutex<Pipe>>,
    blocking: bool,
}

impl Syscall for RelaySyscall {
    fn call(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        if !self.blocking && syscall.requires_result() {
            return VatSyscallResult::error(format!(
                "this worker cannot block: syscall.{} needs an answer",
                syscall.kind_name()
            ));
        }
        let mut pipe = lock(&self.pipe);
        if let Err(err) = pipe.send(&WorkerToKernel::Syscall { syscall }) {
            return VatSyscallResult::error(format!("kernel pipe: {err}"));
        }
        if !self.blocking {
            return VatSyscallResult::ok();
        }
        match pipe.recv() {
            Ok(Some(KernelToWorker::SyscallResponse { result })) => result,
            Ok(Some(_)) => VatSyscallResult::error("expected a syscall response from the kernel"),
            Ok(None) => VatSyscallResult::error("kernel closed the worker pipe"),
            Err(err) => VatSyscallResult::error(format!("kernel pipe: {err}")),
        }
    }
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(PoisonError::into_inner)
}
