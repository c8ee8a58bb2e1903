use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use swing_abi::{KernelToWorker, VatDelivery, VatDeliveryResult, VatId, WorkerToKernel};
use swing_codec::NetstringDecoder;

use super::VatWorker;
use crate::error::ManagerError;
use crate::slog;
use crate::transcript::SyscallGate;

/// A framed, bidirectional link to a vat worker.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: &KernelToWorker) -> Result<(), ManagerError>;

    /// Next message from the worker, or `None` once it has gone away.
    async fn recv(&mut self) -> Result<Option<WorkerToKernel>, ManagerError>;

    /// Tear the worker down without waiting for it to cooperate.
    async fn kill(&mut self);
}

/// Turns a byte stream from a worker into whole messages.
pub(super) struct FrameReader {
    vat_id: VatId,
    decoder: NetstringDecoder,
    ready: VecDeque<Vec<u8>>,
}

impl FrameReader {
    pub(super) fn new(vat_id: VatId) -> Self {
        Self {
            vat_id,
            decoder: NetstringDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// A message already buffered, if any.
    pub(super) fn next(&mut self) -> Result<Option<WorkerToKernel>, ManagerError> {
        let Some(payload) = self.ready.pop_front() else {
            return Ok(None);
        };
        WorkerToKernel::decode(&payload)
            .map(Some)
            .map_err(|err| transport_error(&self.vat_id, err))
    }

    pub(super) fn feed(&mut self, chunk: &[u8]) -> Result<(), ManagerError> {
        let frames = self
            .decoder
            .feed(chunk)
            .map_err(|err| transport_error(&self.vat_id, err))?;
        self.ready.extend(frames);
        Ok(())
    }

    /// End of stream. Leftover bytes mean the worker died mid-frame.
    pub(super) fn close(&self) -> Result<(), ManagerError> {
        if self.decoder.pending().is_empty() {
            Ok(())
        } else {
            Err(transport_error(&self.vat_id, "worker stream ended mid-frame"))
        }
    }
}

pub(super) fn transport_error(vat_id: &VatId, reason: impl ToString) -> ManagerError {
    ManagerError::Transport {
        vat_id: vat_id.clone(),
        reason: reason.to_string(),
    }
}

/// Drives a vat living on the far side of a [`Transport`].
pub struct RemoteWorker<T> {
    vat_id: VatId,
    transport: T,
    bundle: String,
    params: serde_json::Value,
    blocking: bool,
    timeout: Option<Duration>,
}

impl<T: Transport> RemoteWorker<T> {
    pub fn new(
        vat_id: VatId,
        transport: T,
        bundle: impl Into<String>,
        params: serde_json::Value,
        blocking: bool,
    ) -> Self {
        Self {
            vat_id,
            transport,
            bundle: bundle.into(),
            params,
            blocking,
            timeout: None,
        }
    }

    /// Kill the worker if a single delivery runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<T: Transport> VatWorker for RemoteWorker<T> {
    async fn start(&mut self, gate: &SyscallGate) -> Result<(), ManagerError> {
        self.transport
            .send(&KernelToWorker::SetBundle {
                vat_id: self.vat_id.clone(),
                bundle: self.bundle.clone(),
                vat_parameters: self.params.clone(),
                blocking: self.blocking,
            })
            .await?;
        // Bundle code may already make syscalls while building its root.
        loop {
            match self.transport.recv().await? {
                Some(WorkerToKernel::GotBundle) => return Ok(()),
                Some(WorkerToKernel::BundleError { message }) => {
                    return Err(ManagerError::Startup {
                        vat_id: self.vat_id.clone(),
                        reason: message,
                    });
                }
                Some(WorkerToKernel::Syscall { syscall }) => {
                    let result = gate.syscall(syscall);
                    if self.blocking {
                        self.transport
                            .send(&KernelToWorker::SyscallResponse { result })
                            .await?;
                    }
                }
                Some(WorkerToKernel::Console { line }) => {
                    slog::vat_console(&gate.slog(), &self.vat_id, &line);
                }
                Some(WorkerToKernel::DeliverDone { .. }) => {
                    return Err(transport_error(&self.vat_id, "deliverDone before gotBundle"));
                }
                None => return Err(ManagerError::WorkerExited(self.vat_id.clone())),
            }
        }
    }

    async fn deliver(
        &mut self,
        delivery: VatDelivery,
        budget: Option<u64>,
        gate: &SyscallGate,
    ) -> Result<VatDeliveryResult, ManagerError> {
        self.transport
            .send(&KernelToWorker::Deliver { delivery, budget })
            .await?;
        let relay = relay_until_done(&mut self.transport, &self.vat_id, gate, self.blocking);
        let Some(timeout) = self.timeout else {
            return relay.await;
        };
        match tokio::time::timeout(timeout, relay).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(vat = %self.vat_id, ?timeout, "delivery overran its deadline; killing worker");
                self.transport.kill().await;
                Err(ManagerError::DeliveryTimeout {
                    vat_id: self.vat_id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), ManagerError> {
        if let Err(err) = self.transport.send(&KernelToWorker::Shutdown).await {
            tracing::debug!(vat = %self.vat_id, "worker already gone at shutdown: {err}");
        }
        self.transport.kill().await;
        Ok(())
    }
}

/// Serve the worker's syscalls until it reports the delivery finished.
async fn relay_until_done<T: Transport>(
    transport: &mut T,
    vat_id: &VatId,
    gate: &SyscallGate,
    blocking: bool,
) -> Result<VatDeliveryResult, ManagerError> {
    loop {
        match transport.recv().await? {
            Some(WorkerToKernel::Syscall { syscall }) => {
                let result = gate.syscall(syscall);
                if blocking {
                    transport.send(&KernelToWorker::SyscallResponse { result }).await?;
                }
            }
            Some(WorkerToKernel::Console { line }) => slog::vat_console(&gate.slog(), vat_id, &line),
            Some(WorkerToKernel::DeliverDone { result }) => return Ok(result),
            Some(other) => {
                return Err(transport_error(
                    vat_id,
                    format!("unexpected {other:?} during a delivery"),
                ));
            }
            None => return Err(ManagerError::WorkerExited(vat_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slog::NullSlog;
    use std::sync::{Arc, Mutex};
    use swing_abi::{SyscallResult, Usage, VatSyscall, VatSyscallResult};

    /// Plays back a fixed script of worker messages and remembers what the
    /// kernel sent.
    struct Scripted {
        script: VecDeque<WorkerToKernel>,
        sent: Arc<Mutex<Vec<KernelToWorker>>>,
        killed: bool,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&mut self, message: &KernelToWorker) -> Result<(), ManagerError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<WorkerToKernel>, ManagerError> {
            Ok(self.script.pop_front())
        }

        async fn kill(&mut self) {
            self.killed = true;
        }
    }

    fn worker(script: Vec<WorkerToKernel>, blocking: bool) -> (RemoteWorker<Scripted>, Arc<Mutex<Vec<KernelToWorker>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            script: script.into(),
            sent: Arc::clone(&sent),
            killed: false,
        };
        (
            RemoteWorker::new(VatId::from_index(4), transport, "echo", serde_json::Value::Null, blocking),
            sent,
        )
    }

    fn gate() -> SyscallGate {
        let handler = |_: &VatSyscall| -> VatSyscallResult { SyscallResult::ok() };
        SyscallGate::new(VatId::from_index(4), Box::new(handler), None, Arc::new(NullSlog))
    }

    #[tokio::test]
    async fn blocking_workers_get_syscall_answers() {
        let done = VatDeliveryResult::ok(Some(Usage { computrons: 3 }));
        let (mut worker, sent) = worker(
            vec![
                WorkerToKernel::GotBundle,
                WorkerToKernel::Syscall {
                    syscall: VatSyscall::VatstoreDelete { key: "k".into() },
                },
                WorkerToKernel::DeliverDone { result: done.clone() },
            ],
            true,
        );
        let gate = gate();
        worker.start(&gate).await.unwrap();
        let result = worker
            .deliver(VatDelivery::BringOutYourDead, None, &gate)
            .await
            .unwrap();
        assert_eq!(result, done);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], KernelToWorker::SetBundle { blocking: true, .. }));
        assert!(matches!(sent[2], KernelToWorker::SyscallResponse { .. }));
    }

    #[tokio::test]
    async fn bundle_errors_fail_startup() {
        let (mut worker, _) = worker(
            vec![WorkerToKernel::BundleError {
                message: "no bundle named nope".into(),
            }],
            false,
        );
        let err = worker.start(&gate()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Startup { reason, .. } if reason == "no bundle named nope"));
    }

    #[tokio::test]
    async fn end_of_stream_mid_delivery_is_worker_exit() {
        let (mut worker, _) = worker(vec![WorkerToKernel::GotBundle], false);
        let gate = gate();
        worker.start(&gate).await.unwrap();
        let err = worker
            .deliver(VatDelivery::BringOutYourDead, None, &gate)
            .await
            .unwrap_err();
        assert_eq!(err, ManagerError::WorkerExited(VatId::from_index(4)));
    }

    #[test]
    fn frame_reader_waits_for_whole_frames() {
        let mut reader = FrameReader::new(VatId::from_index(1));
        let frame = WorkerToKernel::GotBundle.encode().unwrap();
        let (head, tail) = frame.split_at(3);
        reader.feed(head).unwrap();
        assert_eq!(reader.next().unwrap(), None);
        assert!(reader.close().is_err());
        reader.feed(tail).unwrap();
        assert_eq!(reader.next().unwrap(), Some(WorkerToKernel::GotBundle));
        assert!(reader.close().is_ok());

        // A worker announcing an absurd frame is cut off before it is buffered.
        let err = reader.feed(b"999999999999999:").unwrap_err();
        assert!(matches!(err, ManagerError::Transport { .. }), "{err}");
    }
}
