use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use swing_abi::{KernelToWorker, VatId, WorkerToKernel};
use swing_liveslots::BundleLoader;
use swing_worker::{ChannelReader, ChannelWriter, run_worker};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::Transport;
use super::remote::{FrameReader, transport_error};
use crate::error::ManagerError;

/// A worker loop on its own OS thread, spoken to over byte channels with the
/// same framing a worker process uses.
pub struct ThreadTransport {
    vat_id: VatId,
    to_worker: Option<UnboundedSender<Vec<u8>>>,
    from_worker: UnboundedReceiver<Vec<u8>>,
    frames: FrameReader,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadTransport {
    pub fn spawn(vat_id: VatId, loader: Arc<dyn BundleLoader>) -> Result<Self, ManagerError> {
        let (to_worker, worker_input) = unbounded_channel();
        let (worker_output, from_worker) = unbounded_channel();
        let worker_vat = vat_id.clone();
        let handle = thread::Builder::new()
            .name(format!("vat-{vat_id}"))
            .spawn(move || {
                let reader = ChannelReader::from_receiver(worker_input);
                let writer = ChannelWriter::from_sender(worker_output);
                match run_worker(reader, writer, loader) {
                    Ok(()) => tracing::debug!(vat = %worker_vat, "worker thread finished"),
                    Err(err) => tracing::warn!(vat = %worker_vat, "worker thread failed: {err}"),
                }
            })
            .map_err(|err| transport_error(&vat_id, err))?;
        Ok(Self {
            frames: FrameReader::new(vat_id.clone()),
            vat_id,
            to_worker: Some(to_worker),
            from_worker,
            handle: Some(handle),
        })
    }
}

#[async_trait]
impl Transport for ThreadTransport {
    async fn send(&mut self, message: &KernelToWorker) -> Result<(), ManagerError> {
        let frame = message
            .encode()
            .map_err(|err| transport_error(&self.vat_id, err))?;
        let Some(tx) = &self.to_worker else {
            return Err(ManagerError::WorkerExited(self.vat_id.clone()));
        };
        tx.send(frame)
            .map_err(|_| ManagerError::WorkerExited(self.vat_id.clone()))
    }

    async fn recv(&mut self) -> Result<Option<WorkerToKernel>, ManagerError> {
        loop {
            if let Some(message) = self.frames.next()? {
                return Ok(Some(message));
            }
            match self.from_worker.recv().await {
                Some(chunk) => self.frames.feed(&chunk)?,
                None => {
                    self.frames.close()?;
                    return Ok(None);
                }
            }
        }
    }

    async fn kill(&mut self) {
        // Closing the input ends the worker loop once it next reads. A worker
        // stuck inside vat code cannot be interrupted, so it is left detached.
        self.to_worker = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !handle.is_finished() {
            tracing::warn!(vat = %self.vat_id, "worker thread still busy; leaving it detached");
        } else if handle.join().is_err() {
            tracing::warn!(vat = %self.vat_id, "worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swing_abi::VatDelivery;
    use swing_worker::fixtures;

    #[tokio::test]
    async fn speaks_the_worker_protocol() {
        let vat_id = VatId::from_index(7);
        let mut transport = ThreadTransport::spawn(vat_id.clone(), Arc::new(fixtures::registry())).unwrap();
        transport
            .send(&KernelToWorker::SetBundle {
                vat_id,
                bundle: "echo".into(),
                vat_parameters: serde_json::Value::Null,
                blocking: false,
            })
            .await
            .unwrap();
        assert_eq!(transport.recv().await.unwrap(), Some(WorkerToKernel::GotBundle));

        transport
            .send(&KernelToWorker::Deliver {
                delivery: VatDelivery::BringOutYourDead,
                budget: None,
            })
            .await
            .unwrap();
        loop {
            match transport.recv().await.unwrap() {
                Some(WorkerToKernel::DeliverDone { result }) => {
                    assert!(result.is_ok(), "{result:?}");
                    break;
                }
                Some(_) => continue,
                None => panic!("worker thread went away"),
            }
        }

        transport.send(&KernelToWorker::Shutdown).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), None);
        transport.kill().await;
    }
}
