use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use swing_abi::{KernelToWorker, VatId, WorkerToKernel};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::Transport;
use super::remote::{FrameReader, transport_error};
use crate::error::ManagerError;

const READ_CHUNK: usize = 16 * 1024;

/// A `swing-worker` child process, framed over its stdin and stdout.
/// Stderr is inherited so worker logs land next to the kernel's.
pub struct ProcessTransport {
    vat_id: VatId,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    frames: FrameReader,
    buf: Vec<u8>,
}

impl ProcessTransport {
    pub fn spawn(vat_id: VatId, worker_bin: &Path) -> Result<Self, ManagerError> {
        let mut child = Command::new(worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                transport_error(&vat_id, format!("spawning {}: {err}", worker_bin.display()))
            })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport_error(&vat_id, "worker stdout was not captured"))?;
        tracing::debug!(vat = %vat_id, pid = ?child.id(), "spawned worker process");
        Ok(Self {
            frames: FrameReader::new(vat_id.clone()),
            vat_id,
            child,
            stdin,
            stdout,
            buf: vec![0; READ_CHUNK],
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&mut self, message: &KernelToWorker) -> Result<(), ManagerError> {
        let frame = message
            .encode()
            .map_err(|err| transport_error(&self.vat_id, err))?;
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ManagerError::WorkerExited(self.vat_id.clone()));
        };
        let written = match stdin.write_all(&frame).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        written.map_err(|err| match err.kind() {
            std::io::ErrorKind::BrokenPipe => ManagerError::WorkerExited(self.vat_id.clone()),
            _ => transport_error(&self.vat_id, err),
        })
    }

    async fn recv(&mut self) -> Result<Option<WorkerToKernel>, ManagerError> {
        loop {
            if let Some(message) = self.frames.next()? {
                return Ok(Some(message));
            }
            let n = self
                .stdout
                .read(&mut self.buf)
                .await
                .map_err(|err| transport_error(&self.vat_id, err))?;
            if n == 0 {
                self.frames.close()?;
                return Ok(None);
            }
            self.frames.feed(&self.buf[..n])?;
        }
    }

    async fn kill(&mut self) {
        self.stdin = None;
        if let Err(err) = self.child.kill().await {
            tracing::debug!(vat = %self.vat_id, "killing worker process: {err}");
        }
    }
}
