use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use swing_abi::{
    CapData, KernelToWorker, Message, Resolution, SyscallData, SyscallResult, VatDelivery, VatId,
    VatSyscall, WorkerToKernel,
};
use swing_codec::NetstringDecoder;
use swing_worker::{ChannelReader, ChannelWriter, WorkerError, byte_channel, fixtures, run_worker};

struct FakeKernel {
    to_worker: ChannelWriter,
    from_worker: ChannelReader,
    decoder: NetstringDecoder,
    ready: Vec<Vec<u8>>,
    worker: thread::JoinHandle<Result<(), WorkerError>>,
}

impl FakeKernel {
    fn spawn() -> Self {
        let (to_worker, worker_in) = byte_channel();
        let (worker_out, from_worker) = byte_channel();
        let loader = Arc::new(fixtures::registry());
        let worker = thread::spawn(move || run_worker(worker_in, worker_out, loader));
        Self {
            to_worker,
            from_worker,
            decoder: NetstringDecoder::new(),
            ready: Vec::new(),
            worker,
        }
    }

    fn send(&mut self, message: KernelToWorker) {
        self.to_worker.write_all(&message.encode().unwrap()).unwrap();
    }

    fn recv(&mut self) -> WorkerToKernel {
        let mut buf = [0u8; 256];
        while self.ready.is_empty() {
            let n = self.from_worker.read(&mut buf).unwrap();
            assert!(n > 0, "worker closed its output");
            self.ready = self.decoder.feed(&buf[..n]).unwrap();
            self.ready.reverse();
        }
        let payload = self.ready.pop().unwrap();
        WorkerToKernel::decode(&payload).unwrap()
    }

    fn set_bundle(&mut self, bundle: &str, blocking: bool) -> WorkerToKernel {
        self.send(KernelToWorker::SetBundle {
            vat_id: VatId::from_index(1),
            bundle: bundle.into(),
            vat_parameters: serde_json::Value::Null,
            blocking,
        });
        self.recv()
    }

    fn deliver(&mut self, method: &str, body: &str, result: Option<&str>) {
        self.send(KernelToWorker::Deliver {
            delivery: VatDelivery::Message {
                target: "o+0".parse().unwrap(),
                msg: Message::new(method, CapData::new(body, vec![]), result.map(|r| r.parse().unwrap())),
            },
            budget: None,
        });
    }

    fn shutdown(mut self) {
        self.send(KernelToWorker::Shutdown);
        self.worker.join().unwrap().unwrap();
    }
}

#[test]
fn blocking_worker_relays_syscalls_and_results() {
    let mut kernel = FakeKernel::spawn();
    assert_eq!(kernel.set_bundle("echo", true), WorkerToKernel::GotBundle);

    kernel.deliver("echo", r#"["hi"]"#, Some("p-1"));
    match kernel.recv() {
        WorkerToKernel::Syscall {
            syscall: VatSyscall::Resolve { vpid, resolution },
        } => {
            assert_eq!(vpid.to_string(), "p-1");
            assert_eq!(
                resolution,
                Resolution::FulfilledToData {
                    data: CapData::new(r#""hi""#, vec![])
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    kernel.send(KernelToWorker::SyscallResponse {
        result: SyscallResult::ok(),
    });
    match kernel.recv() {
        WorkerToKernel::DeliverDone { result } => assert!(result.is_ok()),
        other => panic!("unexpected {other:?}"),
    }
    kernel.shutdown();
}

#[test]
fn blocking_worker_waits_for_vatstore_answers() {
    let mut kernel = FakeKernel::spawn();
    kernel.set_bundle("vatstore", true);

    kernel.deliver("get", r#"["color"]"#, Some("p-1"));
    assert!(matches!(
        kernel.recv(),
        WorkerToKernel::Syscall {
            syscall: VatSyscall::VatstoreGet { .. }
        }
    ));
    kernel.send(KernelToWorker::SyscallResponse {
        result: SyscallResult::Ok(SyscallData::Value(Some("blue".into()))),
    });
    match kernel.recv() {
        WorkerToKernel::Syscall {
            syscall: VatSyscall::Resolve { resolution, .. },
        } => assert_eq!(
            resolution,
            Resolution::FulfilledToData {
                data: CapData::new(r#""blue""#, vec![])
            }
        ),
        other => panic!("unexpected {other:?}"),
    }
    kernel.send(KernelToWorker::SyscallResponse {
        result: SyscallResult::ok(),
    });
    assert!(matches!(kernel.recv(), WorkerToKernel::DeliverDone { .. }));
    kernel.shutdown();
}

#[test]
fn non_blocking_worker_refuses_syscalls_that_need_answers() {
    let mut kernel = FakeKernel::spawn();
    kernel.set_bundle("vatstore", false);

    kernel.deliver("get", r#"["color"]"#, None);
    match kernel.recv() {
        WorkerToKernel::DeliverDone { result } => {
            let message = result.error_message().unwrap_or_default().to_string();
            assert!(message.contains("cannot block"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }

    // Fire-and-forget syscalls still go out, with no response expected.
    kernel.deliver("put", r#"["color","red"]"#, None);
    assert!(matches!(
        kernel.recv(),
        WorkerToKernel::Syscall {
            syscall: VatSyscall::VatstoreSet { .. }
        }
    ));
    match kernel.recv() {
        WorkerToKernel::DeliverDone { result } => assert!(result.is_ok()),
        other => panic!("unexpected {other:?}"),
    }
    kernel.shutdown();
}

#[test]
fn console_lines_and_bundle_errors_are_reported() {
    let mut kernel = FakeKernel::spawn();
    match kernel.set_bundle("no-such-bundle", true) {
        WorkerToKernel::BundleError { message } => assert!(message.contains("no-such-bundle")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(kernel.set_bundle("echo", true), WorkerToKernel::GotBundle);
    kernel.deliver("log", r#"["hello from the vat"]"#, None);
    assert_eq!(
        kernel.recv(),
        WorkerToKernel::Console {
            line: "hello from the vat".into()
        }
    );
    assert!(matches!(kernel.recv(), WorkerToKernel::DeliverDone { .. }));
    kernel.shutdown();
}

#[test]
fn worker_exits_when_the_kernel_hangs_up() {
    let kernel = FakeKernel::spawn();
    let FakeKernel { to_worker, worker, .. } = kernel;
    drop(to_worker);
    assert!(worker.join().unwrap().is_ok());
}
