//! Restarting vats from their transcripts.

#[path = "helpers.rs"]
mod helpers;

use std::sync::Arc;

use helpers::{no_args, outcome, rejection, strings};
use serde_json::json;
use swing_abi::{CapData, VatSyscall};
use swing_kernel::{Kernel, KernelConfig, KernelError, ManagerError, NullSlog, VatOptions};
use swing_store::{FsTranscriptStore, KvStore, MemKvStore, MemTranscriptStore, TranscriptStore};
use swing_worker::fixtures;
use tempfile::TempDir;

#[tokio::test]
async fn reloaded_vats_pick_up_where_they_left_off() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("vatstore")).await.unwrap();
    kernel.queue_to_vat_root(&vat, "put", strings(&["color", "blue"])).unwrap();
    kernel.queue_to_vat_root(&vat, "put", strings(&["shape", "round"])).unwrap();
    kernel.run().await.unwrap();
    let before = kernel.transcripts().hash(&vat).unwrap();

    assert_eq!(kernel.reload_vat(&vat).await.unwrap(), 2);
    // Replay checks history without adding to it.
    assert_eq!(kernel.transcripts().hash(&vat).unwrap(), before);

    let got = kernel.queue_to_vat_root(&vat, "get", strings(&["color"])).unwrap();
    kernel.run().await.unwrap();
    assert_eq!(outcome(&kernel, got), Ok(json!("blue")));
    assert_eq!(kernel.transcripts().len(&vat).unwrap(), 4);
}

#[tokio::test]
async fn reloading_answers_startup_syscalls_from_the_transcript() {
    let kv = Arc::new(MemKvStore::new());
    let mut kernel = Kernel::builder(Arc::new(fixtures::registry()))
        .with_kv_store(kv.clone())
        .with_slog(Arc::new(NullSlog))
        .build();
    let vat = kernel.create_vat(VatOptions::new("boot-counter")).await.unwrap();
    let boots_key = format!("{vat}.vs.boots");
    assert_eq!(kv.get(&boots_key).as_deref(), Some("1"));

    for _ in 0..2 {
        assert_eq!(kernel.reload_vat(&vat).await.unwrap(), 0);
        assert_eq!(kv.get(&boots_key).as_deref(), Some("1"));
    }
    let boots = kernel.queue_to_vat_root(&vat, "boots", no_args()).unwrap();
    kernel.run().await.unwrap();
    assert_eq!(outcome(&kernel, boots), Ok(json!("1")));

    let (_, startup) = kernel.transcripts().read_from(&vat, 0).unwrap().remove(0);
    assert_eq!(startup.delivery.kind_name(), "startVat");
    assert_eq!(startup.syscalls.len(), 2);
}

#[tokio::test]
async fn vats_without_transcripts_cannot_replay() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel
        .create_vat(VatOptions::new("echo").without_transcript())
        .await
        .unwrap();
    let echoed = kernel.queue_to_vat_root(&vat, "echo", strings(&["hi"])).unwrap();
    kernel.run().await.unwrap();
    assert_eq!(outcome(&kernel, echoed), Ok(json!("hi")));
    assert_eq!(kernel.transcripts().len(&vat).unwrap(), 0);
    assert_eq!(kernel.reload_vat(&vat).await.unwrap(), 0);
}

#[tokio::test]
async fn diverging_replay_is_fatal() {
    let transcripts = Arc::new(MemTranscriptStore::new());
    let mut kernel = Kernel::builder(Arc::new(fixtures::registry()))
        .with_transcript_store(transcripts.clone())
        .with_slog(Arc::new(NullSlog))
        .build();
    let vat = kernel.create_vat(VatOptions::new("vatstore")).await.unwrap();
    kernel.queue_to_vat_root(&vat, "put", strings(&["color", "blue"])).unwrap();
    kernel.run().await.unwrap();

    // Rewrite history: the vat now "remembers" writing a different value.
    let (position, mut entry) = transcripts.read_from(&vat, 1).unwrap().remove(0);
    let forged = entry
        .syscalls
        .iter_mut()
        .find(|syscall| matches!(syscall.request, VatSyscall::VatstoreSet { .. }))
        .unwrap();
    forged.request = VatSyscall::VatstoreSet {
        key: "color".into(),
        value: "red".into(),
    };
    transcripts.overwrite_entry(&vat, position, entry).unwrap();

    let err = kernel.reload_vat(&vat).await.unwrap_err();
    assert!(
        matches!(err, KernelError::Manager(ManagerError::Anachrophobia { .. })),
        "{err}"
    );

    // The vat cannot be trusted any more; its next delivery kills it.
    let got = kernel.queue_to_vat_root(&vat, "get", strings(&["color"])).unwrap();
    kernel.run().await.unwrap();
    assert!(rejection(&kernel, got).contains("anachrophobia"));
    assert!(kernel.vat_ids().unwrap().is_empty());
}

#[tokio::test]
async fn a_new_kernel_resumes_from_disk() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemKvStore::new());
    let build = |transcripts: FsTranscriptStore| {
        Kernel::builder(Arc::new(fixtures::registry()))
            .with_kv_store(kv.clone())
            .with_transcript_store(Arc::new(transcripts))
            .with_slog(Arc::new(NullSlog))
            .build()
    };

    let mut first = build(FsTranscriptStore::open(dir.path()).unwrap());
    let vat = first.create_vat(VatOptions::new("vatstore")).await.unwrap();
    first.queue_to_vat_root(&vat, "put", strings(&["color", "blue"])).unwrap();
    first.run().await.unwrap();
    let hash = first.transcripts().hash(&vat).unwrap();
    first.shutdown().await.unwrap();
    drop(first);

    let mut second = build(FsTranscriptStore::open(dir.path()).unwrap());
    assert_eq!(second.vat_ids().unwrap(), vec![vat.clone()]);
    assert_eq!(second.resume().await.unwrap(), 1);
    assert_eq!(second.transcripts().hash(&vat).unwrap(), hash);

    let got = second.queue_to_vat_root(&vat, "get", strings(&["color"])).unwrap();
    second.run().await.unwrap();
    assert_eq!(outcome(&second, got), Ok(json!("blue")));

    second
        .terminate_vat(&vat, CapData::error("done"))
        .await
        .unwrap();
    assert!(!FsTranscriptStore::open(dir.path()).unwrap().path_for(&vat).exists());
}
