//! Vatstore, devices, exit, metering and failure handling, end to end
//! through in-process vats.

#[path = "helpers.rs"]
mod helpers;

use std::sync::Arc;

use helpers::{args, no_args, outcome, rejection, slot_ref, strings, undefined};
use serde_json::json;
use swing_abi::{CapData, KernelCapData};
use swing_kernel::{KernelConfig, KernelError, VatOptions};

#[tokio::test]
async fn vatstore_survives_between_deliveries() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("vatstore")).await.unwrap();
    for (key, value) in [("a/1", "x"), ("a/2", "y"), ("b/1", "z")] {
        kernel.queue_to_vat_root(&vat, "put", strings(&[key, value])).unwrap();
    }
    kernel.queue_to_vat_root(&vat, "delete", strings(&["a/1"])).unwrap();
    let listed = kernel.queue_to_vat_root(&vat, "list", strings(&["a/"])).unwrap();
    let got = kernel.queue_to_vat_root(&vat, "get", strings(&["b/1"])).unwrap();
    let missing = kernel.queue_to_vat_root(&vat, "get", strings(&["a/1"])).unwrap();
    kernel.run().await.unwrap();

    assert_eq!(outcome(&kernel, listed), Ok(json!(["a/2"])));
    assert_eq!(outcome(&kernel, got), Ok(json!("z")));
    assert_eq!(outcome(&kernel, missing), Ok(json!(null)));
    let stats = kernel.vat_stats(&vat).unwrap();
    assert_eq!(stats.vatstore_keys, 2);
    assert_eq!(stats.deliveries, 7);
    // Seven deliveries behind the startVat entry.
    assert_eq!(stats.transcript_entries, 8);
}

#[tokio::test]
async fn devices_answer_synchronously() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let clock = kernel
        .register_device(
            "clock",
            Arc::new(|method: &str, _args: &KernelCapData| -> Result<KernelCapData, String> {
                match method {
                    "now" => Ok(CapData::data(&json!(1234))),
                    other => Err(format!("clock has no method {other}")),
                }
            }),
        )
        .unwrap();
    let vat = kernel.create_vat(VatOptions::new("timekeeper")).await.unwrap();
    let now = kernel
        .queue_to_vat_root(&vat, "now", args(json!([slot_ref(0)]), vec![clock]))
        .unwrap();
    kernel.run().await.unwrap();
    assert_eq!(outcome(&kernel, now), Ok(json!(1234)));
    assert_eq!(kernel.stats().unwrap().syscalls["callNow"], 1);
}

#[tokio::test]
async fn failing_device_terminates_the_caller() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let broken = kernel
        .register_device(
            "broken",
            Arc::new(|_: &str, _: &KernelCapData| -> Result<KernelCapData, String> {
                Err("out of order".to_string())
            }),
        )
        .unwrap();
    let vat = kernel.create_vat(VatOptions::new("timekeeper")).await.unwrap();
    let now = kernel
        .queue_to_vat_root(&vat, "now", args(json!([slot_ref(0)]), vec![broken]))
        .unwrap();
    kernel.run().await.unwrap();

    assert!(rejection(&kernel, now).contains("out of order"));
    assert!(kernel.vat_ids().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_results_leave_the_vat_running() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("faulty")).await.unwrap();
    let failed = kernel.queue_to_vat_root(&vat, "fail", no_args()).unwrap();
    let fine = kernel.queue_to_vat_root(&vat, "ok", no_args()).unwrap();
    kernel.run().await.unwrap();

    assert_eq!(rejection(&kernel, failed), "deliberate failure");
    assert_eq!(outcome(&kernel, fine), Ok(json!("fine")));
    assert_eq!(kernel.vat_ids().unwrap(), vec![vat]);
}

#[tokio::test]
async fn exit_terminates_after_the_delivery() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("faulty")).await.unwrap();
    let root = kernel.vat_root(&vat).unwrap();
    kernel.queue_to_vat_root(&vat, "quit", strings(&["bye"])).unwrap();
    kernel.run().await.unwrap();

    assert!(kernel.vat_ids().unwrap().is_empty());
    assert!(matches!(kernel.vat_root(&vat), Err(KernelError::UnknownVat(_))));
    assert_eq!(kernel.stats().unwrap().terminated_vats, 1);

    // The host still holds the old root; sends to it bounce.
    let late = kernel.queue_message(root, "ok", no_args()).unwrap();
    kernel.run().await.unwrap();
    assert_eq!(rejection(&kernel, late), "vat terminated");
}

#[tokio::test]
async fn overspending_vat_is_terminated() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel
        .create_vat(VatOptions::new("faulty").with_meter_limit(100))
        .await
        .unwrap();
    let cheap = kernel.queue_to_vat_root(&vat, "overspend", args(json!([10]), vec![])).unwrap();
    let costly = kernel.queue_to_vat_root(&vat, "overspend", args(json!([500]), vec![])).unwrap();
    kernel.run().await.unwrap();

    assert_eq!(outcome(&kernel, cheap), Ok(undefined()));
    assert!(rejection(&kernel, costly).contains("meter exhausted"));
    assert!(kernel.vat_ids().unwrap().is_empty());
}

#[tokio::test]
async fn panicking_local_vat_is_terminated() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("faulty")).await.unwrap();
    let died = kernel.queue_to_vat_root(&vat, "die", no_args()).unwrap();
    kernel.run().await.unwrap();

    assert!(rejection(&kernel, died).contains("exited"));
    assert!(kernel.vat_ids().unwrap().is_empty());
}

#[tokio::test]
async fn host_can_terminate_a_vat() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let vat = kernel.create_vat(VatOptions::new("echo")).await.unwrap();
    kernel.terminate_vat(&vat, CapData::error("enough")).await.unwrap();
    assert!(kernel.vat_ids().unwrap().is_empty());
    assert!(matches!(
        kernel.terminate_vat(&vat, CapData::error("again")).await,
        Err(KernelError::UnknownVat(_))
    ));
    assert_eq!(kernel.transcripts().len(&vat).unwrap(), 0);
}

#[tokio::test]
async fn unknown_bundles_fail_creation() {
    let mut kernel = helpers::kernel(KernelConfig::default());
    let err = kernel.create_vat(VatOptions::new("nope")).await.unwrap_err();
    assert!(matches!(err, KernelError::Bundle(_)), "{err}");
    assert!(kernel.vat_ids().unwrap().is_empty());
}
