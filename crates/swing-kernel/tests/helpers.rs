//! Shared helpers for the kernel integration tests.
//!
//! Each integration test compiles this module separately, so some helpers
//! look unused in some test binaries.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value as Json, json};
use swing_abi::{CapData, KernelCapData, KernelSlot};
use swing_kernel::{Kernel, KernelConfig, MemorySlog, NullSlog, PromiseStatus};
use swing_worker::fixtures;

/// Kernel over in-memory stores with the fixture bundles.
pub fn kernel(config: KernelConfig) -> Kernel {
    Kernel::builder(Arc::new(fixtures::registry()))
        .with_config(config)
        .with_slog(Arc::new(NullSlog))
        .build()
}

pub fn kernel_with_slog(config: KernelConfig) -> (Kernel, Arc<MemorySlog>) {
    let slog = Arc::new(MemorySlog::new());
    let kernel = Kernel::builder(Arc::new(fixtures::registry()))
        .with_config(config)
        .with_slog(slog.clone())
        .build();
    (kernel, slog)
}

/// Config that can start out-of-process vats.
pub fn worker_config() -> KernelConfig {
    KernelConfig::default().with_worker_bin(env!("CARGO_BIN_EXE_swing-worker"))
}

pub fn args(body: Json, slots: Vec<KernelSlot>) -> KernelCapData {
    CapData::new(body.to_string(), slots)
}

pub fn no_args() -> KernelCapData {
    args(json!([]), vec![])
}

pub fn strings(values: &[&str]) -> KernelCapData {
    args(json!(values), vec![])
}

/// Body of a reference to slot `index`.
pub fn slot_ref(index: usize) -> Json {
    json!({ "@qclass": "slot", "index": index })
}

pub fn undefined() -> Json {
    json!({ "@qclass": "undefined" })
}

/// `Ok(body)` for a fulfilled promise, `Err(body)` for a rejected one.
pub fn outcome(kernel: &Kernel, kpid: KernelSlot) -> Result<Json, Json> {
    match kernel.kpstatus(kpid).unwrap() {
        PromiseStatus::Fulfilled(data) => Ok(serde_json::from_str(&data.body).unwrap()),
        PromiseStatus::Rejected(data) => Err(serde_json::from_str(&data.body).unwrap()),
        PromiseStatus::Unresolved => panic!("{kpid} is still unresolved"),
    }
}

/// The error message carried by a rejection.
pub fn rejection(kernel: &Kernel, kpid: KernelSlot) -> String {
    let reason = outcome(kernel, kpid).expect_err("promise was fulfilled");
    reason["message"].as_str().unwrap_or_default().to_string()
}

/// The object a promise was fulfilled to.
pub fn presence(kernel: &Kernel, kpid: KernelSlot) -> KernelSlot {
    match kernel.kpstatus(kpid).unwrap() {
        PromiseStatus::Fulfilled(data) if data.slots.len() == 1 => data.slots[0],
        other => panic!("{kpid} is not a presence: {other:?}"),
    }
}
