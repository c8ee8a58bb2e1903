//! Structured kernel log ("slog"): one event per delivery, syscall, replay
//! and console line, written to a pluggable sink.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use swing_abi::{VatDelivery, VatDeliveryResult, VatId, VatSyscall, VatSyscallResult};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SlogEvent {
    CreateVat {
        vat_id: VatId,
        bundle: String,
        manager: String,
    },
    CrankStart {
        crank: u64,
        kind: String,
    },
    Deliver {
        vat_id: VatId,
        delivery_num: u64,
        delivery: VatDelivery,
        replay: bool,
    },
    DeliverResult {
        vat_id: VatId,
        delivery_num: u64,
        result: VatDeliveryResult,
    },
    Syscall {
        vat_id: VatId,
        syscall: VatSyscall,
        replay: bool,
    },
    SyscallResult {
        vat_id: VatId,
        result: VatSyscallResult,
        replay: bool,
    },
    ReplayStart {
        vat_id: VatId,
        start: u64,
    },
    ReplayDone {
        vat_id: VatId,
        deliveries: u64,
    },
    Console {
        vat_id: VatId,
        line: String,
    },
    TerminateVat {
        vat_id: VatId,
        reason: String,
    },
}

impl SlogEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            SlogEvent::CreateVat { .. } => "create-vat",
            SlogEvent::CrankStart { .. } => "crank-start",
            SlogEvent::Deliver { .. } => "deliver",
            SlogEvent::DeliverResult { .. } => "deliver-result",
            SlogEvent::Syscall { .. } => "syscall",
            SlogEvent::SyscallResult { .. } => "syscall-result",
            SlogEvent::ReplayStart { .. } => "replay-start",
            SlogEvent::ReplayDone { .. } => "replay-done",
            SlogEvent::Console { .. } => "console",
            SlogEvent::TerminateVat { .. } => "terminate-vat",
        }
    }
}

pub trait Slog: Send + Sync {
    fn write(&self, event: &SlogEvent);
}

pub type DynSlog = Arc<dyn Slog>;

/// Writes the closing event of a delivery.
#[must_use]
pub struct DeliveryFinisher {
    slog: DynSlog,
    vat_id: VatId,
    delivery_num: u64,
}

impl DeliveryFinisher {
    pub fn finish(self, result: &VatDeliveryResult) {
        self.slog.write(&SlogEvent::DeliverResult {
            vat_id: self.vat_id,
            delivery_num: self.delivery_num,
            result: result.clone(),
        });
    }
}

/// Writes the closing event of a syscall.
#[must_use]
pub struct SyscallFinisher {
    slog: DynSlog,
    vat_id: VatId,
    replay: bool,
}

impl SyscallFinisher {
    pub fn finish(self, result: &VatSyscallResult) {
        self.slog.write(&SlogEvent::SyscallResult {
            vat_id: self.vat_id,
            result: result.clone(),
            replay: self.replay,
        });
    }
}

pub fn delivery(
    slog: &DynSlog,
    vat_id: &VatId,
    delivery_num: u64,
    delivery: &VatDelivery,
    replay: bool,
) -> DeliveryFinisher {
    slog.write(&SlogEvent::Deliver {
        vat_id: vat_id.clone(),
        delivery_num,
        delivery: delivery.clone(),
        replay,
    });
    DeliveryFinisher {
        slog: Arc::clone(slog),
        vat_id: vat_id.clone(),
        delivery_num,
    }
}

pub fn syscall(slog: &DynSlog, vat_id: &VatId, syscall: &VatSyscall, replay: bool) -> SyscallFinisher {
    slog.write(&SlogEvent::Syscall {
        vat_id: vat_id.clone(),
        syscall: syscall.clone(),
        replay,
    });
    SyscallFinisher {
        slog: Arc::clone(slog),
        vat_id: vat_id.clone(),
        replay,
    }
}

pub fn vat_console(slog: &DynSlog, vat_id: &VatId, line: &str) {
    slog.write(&SlogEvent::Console {
        vat_id: vat_id.clone(),
        line: line.to_string(),
    });
}

/// Emits every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSlog;

impl Slog for TracingSlog {
    fn write(&self, event: &SlogEvent) {
        match event {
            SlogEvent::Console { vat_id, line } => {
                tracing::info!(target: "swingset::console", vat = %vat_id, "{line}");
            }
            SlogEvent::TerminateVat { vat_id, reason } => {
                tracing::warn!(target: "swingset::slog", vat = %vat_id, "vat terminated: {reason}");
            }
            SlogEvent::DeliverResult { vat_id, delivery_num, result } => match result.error_message() {
                Some(message) => tracing::warn!(
                    target: "swingset::slog",
                    vat = %vat_id,
                    delivery = delivery_num,
                    "delivery failed: {message}"
                ),
                None => tracing::debug!(
                    target: "swingset::slog",
                    vat = %vat_id,
                    delivery = delivery_num,
                    computrons = result.usage().map(|u| u.computrons),
                    "delivery done"
                ),
            },
            other => match serde_json::to_string(other) {
                Ok(json) => tracing::debug!(target: "swingset::slog", kind = other.type_name(), "{json}"),
                Err(err) => tracing::warn!(target: "swingset::slog", "unserializable slog event: {err}"),
            },
        }
    }
}

/// Keeps every event as JSON, for inspection in tests.
#[derive(Debug, Default)]
pub struct MemorySlog {
    events: Mutex<Vec<serde_json::Value>>,
}

impl MemorySlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn events_of_type(&self, type_name: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|event| event["type"] == type_name)
            .collect()
    }
}

impl Slog for MemorySlog {
    fn write(&self, event: &SlogEvent) {
        match serde_json::to_value(event) {
            Ok(value) => self.events.lock().unwrap_or_else(PoisonError::into_inner).push(value),
            Err(err) => log::warn!("dropping slog event {}: {err}", event.type_name()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSlog;

impl Slog for NullSlog {
    fn write(&self, _event: &SlogEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use swing_abi::SyscallResult;

    #[test]
    fn finishers_close_their_events() {
        let memory = Arc::new(MemorySlog::new());
        let slog: DynSlog = memory.clone();
        let vat = VatId::from_index(1);

        let done = delivery(&slog, &vat, 3, &VatDelivery::BringOutYourDead, false);
        let call = syscall(&slog, &vat, &VatSyscall::VatstoreGet { key: "k".into() }, true);
        call.finish(&SyscallResult::ok());
        done.finish(&VatDeliveryResult::ok(None));
        vat_console(&slog, &vat, "hello");

        let types: Vec<_> = memory.events().iter().map(|e| e["type"].clone()).collect();
        assert_eq!(
            types,
            ["deliver", "syscall", "syscall-result", "deliver-result", "console"]
        );
        let syscall_event = &memory.events_of_type("syscall")[0];
        assert_eq!(syscall_event["replay"], true);
        assert_eq!(syscall_event["syscall"]["type"], "vatstoreGet");
        assert_eq!(memory.events_of_type("deliver")[0]["deliveryNum"], 3);
    }
}
