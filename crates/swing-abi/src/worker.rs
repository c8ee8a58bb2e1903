//! Messages exchanged with an out-of-process vat worker. Each message is one
//! JSON document inside one netstring frame.

use serde::{Deserialize, Serialize};
use swing_codec::{CodecError, decode_json_payload, encode_json_frame};

use crate::VatId;
use crate::delivery::{VatDelivery, VatDeliveryResult, VatSyscall, VatSyscallResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum KernelToWorker {
    /// Load the named bundle and build the vat root object. `blocking`
    /// workers wait for a `syscallResponse` after every syscall.
    SetBundle {
        vat_id: VatId,
        bundle: String,
        #[serde(default)]
        vat_parameters: serde_json::Value,
        blocking: bool,
    },
    Deliver {
        delivery: VatDelivery,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        budget: Option<u64>,
    },
    SyscallResponse {
        result: VatSyscallResult,
    },
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerToKernel {
    GotBundle,
    BundleError { message: String },
    Syscall { syscall: VatSyscall },
    Console { line: String },
    DeliverDone { result: VatDeliveryResult },
}

macro_rules! frame_codec {
    ($ty:ty) => {
        impl $ty {
            /// Netstring-framed JSON encoding.
            pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
                encode_json_frame(self)
            }

            /// Decode one unframed payload.
            pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
                decode_json_payload(payload)
            }
        }
    };
}

frame_codec!(KernelToWorker);
frame_codec!(WorkerToKernel);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capdata::CapData;
    use crate::delivery::{Message, Usage};
    use crate::slots::{SlotKind, VatSlot};
    use swing_codec::NetstringDecoder;

    #[test]
    fn frames_decode_back_to_messages() {
        let outbound = [
            KernelToWorker::SetBundle {
                vat_id: VatId::from_index(3),
                bundle: "echo".into(),
                vat_parameters: serde_json::json!({"greeting": "hi"}),
                blocking: false,
            },
            KernelToWorker::Deliver {
                delivery: VatDelivery::Message {
                    target: VatSlot::export(SlotKind::Object, 0),
                    msg: Message::new("echo", CapData::new("[1]", vec![]), None),
                },
                budget: Some(100),
            },
            KernelToWorker::Shutdown,
        ];
        let mut stream = Vec::new();
        for msg in &outbound {
            stream.extend(msg.encode().unwrap());
        }
        let mut decoder = NetstringDecoder::new();
        let payloads = decoder.feed(&stream).unwrap();
        let decoded: Vec<KernelToWorker> = payloads
            .iter()
            .map(|p| KernelToWorker::decode(p).unwrap())
            .collect();
        assert_eq!(decoded, outbound);
    }

    #[test]
    fn worker_messages_use_camel_case_tags() {
        let done = WorkerToKernel::DeliverDone {
            result: VatDeliveryResult::error("boom", Some(Usage { computrons: 4 })),
        };
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["type"], "deliverDone");
        assert_eq!(value["result"]["status"], "error");
        assert_eq!(value["result"]["usage"]["computrons"], 4);
    }
}
