//! Byte-level codecs shared by the kernel, the vat workers and the stores:
//! netstring framing, canonical JSON for transcript comparison, canonical
//! CBOR for durable records, and the sha256 chain over them.

pub mod djson;
pub mod netstring;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

pub use netstring::{NetstringDecoder, NetstringError};

/// Encode `value` as CBOR with map keys in canonical order, so equal records
/// always hash the same.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    // Going through `Value` sorts maps by their encoded keys.
    let ordered = serde_cbor::value::to_value(value)?;
    serde_cbor::to_vec(&ordered)
}

/// Head of a sha256 hash chain. The default is the empty chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Digest256([u8; 32]);

impl Digest256 {
    /// `sha256(self || bytes)`.
    pub fn chain(&self, bytes: &[u8]) -> Self {
        Digest256(Sha256::new().chain_update(self.0).chain_update(bytes).finalize().into())
    }

    pub fn to_hex(&self) -> String {
        format!("sha256:{}", hex::encode(self.0))
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Failures shared by the JSON-in-netstring message codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Netstring(#[from] NetstringError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a serializable message as a netstring-framed JSON payload.
pub fn encode_json_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(message)?;
    Ok(netstring::encode(&payload))
}

/// Decode a single netstring payload (already unframed) as JSON.
pub fn decode_json_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_cbor_ignores_map_order() {
        let a = json!({"b": 1, "a": [1, 2, {"z": null, "y": true}]});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a":[1,2,{"y":true,"z":null}],"b":1}"#).unwrap();
        assert_eq!(to_canonical_cbor(&a).unwrap(), to_canonical_cbor(&b).unwrap());
        let decoded: serde_json::Value =
            serde_cbor::from_slice(&to_canonical_cbor(&a).unwrap()).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn digests_chain_in_order() {
        let root = Digest256::default();
        let one = root.chain(b"one");
        assert_ne!(one, root);
        assert_eq!(one, Digest256::default().chain(b"one"));
        assert_ne!(one.chain(b"two"), root.chain(b"two").chain(b"one"));
        assert!(one.to_string().starts_with("sha256:"));
        assert_eq!(one.to_hex().len(), "sha256:".len() + 64);
    }

    #[test]
    fn json_frames_round_trip_through_decoder() {
        let frame = encode_json_frame(&json!(["deliver", {"n": 1}])).unwrap();
        let mut decoder = NetstringDecoder::new();
        let payloads = decoder.feed(&frame).unwrap();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = decode_json_payload(&payloads[0]).unwrap();
        assert_eq!(value, json!(["deliver", {"n": 1}]));
    }
}
