use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::slots::{KernelSlot, VatSlot};

/// Tag key marking special encodings inside a capdata body.
pub const QCLASS: &str = "@qclass";

/// Serialized value: a JSON body plus the slots it references by index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    pub slots: Vec<S>,
}

pub type VatCapData = CapData<VatSlot>;
pub type KernelCapData = CapData<KernelSlot>;

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Plain JSON data with no slots.
    pub fn data(body: &serde_json::Value) -> Self {
        Self::new(body.to_string(), Vec::new())
    }

    pub fn undefined() -> Self {
        Self::data(&json!({ "@qclass": "undefined" }))
    }

    /// An `Error` value carrying only a message.
    pub fn error(message: impl AsRef<str>) -> Self {
        Self::data(&json!({ "@qclass": "error", "name": "Error", "message": message.as_ref() }))
    }

    /// Capdata whose body is exactly one slot reference.
    pub fn single_slot(slot: S) -> Self {
        Self::new(json!({ "@qclass": "slot", "index": 0 }).to_string(), vec![slot])
    }

    pub fn map_slots<T, E>(&self, mut f: impl FnMut(&S) -> Result<T, E>) -> Result<CapData<T>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotKind;

    #[test]
    fn helper_bodies() {
        let undef = VatCapData::undefined();
        assert_eq!(undef.body, r#"{"@qclass":"undefined"}"#);
        let single = VatCapData::single_slot(VatSlot::export(SlotKind::Object, 1));
        assert_eq!(single.body, r#"{"@qclass":"slot","index":0}"#);
        let err = KernelCapData::error("boom");
        let parsed: serde_json::Value = serde_json::from_str(&err.body).unwrap();
        assert_eq!(parsed["message"], "boom");
    }

    #[test]
    fn map_slots_keeps_body() {
        let data = VatCapData::new("[1]", vec![VatSlot::import(SlotKind::Object, 3)]);
        let mapped: KernelCapData = data
            .map_slots(|s| Ok::<_, ()>(KernelSlot::object(s.id + 10)))
            .unwrap();
        assert_eq!(mapped.body, "[1]");
        assert_eq!(mapped.slots, vec![KernelSlot::object(13)]);
    }
}
