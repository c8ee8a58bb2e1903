//! Capdata encoding of [`Value`]s. References become `{"@qclass":"slot"}`
//! entries pointing into the slot list; the converter decides which slot a
//! reference gets and which reference a slot names.

use std::collections::HashMap;

use serde_json::{Map, Value as Json, json};
use swing_abi::{CapData, QCLASS, VatCapData, VatSlot};

use crate::LiveSlotsError;
use crate::value::Value;

pub(crate) trait SlotConverter {
    fn convert_val_to_slot(&mut self, value: &Value) -> Result<VatSlot, LiveSlotsError>;
    fn convert_slot_to_val(&mut self, slot: VatSlot) -> Result<Value, LiveSlotsError>;
}

pub(crate) fn serialize<C: SlotConverter + ?Sized>(
    conv: &mut C,
    value: &Value,
) -> Result<VatCapData, LiveSlotsError> {
    let mut encoder = Encoder {
        conv,
        slots: Vec::new(),
        indices: HashMap::new(),
    };
    let body = encoder.encode(value)?;
    Ok(CapData::new(body.to_string(), encoder.slots))
}

pub(crate) fn unserialize<C: SlotConverter + ?Sized>(
    conv: &mut C,
    data: &VatCapData,
) -> Result<Value, LiveSlotsError> {
    let body: Json = serde_json::from_str(&data.body)
        .map_err(|err| LiveSlotsError::Marshal(format!("capdata body is not JSON: {err}")))?;
    decode(conv, &body, &data.slots)
}

struct Encoder<'a, C: ?Sized> {
    conv: &'a mut C,
    slots: Vec<VatSlot>,
    indices: HashMap<VatSlot, usize>,
}

impl<C: SlotConverter + ?Sized> Encoder<'_, C> {
    fn encode(&mut self, value: &Value) -> Result<Json, LiveSlotsError> {
        Ok(match value {
            Value::Undefined => json!({ "@qclass": "undefined" }),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Record(fields) => {
                if fields.contains_key(QCLASS) {
                    return Err(LiveSlotsError::Marshal(format!(
                        "records may not use the reserved key {QCLASS:?}"
                    )));
                }
                let mut map = Map::new();
                for (key, field) in fields {
                    map.insert(key.clone(), self.encode(field)?);
                }
                Json::Object(map)
            }
            Value::Error { name, message } => {
                json!({ "@qclass": "error", "name": name, "message": message })
            }
            Value::Remotable(_) | Value::Promise(_) => {
                let slot = self.conv.convert_val_to_slot(value)?;
                let slots = &mut self.slots;
                let index = *self.indices.entry(slot).or_insert_with(|| {
                    slots.push(slot);
                    slots.len() - 1
                });
                json!({ "@qclass": "slot", "index": index })
            }
        })
    }
}

fn decode<C: SlotConverter + ?Sized>(
    conv: &mut C,
    json: &Json,
    slots: &[VatSlot],
) -> Result<Value, LiveSlotsError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.clone()),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| decode(conv, item, slots))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(map) => match map.get(QCLASS) {
            None => {
                let mut fields = std::collections::BTreeMap::new();
                for (key, field) in map {
                    fields.insert(key.clone(), decode(conv, field, slots)?);
                }
                Value::Record(fields)
            }
            Some(Json::String(qclass)) => match qclass.as_str() {
                "undefined" => Value::Undefined,
                "slot" => {
                    let index = map
                        .get("index")
                        .and_then(Json::as_u64)
                        .ok_or_else(|| LiveSlotsError::Marshal("slot reference without index".into()))?;
                    let slot = slots.get(index as usize).ok_or_else(|| {
                        LiveSlotsError::Marshal(format!(
                            "slot index {index} out of range ({} slots)",
                            slots.len()
                        ))
                    })?;
                    conv.convert_slot_to_val(*slot)?
                }
                "error" => Value::Error {
                    name: map
                        .get("name")
                        .and_then(Json::as_str)
                        .unwrap_or("Error")
                        .to_string(),
                    message: map
                        .get("message")
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                other => {
                    return Err(LiveSlotsError::Marshal(format!(
                        "unrecognized {QCLASS} {other:?}"
                    )));
                }
            },
            Some(other) => {
                return Err(LiveSlotsError::Marshal(format!(
                    "{QCLASS} must be a string, got {other}"
                )));
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RefId;
    use swing_abi::SlotKind;

    /// Converter that maps remotable N to `o-N` and back.
    struct Identity;

    impl SlotConverter for Identity {
        fn convert_val_to_slot(&mut self, value: &Value) -> Result<VatSlot, LiveSlotsError> {
            match value {
                Value::Remotable(RefId(id)) => Ok(VatSlot::import(SlotKind::Object, *id)),
                other => Err(LiveSlotsError::Marshal(other.kind_name().into())),
            }
        }

        fn convert_slot_to_val(&mut self, slot: VatSlot) -> Result<Value, LiveSlotsError> {
            Ok(Value::Remotable(RefId(slot.id)))
        }
    }

    #[test]
    fn repeated_references_share_one_slot() {
        let value = Value::List(vec![
            Value::Remotable(RefId(4)),
            Value::from("x"),
            Value::Remotable(RefId(4)),
            Value::Remotable(RefId(2)),
        ]);
        let data = serialize(&mut Identity, &value).unwrap();
        assert_eq!(
            data.body,
            r#"[{"@qclass":"slot","index":0},"x",{"@qclass":"slot","index":0},{"@qclass":"slot","index":1}]"#
        );
        assert_eq!(data.slots.len(), 2);
        assert_eq!(unserialize(&mut Identity, &data).unwrap(), value);
    }

    #[test]
    fn special_forms() {
        let value = Value::record([
            ("u", Value::Undefined),
            ("e", Value::type_error("bad")),
            ("n", Value::Null),
        ]);
        let data = serialize(&mut Identity, &value).unwrap();
        assert!(data.slots.is_empty());
        assert_eq!(unserialize(&mut Identity, &data).unwrap(), value);
    }

    #[test]
    fn rejects_reserved_keys_and_bad_bodies() {
        let bad = Value::record([(QCLASS, Value::Null)]);
        assert!(serialize(&mut Identity, &bad).is_err());

        let out_of_range = CapData::new(r#"{"@qclass":"slot","index":3}"#, vec![]);
        assert!(unserialize(&mut Identity, &out_of_range).is_err());
        let unknown = CapData::new(r#"{"@qclass":"bigint","digits":"1"}"#, vec![]);
        assert!(unserialize(&mut Identity, &unknown).is_err());
        let garbage = CapData::new("{not json", vec![]);
        assert!(unserialize(&mut Identity, &garbage).is_err());
    }
}
