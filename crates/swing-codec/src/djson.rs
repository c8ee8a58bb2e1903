//! Deterministic JSON: object keys are always emitted in sorted order, no
//! whitespace. Used to compare replayed syscalls against recorded ones.

use serde::Serialize;
use serde_json::Value;

pub fn stringify<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Compare two values by their deterministic encodings.
pub fn equal<A: Serialize + ?Sized, B: Serialize + ?Sized>(
    a: &A,
    b: &B,
) -> Result<bool, serde_json::Error> {
    Ok(stringify(a)? == stringify(b)?)
}

fn write_value(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
