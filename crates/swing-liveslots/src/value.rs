use std::collections::BTreeMap;

/// Handle to a remotable (local object, presence or device node) owned by
/// one liveslots instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub(crate) u64);

/// Handle to a promise owned by one liveslots instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub(crate) u64);

/// A passable value inside a vat. Remotables and promises compare by handle,
/// which is object identity.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Error { name: String, message: String },
    Remotable(RefId),
    Promise(PromiseId),
}

impl Value {
    pub fn error(message: impl Into<String>) -> Self {
        Value::Error {
            name: "Error".into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Value::Error {
            name: "TypeError".into(),
            message: message.into(),
        }
    }

    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Record(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<PromiseId> {
        match self {
            Value::Promise(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_remotable(&self) -> Option<RefId> {
        match self {
            Value::Remotable(id) => Some(*id),
            _ => None,
        }
    }

    /// Error message for `Value::Error`, if any.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Value::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "array",
            Value::Record(_) => "record",
            Value::Error { .. } => "error",
            Value::Remotable(_) => "remotable",
            Value::Promise(_) => "promise",
        }
    }

    /// Lift plain JSON (vat parameters, for instance) into a value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}
