use std::collections::BTreeMap;

use crate::context::VatContext;
use crate::value::Value;

/// Outcome of a method invocation: `Err` carries the rejection reason.
pub type VatResult = Result<Value, Value>;

/// An object that can receive messages. Invocation is by method name; an
/// unknown name is a rejection, never a kernel error.
pub trait VatObject: Send + Sync {
    fn interface(&self) -> &str {
        "Remotable"
    }

    fn invoke(&self, vat: &mut VatContext, method: &str, args: Vec<Value>) -> VatResult;
}

type MethodFn = Box<dyn Fn(&mut VatContext, Vec<Value>) -> VatResult + Send + Sync>;

/// Method-table object built from closures.
pub struct Far {
    iface: String,
    methods: BTreeMap<String, MethodFn>,
}

impl Far {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut VatContext, Vec<Value>) -> VatResult + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(handler));
        self
    }
}

impl std::fmt::Debug for Far {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Far")
            .field("iface", &self.iface)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VatObject for Far {
    fn interface(&self) -> &str {
        &self.iface
    }

    fn invoke(&self, vat: &mut VatContext, method: &str, args: Vec<Value>) -> VatResult {
        match self.methods.get(method) {
            Some(handler) => handler(vat, args),
            None => Err(Value::type_error(format!(
                "target {} has no method {method:?}",
                self.iface
            ))),
        }
    }
}

/// Positional argument accessor for method bodies.
pub fn arg(args: &[Value], index: usize) -> Result<&Value, Value> {
    args.get(index)
        .ok_or_else(|| Value::type_error(format!("missing argument {index}")))
}
