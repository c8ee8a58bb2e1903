use std::collections::BTreeMap;
use std::sync::Arc;

use crate::LiveSlotsError;
use crate::context::VatContext;
use crate::value::Value;

/// Vat code: builds the root object exported as `o+0`.
pub trait VatBundle: Send + Sync {
    fn build_root_object(
        &self,
        vat: &mut VatContext,
        params: &serde_json::Value,
    ) -> Result<Value, LiveSlotsError>;
}

struct FnBundle<F>(F);

impl<F> VatBundle for FnBundle<F>
where
    F: Fn(&mut VatContext, &serde_json::Value) -> Result<Value, LiveSlotsError> + Send + Sync,
{
    fn build_root_object(
        &self,
        vat: &mut VatContext,
        params: &serde_json::Value,
    ) -> Result<Value, LiveSlotsError> {
        (self.0)(vat, params)
    }
}

/// Resolves bundle names to vat code.
pub trait BundleLoader: Send + Sync {
    fn import_bundle(&self, name: &str) -> Result<Arc<dyn VatBundle>, LiveSlotsError>;
}

#[derive(Clone, Default)]
pub struct BundleRegistry {
    bundles: BTreeMap<String, Arc<dyn VatBundle>>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, build: F) -> &mut Self
    where
        F: Fn(&mut VatContext, &serde_json::Value) -> Result<Value, LiveSlotsError>
            + Send
            + Sync
            + 'static,
    {
        self.register_bundle(name, Arc::new(FnBundle(build)))
    }

    pub fn register_bundle(&mut self, name: &str, bundle: Arc<dyn VatBundle>) -> &mut Self {
        self.bundles.insert(name.to_string(), bundle);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for BundleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.bundles.keys()).finish()
    }
}

impl BundleLoader for BundleRegistry {
    fn import_bundle(&self, name: &str) -> Result<Arc<dyn VatBundle>, LiveSlotsError> {
        self.bundles
            .get(name)
            .cloned()
            .ok_or_else(|| LiveSlotsError::UnknownBundle(name.to_string()))
    }
}
