use swing_abi::{VatDelivery, VatDeliveryResult};

use crate::bundle::VatBundle;
use crate::context::VatContext;
use crate::value::Value;
use crate::{LiveSlotsError, Syscall};

/// One vat's liveslots instance: owns the [`VatContext`] and turns kernel
/// deliveries into jobs on it.
pub struct LiveSlots {
    vat: VatContext,
    root: Option<Value>,
}

impl LiveSlots {
    pub fn new(vat_id: impl Into<String>, syscall: Box<dyn Syscall>) -> Self {
        Self {
            vat: VatContext::new(vat_id.into(), syscall),
            root: None,
        }
    }

    /// Route `console` output from vat code to `sink` instead of the log.
    pub fn with_console(mut self, sink: impl FnMut(&str) + Send + 'static) -> Self {
        self.vat.set_console(Box::new(sink));
        self
    }

    /// Evaluate the bundle and register its root object as `o+0`. Jobs the
    /// bundle scheduled during startup run before this returns.
    pub fn start(
        &mut self,
        bundle: &dyn VatBundle,
        params: &serde_json::Value,
    ) -> Result<(), LiveSlotsError> {
        self.vat.begin_delivery(None);
        let root = bundle.build_root_object(&mut self.vat, params)?;
        self.vat.register_root(&root)?;
        self.vat.run_until_quiescent();
        if let Some(err) = self.vat.take_fatal() {
            return Err(err);
        }
        log::debug!("{}: started", self.vat.vat_id());
        self.root = Some(root);
        Ok(())
    }

    pub fn root(&self) -> Option<&Value> {
        self.root.as_ref()
    }

    pub fn context(&mut self) -> &mut VatContext {
        &mut self.vat
    }

    /// Apply one delivery and run the vat until it has nothing left to do.
    /// `budget` caps the computrons spent; exceeding it fails the delivery.
    pub fn dispatch(&mut self, delivery: VatDelivery, budget: Option<u64>) -> VatDeliveryResult {
        if self.root.is_none() {
            return VatDeliveryResult::error("vat has not been started", None);
        }
        if matches!(delivery, VatDelivery::StartVat) {
            return VatDeliveryResult::error("vat is already started", None);
        }
        self.vat.begin_delivery(budget);
        let kind = delivery.kind_name();
        let collect = matches!(delivery, VatDelivery::BringOutYourDead);
        let applied = match delivery {
            VatDelivery::Message { target, msg } => self.vat.deliver(target, msg),
            VatDelivery::Notify { vpid, resolution } => self.vat.notify(vpid, resolution),
            VatDelivery::DropExports { vrefs } => self.vat.drop_exports(&vrefs),
            VatDelivery::RetireExports { vrefs } => self.vat.retire_exports(&vrefs),
            VatDelivery::RetireImports { vrefs } => self.vat.retire_imports(&vrefs),
            VatDelivery::BringOutYourDead | VatDelivery::StartVat => Ok(()),
        };
        match applied {
            Ok(()) => {
                self.vat.run_until_quiescent();
                if collect {
                    if let Err(err) = self.vat.bring_out_your_dead() {
                        self.vat.fail(err);
                    }
                }
            }
            Err(err) => self.vat.fail(err),
        }
        let result = self.vat.finish_delivery();
        if let Some(message) = result.error_message() {
            log::warn!("{}: {kind} failed: {message}", self.vat.vat_id());
        }
        result
    }
}

impl std::fmt::Debug for LiveSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSlots")
            .field("vat_id", &self.vat.vat_id())
            .field("started", &self.root.is_some())
            .finish()
    }
}
