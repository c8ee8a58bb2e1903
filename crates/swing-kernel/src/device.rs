//! Devices: kernel-resident objects vats reach synchronously through
//! `callNow`.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use swing_abi::{KernelCapData, KernelSlot};

pub trait Device: Send + Sync {
    /// Run `method` and return its result, or a reason the call failed.
    fn invoke(&self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String>;
}

impl<F> Device for F
where
    F: Fn(&str, &KernelCapData) -> Result<KernelCapData, String> + Send + Sync,
{
    fn invoke(&self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String> {
        self(method, args)
    }
}

struct Registered {
    name: String,
    device: Arc<dyn Device>,
}

/// Devices by kernel slot, shared between the kernel and every vat's
/// syscall handler.
#[derive(Clone, Default)]
pub struct DeviceTable {
    devices: Arc<RwLock<BTreeMap<KernelSlot, Registered>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kref: KernelSlot, name: &str, device: Arc<dyn Device>) {
        self.devices.write().unwrap_or_else(PoisonError::into_inner).insert(
            kref,
            Registered {
                name: name.to_string(),
                device,
            },
        );
    }

    pub fn name(&self, kref: KernelSlot) -> Option<String> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(&kref).map(|registered| registered.name.clone())
    }

    pub fn invoke(&self, kref: KernelSlot, method: &str, args: &KernelCapData) -> Result<KernelCapData, String> {
        let device = {
            let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
            devices
                .get(&kref)
                .map(|registered| Arc::clone(&registered.device))
                .ok_or_else(|| format!("no device registered at {kref}"))?
        };
        device.invoke(method, args)
    }
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(devices.iter().map(|(kref, registered)| (kref, &registered.name)))
            .finish()
    }
}
