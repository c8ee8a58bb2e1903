//! One vat's slice of kernel state: its c-list and its vatstore.
//!
//! ```text
//! vNN.{o,p,d}.nextID = NN            (import allocation)
//! vNN.c.koNN = "R o+5" | "_ o+5"     (flag: reachable or merely recognizable)
//! vNN.c.o+5 = koNN
//! vNN.vs.KEY = VALUE
//! vNN.options = JSON(VatOptions)     vNN.root = koNN
//! ```

use std::fmt::Display;

use serde::Serialize;
use swing_abi::{KernelSlot, SlotKind, VatId, VatSlot};

use crate::KernelError;
use crate::kernel_keeper::{KernelKeeper, RefOptions};

pub(crate) fn parse_clist_value(raw: &str) -> Option<(bool, VatSlot)> {
    let (flag, vref) = raw.split_once(' ')?;
    let reachable = match flag {
        "R" => true,
        "_" => false,
        _ => return None,
    };
    Some((reachable, vref.parse().ok()?))
}

fn clist_value(reachable: bool, vref: VatSlot) -> String {
    format!("{} {vref}", if reachable { 'R' } else { '_' })
}

/// How a c-list lookup treats missing entries and the reachable flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapOptions {
    /// Mark the entry reachable, or insist it already is when the other
    /// side owns the object.
    pub set_reachable: bool,
    /// Fail instead of allocating a new entry.
    pub required: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            set_reachable: true,
            required: false,
        }
    }
}

impl MapOptions {
    /// An existing entry, with its reachable flag left alone.
    pub const LOOKUP: MapOptions = MapOptions {
        set_reachable: false,
        required: true,
    };
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClistEntry {
    pub vat_id: VatId,
    pub kref: KernelSlot,
    pub vref: VatSlot,
    pub reachable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatStats {
    pub clist_entries: u64,
    pub object_exports: u64,
    pub object_imports: u64,
    pub promises: u64,
    pub devices: u64,
    pub vatstore_keys: u64,
    pub deliveries: u64,
    pub transcript_entries: u64,
}

pub struct VatKeeper<'a> {
    keeper: &'a mut KernelKeeper,
    vat_id: VatId,
}

impl<'a> VatKeeper<'a> {
    pub(crate) fn new(keeper: &'a mut KernelKeeper, vat_id: VatId) -> Self {
        Self { keeper, vat_id }
    }

    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn key(&self, slot: impl Display) -> String {
        format!("{}.c.{slot}", self.vat_id)
    }

    /// Translate a slot the vat named into a kernel slot, allocating a new
    /// kernel object or promise the first time the vat exports it.
    pub fn map_vat_to_kernel(
        &mut self,
        vref: VatSlot,
        options: MapOptions,
    ) -> Result<KernelSlot, KernelError> {
        if let Some(raw) = self.keeper.kv.get(&self.key(vref)) {
            let kref: KernelSlot = raw.parse().map_err(|_| KernelError::Corrupt {
                key: self.key(vref),
                reason: format!("bad kernel slot {raw:?}"),
            })?;
            if options.set_reachable {
                if vref.allocated_by_vat {
                    self.set_reachable_flag(kref)?;
                } else if !self.reachable_flag(kref) {
                    return Err(KernelError::unreachable(&self.vat_id, &vref));
                }
            }
            return Ok(kref);
        }
        if options.required {
            return Err(KernelError::missing(&self.vat_id, vref));
        }
        if !vref.allocated_by_vat {
            return Err(KernelError::clist(
                &self.vat_id,
                format!("vat used unknown import {vref}"),
            ));
        }
        let kref = match vref.kind {
            SlotKind::Object => self.keeper.add_kernel_object(&self.vat_id)?,
            SlotKind::Promise => self.keeper.add_kernel_promise(Some(&self.vat_id))?,
            SlotKind::Device => {
                return Err(KernelError::clist(
                    &self.vat_id,
                    format!("vats cannot export devices ({vref})"),
                ));
            }
        };
        log::debug!("{}: exports {vref} as {kref}", self.vat_id);
        self.add_clist_entry(kref, vref, options.set_reachable)?;
        Ok(kref)
    }

    /// Translate a kernel slot for delivery into the vat, allocating a new
    /// import the first time the vat sees it.
    pub fn map_kernel_to_vat(
        &mut self,
        kref: KernelSlot,
        options: MapOptions,
    ) -> Result<VatSlot, KernelError> {
        if let Some((reachable, vref)) = self.entry(kref) {
            if options.set_reachable {
                if !vref.allocated_by_vat {
                    self.set_reachable_flag(kref)?;
                } else if !reachable {
                    return Err(KernelError::unreachable(&self.vat_id, &vref));
                }
            }
            return Ok(vref);
        }
        if options.required {
            return Err(KernelError::missing(&self.vat_id, kref));
        }
        match kref.kind {
            SlotKind::Object if !self.keeper.object_exists(kref) => {
                return Err(KernelError::UnknownObject(kref));
            }
            SlotKind::Promise if !self.keeper.promise_exists(kref) => {
                return Err(KernelError::UnknownPromise(kref));
            }
            SlotKind::Device if !self.keeper.device_exists(kref) => {
                return Err(KernelError::UnknownDevice(kref));
            }
            _ => {}
        }
        let id = self
            .keeper
            .allocate_id(&format!("{}.{}.nextID", self.vat_id, kref.kind.letter()))?;
        let vref = VatSlot::import(kref.kind, id);
        log::debug!("{}: imports {kref} as {vref}", self.vat_id);
        self.add_clist_entry(kref, vref, options.set_reachable)?;
        Ok(vref)
    }

    pub fn lookup_vat_slot(&self, vref: VatSlot) -> Option<KernelSlot> {
        self.keeper.kv.get(&self.key(vref))?.parse().ok()
    }

    /// `(reachable, vref)` for `kref`.
    pub fn entry(&self, kref: KernelSlot) -> Option<(bool, VatSlot)> {
        self.keeper.clist_entry(&self.vat_id, kref)
    }

    pub fn has_entry(&self, kref: KernelSlot) -> bool {
        self.entry(kref).is_some()
    }

    pub fn reachable_flag(&self, kref: KernelSlot) -> bool {
        self.keeper.reachable_flag(&self.vat_id, kref)
    }

    /// No-op when already set. Re-reaching an object import counts again.
    pub fn set_reachable_flag(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let (reachable, vref) = self
            .entry(kref)
            .ok_or_else(|| KernelError::missing(&self.vat_id, kref))?;
        if reachable {
            return Ok(());
        }
        self.keeper.kv.set(&self.key(kref), &clist_value(true, vref));
        if !vref.allocated_by_vat {
            self.keeper.adjust_reachable(kref, true)?;
        }
        Ok(())
    }

    pub fn clear_reachable_flag(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let (reachable, vref) = self
            .entry(kref)
            .ok_or_else(|| KernelError::missing(&self.vat_id, kref))?;
        if !reachable {
            return Ok(());
        }
        self.keeper.kv.set(&self.key(kref), &clist_value(false, vref));
        if !vref.allocated_by_vat {
            self.keeper.adjust_reachable(kref, false)?;
        }
        Ok(())
    }

    fn add_clist_entry(
        &mut self,
        kref: KernelSlot,
        vref: VatSlot,
        reachable: bool,
    ) -> Result<(), KernelError> {
        self.keeper.kv.set(&self.key(kref), &clist_value(reachable, vref));
        self.keeper.kv.set(&self.key(vref), &kref.to_string());
        self.keeper.increment_refcount(
            kref,
            RefOptions {
                is_export: vref.allocated_by_vat,
                only_recognizable: !reachable,
            },
        )
    }

    pub fn delete_clist_entry(&mut self, kref: KernelSlot, vref: VatSlot) -> Result<(), KernelError> {
        let reachable = self.reachable_flag(kref);
        self.keeper.kv.delete(&self.key(kref));
        self.keeper.kv.delete(&self.key(vref));
        log::debug!("{}: forgets {vref} ({kref})", self.vat_id);
        self.keeper.decrement_refcount(
            kref,
            RefOptions {
                is_export: vref.allocated_by_vat,
                only_recognizable: !reachable,
            },
        )
    }

    pub fn clist_entries(&self) -> Result<Vec<ClistEntry>, KernelError> {
        let prefix = format!("{}.c.k", self.vat_id);
        let mut entries = Vec::new();
        for key in self.keeper.kv.keys_with_prefix(&prefix) {
            let kref: KernelSlot = key[prefix.len() - 1..].parse()?;
            if let Some((reachable, vref)) = self.entry(kref) {
                entries.push(ClistEntry {
                    vat_id: self.vat_id.clone(),
                    kref,
                    vref,
                    reachable,
                });
            }
        }
        Ok(entries)
    }

    pub fn set_root(&mut self, kref: KernelSlot) {
        self.keeper.kv.set(&format!("{}.root", self.vat_id), &kref.to_string());
    }

    pub fn root(&self) -> Option<KernelSlot> {
        self.keeper.kv.get(&format!("{}.root", self.vat_id))?.parse().ok()
    }

    // vatstore

    fn vatstore_prefix(&self) -> String {
        format!("{}.vs.", self.vat_id)
    }

    pub fn vatstore_get(&self, key: &str) -> Option<String> {
        self.keeper.kv.get(&format!("{}{key}", self.vatstore_prefix()))
    }

    pub fn vatstore_set(&mut self, key: &str, value: &str) {
        self.keeper.kv.set(&format!("{}{key}", self.vatstore_prefix()), value);
    }

    pub fn vatstore_delete(&mut self, key: &str) {
        self.keeper.kv.delete(&format!("{}{key}", self.vatstore_prefix()));
    }

    /// The first entry after `prior` (or at or after `lower` when `prior` is
    /// empty) that stays below `upper`, or shares the `lower` prefix when
    /// there is no upper bound.
    pub fn vatstore_get_after(
        &self,
        prior: &str,
        lower: &str,
        upper: Option<&str>,
    ) -> Option<(String, String)> {
        let prefix = self.vatstore_prefix();
        let kv = &self.keeper.kv;
        let full = if prior.is_empty() || prior < lower {
            let start = format!("{prefix}{lower}");
            if kv.has(&start) {
                start
            } else {
                kv.next_key(&start)?
            }
        } else {
            kv.next_key(&format!("{prefix}{prior}"))?
        };
        let key = full.strip_prefix(&prefix)?;
        let in_range = match upper {
            Some(upper) => key < upper,
            None => key.starts_with(lower),
        };
        if !in_range {
            return None;
        }
        Some((key.to_string(), kv.get(&full)?))
    }

    /// Drop every c-list entry (releasing the references they held) and
    /// every other key under this vat.
    pub(crate) fn delete_everything(&mut self) -> Result<(), KernelError> {
        for entry in self.clist_entries()? {
            self.delete_clist_entry(entry.kref, entry.vref)?;
        }
        let kv = &self.keeper.kv;
        for key in kv.keys_with_prefix(&format!("{}.", self.vat_id)) {
            kv.delete(&key);
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<VatStats, KernelError> {
        let mut stats = VatStats::default();
        for entry in self.clist_entries()? {
            stats.clist_entries += 1;
            match (entry.kref.kind, entry.vref.allocated_by_vat) {
                (SlotKind::Object, true) => stats.object_exports += 1,
                (SlotKind::Object, false) => stats.object_imports += 1,
                (SlotKind::Promise, _) => stats.promises += 1,
                (SlotKind::Device, _) => stats.devices += 1,
            }
        }
        stats.vatstore_keys = self.keeper.kv.keys_with_prefix(&self.vatstore_prefix()).len() as u64;
        stats.deliveries = self
            .keeper
            .kv
            .get(&format!("{}.deliveries", self.vat_id))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Ok(stats)
    }
}
