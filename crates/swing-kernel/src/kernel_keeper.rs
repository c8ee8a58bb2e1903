//! Durable kernel state on top of a [`KvStore`].
//!
//! Key layout:
//!
//! ```text
//! vat.nextID, ko.nextID, kp.nextID, kd.nextID, crankNumber
//! vat.ids = JSON([vatID..])          vats.terminated = JSON([vatID..])
//! koNN.owner = vatID                 koNN.refCount = "reachable,recognizable"
//! kpNN = JSON(KernelPromise)         kpNN.refCount = NN
//! kdNN.name = name
//! runQueue = JSON([item..])          gcActions = JSON([item..])
//! ```
//!
//! Per-vat keys (`vNN.*`) belong to [`VatKeeper`].

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use swing_abi::{
    CapData, KernelCapData, KernelMessage, KernelSlot, Resolution, SlotKind, VatId, VatSlot,
};
use swing_store::DynKvStore;

use crate::KernelError;
use crate::config::VatOptions;
use crate::vat_keeper::{VatKeeper, parse_clist_value};

const FIRST_VAT_ID: u64 = 1;
const FIRST_OBJECT_ID: u64 = 20;
const FIRST_DEVNODE_ID: u64 = 30;
const FIRST_PROMISE_ID: u64 = 40;

const RUN_QUEUE: &str = "runQueue";
const GC_ACTIONS: &str = "gcActions";
const VAT_IDS: &str = "vat.ids";
const TERMINATED: &str = "vats.terminated";

/// One unit of kernel work. Each item processed is one crank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunQueueItem {
    Send { target: KernelSlot, msg: KernelMessage },
    Notify { vat_id: VatId, kpid: KernelSlot },
    DropExports { vat_id: VatId, krefs: Vec<KernelSlot> },
    RetireExports { vat_id: VatId, krefs: Vec<KernelSlot> },
    RetireImports { vat_id: VatId, krefs: Vec<KernelSlot> },
    BringOutYourDead { vat_id: VatId },
}

impl RunQueueItem {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RunQueueItem::Send { .. } => "send",
            RunQueueItem::Notify { .. } => "notify",
            RunQueueItem::DropExports { .. } => "dropExports",
            RunQueueItem::RetireExports { .. } => "retireExports",
            RunQueueItem::RetireImports { .. } => "retireImports",
            RunQueueItem::BringOutYourDead { .. } => "bringOutYourDead",
        }
    }

    /// Krefs this item holds a reference on while it waits in the queue.
    fn held_slots(&self) -> Vec<KernelSlot> {
        match self {
            RunQueueItem::Send { target, msg } => {
                let mut slots = vec![*target];
                slots.extend(msg.slots());
                slots
            }
            RunQueueItem::Notify { kpid, .. } => vec![*kpid],
            _ => Vec::new(),
        }
    }
}

/// A kernel promise. Messages sent to it while unresolved wait in `queue`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelPromise {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution<KernelSlot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider: Option<VatId>,
    #[serde(default)]
    pub subscribers: BTreeSet<VatId>,
    #[serde(default)]
    pub queue: Vec<KernelMessage>,
}

impl KernelPromise {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// What the host sees of a kernel promise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseStatus {
    Unresolved,
    Fulfilled(KernelCapData),
    Rejected(KernelCapData),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

/// Which parts of a kref's count a reference contributes to.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefOptions {
    /// Export c-list entries count for promises but not objects.
    pub is_export: bool,
    /// The reference only recognizes the object; it cannot reach it.
    pub only_recognizable: bool,
}

/// Why a vat asked to leave, recorded by `syscall.exit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VatExit {
    pub is_failure: bool,
    pub info: KernelCapData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStats {
    pub cranks: u64,
    pub deliveries: u64,
    pub syscalls: BTreeMap<String, u64>,
    pub kernel_objects: u64,
    pub kernel_promises: u64,
    pub run_queue_length: u64,
    pub terminated_vats: u64,
}

pub struct KernelKeeper {
    pub(crate) kv: DynKvStore,
    maybe_free: BTreeSet<KernelSlot>,
    exits: BTreeMap<VatId, VatExit>,
    stats: KernelStats,
}

impl std::fmt::Debug for KernelKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelKeeper")
            .field("maybe_free", &self.maybe_free)
            .field("stats", &self.stats)
            .finish()
    }
}

impl KernelKeeper {
    pub fn new(kv: DynKvStore) -> Self {
        if !kv.has("initialized") {
            kv.set("vat.nextID", &FIRST_VAT_ID.to_string());
            kv.set("ko.nextID", &FIRST_OBJECT_ID.to_string());
            kv.set("kd.nextID", &FIRST_DEVNODE_ID.to_string());
            kv.set("kp.nextID", &FIRST_PROMISE_ID.to_string());
            kv.set("crankNumber", "0");
            kv.set(VAT_IDS, "[]");
            kv.set(TERMINATED, "[]");
            kv.set(RUN_QUEUE, "[]");
            kv.set(GC_ACTIONS, "[]");
            kv.set("initialized", "true");
        }
        Self {
            kv,
            maybe_free: BTreeSet::new(),
            exits: BTreeMap::new(),
            stats: KernelStats::default(),
        }
    }

    pub fn kv(&self) -> &DynKvStore {
        &self.kv
    }

    pub(crate) fn get_required(&self, key: &str) -> Result<String, KernelError> {
        self.kv.get(key).ok_or_else(|| KernelError::Corrupt {
            key: key.to_string(),
            reason: "missing".into(),
        })
    }

    pub(crate) fn get_number(&self, key: &str) -> Result<u64, KernelError> {
        let raw = self.get_required(key)?;
        raw.parse().map_err(|_| KernelError::Corrupt {
            key: key.to_string(),
            reason: format!("not a number: {raw:?}"),
        })
    }

    /// Read and bump a `*.nextID` counter.
    pub(crate) fn allocate_id(&self, key: &str) -> Result<u64, KernelError> {
        let id = self.get_number(key)?;
        self.kv.set(key, &(id + 1).to_string());
        Ok(id)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, KernelError> {
        let raw = self.get_required(key)?;
        serde_json::from_str(&raw).map_err(|err| KernelError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KernelError> {
        let raw = serde_json::to_string(value).map_err(|err| KernelError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        self.kv.set(key, &raw);
        Ok(())
    }

    // vats

    pub fn allocate_vat_id(&mut self) -> Result<VatId, KernelError> {
        Ok(VatId::from_index(self.allocate_id("vat.nextID")?))
    }

    pub fn add_vat(&mut self, vat_id: &VatId, options: &VatOptions) -> Result<(), KernelError> {
        for letter in ['o', 'p', 'd'] {
            self.kv.set(&format!("{vat_id}.{letter}.nextID"), "1");
        }
        self.set_json(&format!("{vat_id}.options"), options)?;
        let mut ids: Vec<VatId> = self.get_json(VAT_IDS)?;
        ids.push(vat_id.clone());
        self.set_json(VAT_IDS, &ids)
    }

    /// Live vats, in creation order.
    pub fn vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        self.get_json(VAT_IDS)
    }

    pub fn is_live_vat(&self, vat_id: &VatId) -> bool {
        self.vat_ids().is_ok_and(|ids| ids.contains(vat_id))
    }

    pub fn terminated_vats(&self) -> Result<Vec<VatId>, KernelError> {
        self.get_json(TERMINATED)
    }

    pub fn vat_options(&self, vat_id: &VatId) -> Result<VatOptions, KernelError> {
        if !self.kv.has(&format!("{vat_id}.options")) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        self.get_json(&format!("{vat_id}.options"))
    }

    pub fn vat(&mut self, vat_id: &VatId) -> VatKeeper<'_> {
        VatKeeper::new(self, vat_id.clone())
    }

    /// Tear down a vat's kernel state: reject the promises it decided,
    /// orphan its exports, and drop its c-list and vatstore.
    pub fn cleanup_terminated_vat(
        &mut self,
        vat_id: &VatId,
        info: &KernelCapData,
    ) -> Result<(), KernelError> {
        let entries = self.vat(vat_id).clist_entries()?;
        for entry in &entries {
            if entry.kref.kind != SlotKind::Promise {
                continue;
            }
            let promise = self.promise(entry.kref)?;
            if !promise.is_resolved() && promise.decider.as_ref() == Some(vat_id) {
                self.resolve_kernel_promise(
                    entry.kref,
                    Resolution::Rejected { data: info.clone() },
                    Some(vat_id),
                )?;
            }
        }
        for entry in &entries {
            if entry.kref.kind == SlotKind::Object && entry.vref.allocated_by_vat {
                self.orphan_object(entry.kref);
            }
        }
        self.vat(vat_id).delete_everything()?;

        let mut ids: Vec<VatId> = self.get_json(VAT_IDS)?;
        ids.retain(|id| id != vat_id);
        self.set_json(VAT_IDS, &ids)?;
        let mut terminated: Vec<VatId> = self.get_json(TERMINATED)?;
        if !terminated.contains(vat_id) {
            terminated.push(vat_id.clone());
        }
        self.set_json(TERMINATED, &terminated)?;
        self.exits.remove(vat_id);
        Ok(())
    }

    pub fn record_exit(&mut self, vat_id: &VatId, exit: VatExit) {
        self.exits.entry(vat_id.clone()).or_insert(exit);
    }

    pub fn take_exit(&mut self, vat_id: &VatId) -> Option<VatExit> {
        self.exits.remove(vat_id)
    }

    // objects

    pub fn add_kernel_object(&mut self, owner: &VatId) -> Result<KernelSlot, KernelError> {
        let kref = KernelSlot::object(self.allocate_id("ko.nextID")?);
        self.kv.set(&format!("{kref}.owner"), owner.as_str());
        self.kv.set(&format!("{kref}.refCount"), "0,0");
        Ok(kref)
    }

    pub fn object_exists(&self, kref: KernelSlot) -> bool {
        self.kv.has(&format!("{kref}.refCount"))
    }

    pub fn object_owner(&self, kref: KernelSlot) -> Option<VatId> {
        self.kv.get(&format!("{kref}.owner")).map(|owner| VatId::from(owner.as_str()))
    }

    pub fn object_refcount(&self, kref: KernelSlot) -> Result<RefCount, KernelError> {
        let key = format!("{kref}.refCount");
        let raw = self.get_required(&key)?;
        let parsed = raw
            .split_once(',')
            .and_then(|(r, c)| Some((r.parse().ok()?, c.parse().ok()?)));
        match parsed {
            Some((reachable, recognizable)) => Ok(RefCount {
                reachable,
                recognizable,
            }),
            None => Err(KernelError::Corrupt {
                key,
                reason: format!("bad refcount {raw:?}"),
            }),
        }
    }

    fn set_object_refcount(&self, kref: KernelSlot, count: RefCount) {
        self.kv.set(
            &format!("{kref}.refCount"),
            &format!("{},{}", count.reachable, count.recognizable),
        );
    }

    /// The owner is gone; messages to the object will be rejected.
    pub fn orphan_object(&mut self, kref: KernelSlot) {
        self.kv.delete(&format!("{kref}.owner"));
        self.maybe_free.insert(kref);
    }

    pub fn delete_kernel_object(&mut self, kref: KernelSlot) {
        self.kv.delete(&format!("{kref}.owner"));
        self.kv.delete(&format!("{kref}.refCount"));
        self.maybe_free.remove(&kref);
    }

    /// Nudge only the reachable half of an object import's count, for
    /// c-list reachable-flag changes.
    pub(crate) fn adjust_reachable(&mut self, kref: KernelSlot, up: bool) -> Result<(), KernelError> {
        if kref.kind != SlotKind::Object || !self.object_exists(kref) {
            return Ok(());
        }
        let mut count = self.object_refcount(kref)?;
        if up {
            count.reachable += 1;
        } else {
            count.reachable = count.reachable.saturating_sub(1);
            if count.reachable == 0 {
                self.maybe_free.insert(kref);
            }
        }
        self.set_object_refcount(kref, count);
        Ok(())
    }

    // devices

    pub fn add_device(&mut self, name: &str) -> Result<KernelSlot, KernelError> {
        let kref = KernelSlot::device(self.allocate_id("kd.nextID")?);
        self.kv.set(&format!("{kref}.name"), name);
        Ok(kref)
    }

    pub fn device_exists(&self, kref: KernelSlot) -> bool {
        self.kv.has(&format!("{kref}.name"))
    }

    // promises

    pub fn add_kernel_promise(&mut self, decider: Option<&VatId>) -> Result<KernelSlot, KernelError> {
        let kpid = KernelSlot::promise(self.allocate_id("kp.nextID")?);
        let promise = KernelPromise {
            decider: decider.cloned(),
            ..KernelPromise::default()
        };
        self.set_promise(kpid, &promise)?;
        self.kv.set(&format!("{kpid}.refCount"), "0");
        Ok(kpid)
    }

    pub fn promise_exists(&self, kpid: KernelSlot) -> bool {
        kpid.kind == SlotKind::Promise && self.kv.has(&kpid.to_string())
    }

    pub fn promise(&self, kpid: KernelSlot) -> Result<KernelPromise, KernelError> {
        if !self.promise_exists(kpid) {
            return Err(KernelError::UnknownPromise(kpid));
        }
        self.get_json(&kpid.to_string())
    }

    pub fn set_promise(&mut self, kpid: KernelSlot, promise: &KernelPromise) -> Result<(), KernelError> {
        self.set_json(&kpid.to_string(), promise)
    }

    pub fn promise_refcount(&self, kpid: KernelSlot) -> Result<u64, KernelError> {
        self.get_number(&format!("{kpid}.refCount"))
    }

    fn delete_kernel_promise(&mut self, kpid: KernelSlot) {
        self.kv.delete(&kpid.to_string());
        self.kv.delete(&format!("{kpid}.refCount"));
    }

    pub fn promise_status(&self, kpid: KernelSlot) -> Result<PromiseStatus, KernelError> {
        Ok(match self.promise(kpid)?.resolution {
            None => PromiseStatus::Unresolved,
            Some(Resolution::FulfilledToPresence { slot }) => {
                PromiseStatus::Fulfilled(CapData::single_slot(slot))
            }
            Some(Resolution::FulfilledToData { data }) => PromiseStatus::Fulfilled(data),
            Some(Resolution::Rejected { data }) => PromiseStatus::Rejected(data),
        })
    }

    /// Settle a promise, requeue the messages waiting on it, and notify its
    /// subscribers. The resolving vat is not notified of its own decision.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KernelSlot,
        resolution: Resolution<KernelSlot>,
        resolver: Option<&VatId>,
    ) -> Result<(), KernelError> {
        let mut promise = self.promise(kpid)?;
        if promise.is_resolved() {
            return Err(KernelError::AlreadyResolved(kpid));
        }
        log::debug!("resolve {kpid} {}", resolution.state_name());
        for slot in resolution.slots() {
            self.increment_refcount(slot, RefOptions::default())?;
        }
        // Queued messages keep the references they already hold.
        for msg in std::mem::take(&mut promise.queue) {
            self.append(RUN_QUEUE, RunQueueItem::Send { target: kpid, msg })?;
        }
        for subscriber in std::mem::take(&mut promise.subscribers) {
            if Some(&subscriber) != resolver {
                self.push_run_queue(RunQueueItem::Notify {
                    vat_id: subscriber,
                    kpid,
                })?;
            }
        }
        promise.resolution = Some(resolution);
        promise.decider = None;
        self.set_promise(kpid, &promise)
    }

    pub fn subscribe(&mut self, vat_id: &VatId, kpid: KernelSlot) -> Result<(), KernelError> {
        let mut promise = self.promise(kpid)?;
        if promise.is_resolved() {
            return self.push_run_queue(RunQueueItem::Notify {
                vat_id: vat_id.clone(),
                kpid,
            });
        }
        if promise.subscribers.insert(vat_id.clone()) {
            self.set_promise(kpid, &promise)?;
        }
        Ok(())
    }

    /// Park a message on an unresolved promise. The references it held in
    /// the run queue move with it.
    pub fn enqueue_on_promise(&mut self, kpid: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        let mut promise = self.promise(kpid)?;
        promise.queue.push(msg);
        self.set_promise(kpid, &promise)
    }

    // reference counts

    pub fn increment_refcount(&mut self, kref: KernelSlot, options: RefOptions) -> Result<(), KernelError> {
        match kref.kind {
            SlotKind::Promise if self.promise_exists(kref) => {
                let count = self.promise_refcount(kref)? + 1;
                self.kv.set(&format!("{kref}.refCount"), &count.to_string());
            }
            SlotKind::Object if !options.is_export && self.object_exists(kref) => {
                let mut count = self.object_refcount(kref)?;
                if !options.only_recognizable {
                    count.reachable += 1;
                }
                count.recognizable += 1;
                self.set_object_refcount(kref, count);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn decrement_refcount(&mut self, kref: KernelSlot, options: RefOptions) -> Result<(), KernelError> {
        match kref.kind {
            SlotKind::Promise if self.promise_exists(kref) => {
                let count = self.promise_refcount(kref)?;
                if count == 0 {
                    log::warn!("refcount underflow on {kref}");
                }
                let count = count.saturating_sub(1);
                self.kv.set(&format!("{kref}.refCount"), &count.to_string());
                if count == 0 {
                    self.maybe_free.insert(kref);
                }
            }
            SlotKind::Object if !options.is_export && self.object_exists(kref) => {
                let mut count = self.object_refcount(kref)?;
                if !options.only_recognizable {
                    count.reachable = count.reachable.saturating_sub(1);
                }
                count.recognizable = count.recognizable.saturating_sub(1);
                if count.reachable == 0 || count.recognizable == 0 {
                    self.maybe_free.insert(kref);
                }
                self.set_object_refcount(kref, count);
            }
            _ => {}
        }
        Ok(())
    }

    /// Hold a kref on behalf of the host so it is never collected.
    pub fn pin(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        self.increment_refcount(kref, RefOptions::default())
    }

    // queues

    fn append(&self, key: &str, item: RunQueueItem) -> Result<(), KernelError> {
        let mut queue: Vec<RunQueueItem> = self.get_json(key)?;
        queue.push(item);
        self.set_json(key, &queue)
    }

    fn pop(&self, key: &str) -> Result<Option<RunQueueItem>, KernelError> {
        let mut queue: Vec<RunQueueItem> = self.get_json(key)?;
        if queue.is_empty() {
            return Ok(None);
        }
        let item = queue.remove(0);
        self.set_json(key, &queue)?;
        Ok(Some(item))
    }

    /// Enqueue `item`, taking references on everything it names.
    pub fn push_run_queue(&mut self, item: RunQueueItem) -> Result<(), KernelError> {
        for kref in item.held_slots() {
            self.increment_refcount(kref, RefOptions::default())?;
        }
        self.append(RUN_QUEUE, item)
    }

    /// Drop the references an item held while queued.
    pub fn release_item(&mut self, item: &RunQueueItem) -> Result<(), KernelError> {
        for kref in item.held_slots() {
            self.decrement_refcount(kref, RefOptions::default())?;
        }
        Ok(())
    }

    /// The next item to process: pending GC actions first, then the run queue.
    pub fn next_item(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        match self.pop(GC_ACTIONS)? {
            Some(action) => Ok(Some(action)),
            None => self.pop(RUN_QUEUE),
        }
    }

    pub fn run_queue_len(&self) -> Result<usize, KernelError> {
        let run: Vec<RunQueueItem> = self.get_json(RUN_QUEUE)?;
        let gc: Vec<RunQueueItem> = self.get_json(GC_ACTIONS)?;
        Ok(run.len() + gc.len())
    }

    fn push_gc_action(&mut self, action: RunQueueItem) -> Result<(), KernelError> {
        self.append(GC_ACTIONS, action)
    }

    /// `(reachable, vref)` for `kref` in a vat's c-list.
    pub(crate) fn clist_entry(&self, vat_id: &VatId, kref: KernelSlot) -> Option<(bool, VatSlot)> {
        let raw = self.kv.get(&format!("{vat_id}.c.{kref}"))?;
        parse_clist_value(&raw)
    }

    pub(crate) fn reachable_flag(&self, vat_id: &VatId, kref: KernelSlot) -> bool {
        self.clist_entry(vat_id, kref).is_some_and(|(reachable, _)| reachable)
    }

    /// Vats that import `kref`.
    pub fn importers_of(&self, kref: KernelSlot) -> Result<Vec<VatId>, KernelError> {
        Ok(self
            .vat_ids()?
            .into_iter()
            .filter(|vat_id| {
                self.clist_entry(vat_id, kref)
                    .is_some_and(|(_, vref)| !vref.allocated_by_vat)
            })
            .collect())
    }

    /// Delete objects nobody can reach any more, telling every importer
    /// to forget them first.
    pub fn retire_kernel_objects(&mut self, krefs: &[KernelSlot]) -> Result<(), KernelError> {
        for &kref in krefs {
            for importer in self.importers_of(kref)? {
                self.push_gc_action(RunQueueItem::RetireImports {
                    vat_id: importer,
                    krefs: vec![kref],
                })?;
            }
            self.delete_kernel_object(kref);
        }
        Ok(())
    }

    /// Act on every kref whose count dropped since the last call: delete
    /// dead promises, and schedule `dropExports`/`retireExports` for
    /// objects whose importers have all let go.
    pub fn process_refcounts(&mut self) -> Result<(), KernelError> {
        let mut drops: BTreeMap<VatId, Vec<KernelSlot>> = BTreeMap::new();
        let mut retires: BTreeMap<VatId, Vec<KernelSlot>> = BTreeMap::new();
        while let Some(kref) = self.maybe_free.pop_first() {
            match kref.kind {
                SlotKind::Promise => {
                    if !self.promise_exists(kref) || self.promise_refcount(kref)? > 0 {
                        continue;
                    }
                    let promise = self.promise(kref)?;
                    for slot in promise.resolution.iter().flat_map(Resolution::slots) {
                        self.decrement_refcount(slot, RefOptions::default())?;
                    }
                    log::debug!("collected {kref}");
                    self.delete_kernel_promise(kref);
                }
                SlotKind::Object => {
                    if !self.object_exists(kref) {
                        continue;
                    }
                    let count = self.object_refcount(kref)?;
                    if count.reachable > 0 {
                        continue;
                    }
                    match self.object_owner(kref) {
                        Some(owner) => {
                            if self.reachable_flag(&owner, kref) {
                                drops.entry(owner.clone()).or_default().push(kref);
                            }
                            if count.recognizable == 0 {
                                retires.entry(owner).or_default().push(kref);
                            }
                        }
                        None if count.recognizable > 0 => self.retire_kernel_objects(&[kref])?,
                        None => self.delete_kernel_object(kref),
                    }
                }
                SlotKind::Device => {}
            }
        }
        for (vat_id, krefs) in drops {
            self.push_gc_action(RunQueueItem::DropExports { vat_id, krefs })?;
        }
        for (vat_id, krefs) in retires {
            self.push_gc_action(RunQueueItem::RetireExports { vat_id, krefs })?;
        }
        Ok(())
    }

    /// Narrow a queued GC action to the krefs it still applies to; the
    /// world may have moved on since it was scheduled.
    pub fn filter_gc_action(&self, item: RunQueueItem) -> Option<RunQueueItem> {
        match item {
            RunQueueItem::DropExports { vat_id, krefs } => {
                let krefs = retain_krefs(krefs, |kref| {
                    self.object_owner(kref).as_ref() == Some(&vat_id)
                        && self.object_refcount(kref).is_ok_and(|count| count.reachable == 0)
                        && self.reachable_flag(&vat_id, kref)
                })?;
                Some(RunQueueItem::DropExports { vat_id, krefs })
            }
            RunQueueItem::RetireExports { vat_id, krefs } => {
                let krefs = retain_krefs(krefs, |kref| {
                    self.object_owner(kref).as_ref() == Some(&vat_id)
                        && self
                            .object_refcount(kref)
                            .is_ok_and(|count| count.reachable == 0 && count.recognizable == 0)
                        && self.clist_entry(&vat_id, kref).is_some()
                })?;
                Some(RunQueueItem::RetireExports { vat_id, krefs })
            }
            RunQueueItem::RetireImports { vat_id, krefs } => {
                let krefs = retain_krefs(krefs, |kref| self.clist_entry(&vat_id, kref).is_some())?;
                Some(RunQueueItem::RetireImports { vat_id, krefs })
            }
            other => Some(other),
        }
    }

    // stats

    pub fn crank_number(&self) -> Result<u64, KernelError> {
        self.get_number("crankNumber")
    }

    pub(crate) fn start_crank(&mut self) -> Result<u64, KernelError> {
        let crank = self.allocate_id("crankNumber")?;
        self.stats.cranks += 1;
        Ok(crank)
    }

    pub(crate) fn note_delivery(&mut self, vat_id: &VatId) {
        self.stats.deliveries += 1;
        let key = format!("{vat_id}.deliveries");
        let count = self.kv.get(&key).and_then(|raw| raw.parse::<u64>().ok()).unwrap_or(0);
        self.kv.set(&key, &(count + 1).to_string());
    }

    pub(crate) fn note_syscall(&mut self, kind: &str) {
        *self.stats.syscalls.entry(kind.to_string()).or_default() += 1;
    }

    fn count_refcounted(&self, prefix: &str) -> u64 {
        self.kv
            .keys_with_prefix(prefix)
            .iter()
            .filter(|key| key.ends_with(".refCount"))
            .count() as u64
    }

    pub fn stats(&self) -> Result<KernelStats, KernelError> {
        let mut stats = self.stats.clone();
        stats.kernel_objects = self.count_refcounted("ko");
        stats.kernel_promises = self.count_refcounted("kp");
        stats.run_queue_length = self.run_queue_len()? as u64;
        stats.terminated_vats = self.terminated_vats()?.len() as u64;
        Ok(stats)
    }
}

fn retain_krefs(
    krefs: Vec<KernelSlot>,
    mut keep: impl FnMut(KernelSlot) -> bool,
) -> Option<Vec<KernelSlot>> {
    let kept: Vec<KernelSlot> = krefs.into_iter().filter(|kref| keep(*kref)).collect();
    (!kept.is_empty()).then_some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use swing_abi::Message;
    use swing_store::MemKvStore;

    fn keeper() -> KernelKeeper {
        KernelKeeper::new(Arc::new(MemKvStore::new()))
    }

    #[test]
    fn allocates_from_fixed_bases() {
        let mut keeper = keeper();
        let v1 = keeper.allocate_vat_id().unwrap();
        assert_eq!(v1.as_str(), "v1");
        assert_eq!(keeper.add_kernel_object(&v1).unwrap().to_string(), "ko20");
        assert_eq!(keeper.add_kernel_promise(None).unwrap().to_string(), "kp40");
        assert_eq!(keeper.add_device("clock").unwrap().to_string(), "kd30");
    }

    #[test]
    fn resolving_requeues_and_notifies_everyone_but_the_resolver() {
        let mut keeper = keeper();
        let (v1, v2) = (VatId::from("v1"), VatId::from("v2"));
        let kpid = keeper.add_kernel_promise(Some(&v1)).unwrap();
        keeper.subscribe(&v1, kpid).unwrap();
        keeper.subscribe(&v2, kpid).unwrap();
        keeper
            .enqueue_on_promise(kpid, Message::new("hi", CapData::new("[]", vec![]), None))
            .unwrap();

        keeper
            .resolve_kernel_promise(kpid, Resolution::FulfilledToData { data: CapData::new("1", vec![]) }, Some(&v1))
            .unwrap();
        let first = keeper.next_item().unwrap().unwrap();
        assert!(matches!(first, RunQueueItem::Send { target, .. } if target == kpid));
        let second = keeper.next_item().unwrap().unwrap();
        assert_eq!(second, RunQueueItem::Notify { vat_id: v2, kpid });
        assert_eq!(keeper.next_item().unwrap(), None);
        assert!(matches!(keeper.promise_status(kpid).unwrap(), PromiseStatus::Fulfilled(_)));

        let again = keeper.resolve_kernel_promise(kpid, Resolution::Rejected { data: CapData::new("0", vec![]) }, None);
        assert!(matches!(again, Err(KernelError::AlreadyResolved(_))));
    }

    #[test]
    fn subscribing_to_a_settled_promise_queues_a_notify() {
        let mut keeper = keeper();
        let v3 = VatId::from("v3");
        let kpid = keeper.add_kernel_promise(None).unwrap();
        keeper
            .resolve_kernel_promise(kpid, Resolution::Rejected { data: CapData::error("no") }, None)
            .unwrap();
        keeper.subscribe(&v3, kpid).unwrap();
        assert_eq!(keeper.next_item().unwrap(), Some(RunQueueItem::Notify { vat_id: v3, kpid }));
        assert_eq!(keeper.promise_refcount(kpid).unwrap(), 1);
    }

    #[test]
    fn unreferenced_promises_are_collected_with_their_data() {
        let mut keeper = keeper();
        let v1 = VatId::from("v1");
        let ko = keeper.add_kernel_object(&v1).unwrap();
        keeper.pin(ko).unwrap();
        let kpid = keeper.add_kernel_promise(None).unwrap();
        keeper.increment_refcount(kpid, RefOptions::default()).unwrap();
        keeper
            .resolve_kernel_promise(kpid, Resolution::FulfilledToPresence { slot: ko }, None)
            .unwrap();
        assert_eq!(keeper.object_refcount(ko).unwrap(), RefCount { reachable: 2, recognizable: 2 });

        keeper.decrement_refcount(kpid, RefOptions::default()).unwrap();
        keeper.process_refcounts().unwrap();
        assert!(!keeper.promise_exists(kpid));
        assert_eq!(keeper.object_refcount(ko).unwrap(), RefCount { reachable: 1, recognizable: 1 });
    }

    #[test]
    fn orphaned_unreferenced_objects_are_deleted() {
        let mut keeper = keeper();
        let v1 = VatId::from("v1");
        let ko = keeper.add_kernel_object(&v1).unwrap();
        keeper.orphan_object(ko);
        keeper.process_refcounts().unwrap();
        assert!(!keeper.object_exists(ko));
        assert_eq!(keeper.next_item().unwrap(), None);
    }

    #[test]
    fn run_queue_items_hold_references_until_released() {
        let mut keeper = keeper();
        let v1 = VatId::from("v1");
        let ko = keeper.add_kernel_object(&v1).unwrap();
        let kpid = keeper.add_kernel_promise(None).unwrap();
        let item = RunQueueItem::Send {
            target: ko,
            msg: Message::new("go", CapData::new("[]", vec![]), Some(kpid)),
        };
        keeper.push_run_queue(item).unwrap();
        assert_eq!(keeper.object_refcount(ko).unwrap(), RefCount { reachable: 1, recognizable: 1 });
        assert_eq!(keeper.promise_refcount(kpid).unwrap(), 1);

        let item = keeper.next_item().unwrap().unwrap();
        keeper.release_item(&item).unwrap();
        assert_eq!(keeper.object_refcount(ko).unwrap(), RefCount::default());
        assert_eq!(keeper.promise_refcount(kpid).unwrap(), 0);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["target"], "ko20");
    }
}
