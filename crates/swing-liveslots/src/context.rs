use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use swing_abi::{
    CapData, Message, Resolution, SlotKind, SyscallData, SyscallResult, VatCapData,
    VatDeliveryResult, VatMessage, VatSlot, VatSyscall,
};

use crate::marshal::{self, SlotConverter};
use crate::meter::DeliveryMeter;
use crate::object::VatObject;
use crate::value::{PromiseId, RefId, Value};
use crate::{LiveSlotsError, Syscall};

/// `o+0` is the root object; later exports count up from here.
const FIRST_EXPORT_ID: u64 = 1;
const FIRST_PROMISE_ID: u64 = 5;

/// How a promise settled: `Ok(value)` or `Err(reason)`.
pub type Settlement = Result<Value, Value>;

type Reaction = Box<dyn FnOnce(&mut VatContext, Settlement) + Send>;
type Job = Box<dyn FnOnce(&mut VatContext) + Send>;
type ConsoleSink = Box<dyn FnMut(&str) + Send>;

#[derive(Clone, Debug, PartialEq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

enum PromiseState {
    Pending,
    /// Resolved to another promise; settles when that one does.
    Forwarded(PromiseId),
    Fulfilled(Value),
    Rejected(Value),
}

struct PromiseRecord {
    state: PromiseState,
    reactions: Vec<Reaction>,
}

enum RefEntry {
    Local(Arc<dyn VatObject>),
    Presence,
    Device,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Handle {
    Ref(RefId),
    Promise(PromiseId),
}

impl Handle {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Remotable(id) => Some(Handle::Ref(*id)),
            Value::Promise(id) => Some(Handle::Promise(*id)),
            _ => None,
        }
    }

    fn value(self) -> Value {
        match self {
            Handle::Ref(id) => Value::Remotable(id),
            Handle::Promise(id) => Value::Promise(id),
        }
    }
}

/// Where an eventual send on a promise should go right now.
enum PromiseRoute {
    Pending,
    Forwarded(PromiseId),
    Settled(Settlement),
}

/// A vat's heap and its view of the kernel.
///
/// `val_to_slot` and `slot_to_val` always change together: a reference is
/// either unknown to both or mapped consistently in both.
pub struct VatContext {
    vat_id: String,
    syscall: Box<dyn Syscall>,
    console: Option<ConsoleSink>,
    next_handle: u64,
    refs: HashMap<RefId, RefEntry>,
    promises: HashMap<PromiseId, PromiseRecord>,
    val_to_slot: HashMap<Handle, VatSlot>,
    slot_to_val: HashMap<VatSlot, Handle>,
    /// Promises decided elsewhere that we expect a notify for.
    imported_promises: HashMap<VatSlot, PromiseId>,
    next_export_id: u64,
    next_promise_id: u64,
    /// Exports the kernel still holds a reachable reference to.
    kernel_reachable: BTreeSet<VatSlot>,
    /// Remotables the vat has let go of, reclaimed at `bringOutYourDead`.
    forgotten: BTreeSet<RefId>,
    jobs: VecDeque<Job>,
    meter: DeliveryMeter,
    fatal: Option<LiveSlotsError>,
}

impl VatContext {
    pub(crate) fn new(vat_id: String, syscall: Box<dyn Syscall>) -> Self {
        Self {
            vat_id,
            syscall,
            console: None,
            next_handle: 0,
            refs: HashMap::new(),
            promises: HashMap::new(),
            val_to_slot: HashMap::new(),
            slot_to_val: HashMap::new(),
            imported_promises: HashMap::new(),
            next_export_id: FIRST_EXPORT_ID,
            next_promise_id: FIRST_PROMISE_ID,
            kernel_reachable: BTreeSet::new(),
            forgotten: BTreeSet::new(),
            jobs: VecDeque::new(),
            meter: DeliveryMeter::default(),
            fatal: None,
        }
    }

    pub(crate) fn set_console(&mut self, sink: ConsoleSink) {
        self.console = Some(sink);
    }

    pub fn vat_id(&self) -> &str {
        &self.vat_id
    }

    /// Register a local object and return a reference to it.
    pub fn make_far(&mut self, object: impl VatObject + 'static) -> Value {
        let id = RefId(self.bump());
        self.refs.insert(id, RefEntry::Local(Arc::new(object)));
        Value::Remotable(id)
    }

    /// A new pending promise decided by this vat.
    pub fn make_promise(&mut self) -> Value {
        Value::Promise(self.new_promise())
    }

    pub fn resolve(&mut self, promise: &Value, value: Value) {
        match promise.as_promise() {
            Some(pid) => self.resolve_promise(pid, value),
            None => log::warn!("{}: resolve() on a {}", self.vat_id, promise.kind_name()),
        }
    }

    pub fn reject(&mut self, promise: &Value, reason: Value) {
        match promise.as_promise() {
            Some(pid) => self.reject_promise(pid, reason),
            None => log::warn!("{}: reject() on a {}", self.vat_id, promise.kind_name()),
        }
    }

    pub fn promise_status(&self, promise: &Value) -> Option<PromiseStatus> {
        let record = self.promises.get(&promise.as_promise()?)?;
        Some(match &record.state {
            PromiseState::Pending | PromiseState::Forwarded(_) => PromiseStatus::Pending,
            PromiseState::Fulfilled(value) => PromiseStatus::Fulfilled(value.clone()),
            PromiseState::Rejected(reason) => PromiseStatus::Rejected(reason.clone()),
        })
    }

    /// Eventual send, `E(target).method(...args)`. Returns the result promise.
    pub fn send(&mut self, target: &Value, method: &str, args: Vec<Value>) -> Value {
        match self.route_send(target.clone(), method.to_string(), args, true) {
            Some(pid) => Value::Promise(pid),
            None => Value::Undefined,
        }
    }

    /// Eventual send without a result promise.
    pub fn send_only(&mut self, target: &Value, method: &str, args: Vec<Value>) {
        self.route_send(target.clone(), method.to_string(), args, false);
    }

    /// Register a continuation; its return value settles the returned promise.
    /// A non-promise `value` counts as already fulfilled.
    pub fn then<F>(&mut self, value: &Value, on_settled: F) -> Value
    where
        F: FnOnce(&mut VatContext, Settlement) -> Settlement + Send + 'static,
    {
        let result = self.new_promise();
        self.react(
            value,
            Box::new(move |vat, settlement| {
                let outcome = on_settled(vat, settlement);
                vat.settle(result, outcome);
            }),
        );
        Value::Promise(result)
    }

    pub fn when_settled<F>(&mut self, value: &Value, on_settled: F)
    where
        F: FnOnce(&mut VatContext, Settlement) + Send + 'static,
    {
        self.react(value, Box::new(on_settled));
    }

    /// Synchronous device invocation, `D(device).method(...args)`.
    pub fn call_now(
        &mut self,
        device: &Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, LiveSlotsError> {
        let target = device
            .as_remotable()
            .filter(|id| matches!(self.refs.get(id), Some(RefEntry::Device)))
            .and_then(|id| self.val_to_slot.get(&Handle::Ref(id)).copied())
            .ok_or_else(|| LiveSlotsError::Vat("D() must be given a device node".into()))?;
        let args = Value::List(args);
        if contains_promise(&args) {
            return Err(LiveSlotsError::Vat(
                "D() arguments cannot include a Promise".into(),
            ));
        }
        let data = self.serialize(&args)?;
        match self.do_syscall(VatSyscall::CallNow {
            target,
            method: method.to_string(),
            args: data,
        })? {
            SyscallData::CapData(ret) => self.unserialize(&ret),
            SyscallData::Null => Ok(Value::Undefined),
            other => Err(unexpected_result("callNow", &other)),
        }
    }

    pub fn vatstore_get(&mut self, key: &str) -> Result<Option<String>, LiveSlotsError> {
        match self.do_syscall(VatSyscall::VatstoreGet {
            key: key.to_string(),
        })? {
            SyscallData::Value(value) => Ok(value),
            SyscallData::Null => Ok(None),
            other => Err(unexpected_result("vatstoreGet", &other)),
        }
    }

    pub fn vatstore_set(&mut self, key: &str, value: &str) -> Result<(), LiveSlotsError> {
        self.do_syscall(VatSyscall::VatstoreSet {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    pub fn vatstore_delete(&mut self, key: &str) -> Result<(), LiveSlotsError> {
        self.do_syscall(VatSyscall::VatstoreDelete {
            key: key.to_string(),
        })?;
        Ok(())
    }

    /// First vatstore entry after `prior_key` (or at `lower_bound` when
    /// `prior_key` is empty), bounded above by `upper_bound` or by the
    /// `lower_bound` prefix.
    pub fn vatstore_get_after(
        &mut self,
        prior_key: &str,
        lower_bound: &str,
        upper_bound: Option<&str>,
    ) -> Result<Option<(String, String)>, LiveSlotsError> {
        match self.do_syscall(VatSyscall::VatstoreGetAfter {
            prior_key: prior_key.to_string(),
            lower_bound: lower_bound.to_string(),
            upper_bound: upper_bound.map(str::to_string),
        })? {
            SyscallData::Entry(entry) => Ok(entry),
            SyscallData::Null => Ok(None),
            other => Err(unexpected_result("vatstoreGetAfter", &other)),
        }
    }

    /// Ask the kernel to terminate this vat after the current delivery.
    pub fn exit_vat(&mut self, completion: Value) -> Result<(), LiveSlotsError> {
        self.exit(false, completion)
    }

    pub fn exit_vat_with_failure(&mut self, reason: Value) -> Result<(), LiveSlotsError> {
        self.exit(true, reason)
    }

    fn exit(&mut self, is_failure: bool, value: Value) -> Result<(), LiveSlotsError> {
        let info = self.serialize(&value)?;
        self.do_syscall(VatSyscall::Exit { is_failure, info })?;
        Ok(())
    }

    /// Declare that vat code holds no more references to `value`. It is
    /// reclaimed, and the kernel told, at the next `bringOutYourDead`.
    pub fn forget(&mut self, value: &Value) {
        if let Some(id) = value.as_remotable() {
            if self.refs.contains_key(&id) {
                self.forgotten.insert(id);
            }
        }
    }

    pub fn charge(&mut self, computrons: u64) -> Result<(), LiveSlotsError> {
        self.meter.charge(computrons)
    }

    pub fn console(&mut self, line: &str) {
        match self.console.as_mut() {
            Some(sink) => sink(line),
            None => log::info!("{}: {line}", self.vat_id),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn new_promise(&mut self) -> PromiseId {
        let id = PromiseId(self.bump());
        self.promises.insert(
            id,
            PromiseRecord {
                state: PromiseState::Pending,
                reactions: Vec::new(),
            },
        );
        id
    }

    fn allocate_export_id(&mut self) -> VatSlot {
        let slot = VatSlot::export(SlotKind::Object, self.next_export_id);
        self.next_export_id += 1;
        slot
    }

    fn allocate_promise_id(&mut self) -> VatSlot {
        let slot = VatSlot::export(SlotKind::Promise, self.next_promise_id);
        self.next_promise_id += 1;
        slot
    }

    fn register(&mut self, handle: Handle, slot: VatSlot) {
        self.val_to_slot.insert(handle, slot);
        self.slot_to_val.insert(slot, handle);
    }

    fn unregister_slot(&mut self, slot: VatSlot) -> Option<Handle> {
        let handle = self.slot_to_val.remove(&slot)?;
        self.val_to_slot.remove(&handle);
        Some(handle)
    }

    pub(crate) fn fail(&mut self, err: LiveSlotsError) {
        if self.fatal.is_none() {
            log::warn!("{}: vat fatal error: {err}", self.vat_id);
            self.fatal = Some(err);
        }
    }

    /// A syscall error means the kernel cannot serve this vat any more: it
    /// becomes fatal for the current delivery and no further syscalls go out.
    fn do_syscall(&mut self, syscall: VatSyscall) -> Result<SyscallData<VatSlot>, LiveSlotsError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }
        let name = syscall.kind_name();
        match self.syscall.call(syscall) {
            SyscallResult::Ok(data) => Ok(data),
            SyscallResult::Error(reason) => {
                let err = LiveSlotsError::SyscallFailed { name, reason };
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    pub(crate) fn serialize(&mut self, value: &Value) -> Result<VatCapData, LiveSlotsError> {
        marshal::serialize(self, value)
    }

    pub(crate) fn unserialize(&mut self, data: &VatCapData) -> Result<Value, LiveSlotsError> {
        marshal::unserialize(self, data)
    }

    fn route_send(
        &mut self,
        target: Value,
        method: String,
        args: Vec<Value>,
        want_result: bool,
    ) -> Option<PromiseId> {
        match target {
            Value::Remotable(id) => {
                let entry = self.refs.get(&id).map(|entry| match entry {
                    RefEntry::Local(object) => Some(Arc::clone(object)),
                    RefEntry::Presence | RefEntry::Device => None,
                });
                match entry {
                    Some(Some(object)) => {
                        let result = want_result.then(|| self.new_promise());
                        self.jobs.push_back(Box::new(move |vat| {
                            let outcome = object.invoke(vat, &method, args);
                            match (result, outcome) {
                                (Some(result), outcome) => vat.settle(result, outcome),
                                (None, Err(reason)) => log::debug!(
                                    "{}: sendOnly {method} rejected: {reason:?}",
                                    vat.vat_id
                                ),
                                (None, Ok(_)) => {}
                            }
                        }));
                        result
                    }
                    Some(None) => {
                        if matches!(self.refs.get(&id), Some(RefEntry::Device)) {
                            return self.rejected_result(
                                want_result,
                                Value::type_error(format!(
                                    "device nodes accept only call_now, not {method:?}"
                                )),
                            );
                        }
                        match self.val_to_slot.get(&Handle::Ref(id)).copied() {
                            Some(slot) => self.queue_message(slot, &method, args, want_result),
                            None => self.rejected_result(
                                want_result,
                                Value::error("presence has been retired"),
                            ),
                        }
                    }
                    None => self.rejected_result(want_result, Value::error("unknown remotable")),
                }
            }
            Value::Promise(pid) => {
                let route = self.promises.get(&pid).map(|record| match &record.state {
                    PromiseState::Pending => PromiseRoute::Pending,
                    PromiseState::Forwarded(next) => PromiseRoute::Forwarded(*next),
                    PromiseState::Fulfilled(value) => PromiseRoute::Settled(Ok(value.clone())),
                    PromiseState::Rejected(reason) => PromiseRoute::Settled(Err(reason.clone())),
                });
                match route {
                    None => self.rejected_result(want_result, Value::error("unknown promise")),
                    // Once the resolution is known locally, send straight to it
                    // rather than pipelining through the stale promise.
                    Some(PromiseRoute::Settled(Ok(value))) => {
                        self.route_send(value, method, args, want_result)
                    }
                    Some(PromiseRoute::Settled(Err(reason))) => {
                        self.rejected_result(want_result, reason)
                    }
                    Some(PromiseRoute::Forwarded(next)) => {
                        self.route_send(Value::Promise(next), method, args, want_result)
                    }
                    Some(PromiseRoute::Pending) => {
                        let kernel_slot = self
                            .val_to_slot
                            .get(&Handle::Promise(pid))
                            .copied()
                            .filter(|slot| self.imported_promises.contains_key(slot));
                        match kernel_slot {
                            Some(slot) => self.queue_message(slot, &method, args, want_result),
                            None => self.queue_locally(pid, method, args, want_result),
                        }
                    }
                }
            }
            other => self.rejected_result(
                want_result,
                Value::type_error(format!(
                    "cannot deliver {method:?} to {}",
                    other.kind_name()
                )),
            ),
        }
    }

    /// Hold a send to a locally decided promise until it settles.
    fn queue_locally(
        &mut self,
        pid: PromiseId,
        method: String,
        args: Vec<Value>,
        want_result: bool,
    ) -> Option<PromiseId> {
        let result = want_result.then(|| self.new_promise());
        self.on_settled(
            pid,
            Box::new(move |vat, settlement| match settlement {
                Ok(value) => {
                    let inner = vat.route_send(value, method, args, result.is_some());
                    if let (Some(result), Some(inner)) = (result, inner) {
                        vat.resolve_promise(result, Value::Promise(inner));
                    }
                }
                Err(reason) => {
                    if let Some(result) = result {
                        vat.reject_promise(result, reason);
                    }
                }
            }),
        );
        result
    }

    fn rejected_result(&mut self, want_result: bool, reason: Value) -> Option<PromiseId> {
        if !want_result {
            log::debug!("{}: dropped sendOnly: {reason:?}", self.vat_id);
            return None;
        }
        let pid = self.new_promise();
        self.reject_promise(pid, reason);
        Some(pid)
    }

    /// Serialize args, allocate the result promise, `send`, then `subscribe`.
    fn queue_message(
        &mut self,
        target: VatSlot,
        method: &str,
        args: Vec<Value>,
        want_result: bool,
    ) -> Option<PromiseId> {
        let args = match self.serialize(&Value::List(args)) {
            Ok(data) => data,
            Err(err) => return self.rejected_result(want_result, Value::error(err.to_string())),
        };
        let result = want_result.then(|| {
            let pid = self.new_promise();
            let vpid = self.allocate_promise_id();
            self.register(Handle::Promise(pid), vpid);
            self.imported_promises.insert(vpid, pid);
            (pid, vpid)
        });
        let msg = Message::new(method, args, result.map(|(_, vpid)| vpid));
        let sent = self.do_syscall(VatSyscall::Send { target, msg });
        if let (Ok(_), Some((_, vpid))) = (&sent, result) {
            // Failure here is already recorded as fatal.
            let _ = self.do_syscall(VatSyscall::Subscribe { vpid });
        }
        result.map(|(pid, _)| pid)
    }

    fn export_promise(&mut self, pid: PromiseId) -> VatSlot {
        let vpid = self.allocate_promise_id();
        self.register(Handle::Promise(pid), vpid);
        self.on_settled(
            pid,
            Box::new(move |vat, settlement| vat.resolve_exported(vpid, pid, settlement)),
        );
        vpid
    }

    /// Tell the kernel how a promise we decide settled, then retire its ID.
    fn resolve_exported(&mut self, vpid: VatSlot, pid: PromiseId, settlement: Settlement) {
        let resolution = self.resolution_for(&settlement);
        if self
            .do_syscall(VatSyscall::Resolve {
                vpid,
                resolution: resolution.clone(),
            })
            .is_err()
        {
            return;
        }
        if let Some(local) = self.imported_promises.get(&vpid).copied() {
            if local != pid {
                self.settle(local, settlement);
            }
        }
        match &resolution {
            Resolution::FulfilledToPresence { .. } => self.retire_promise_id(vpid),
            Resolution::FulfilledToData { data } | Resolution::Rejected { data } => {
                self.retire_promise_id_if_easy(vpid, &data.slots)
            }
        }
    }

    fn resolution_for(&mut self, settlement: &Settlement) -> Resolution<VatSlot> {
        match settlement {
            Ok(value @ Value::Remotable(_)) => match self.convert_val_to_slot(value) {
                Ok(slot) if slot.kind == SlotKind::Object => {
                    Resolution::FulfilledToPresence { slot }
                }
                Ok(slot) => Resolution::FulfilledToData {
                    data: CapData::single_slot(slot),
                },
                Err(err) => Resolution::Rejected {
                    data: CapData::error(err.to_string()),
                },
            },
            Ok(value) => match self.serialize(value) {
                Ok(data) => Resolution::FulfilledToData { data },
                Err(err) => Resolution::Rejected {
                    data: CapData::error(err.to_string()),
                },
            },
            Err(reason) => Resolution::Rejected {
                data: self
                    .serialize(reason)
                    .unwrap_or_else(|err| CapData::error(err.to_string())),
            },
        }
    }

    fn retire_promise_id(&mut self, vpid: VatSlot) {
        self.imported_promises.remove(&vpid);
        self.unregister_slot(vpid);
    }

    /// Resolutions that carry promise slots keep the ID alive.
    fn retire_promise_id_if_easy(&mut self, vpid: VatSlot, slots: &[VatSlot]) {
        if slots.iter().all(|slot| slot.kind != SlotKind::Promise) {
            self.retire_promise_id(vpid);
        }
    }

    fn react(&mut self, value: &Value, reaction: Reaction) {
        match value.as_promise() {
            Some(pid) => self.on_settled(pid, reaction),
            None => {
                let value = value.clone();
                self.jobs.push_back(Box::new(move |vat| reaction(vat, Ok(value))));
            }
        }
    }

    fn on_settled(&mut self, pid: PromiseId, reaction: Reaction) {
        let settlement = match self.promises.get_mut(&pid) {
            None => Err(Value::error("unknown promise")),
            Some(record) => match &record.state {
                PromiseState::Fulfilled(value) => Ok(value.clone()),
                PromiseState::Rejected(reason) => Err(reason.clone()),
                PromiseState::Pending | PromiseState::Forwarded(_) => {
                    record.reactions.push(reaction);
                    return;
                }
            },
        };
        self.jobs
            .push_back(Box::new(move |vat| reaction(vat, settlement)));
    }

    pub(crate) fn settle(&mut self, pid: PromiseId, settlement: Settlement) {
        match settlement {
            Ok(value) => self.resolve_promise(pid, value),
            Err(reason) => self.reject_promise(pid, reason),
        }
    }

    fn is_unresolved(&self, pid: PromiseId) -> bool {
        matches!(
            self.promises.get(&pid).map(|record| &record.state),
            Some(PromiseState::Pending)
        )
    }

    fn resolve_promise(&mut self, pid: PromiseId, value: Value) {
        if !self.is_unresolved(pid) {
            return;
        }
        if let Value::Promise(target) = value {
            if self.forwards_to(target, pid) {
                self.transition(
                    pid,
                    PromiseState::Rejected(Value::type_error("promise resolved to itself")),
                );
                return;
            }
            if let Some(record) = self.promises.get_mut(&pid) {
                record.state = PromiseState::Forwarded(target);
            }
            self.on_settled(
                target,
                Box::new(move |vat, settlement| match settlement {
                    Ok(value) => vat.transition(pid, PromiseState::Fulfilled(value)),
                    Err(reason) => vat.transition(pid, PromiseState::Rejected(reason)),
                }),
            );
            return;
        }
        self.transition(pid, PromiseState::Fulfilled(value));
    }

    fn reject_promise(&mut self, pid: PromiseId, reason: Value) {
        if self.is_unresolved(pid) {
            self.transition(pid, PromiseState::Rejected(reason));
        }
    }

    fn forwards_to(&self, start: PromiseId, pid: PromiseId) -> bool {
        let mut cursor = start;
        loop {
            if cursor == pid {
                return true;
            }
            match self.promises.get(&cursor).map(|record| &record.state) {
                Some(PromiseState::Forwarded(next)) => cursor = *next,
                _ => return false,
            }
        }
    }

    /// Settle `pid` and queue one job per waiting reaction.
    fn transition(&mut self, pid: PromiseId, state: PromiseState) {
        let settlement = match &state {
            PromiseState::Fulfilled(value) => Ok(value.clone()),
            PromiseState::Rejected(reason) => Err(reason.clone()),
            PromiseState::Pending | PromiseState::Forwarded(_) => return,
        };
        let Some(record) = self.promises.get_mut(&pid) else {
            return;
        };
        record.state = state;
        let reactions = std::mem::take(&mut record.reactions);
        for reaction in reactions {
            let settlement = settlement.clone();
            self.jobs
                .push_back(Box::new(move |vat| reaction(vat, settlement)));
        }
    }
}

// Dispatch surface, driven by `LiveSlots`.
impl VatContext {
    pub(crate) fn register_root(&mut self, root: &Value) -> Result<(), LiveSlotsError> {
        match root.as_remotable() {
            Some(id) if matches!(self.refs.get(&id), Some(RefEntry::Local(_))) => {
                let slot = VatSlot::export(SlotKind::Object, 0);
                self.register(Handle::Ref(id), slot);
                self.kernel_reachable.insert(slot);
                Ok(())
            }
            _ => Err(LiveSlotsError::BadRoot(root.kind_name())),
        }
    }

    pub(crate) fn begin_delivery(&mut self, budget: Option<u64>) {
        self.meter.reset(budget);
        self.fatal = None;
    }

    /// Run jobs until none are left. The vat's own top-level promises are
    /// not awaited: once it has nothing scheduled, the delivery is done.
    pub(crate) fn run_until_quiescent(&mut self) {
        while self.fatal.is_none() {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            if let Err(err) = self.meter.charge(1) {
                self.fail(err);
                break;
            }
            job(self);
        }
        if let Some(err) = self.meter.exhausted() {
            self.fail(err);
        }
        if self.fatal.is_some() {
            self.jobs.clear();
        }
    }

    pub(crate) fn finish_delivery(&mut self) -> VatDeliveryResult {
        let usage = Some(self.meter.usage());
        match self.fatal.take() {
            Some(err) => VatDeliveryResult::error(err.to_string(), usage),
            None => VatDeliveryResult::ok(usage),
        }
    }

    pub(crate) fn take_fatal(&mut self) -> Option<LiveSlotsError> {
        self.fatal.take()
    }

    pub(crate) fn deliver(&mut self, target: VatSlot, msg: VatMessage) -> Result<(), LiveSlotsError> {
        let Message {
            method,
            args,
            result,
        } = msg;
        if let Some(result) = result {
            result.insist_kind(SlotKind::Promise)?;
        }
        let target_value = self.convert_slot_to_val(target)?;
        let args = match self.unserialize(&args)? {
            Value::List(items) => items,
            other => {
                return Err(LiveSlotsError::BadDelivery(format!(
                    "arguments to {method:?} must be a list, got {}",
                    other.kind_name()
                )));
            }
        };
        log::debug!("{}: deliver {target}.{method} result={result:?}", self.vat_id);
        match result {
            Some(rslot) => {
                if let Some(pid) = self.route_send(target_value, method, args, true) {
                    self.on_settled(
                        pid,
                        Box::new(move |vat, settlement| vat.resolve_exported(rslot, pid, settlement)),
                    );
                }
            }
            None => {
                self.route_send(target_value, method, args, false);
            }
        }
        Ok(())
    }

    pub(crate) fn notify(
        &mut self,
        vpid: VatSlot,
        resolution: Resolution<VatSlot>,
    ) -> Result<(), LiveSlotsError> {
        vpid.insist_kind(SlotKind::Promise)?;
        let pid = self
            .imported_promises
            .get(&vpid)
            .copied()
            .ok_or(LiveSlotsError::UnknownPromise(vpid))?;
        log::debug!("{}: notify {vpid} {}", self.vat_id, resolution.state_name());
        match resolution {
            Resolution::FulfilledToPresence { slot } => {
                slot.insist_kind(SlotKind::Object)?;
                let value = self.convert_slot_to_val(slot)?;
                self.resolve_promise(pid, value);
                self.retire_promise_id(vpid);
            }
            Resolution::FulfilledToData { data } => {
                let value = self.unserialize(&data)?;
                self.resolve_promise(pid, value);
                self.retire_promise_id_if_easy(vpid, &data.slots);
            }
            Resolution::Rejected { data } => {
                let reason = self.unserialize(&data)?;
                self.reject_promise(pid, reason);
                self.retire_promise_id_if_easy(vpid, &data.slots);
            }
        }
        Ok(())
    }

    pub(crate) fn drop_exports(&mut self, vrefs: &[VatSlot]) -> Result<(), LiveSlotsError> {
        for vref in vrefs {
            insist_object(vref, true)?;
            self.kernel_reachable.remove(vref);
        }
        Ok(())
    }

    pub(crate) fn retire_exports(&mut self, vrefs: &[VatSlot]) -> Result<(), LiveSlotsError> {
        for vref in vrefs {
            insist_object(vref, true)?;
            self.kernel_reachable.remove(vref);
            self.forget_slot(*vref);
        }
        Ok(())
    }

    pub(crate) fn retire_imports(&mut self, vrefs: &[VatSlot]) -> Result<(), LiveSlotsError> {
        for vref in vrefs {
            insist_object(vref, false)?;
            self.forget_slot(*vref);
        }
        Ok(())
    }

    /// The kernel no longer recognizes `slot`; drop the mapping, and the
    /// object too if vat code already let go of it.
    fn forget_slot(&mut self, slot: VatSlot) {
        if let Some(Handle::Ref(id)) = self.unregister_slot(slot) {
            if self.forgotten.remove(&id) {
                self.refs.remove(&id);
            }
        }
    }

    /// Reclaim forgotten references and report them to the kernel.
    pub(crate) fn bring_out_your_dead(&mut self) -> Result<(), LiveSlotsError> {
        let mut dropped_imports = Vec::new();
        let mut retired_exports = Vec::new();
        for id in std::mem::take(&mut self.forgotten) {
            let slot = self.val_to_slot.get(&Handle::Ref(id)).copied();
            let is_local = matches!(self.refs.get(&id), Some(RefEntry::Local(_)));
            match slot {
                None => {
                    self.refs.remove(&id);
                }
                Some(slot) if is_local => {
                    if self.kernel_reachable.contains(&slot) {
                        // Still held by the kernel; retire after dropExports.
                        self.forgotten.insert(id);
                        continue;
                    }
                    retired_exports.push(slot);
                    self.unregister_slot(slot);
                    self.refs.remove(&id);
                }
                Some(slot) if slot.kind == SlotKind::Object => {
                    dropped_imports.push(slot);
                    self.unregister_slot(slot);
                    self.refs.remove(&id);
                }
                // device nodes are never collected
                Some(_) => {}
            }
        }
        dropped_imports.sort();
        retired_exports.sort();
        if !dropped_imports.is_empty() {
            self.do_syscall(VatSyscall::DropImports {
                vrefs: dropped_imports.clone(),
            })?;
            self.do_syscall(VatSyscall::RetireImports {
                vrefs: dropped_imports,
            })?;
        }
        if !retired_exports.is_empty() {
            self.do_syscall(VatSyscall::RetireExports {
                vrefs: retired_exports,
            })?;
        }
        Ok(())
    }
}

impl SlotConverter for VatContext {
    fn convert_val_to_slot(&mut self, value: &Value) -> Result<VatSlot, LiveSlotsError> {
        let handle = Handle::of(value).ok_or_else(|| {
            LiveSlotsError::Marshal(format!("{} is not a reference", value.kind_name()))
        })?;
        if let Some(slot) = self.val_to_slot.get(&handle) {
            return Ok(*slot);
        }
        match handle {
            Handle::Promise(pid) => {
                if !self.promises.contains_key(&pid) {
                    return Err(LiveSlotsError::Marshal("unknown promise".into()));
                }
                Ok(self.export_promise(pid))
            }
            Handle::Ref(id) => match self.refs.get(&id) {
                Some(RefEntry::Local(_)) => {
                    let slot = self.allocate_export_id();
                    self.register(handle, slot);
                    self.kernel_reachable.insert(slot);
                    Ok(slot)
                }
                Some(RefEntry::Presence | RefEntry::Device) => Err(LiveSlotsError::Marshal(
                    "presence has been retired and cannot be passed".into(),
                )),
                None => Err(LiveSlotsError::Marshal("unknown remotable".into())),
            },
        }
    }

    fn convert_slot_to_val(&mut self, slot: VatSlot) -> Result<Value, LiveSlotsError> {
        if let Some(handle) = self.slot_to_val.get(&slot) {
            return Ok(handle.value());
        }
        if slot.allocated_by_vat {
            return Err(LiveSlotsError::UnknownExport(slot));
        }
        let handle = match slot.kind {
            SlotKind::Object => {
                let id = RefId(self.bump());
                self.refs.insert(id, RefEntry::Presence);
                Handle::Ref(id)
            }
            SlotKind::Device => {
                let id = RefId(self.bump());
                self.refs.insert(id, RefEntry::Device);
                Handle::Ref(id)
            }
            SlotKind::Promise => {
                let pid = self.new_promise();
                self.imported_promises.insert(slot, pid);
                self.do_syscall(VatSyscall::Subscribe { vpid: slot })?;
                Handle::Promise(pid)
            }
        };
        self.register(handle, slot);
        Ok(handle.value())
    }
}

fn insist_object(vref: &VatSlot, exported: bool) -> Result<(), LiveSlotsError> {
    vref.insist_kind(SlotKind::Object)?;
    if vref.allocated_by_vat != exported {
        let side = if exported { "export" } else { "import" };
        return Err(LiveSlotsError::BadDelivery(format!("{vref} is not an {side}")));
    }
    Ok(())
}

fn contains_promise(value: &Value) -> bool {
    match value {
        Value::Promise(_) => true,
        Value::List(items) => items.iter().any(contains_promise),
        Value::Record(fields) => fields.values().any(contains_promise),
        _ => false,
    }
}

fn unexpected_result(name: &str, data: &SyscallData<VatSlot>) -> LiveSlotsError {
    LiveSlotsError::Marshal(format!("unexpected {name} result {data:?}"))
}
