//! The kernel: owns every vat manager and drives the run queue one crank at
//! a time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use swing_abi::{
    CapData, KernelCapData, KernelMessage, KernelSlot, Message, Resolution, SlotKind, VatDelivery,
    VatId, VatSlot,
};
use swing_liveslots::BundleLoader;
use swing_store::{DynKvStore, DynTranscriptStore, MemKvStore, MemTranscriptStore};

use crate::config::{KernelConfig, ManagerType, VatOptions};
use crate::device::{Device, DeviceTable};
use crate::error::KernelError;
use crate::kernel_keeper::{KernelKeeper, KernelStats, PromiseStatus, RefOptions, RunQueueItem};
use crate::lock;
use crate::manager::{
    LocalWorker, ManagedVat, ManagerState, ProcessTransport, RemoteWorker, StartMode,
    ThreadTransport, VatManager,
};
use crate::meter::ComputronMeter;
use crate::slog::{DynSlog, SlogEvent, TracingSlog};
use crate::syscall_handler::KernelSyscallHandler;
use crate::transcript::SyscallGate;
use crate::translator::Translator;
use crate::vat_keeper::{ClistEntry, MapOptions, VatStats};

pub struct KernelBuilder {
    loader: Arc<dyn BundleLoader>,
    config: KernelConfig,
    kv: Option<DynKvStore>,
    transcripts: Option<DynTranscriptStore>,
    slog: Option<DynSlog>,
}

impl KernelBuilder {
    pub fn new(loader: Arc<dyn BundleLoader>) -> Self {
        Self {
            loader,
            config: KernelConfig::default(),
            kv: None,
            transcripts: None,
            slog: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Kernel state lives here; pass the same store to a later kernel to
    /// pick up where this one left off.
    pub fn with_kv_store(mut self, kv: DynKvStore) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_transcript_store(mut self, transcripts: DynTranscriptStore) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    pub fn with_slog(mut self, slog: DynSlog) -> Self {
        self.slog = Some(slog);
        self
    }

    pub fn build(self) -> Kernel {
        let kv = self.kv.unwrap_or_else(|| Arc::new(MemKvStore::new()));
        Kernel {
            loader: self.loader,
            config: self.config,
            keeper: Arc::new(Mutex::new(KernelKeeper::new(kv))),
            devices: DeviceTable::new(),
            transcripts: self
                .transcripts
                .unwrap_or_else(|| Arc::new(MemTranscriptStore::new())),
            slog: self.slog.unwrap_or_else(|| Arc::new(TracingSlog)),
            managers: BTreeMap::new(),
        }
    }
}

/// Where a routed message ends up.
enum Route {
    Deliver { vat_id: VatId, target: KernelSlot },
    Queued,
    Reject(KernelCapData),
}

pub struct Kernel {
    loader: Arc<dyn BundleLoader>,
    config: KernelConfig,
    keeper: Arc<Mutex<KernelKeeper>>,
    devices: DeviceTable,
    transcripts: DynTranscriptStore,
    slog: DynSlog,
    managers: BTreeMap<VatId, Box<dyn VatManager>>,
}

impl Kernel {
    pub fn builder(loader: Arc<dyn BundleLoader>) -> KernelBuilder {
        KernelBuilder::new(loader)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Create a vat, start its worker, and export its root object.
    pub async fn create_vat(&mut self, options: VatOptions) -> Result<VatId, KernelError> {
        let vat_id = {
            let mut keeper = lock(&self.keeper);
            let vat_id = keeper.allocate_vat_id()?;
            keeper.add_vat(&vat_id, &options)?;
            let root = keeper
                .vat(&vat_id)
                .map_vat_to_kernel(VatSlot::export(SlotKind::Object, 0), MapOptions::default())?;
            keeper.vat(&vat_id).set_root(root);
            keeper.pin(root)?;
            vat_id
        };
        let manager_type = self.manager_type(&options);
        self.slog.write(&SlogEvent::CreateVat {
            vat_id: vat_id.clone(),
            bundle: options.bundle.clone(),
            manager: manager_type.to_string(),
        });
        match self.start_manager(&vat_id, &options, StartMode::Fresh).await {
            Ok(manager) => {
                log::debug!("created {vat_id} from {} ({manager_type})", options.bundle);
                self.managers.insert(vat_id.clone(), manager);
                Ok(vat_id)
            }
            Err(err) => {
                log::warn!("{vat_id} failed to start: {err}");
                self.terminate(&vat_id, true, CapData::error(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    fn manager_type(&self, options: &VatOptions) -> ManagerType {
        options.manager_type.unwrap_or(self.config.default_manager)
    }

    async fn start_manager(
        &self,
        vat_id: &VatId,
        options: &VatOptions,
        mode: StartMode,
    ) -> Result<Box<dyn VatManager>, KernelError> {
        let manager_type = self.manager_type(options);
        let transcripts = options
            .enable_transcript
            .then(|| Arc::clone(&self.transcripts));
        let handler = KernelSyscallHandler::new(
            vat_id.clone(),
            Arc::clone(&self.keeper),
            self.devices.clone(),
        );
        let gate = SyscallGate::new(
            vat_id.clone(),
            Box::new(handler),
            transcripts.clone(),
            Arc::clone(&self.slog),
        );
        let meter = Box::new(ComputronMeter::new(
            options.meter_limit.or(self.config.default_meter_limit),
        ));
        let params = options.vat_parameters.clone();
        let manager: Box<dyn VatManager> = match manager_type {
            ManagerType::Local => {
                let bundle = self
                    .loader
                    .import_bundle(&options.bundle)
                    .map_err(|err| KernelError::Bundle(err.to_string()))?;
                let worker = LocalWorker::new(vat_id.clone(), bundle, params);
                Box::new(ManagedVat::start(worker, gate, meter, transcripts, mode).await?)
            }
            ManagerType::Thread => {
                let transport = ThreadTransport::spawn(vat_id.clone(), Arc::clone(&self.loader))?;
                let worker = RemoteWorker::new(vat_id.clone(), transport, &options.bundle, params, false)
                    .with_timeout(self.config.delivery_timeout);
                Box::new(ManagedVat::start(worker, gate, meter, transcripts, mode).await?)
            }
            ManagerType::Subprocess | ManagerType::Isolated => {
                let worker_bin = self.config.worker_bin.as_ref().ok_or_else(|| {
                    KernelError::Config(format!("{manager_type} vats need a worker binary"))
                })?;
                let transport = ProcessTransport::spawn(vat_id.clone(), worker_bin)?;
                let worker = RemoteWorker::new(
                    vat_id.clone(),
                    transport,
                    &options.bundle,
                    params,
                    manager_type.is_blocking(),
                )
                .with_timeout(self.config.delivery_timeout);
                Box::new(ManagedVat::start(worker, gate, meter, transcripts, mode).await?)
            }
        };
        Ok(manager)
    }

    /// Make `device` reachable from vats as a new device node.
    pub fn register_device(
        &mut self,
        name: &str,
        device: Arc<dyn Device>,
    ) -> Result<KernelSlot, KernelError> {
        let kref = lock(&self.keeper).add_device(name)?;
        self.devices.insert(kref, name, device);
        Ok(kref)
    }

    pub fn vat_root(&self, vat_id: &VatId) -> Result<KernelSlot, KernelError> {
        let mut keeper = lock(&self.keeper);
        if !keeper.is_live_vat(vat_id) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        keeper
            .vat(vat_id)
            .root()
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))
    }

    pub fn vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        lock(&self.keeper).vat_ids()
    }

    pub fn vat_state(&self, vat_id: &VatId) -> Option<ManagerState> {
        self.managers.get(vat_id).map(|manager| manager.state())
    }

    pub fn queue_to_vat_root(
        &mut self,
        vat_id: &VatId,
        method: &str,
        args: KernelCapData,
    ) -> Result<KernelSlot, KernelError> {
        let root = self.vat_root(vat_id)?;
        self.queue_message(root, method, args)
    }

    /// Queue a message from outside any vat. Returns the result promise,
    /// which stays alive until [`Kernel::unpin`] releases it.
    pub fn queue_message(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: KernelCapData,
    ) -> Result<KernelSlot, KernelError> {
        let mut keeper = lock(&self.keeper);
        for &kref in std::iter::once(&target).chain(&args.slots) {
            insist_exists(&keeper, kref)?;
        }
        let kpid = keeper.add_kernel_promise(None)?;
        keeper.pin(kpid)?;
        keeper.push_run_queue(RunQueueItem::Send {
            target,
            msg: Message::new(method, args, Some(kpid)),
        })?;
        Ok(kpid)
    }

    /// Hold `kref` on behalf of the host so it survives collection.
    pub fn pin(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let mut keeper = lock(&self.keeper);
        insist_exists(&keeper, kref)?;
        keeper.pin(kref)
    }

    /// Drop the host's hold on `kref`.
    pub fn unpin(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let mut keeper = lock(&self.keeper);
        insist_exists(&keeper, kref)?;
        keeper.decrement_refcount(kref, RefOptions::default())?;
        keeper.process_refcounts()
    }

    /// Ask a vat to sweep the references it has forgotten.
    pub fn schedule_reap(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        let mut keeper = lock(&self.keeper);
        if !keeper.is_live_vat(vat_id) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        keeper.push_run_queue(RunQueueItem::BringOutYourDead {
            vat_id: vat_id.clone(),
        })
    }

    pub fn kpstatus(&self, kpid: KernelSlot) -> Result<PromiseStatus, KernelError> {
        lock(&self.keeper).promise_status(kpid)
    }

    pub fn run_queue_len(&self) -> Result<usize, KernelError> {
        lock(&self.keeper).run_queue_len()
    }

    /// Process one queued item. `false` when there was nothing to do.
    pub async fn step(&mut self) -> Result<bool, KernelError> {
        let (item, crank) = {
            let mut keeper = lock(&self.keeper);
            let item = loop {
                let Some(item) = keeper.next_item()? else {
                    return Ok(false);
                };
                match keeper.filter_gc_action(item) {
                    Some(item) => break item,
                    None => log::debug!("dropped a stale gc action"),
                }
            };
            (item, keeper.start_crank()?)
        };
        self.slog.write(&SlogEvent::CrankStart {
            crank,
            kind: item.kind_name().to_string(),
        });
        match item {
            RunQueueItem::Send { target, msg } => self.process_send(target, msg).await?,
            RunQueueItem::Notify { vat_id, kpid } => {
                let delivery = {
                    let mut keeper = lock(&self.keeper);
                    if keeper.is_live_vat(&vat_id) {
                        Translator::new(&mut keeper, &vat_id).notify(kpid)?
                    } else {
                        None
                    }
                };
                if let Some(delivery) = delivery {
                    self.deliver(&vat_id, delivery).await?;
                }
                lock(&self.keeper).release_item(&RunQueueItem::Notify { vat_id, kpid })?;
            }
            RunQueueItem::DropExports { vat_id, krefs } => {
                let delivery = self.translate_live(&vat_id, |t| t.drop_exports(&krefs))?;
                self.deliver_opt(&vat_id, delivery).await?;
            }
            RunQueueItem::RetireExports { vat_id, krefs } => {
                let delivery = self.translate_live(&vat_id, |t| t.retire_exports(&krefs))?;
                self.deliver_opt(&vat_id, delivery).await?;
            }
            RunQueueItem::RetireImports { vat_id, krefs } => {
                let delivery = self.translate_live(&vat_id, |t| t.retire_imports(&krefs))?;
                self.deliver_opt(&vat_id, delivery).await?;
            }
            RunQueueItem::BringOutYourDead { vat_id } => {
                if lock(&self.keeper).is_live_vat(&vat_id) {
                    self.deliver(&vat_id, VatDelivery::BringOutYourDead).await?;
                }
            }
        }
        lock(&self.keeper).process_refcounts()?;
        Ok(true)
    }

    /// Step until the queues are empty; returns the number of cranks run.
    pub async fn run(&mut self) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while self.step().await? {
            cranks += 1;
        }
        Ok(cranks)
    }

    fn translate_live(
        &self,
        vat_id: &VatId,
        translate: impl FnOnce(&mut Translator<'_>) -> Result<VatDelivery, KernelError>,
    ) -> Result<Option<VatDelivery>, KernelError> {
        let mut keeper = lock(&self.keeper);
        if !keeper.is_live_vat(vat_id) {
            return Ok(None);
        }
        translate(&mut Translator::new(&mut keeper, vat_id)).map(Some)
    }

    async fn deliver_opt(&mut self, vat_id: &VatId, delivery: Option<VatDelivery>) -> Result<(), KernelError> {
        match delivery {
            Some(delivery) => self.deliver(vat_id, delivery).await,
            None => Ok(()),
        }
    }

    async fn process_send(&mut self, target: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        let item = RunQueueItem::Send {
            target,
            msg: msg.clone(),
        };
        let destination = route(&mut lock(&self.keeper), target, &msg)?;
        match destination {
            Route::Deliver { vat_id, target } => {
                let translated = {
                    let mut keeper = lock(&self.keeper);
                    Translator::new(&mut keeper, &vat_id).message(target, &msg)
                };
                match translated {
                    Ok(delivery) => self.deliver(&vat_id, delivery).await?,
                    Err(err) => {
                        log::error!("cannot deliver {} to {target} in {vat_id}: {err}", msg.method);
                        reject_result(&mut lock(&self.keeper), &msg, CapData::error(err.to_string()))?;
                    }
                }
            }
            // The queued message keeps its references.
            Route::Queued => return Ok(()),
            Route::Reject(data) => {
                log::debug!("rejecting {} sent to {target}", msg.method);
                reject_result(&mut lock(&self.keeper), &msg, data)?;
            }
        }
        lock(&self.keeper).release_item(&item)
    }

    /// Hand one delivery to a vat's manager and terminate the vat if it
    /// failed or asked to exit.
    async fn deliver(&mut self, vat_id: &VatId, delivery: VatDelivery) -> Result<(), KernelError> {
        let Some(manager) = self.managers.get_mut(vat_id) else {
            log::warn!("no manager for {vat_id}; dropping {}", delivery.kind_name());
            return Ok(());
        };
        lock(&self.keeper).note_delivery(vat_id);
        let outcome = manager.deliver(delivery).await;
        let exit = lock(&self.keeper).take_exit(vat_id);
        match outcome {
            Err(err) => {
                log::warn!("{vat_id} manager failed: {err}");
                self.terminate(vat_id, true, CapData::error(err.to_string())).await
            }
            Ok(result) => match (result.error_message(), exit) {
                (Some(message), _) => {
                    let info = CapData::error(message);
                    self.terminate(vat_id, true, info).await
                }
                (None, Some(exit)) => self.terminate(vat_id, exit.is_failure, exit.info).await,
                (None, None) => Ok(()),
            },
        }
    }

    /// Kill a vat from outside. Promises it was deciding are rejected with
    /// `reason`.
    pub async fn terminate_vat(&mut self, vat_id: &VatId, reason: KernelCapData) -> Result<(), KernelError> {
        if !lock(&self.keeper).is_live_vat(vat_id) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        self.terminate(vat_id, true, reason).await
    }

    async fn terminate(&mut self, vat_id: &VatId, is_failure: bool, info: KernelCapData) -> Result<(), KernelError> {
        {
            let mut keeper = lock(&self.keeper);
            if !keeper.is_live_vat(vat_id) {
                return Ok(());
            }
            for &kref in &info.slots {
                insist_exists(&keeper, kref)?;
            }
            keeper.cleanup_terminated_vat(vat_id, &info)?;
            keeper.process_refcounts()?;
        }
        if let Some(mut manager) = self.managers.remove(vat_id) {
            if let Err(err) = manager.shutdown().await {
                log::warn!("shutting down {vat_id}: {err}");
            }
        }
        if let Err(err) = self.transcripts.delete_vat(vat_id) {
            log::warn!("dropping transcript of {vat_id}: {err}");
        }
        log::info!("terminated {vat_id} (failure: {is_failure})");
        self.slog.write(&SlogEvent::TerminateVat {
            vat_id: vat_id.clone(),
            reason: info.body,
        });
        Ok(())
    }

    /// Restart a vat's worker and replay its transcript. Returns the number
    /// of deliveries replayed.
    pub async fn reload_vat(&mut self, vat_id: &VatId) -> Result<u64, KernelError> {
        let options = {
            let keeper = lock(&self.keeper);
            if !keeper.is_live_vat(vat_id) {
                return Err(KernelError::UnknownVat(vat_id.clone()));
            }
            keeper.vat_options(vat_id)?
        };
        if let Some(mut old) = self.managers.remove(vat_id) {
            if let Err(err) = old.shutdown().await {
                log::warn!("shutting down {vat_id} before reload: {err}");
            }
        }
        let manager = self.start_manager(vat_id, &options, StartMode::Reload).await?;
        let manager = self.managers.entry(vat_id.clone()).or_insert(manager);
        let replayed = manager.replay_transcript(None).await?;
        log::debug!("reloaded {vat_id}, replayed {replayed:?} deliveries");
        Ok(replayed.unwrap_or(0))
    }

    /// Start workers for every live vat recorded in the kv store that this
    /// kernel is not running yet.
    pub async fn resume(&mut self) -> Result<u64, KernelError> {
        let mut replayed = 0;
        for vat_id in self.vat_ids()? {
            if !self.managers.contains_key(&vat_id) {
                replayed += self.reload_vat(&vat_id).await?;
            }
        }
        Ok(replayed)
    }

    /// Every c-list entry of every live vat.
    pub fn dump_clist(&self) -> Result<Vec<ClistEntry>, KernelError> {
        let mut keeper = lock(&self.keeper);
        let mut entries = Vec::new();
        for vat_id in keeper.vat_ids()? {
            entries.extend(keeper.vat(&vat_id).clist_entries()?);
        }
        Ok(entries)
    }

    pub fn stats(&self) -> Result<KernelStats, KernelError> {
        lock(&self.keeper).stats()
    }

    pub fn vat_stats(&self, vat_id: &VatId) -> Result<VatStats, KernelError> {
        let mut stats = {
            let mut keeper = lock(&self.keeper);
            if !keeper.is_live_vat(vat_id) {
                return Err(KernelError::UnknownVat(vat_id.clone()));
            }
            keeper.vat(vat_id).stats()?
        };
        stats.transcript_entries = self.transcripts.len(vat_id)?;
        Ok(stats)
    }

    pub fn transcripts(&self) -> &DynTranscriptStore {
        &self.transcripts
    }

    /// Stop every worker. Kernel state stays in the kv store.
    pub async fn shutdown(&mut self) -> Result<(), KernelError> {
        for (vat_id, mut manager) in std::mem::take(&mut self.managers) {
            if let Err(err) = manager.shutdown().await {
                log::warn!("shutting down {vat_id}: {err}");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("vats", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn insist_exists(keeper: &KernelKeeper, kref: KernelSlot) -> Result<(), KernelError> {
    let exists = match kref.kind {
        SlotKind::Object => keeper.object_exists(kref),
        SlotKind::Promise => keeper.promise_exists(kref),
        SlotKind::Device => keeper.device_exists(kref),
    };
    if exists {
        Ok(())
    } else {
        Err(match kref.kind {
            SlotKind::Object => KernelError::UnknownObject(kref),
            SlotKind::Promise => KernelError::UnknownPromise(kref),
            SlotKind::Device => KernelError::UnknownDevice(kref),
        })
    }
}

/// Follow promises fulfilled to presences until the message either reaches
/// a live vat's export, parks on an unresolved promise, or cannot be
/// delivered at all.
fn route(keeper: &mut KernelKeeper, mut target: KernelSlot, msg: &KernelMessage) -> Result<Route, KernelError> {
    loop {
        match target.kind {
            SlotKind::Object => {
                return Ok(match keeper.object_owner(target) {
                    Some(vat_id) if keeper.is_live_vat(&vat_id) => Route::Deliver { vat_id, target },
                    _ => Route::Reject(CapData::error("vat terminated")),
                });
            }
            SlotKind::Device => return Ok(Route::Reject(CapData::error("cannot send to device"))),
            SlotKind::Promise => match keeper.promise(target)?.resolution {
                None => {
                    keeper.enqueue_on_promise(target, msg.clone())?;
                    return Ok(Route::Queued);
                }
                Some(Resolution::FulfilledToPresence { slot }) => target = slot,
                Some(Resolution::FulfilledToData { .. }) => {
                    return Ok(Route::Reject(CapData::error(format!(
                        "data is not callable, has no method {}",
                        msg.method
                    ))));
                }
                Some(Resolution::Rejected { data }) => return Ok(Route::Reject(data)),
            },
        }
    }
}

fn reject_result(keeper: &mut KernelKeeper, msg: &KernelMessage, data: KernelCapData) -> Result<(), KernelError> {
    let Some(kpid) = msg.result else {
        return Ok(());
    };
    if keeper.promise(kpid)?.is_resolved() {
        return Ok(());
    }
    keeper.resolve_kernel_promise(kpid, Resolution::Rejected { data }, None)
}
