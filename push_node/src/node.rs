/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-node event loop.
//!
//! A [`NodeEventLoop`] owns every particle assigned to its devices. It pulls
//! one message at a time from its inbox and dispatches it on a single
//! thread; compute units are handed to the device's executor and retired
//! lazily, when a later operation needs the device. Handlers run inline on
//! the dispatch thread and may block in [`NodeEventLoop::wait`], which keeps
//! pumping the inbox so the loop never deadlocks against itself.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use dashmap::DashMap;
use push_messages::Data;
use push_messages::Device;
use push_messages::DeviceIndex;
use push_messages::Fid;
use push_messages::FutureKey;
use push_messages::ParamSnapshot;
use push_messages::Pid;
use push_messages::Rank;
use push_messages::RemoteError;
use push_messages::Tensor;
use push_messages::WireValue;
use push_messages::client::ClientMessage;
use push_messages::peer::PeerMessage;
use tokio::sync::mpsc;

use crate::cache::CacheError;
use crate::cache::Handle;
use crate::cache::ParticleCache;
use crate::cache::ResourceLoader;
use crate::checkpoint::Checkpointer;
use crate::checkpoint::DirCheckpointer;
use crate::config::Config;
use crate::config::EvictionPolicy;
use crate::device::Completion;
use crate::device::DeviceExecutor;
use crate::device::Job;
use crate::future::Outcome;
use crate::future::PFuture;
use crate::particle::Handler;
use crate::particle::Particle;
use crate::particle::ParticleState;
use crate::particle::ParticleView;
use crate::resource::LossFn;
use crate::resource::Module;
use crate::resource::ModuleFactory;
use crate::resource::Resource;
use crate::resource::StepFactory;
use crate::resource::load_snapshot;

/// Sender half of a node's inbox.
pub type NodeSender = mpsc::UnboundedSender<Envelope>;

/// Requests from the coordinator. These travel in-process and are never
/// encoded.
pub enum ControlMessage {
    InitParticle {
        pid: Pid,
        device: DeviceIndex,
        state: ParticleState,
        handlers: HashMap<String, Handler>,
        steps: StepFactory,
    },
    RegisterHandler {
        pid: Pid,
        name: String,
        handler: Handler,
    },
    /// Replace the node's routing tables.
    Broadcast {
        peers: HashMap<Rank, NodeSender>,
        particle_to_rank: HashMap<Pid, Rank>,
        particle_to_device: HashMap<Pid, DeviceIndex>,
    },
    /// Run a handler on behalf of the coordinator.
    Launch {
        key: FutureKey,
        name: String,
        args: Vec<WireValue>,
    },
    FetchParameters {
        key: FutureKey,
    },
    Save {
        key: FutureKey,
    },
    Shutdown,
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::InitParticle {
                pid,
                device,
                handlers,
                steps,
                ..
            } => f
                .debug_struct("InitParticle")
                .field("pid", pid)
                .field("device", device)
                .field("handlers", &handlers.keys().collect::<BTreeSet<_>>())
                .field("steps", steps)
                .finish(),
            ControlMessage::RegisterHandler { pid, name, .. } => f
                .debug_struct("RegisterHandler")
                .field("pid", pid)
                .field("name", name)
                .finish(),
            ControlMessage::Broadcast {
                peers,
                particle_to_rank,
                ..
            } => f
                .debug_struct("Broadcast")
                .field("peers", &peers.len())
                .field("particles", &particle_to_rank.len())
                .finish(),
            ControlMessage::Launch { key, name, .. } => f
                .debug_struct("Launch")
                .field("key", key)
                .field("name", name)
                .finish(),
            ControlMessage::FetchParameters { key } => {
                f.debug_struct("FetchParameters").field("key", key).finish()
            }
            ControlMessage::Save { key } => f.debug_struct("Save").field("key", key).finish(),
            ControlMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// What actually travels on a node's inbox channel. Peer traffic is always
/// encoded.
#[derive(Debug)]
pub enum Envelope {
    Control(ControlMessage),
    Wire(Data),
}

impl Envelope {
    pub fn peer(message: &PeerMessage) -> anyhow::Result<Self> {
        Ok(Envelope::Wire(message.encode()?))
    }
}

/// A decoded inbox message.
#[derive(Debug)]
pub enum NodeMessage {
    Control(ControlMessage),
    Peer(PeerMessage),
}

impl NodeMessage {
    /// Whether a loop waiting on `fid` must hold this message back until
    /// its own future resolves.
    fn deferred_while_waiting_on(&self, fid: Fid) -> bool {
        match self {
            NodeMessage::Control(ControlMessage::Launch { .. }) => true,
            NodeMessage::Peer(message) if message.is_request() => true,
            NodeMessage::Peer(PeerMessage::InvokeAck { fid: other, .. }) => *other != fid,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub fn new(receiver: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { receiver }
    }

    /// Block for the next message. `None` once every sender is gone.
    pub fn recv(&mut self) -> anyhow::Result<Option<NodeMessage>> {
        match self.receiver.blocking_recv() {
            None => Ok(None),
            Some(Envelope::Control(message)) => Ok(Some(NodeMessage::Control(message))),
            Some(Envelope::Wire(data)) => Ok(Some(NodeMessage::Peer(PeerMessage::decode(&data)?))),
        }
    }
}

/// Loads particle resources, honoring the node's eviction policy.
struct ParticleLoader {
    mk_module: ModuleFactory,
    steps: Arc<Mutex<HashMap<Pid, StepFactory>>>,
    policy: EvictionPolicy,
    parked: Mutex<HashMap<Pid, Resource>>,
}

impl ResourceLoader<Resource> for ParticleLoader {
    fn load(&self, pid: Pid, device: DeviceIndex) -> anyhow::Result<Resource> {
        let placement = Device::Accelerator(device);
        let parked = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        if let Some(mut resource) = parked {
            resource.module.to_device(placement);
            return Ok(resource);
        }
        let steps = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
            .ok_or(RemoteError::UnknownParticle(pid))?;
        let mut module =
            (self.mk_module)(device).with_context(|| format!("building module for {}", pid))?;
        module.to_device(placement);
        steps.build(module)
    }

    fn teardown(&self, pid: Pid, _device: DeviceIndex, mut resource: Resource) -> anyhow::Result<()> {
        match self.policy {
            EvictionPolicy::Offload => {
                resource.module.to_device(Device::Cpu);
                self.parked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(pid, resource);
            }
            EvictionPolicy::Discard => drop(resource),
        }
        Ok(())
    }
}

/// Builds empty placeholders for views; the refresh step overwrites them.
struct ViewLoader {
    mk_module: ModuleFactory,
}

impl ResourceLoader<Box<dyn Module>> for ViewLoader {
    fn load(&self, pid: Pid, device: DeviceIndex) -> anyhow::Result<Box<dyn Module>> {
        (self.mk_module)(device).with_context(|| format!("building view of {}", pid))
    }

    fn teardown(&self, _pid: Pid, _device: DeviceIndex, _view: Box<dyn Module>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The unit currently occupying a device.
#[derive(Debug)]
struct ActiveOp {
    pid: Pid,
    fid: Fid,
    completion: Completion,
}

struct DeviceSlot {
    cache: Arc<ParticleCache<Resource>>,
    views: Arc<ParticleCache<Box<dyn Module>>>,
    executor: DeviceExecutor,
    active: Option<ActiveOp>,
}

pub struct NodeEventLoop {
    rank: Rank,
    inbox: Inbox,
    client: mpsc::UnboundedSender<ClientMessage>,
    peers: HashMap<Rank, NodeSender>,
    particle_to_rank: HashMap<Pid, Rank>,
    particle_to_device: HashMap<Pid, DeviceIndex>,
    /// Particles that live on this node.
    local: HashMap<Pid, DeviceIndex>,
    states: HashMap<Pid, ParticleState>,
    handlers: HashMap<Pid, HashMap<String, Handler>>,
    steps: Arc<Mutex<HashMap<Pid, StepFactory>>>,
    devices: BTreeMap<DeviceIndex, DeviceSlot>,
    next_fid: u64,
    particle_to_futures: HashMap<Pid, BTreeSet<Fid>>,
    future_to_particle: HashMap<Fid, Pid>,
    results: Arc<DashMap<Fid, Result<Outcome, RemoteError>>>,
    /// Set by a compute unit that failed; the dispatch thread stops on it.
    unit_failed: Arc<AtomicBool>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    stopped: bool,
}

impl fmt::Debug for NodeEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEventLoop")
            .field("rank", &self.rank)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("particles", &self.local.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

fn remote_error(pid: Pid, op: &str, err: anyhow::Error) -> RemoteError {
    match err.downcast::<RemoteError>() {
        Ok(err) => err,
        Err(err) => RemoteError::OperationFailed {
            pid,
            op: op.to_string(),
            message: format!("{:#}", err),
        },
    }
}

impl NodeEventLoop {
    pub fn new(
        rank: Rank,
        devices: impl IntoIterator<Item = DeviceIndex>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        client: mpsc::UnboundedSender<ClientMessage>,
        config: &Config,
        mk_module: ModuleFactory,
    ) -> anyhow::Result<Self> {
        let steps = Arc::new(Mutex::new(HashMap::new()));
        let mut slots = BTreeMap::new();
        for device in devices {
            let cache = ParticleCache::new(
                device,
                config.cache_size,
                ParticleLoader {
                    mk_module: mk_module.clone(),
                    steps: steps.clone(),
                    policy: config.eviction,
                    parked: Mutex::new(HashMap::new()),
                },
            )?;
            let views = ParticleCache::new(
                device,
                config.view_size,
                ViewLoader {
                    mk_module: mk_module.clone(),
                },
            )?;
            slots.insert(
                device,
                DeviceSlot {
                    cache: Arc::new(cache),
                    views: Arc::new(views),
                    executor: DeviceExecutor::new(device)?,
                    active: None,
                },
            );
        }
        let checkpointer = match &config.checkpoint_dir {
            Some(dir) => Some(Arc::new(DirCheckpointer::new(dir)?) as Arc<dyn Checkpointer>),
            None => None,
        };
        Ok(Self {
            rank,
            inbox: Inbox::new(inbox),
            client,
            peers: HashMap::new(),
            particle_to_rank: HashMap::new(),
            particle_to_device: HashMap::new(),
            local: HashMap::new(),
            states: HashMap::new(),
            handlers: HashMap::new(),
            steps,
            devices: slots,
            next_fid: 0,
            particle_to_futures: HashMap::new(),
            future_to_particle: HashMap::new(),
            results: Arc::new(DashMap::new()),
            unit_failed: Arc::new(AtomicBool::new(false)),
            checkpointer,
            stopped: false,
        })
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn devices(&self) -> Vec<DeviceIndex> {
        self.devices.keys().copied().collect()
    }

    /// Every particle the node has heard of, in pid order.
    pub fn particles(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.particle_to_rank.keys().copied().collect();
        pids.sort();
        pids
    }

    /// Run the loop on a dedicated, named OS thread.
    pub fn spawn(self) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        std::thread::Builder::new()
            .name(format!("push-node-{}", self.rank.0))
            .spawn(move || self.run())
            .context("spawning node event loop")
    }

    /// Dispatch messages until shutdown, a closed inbox, or a fatal error.
    pub fn run(mut self) -> anyhow::Result<()> {
        tracing::info!("{}: serving {:?}", self.rank, self.devices());
        let result = self.serve();
        if let Err(err) = &result {
            tracing::error!("{}: stopping after fatal error: {:#}", self.rank, err);
        }
        self.teardown();
        result
    }

    fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            self.observe_unit_failure();
            if self.stopped {
                break;
            }
            let Some(message) = self.recv()? else {
                tracing::info!("{}: inbox closed", self.rank);
                break;
            };
            if let Err(err) = self.handle(message) {
                self.fail(
                    None,
                    RemoteError::NodeFailed {
                        rank: self.rank,
                        message: format!("{:#}", err),
                    },
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.stopped = true;
        for device in self.devices() {
            if let Err(err) = self.retire(device) {
                tracing::warn!("{}: {:#}", self.rank, err);
            }
        }
        tracing::info!("{}: stopped", self.rank);
    }

    fn recv(&mut self) -> anyhow::Result<Option<NodeMessage>> {
        match self.inbox.recv() {
            Ok(message) => Ok(message),
            Err(err) => {
                self.fail(None, RemoteError::Codec(format!("{:#}", err)));
                Err(err)
            }
        }
    }

    /// Report the first fatal error to the coordinator and stop dispatching.
    fn fail(&mut self, pid: Option<Pid>, error: RemoteError) {
        if self.stopped {
            return;
        }
        tracing::error!("{}: {}", self.rank, error);
        self.stopped = true;
        self.reply(ClientMessage::Failure {
            rank: self.rank,
            pid,
            error,
        });
    }

    /// Stop dispatching once a compute unit has failed. The unit itself
    /// has already reported the failure.
    fn observe_unit_failure(&mut self) {
        if !self.stopped && self.unit_failed.load(Ordering::SeqCst) {
            tracing::error!("{}: stopping after a failed compute unit", self.rank);
            self.stopped = true;
        }
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        if self.stopped {
            return Err(RemoteError::TornDown(self.rank).into());
        }
        Ok(())
    }

    fn reply(&self, message: ClientMessage) {
        if self.client.send(message).is_err() {
            tracing::warn!("{}: coordinator hung up", self.rank);
        }
    }

    fn post(&self, rank: Rank, message: PeerMessage) -> anyhow::Result<()> {
        let envelope = Envelope::peer(&message)?;
        match self.peers.get(&rank) {
            Some(peer) if peer.send(envelope).is_ok() => {}
            _ => tracing::warn!("{}: dropping {:?} for unreachable {}", self.rank, message, rank),
        }
        Ok(())
    }

    /// Send `message` to the node that owns `pid`.
    fn post_to_owner(&self, pid: Pid, message: PeerMessage) -> anyhow::Result<()> {
        match self.particle_to_rank.get(&pid) {
            Some(rank) => self.post(*rank, message),
            None => {
                tracing::warn!("{}: no route to {}, dropping {:?}", self.rank, pid, message);
                Ok(())
            }
        }
    }

    fn handle(&mut self, message: NodeMessage) -> anyhow::Result<()> {
        match message {
            NodeMessage::Control(ControlMessage::InitParticle {
                pid,
                device,
                state,
                handlers,
                steps,
            }) => {
                let result = self.init_particle(pid, device, state, handlers, steps);
                self.reply(ClientMessage::ParticleInitAck { pid, result });
            }
            NodeMessage::Control(ControlMessage::RegisterHandler { pid, name, handler }) => {
                let result = match self.handlers.get_mut(&pid) {
                    Some(table) if self.local.contains_key(&pid) => {
                        table.insert(name.clone(), handler);
                        Ok(())
                    }
                    _ => Err(RemoteError::UnknownParticle(pid)),
                };
                self.reply(ClientMessage::RegisterAck { pid, name, result });
            }
            NodeMessage::Control(ControlMessage::Broadcast {
                peers,
                particle_to_rank,
                particle_to_device,
            }) => {
                self.peers = peers;
                self.particle_to_rank.extend(particle_to_rank);
                self.particle_to_device.extend(particle_to_device);
                self.reply(ClientMessage::BroadcastAck { rank: self.rank });
            }
            NodeMessage::Control(ControlMessage::Launch { key, name, args }) => {
                let result = self.invoke(key.pid, &name, args).map(|v| v.to_host());
                self.reply(ClientMessage::FuncAck { key, result });
            }
            NodeMessage::Control(ControlMessage::FetchParameters { key }) => {
                let result = self
                    .snapshot(key.pid)
                    .map(|snapshot| snapshot.params)
                    .map_err(|err| remote_error(key.pid, "fetch_parameters", err));
                self.reply(ClientMessage::ParametersAck { key, result });
            }
            NodeMessage::Control(ControlMessage::Save { key }) => {
                let result = self.save();
                self.reply(ClientMessage::SaveAck { key, result });
            }
            NodeMessage::Control(ControlMessage::Shutdown) => {
                tracing::info!("{}: shutting down", self.rank);
                self.stopped = true;
            }
            NodeMessage::Peer(PeerMessage::Invoke {
                sender,
                pid,
                name,
                args,
            }) => {
                let result = self.invoke(pid, &name, args).map(|v| v.to_host());
                self.post_to_owner(
                    sender.pid,
                    PeerMessage::InvokeAck {
                        fid: sender.fid,
                        pid,
                        result,
                    },
                )?;
            }
            NodeMessage::Peer(PeerMessage::Notify {
                sender,
                pid,
                name,
                args,
            }) => {
                if let Err(err) = self.invoke(pid, &name, args) {
                    tracing::warn!("{}: notify from {} failed: {}", self.rank, sender, err);
                }
            }
            NodeMessage::Peer(PeerMessage::InvokeAck { fid, pid, result }) => {
                self.resolve(fid, result.map(Outcome::Value), pid);
            }
            NodeMessage::Peer(PeerMessage::Get { sender, pid }) => {
                let result = self
                    .snapshot(pid)
                    .map_err(|err| remote_error(pid, "get", err));
                self.post_to_owner(
                    sender.pid,
                    PeerMessage::GetAck {
                        fid: sender.fid,
                        caller: sender.pid,
                        pid,
                        result,
                    },
                )?;
            }
            NodeMessage::Peer(PeerMessage::GetAck {
                fid,
                caller,
                pid,
                result,
            }) => {
                let outcome = match result {
                    Ok(snapshot) => self
                        .materialize_view(caller, pid, &snapshot)
                        .map(Outcome::View)
                        .map_err(|err| remote_error(pid, "get", err)),
                    Err(err) => Err(err),
                };
                self.resolve(fid, outcome, pid);
            }
        }
        Ok(())
    }

    fn init_particle(
        &mut self,
        pid: Pid,
        device: DeviceIndex,
        state: ParticleState,
        handlers: HashMap<String, Handler>,
        steps: StepFactory,
    ) -> Result<(), RemoteError> {
        let refuse = |message: String| RemoteError::OperationFailed {
            pid,
            op: "init".to_string(),
            message,
        };
        if !self.devices.contains_key(&device) {
            return Err(refuse(format!("{} is not owned by {}", device, self.rank)));
        }
        if self.local.contains_key(&pid) {
            return Err(refuse(format!("{} already exists", pid)));
        }
        self.local.insert(pid, device);
        self.particle_to_rank.insert(pid, self.rank);
        self.particle_to_device.insert(pid, device);
        self.states.insert(pid, state);
        self.handlers.insert(pid, handlers);
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, steps);
        tracing::debug!("{}: created {} on {}", self.rank, pid, device);
        Ok(())
    }

    /// Record a result for a pending future. Results for futures nobody is
    /// waiting on are dropped.
    fn resolve(&mut self, fid: Fid, result: Result<Outcome, RemoteError>, from: Pid) {
        if self.future_to_particle.contains_key(&fid) {
            self.results.insert(fid, result);
        } else {
            tracing::warn!("{}: dropping result of {} from {} for unknown future", self.rank, fid, from);
        }
    }

    pub(crate) fn state(&self, pid: Pid) -> Option<&ParticleState> {
        self.states.get(&pid)
    }

    pub(crate) fn state_mut(&mut self, pid: Pid) -> &mut ParticleState {
        self.states.entry(pid).or_default()
    }

    fn local_device(&self, pid: Pid) -> anyhow::Result<DeviceIndex> {
        self.local
            .get(&pid)
            .copied()
            .ok_or_else(|| RemoteError::UnknownParticle(pid).into())
    }

    fn slot(&mut self, device: DeviceIndex) -> anyhow::Result<&mut DeviceSlot> {
        let rank = self.rank;
        self.devices
            .get_mut(&device)
            .ok_or_else(|| anyhow!("{} does not own {}", rank, device))
    }

    /// Wait for the unit occupying `device`, if any, and unpin its particle.
    fn retire(&mut self, device: DeviceIndex) -> anyhow::Result<()> {
        let slot = self.slot(device)?;
        let Some(ActiveOp {
            pid,
            fid,
            completion,
        }) = slot.active.take()
        else {
            return Ok(());
        };
        let cache = slot.cache.clone();
        let result = completion.join();
        cache.release(pid)?;
        if let Err(err) = result {
            // A unit that ran to completion has already recorded and
            // reported its failure.
            if self.future_to_particle.contains_key(&fid) && !self.results.contains_key(&fid) {
                self.results.insert(fid, Err(err.clone()));
                self.fail(Some(pid), err.clone());
            }
            self.stopped = true;
            return Err(anyhow::Error::new(err).context(format!("{} on {}", fid, device)));
        }
        Ok(())
    }

    /// Make `pid`'s resource resident on its device, optionally pinning it.
    fn context_switch(&mut self, pid: Pid, pin: bool) -> anyhow::Result<Handle<Resource>> {
        let device = self.local_device(pid)?;
        let occupied_by_other = self
            .slot(device)?
            .active
            .as_ref()
            .is_some_and(|op| op.pid != pid);
        if occupied_by_other {
            self.retire(device)?;
        }
        let cache = self.slot(device)?.cache.clone();
        loop {
            if let Some(handle) = cache.try_read(pid, pin)? {
                tracing::debug!("{}: switched to {} on {}", self.rank, pid, device);
                return Ok(handle);
            }
            self.retire(device)?;
            if cache.evict_oldest_unpinned()?.is_none() {
                return Err(CacheError::Exhausted(device).into());
            }
        }
    }

    /// Like `context_switch`, but also waits for `pid`'s own unit so the
    /// caller observes its effects.
    pub(crate) fn activate(&mut self, pid: Pid) -> anyhow::Result<Handle<Resource>> {
        let device = self.local_device(pid)?;
        self.retire(device)?;
        self.context_switch(pid, false)
    }

    fn snapshot(&mut self, pid: Pid) -> anyhow::Result<ParamSnapshot> {
        let handle = self.activate(pid)?;
        let resource = handle.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(resource.snapshot())
    }

    /// Copy `snapshot` into a fresh view of `pid` on `caller`'s device.
    fn materialize_view(
        &mut self,
        caller: Pid,
        pid: Pid,
        snapshot: &ParamSnapshot,
    ) -> anyhow::Result<ParticleView> {
        let device = self.local_device(caller)?;
        let views = self.slot(device)?.views.clone();
        // Outstanding views keep the module they were handed.
        views.invalidate(pid)?;
        let handle = views.read(pid)?;
        {
            let mut module = handle.lock().unwrap_or_else(PoisonError::into_inner);
            load_snapshot(&mut **module, snapshot, Device::Accelerator(device))?;
            module.train(false);
        }
        Ok(ParticleView::new(pid, device, handle))
    }

    fn save(&mut self) -> Result<(), RemoteError> {
        let Some(checkpointer) = self.checkpointer.clone() else {
            return Err(RemoteError::NodeFailed {
                rank: self.rank,
                message: "no checkpoint directory configured".to_string(),
            });
        };
        let mut pids: Vec<_> = self.local.keys().copied().collect();
        pids.sort();
        for pid in pids {
            let snapshot = self
                .snapshot(pid)
                .map_err(|err| remote_error(pid, "save", err))?;
            checkpointer
                .save(pid, &snapshot)
                .map_err(|err| remote_error(pid, "save", err.into()))?;
        }
        tracing::info!("{}: saved {} particles", self.rank, self.local.len());
        Ok(())
    }

    /// Run handler `name` of local particle `pid`. Unknown targets produce
    /// an error result; a failing handler also stops the loop.
    fn invoke(&mut self, pid: Pid, name: &str, args: Vec<WireValue>) -> Result<WireValue, RemoteError> {
        let Some(&device) = self.local.get(&pid) else {
            tracing::warn!("{}: {} is not local, cannot run {:?}", self.rank, pid, name);
            return Err(RemoteError::UnknownParticle(pid));
        };
        let Some(handler) = self.handlers.get(&pid).and_then(|h| h.get(name)).cloned() else {
            tracing::warn!("{}: {} has no handler {:?}", self.rank, pid, name);
            return Err(RemoteError::UnknownHandler {
                pid,
                name: name.to_string(),
            });
        };
        if let Err(err) = self.context_switch(pid, false) {
            let err = remote_error(pid, "context_switch", err);
            self.fail(Some(pid), err.clone());
            return Err(err);
        }
        let placement = Device::Accelerator(device);
        let args = args.iter().map(|arg| arg.to_device(placement)).collect();
        let result = handler(&mut Particle::new(self, pid, device), args);
        self.observe_unit_failure();
        if result.is_ok() && self.stopped {
            tracing::warn!("{}: {} returned after the loop stopped", self.rank, name);
            return Err(RemoteError::TornDown(self.rank));
        }
        result.map_err(|err| {
            let err = RemoteError::HandlerFailed {
                pid,
                name: name.to_string(),
                message: format!("{:#}", err),
            };
            self.fail(Some(pid), err.clone());
            err
        })
    }

    fn create_future(&mut self, owner: Pid, target: Pid) -> Fid {
        let fid = Fid(self.next_fid);
        self.next_fid += 1;
        self.particle_to_futures.entry(owner).or_default().insert(fid);
        self.future_to_particle.insert(fid, owner);
        tracing::trace!("{}: {} -> {} as {}", self.rank, owner, target, fid);
        fid
    }

    fn forget(&mut self, owner: Pid, fid: Fid) {
        self.future_to_particle.remove(&fid);
        if let Some(fids) = self.particle_to_futures.get_mut(&owner) {
            fids.remove(&fid);
        }
    }

    /// Futures `pid` has created and not yet waited on.
    pub fn pending_futures(&self, pid: Pid) -> Vec<Fid> {
        self.particle_to_futures
            .get(&pid)
            .map(|fids| fids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Block until `fid` resolves, servicing the inbox meanwhile. Requests
    /// that arrive during the wait are deferred and replayed in arrival
    /// order once the result is in.
    pub(crate) fn wait(&mut self, fid: Fid) -> anyhow::Result<Result<Outcome, RemoteError>> {
        let Some(&owner) = self.future_to_particle.get(&fid) else {
            bail!("{}: {} is not pending", self.rank, fid);
        };
        let mut deferred = Vec::new();
        let resolved = self.pump_until(fid, &mut deferred);
        self.forget(owner, fid);
        if resolved.is_err() || self.stopped {
            if !deferred.is_empty() {
                tracing::warn!("{}: dropping {} deferred messages", self.rank, deferred.len());
            }
            return resolved;
        }
        for message in deferred {
            self.handle(message)?;
            if self.stopped {
                break;
            }
        }
        resolved
    }

    fn pump_until(
        &mut self,
        fid: Fid,
        deferred: &mut Vec<NodeMessage>,
    ) -> anyhow::Result<Result<Outcome, RemoteError>> {
        loop {
            // A unit is retired even when its result is already in, so its
            // failure stops the loop before the waiter sees it.
            if let Some(device) = self.device_running(fid) {
                self.retire(device)?;
            }
            if let Some((_, result)) = self.results.remove(&fid) {
                return Ok(result);
            }
            self.observe_unit_failure();
            if self.stopped {
                return Ok(Err(RemoteError::TornDown(self.rank)));
            }
            let Some(message) = self.recv()? else {
                bail!("{}: inbox closed while waiting on {}", self.rank, fid);
            };
            match message {
                NodeMessage::Control(ControlMessage::Shutdown) => {
                    tracing::info!("{}: shutdown while waiting on {}", self.rank, fid);
                    self.stopped = true;
                }
                message if message.deferred_while_waiting_on(fid) => deferred.push(message),
                message => self.handle(message)?,
            }
        }
    }

    fn device_running(&self, fid: Fid) -> Option<DeviceIndex> {
        self.devices
            .iter()
            .find(|(_, slot)| slot.active.as_ref().is_some_and(|op| op.fid == fid))
            .map(|(device, _)| *device)
    }

    pub(crate) fn send(
        &mut self,
        from: Pid,
        to: Pid,
        name: &str,
        args: Vec<WireValue>,
    ) -> anyhow::Result<PFuture<WireValue>> {
        let fid = self.create_future(from, to);
        match self.particle_to_rank.get(&to).copied() {
            None => {
                self.results.insert(fid, Err(RemoteError::UnknownParticle(to)));
            }
            Some(rank) if rank == self.rank => {
                let result = self.invoke(to, name, args);
                self.results.insert(fid, result.map(Outcome::Value));
                self.ensure_running()?;
                self.context_switch(from, false)?;
            }
            Some(rank) => {
                let args = args.iter().map(WireValue::to_host).collect();
                self.post(
                    rank,
                    PeerMessage::Invoke {
                        sender: FutureKey::new(from, fid),
                        pid: to,
                        name: name.to_string(),
                        args,
                    },
                )?;
            }
        }
        Ok(PFuture::new(fid, from, to))
    }

    pub(crate) fn notify(
        &mut self,
        from: Pid,
        to: Pid,
        name: &str,
        args: Vec<WireValue>,
    ) -> anyhow::Result<()> {
        match self.particle_to_rank.get(&to).copied() {
            None => tracing::warn!("{}: notify from {} to unknown {}", self.rank, from, to),
            Some(rank) if rank == self.rank => {
                if let Err(err) = self.invoke(to, name, args) {
                    tracing::warn!("{}: notify from {} failed: {}", self.rank, from, err);
                }
                self.ensure_running()?;
                self.context_switch(from, false)?;
            }
            Some(rank) => {
                let args = args.iter().map(WireValue::to_host).collect();
                self.post(
                    rank,
                    PeerMessage::Notify {
                        sender: from,
                        pid: to,
                        name: name.to_string(),
                        args,
                    },
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn get(&mut self, from: Pid, to: Pid) -> anyhow::Result<PFuture<ParticleView>> {
        let fid = self.create_future(from, to);
        match self.particle_to_rank.get(&to).copied() {
            None => {
                self.results.insert(fid, Err(RemoteError::UnknownParticle(to)));
            }
            Some(rank) if rank == self.rank => {
                let view = match self.snapshot(to) {
                    Ok(snapshot) => self.materialize_view(from, to, &snapshot),
                    Err(err) => Err(err),
                };
                self.results.insert(
                    fid,
                    view.map(Outcome::View)
                        .map_err(|err| remote_error(to, "get", err)),
                );
                self.context_switch(from, false)?;
            }
            Some(rank) => {
                self.post(
                    rank,
                    PeerMessage::Get {
                        sender: FutureKey::new(from, fid),
                        pid: to,
                    },
                )?;
            }
        }
        Ok(PFuture::new(fid, from, to))
    }

    /// Queue `work` against `pid`'s pinned resource on its device's
    /// executor. The device's previous unit is retired first.
    fn submit<T>(
        &mut self,
        pid: Pid,
        op: &'static str,
        work: impl FnOnce(&mut Resource, Device) -> anyhow::Result<WireValue> + Send + 'static,
    ) -> anyhow::Result<PFuture<T>> {
        let device = self.local_device(pid)?;
        let fid = self.create_future(pid, pid);
        self.retire(device)?;
        let handle = self.context_switch(pid, true)?;
        let results = self.results.clone();
        let unit_failed = self.unit_failed.clone();
        let client = self.client.clone();
        let rank = self.rank;
        let job: Job = Box::new(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let mut resource = handle.lock().unwrap_or_else(PoisonError::into_inner);
                work(&mut resource, Device::Accelerator(device))
            }))
            .unwrap_or_else(|_| Err(anyhow!("{} panicked", op)));
            match outcome {
                Ok(value) => {
                    results.insert(fid, Ok(Outcome::Value(value)));
                    Ok(())
                }
                Err(err) => {
                    let err = RemoteError::OperationFailed {
                        pid,
                        op: op.to_string(),
                        message: format!("{:#}", err),
                    };
                    tracing::error!("{}: {}", rank, err);
                    results.insert(fid, Err(err.clone()));
                    unit_failed.store(true, Ordering::SeqCst);
                    let report = ClientMessage::Failure {
                        rank,
                        pid: Some(pid),
                        error: err.clone(),
                    };
                    if client.send(report).is_err() {
                        tracing::warn!("{}: coordinator hung up, failure of {} unreported", rank, op);
                    }
                    Err(err)
                }
            }
        });
        let slot = self.slot(device)?;
        let completion = slot.executor.submit(pid, op, job);
        slot.active = Some(ActiveOp {
            pid,
            fid,
            completion,
        });
        Ok(PFuture::new(fid, pid, pid))
    }

    pub(crate) fn forward(&mut self, pid: Pid, input: Tensor) -> anyhow::Result<PFuture<Tensor>> {
        self.submit(pid, "forward", move |resource, device| {
            let input = input.to(device);
            Ok(WireValue::Tensor(resource.module.forward(&input)?))
        })
    }

    pub(crate) fn step(
        &mut self,
        pid: Pid,
        loss_fn: LossFn,
        data: Tensor,
        label: Tensor,
    ) -> anyhow::Result<PFuture<f64>> {
        self.submit(pid, "step", move |resource, device| {
            let loss = resource.step(&loss_fn, &data.to(device), &label.to(device))?;
            Ok(WireValue::Double(loss))
        })
    }

    pub(crate) fn zero_grad(&mut self, pid: Pid) -> anyhow::Result<PFuture<()>> {
        self.submit(pid, "zero_grad", |resource, _| {
            resource.module.zero_grad();
            Ok(WireValue::None(()))
        })
    }

    pub(crate) fn scheduler_step(&mut self, pid: Pid) -> anyhow::Result<PFuture<()>> {
        self.submit(pid, "scheduler_step", |resource, _| {
            resource.scheduler_step()?;
            Ok(WireValue::None(()))
        })
    }

    /// High-water mark of units simultaneously in flight on `device`.
    pub fn max_in_flight(&self, device: DeviceIndex) -> Option<usize> {
        self.devices
            .get(&device)
            .map(|slot| slot.executor.max_in_flight())
    }

    /// Particles resident in `device`'s resource cache.
    pub fn resident(&self, device: DeviceIndex) -> Vec<Pid> {
        self.devices
            .get(&device)
            .map(|slot| slot.cache.resident())
            .unwrap_or_default()
    }
}
