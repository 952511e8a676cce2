/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The coordinator side of the PusH particle runtime.
//!
//! [`PushDist`] spawns one node event loop per rank, assigns particles to
//! devices, and drives them with launched handler invocations whose results
//! come back as [`ClientMessage`] acknowledgments.

use std::collections::HashMap;
use std::thread::JoinHandle;

use push_messages::DeviceIndex;
use push_messages::Fid;
use push_messages::FutureKey;
use push_messages::Pid;
use push_messages::Rank;
use push_messages::RemoteError;
use push_messages::Tensor;
use push_messages::WireValue;
use push_messages::client::ClientMessage;
use push_node::Config;
use push_node::ControlMessage;
use push_node::Envelope;
use push_node::Handler;
use push_node::ModuleFactory;
use push_node::NodeEventLoop;
use push_node::NodeSender;
use push_node::ParticleState;
use push_node::StepFactory;
use thiserror::Error;
use tokio::sync::mpsc;

/// Owner of futures the coordinator issues on no particle's behalf.
const COORDINATOR: Pid = Pid(u64::MAX);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DistError {
    #[error("setting up nodes: {0:#}")]
    Setup(#[source] anyhow::Error),

    #[error("{0} is not owned by any node")]
    UnknownDevice(DeviceIndex),

    #[error("unknown particle {0}")]
    UnknownParticle(Pid),

    #[error("{rank} failed: {error}")]
    NodeFailure {
        rank: Rank,
        pid: Option<Pid>,
        error: RemoteError,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("every node hung up")]
    Disconnected,

    #[error("{rank} exited with error: {source:#}")]
    Exited {
        rank: Rank,
        #[source]
        source: anyhow::Error,
    },
}

/// A handler invocation launched by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushFuture {
    key: FutureKey,
}

impl PushFuture {
    pub fn key(&self) -> FutureKey {
        self.key
    }

    /// The particle running the handler.
    pub fn pid(&self) -> Pid {
        self.key.pid
    }
}

#[derive(Debug)]
struct Node {
    sender: NodeSender,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

#[derive(Debug)]
pub struct PushDist {
    config: Config,
    nodes: Vec<Node>,
    client: mpsc::UnboundedReceiver<ClientMessage>,
    particle_to_rank: HashMap<Pid, Rank>,
    particle_to_device: HashMap<Pid, DeviceIndex>,
    next_pid: u64,
    next_fid: u64,
    /// Keyed acknowledgments that arrived while waiting on something else.
    stashed: HashMap<FutureKey, ClientMessage>,
}

impl PushDist {
    /// Spawn `config.num_nodes` node event loops and hand every node the
    /// routing table.
    pub async fn new(config: Config, mk_module: ModuleFactory) -> Result<Self, DistError> {
        config.validate().map_err(DistError::Setup)?;
        let (client_tx, client) = mpsc::unbounded_channel();
        let mut nodes = Vec::with_capacity(config.num_nodes);
        for rank in 0..config.num_nodes {
            let (sender, inbox) = mpsc::unbounded_channel();
            let first = rank * config.devices_per_node as usize;
            let devices = (first..first + config.devices_per_node as usize)
                .map(|index| DeviceIndex(index as u16));
            let thread = NodeEventLoop::new(
                Rank(rank),
                devices,
                inbox,
                client_tx.clone(),
                &config,
                mk_module.clone(),
            )
            .and_then(NodeEventLoop::spawn)
            .map_err(DistError::Setup)?;
            nodes.push(Node {
                sender,
                thread: Some(thread),
            });
        }
        tracing::info!("spawned {} nodes", nodes.len());

        let mut dist = Self {
            config,
            nodes,
            client,
            particle_to_rank: HashMap::new(),
            particle_to_device: HashMap::new(),
            next_pid: 0,
            next_fid: 0,
            stashed: HashMap::new(),
        };
        dist.broadcast().await?;
        Ok(dist)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every particle created so far, in pid order.
    pub fn particles(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.particle_to_rank.keys().copied().collect();
        pids.sort();
        pids
    }

    /// Install a particle on `device` and tell every node where it lives.
    pub async fn create_particle(
        &mut self,
        device: DeviceIndex,
        steps: StepFactory,
        state: ParticleState,
        handlers: HashMap<String, Handler>,
    ) -> Result<Pid, DistError> {
        let rank = Rank(device.0 as usize / self.config.devices_per_node as usize);
        if rank.0 >= self.nodes.len() {
            return Err(DistError::UnknownDevice(device));
        }
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.send(
            rank,
            ControlMessage::InitParticle {
                pid,
                device,
                state,
                handlers,
                steps,
            },
        )?;
        self.await_ack(|message| match message {
            ClientMessage::ParticleInitAck { pid: acked, result } if acked == pid => Ok(result),
            other => Err(other),
        })
        .await??;
        self.particle_to_rank.insert(pid, rank);
        self.particle_to_device.insert(pid, device);
        tracing::debug!("created {} on {} ({})", pid, device, rank);
        self.broadcast().await?;
        Ok(pid)
    }

    /// Add or replace handler `name` on `pid`.
    pub async fn register(
        &mut self,
        pid: Pid,
        name: &str,
        handler: Handler,
    ) -> Result<(), DistError> {
        let rank = self.rank_of(pid)?;
        self.send(
            rank,
            ControlMessage::RegisterHandler {
                pid,
                name: name.to_string(),
                handler,
            },
        )?;
        self.await_ack(|message| match message {
            ClientMessage::RegisterAck {
                pid: acked,
                name: registered,
                result,
            } if acked == pid && registered == name => Ok(result),
            other => Err(other),
        })
        .await??;
        Ok(())
    }

    /// Run handler `name` on `pid`. The result is collected by [`PushDist::wait`].
    pub fn launch(
        &mut self,
        pid: Pid,
        name: &str,
        args: Vec<WireValue>,
    ) -> Result<PushFuture, DistError> {
        let rank = self.rank_of(pid)?;
        let key = FutureKey::new(pid, self.fid());
        self.send(
            rank,
            ControlMessage::Launch {
                key,
                name: name.to_string(),
                args,
            },
        )?;
        Ok(PushFuture { key })
    }

    /// Collect the results of `futures` in order. The first error ends the
    /// wait; a node failure observed meanwhile fails it too.
    pub async fn wait(
        &mut self,
        futures: impl IntoIterator<Item = PushFuture>,
    ) -> Result<Vec<WireValue>, DistError> {
        let mut values = Vec::new();
        for future in futures {
            let message = self.keyed(future.key).await?;
            match message {
                ClientMessage::FuncAck { result, .. } => values.push(result?),
                other => tracing::warn!("ignoring {:?} for {:?}", other, future),
            }
        }
        Ok(values)
    }

    /// Host copies of `pid`'s parameters.
    pub async fn fetch_parameters(&mut self, pid: Pid) -> Result<Vec<Tensor>, DistError> {
        let rank = self.rank_of(pid)?;
        let key = FutureKey::new(pid, self.fid());
        self.send(rank, ControlMessage::FetchParameters { key })?;
        match self.keyed(key).await? {
            ClientMessage::ParametersAck { result, .. } => Ok(result?),
            other => Err(DistError::Setup(anyhow::anyhow!(
                "expected parameters, got {:?}",
                other
            ))),
        }
    }

    /// Ask every node to checkpoint its particles and wait for all of them.
    pub async fn save(&mut self) -> Result<(), DistError> {
        let key = FutureKey::new(COORDINATOR, self.fid());
        for rank in 0..self.nodes.len() {
            self.send(Rank(rank), ControlMessage::Save { key })?;
        }
        let mut first_error = None;
        for _ in 0..self.nodes.len() {
            let result = self
                .await_ack(|message| match message {
                    ClientMessage::SaveAck { key: acked, result } if acked == key => Ok(result),
                    other => Err(other),
                })
                .await?;
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Stop every node and wait for their threads to exit.
    pub async fn shutdown(mut self) -> Result<(), DistError> {
        for node in &self.nodes {
            let _ = node.sender.send(Envelope::Control(ControlMessage::Shutdown));
        }
        let mut first_error = None;
        for (rank, node) in self.nodes.iter_mut().enumerate() {
            let Some(thread) = node.thread.take() else {
                continue;
            };
            let exit = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|err| anyhow::anyhow!(err))
                .and_then(|joined| {
                    joined.unwrap_or_else(|_| Err(anyhow::anyhow!("node thread panicked")))
                });
            if let Err(source) = exit {
                tracing::error!("{}: {:#}", Rank(rank), source);
                first_error.get_or_insert(DistError::Exited {
                    rank: Rank(rank),
                    source,
                });
            }
        }
        tracing::info!("shut down {} nodes", self.nodes.len());
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fid(&mut self) -> Fid {
        let fid = Fid(self.next_fid);
        self.next_fid += 1;
        fid
    }

    fn rank_of(&self, pid: Pid) -> Result<Rank, DistError> {
        self.particle_to_rank
            .get(&pid)
            .copied()
            .ok_or(DistError::UnknownParticle(pid))
    }

    fn send(&self, rank: Rank, message: ControlMessage) -> Result<(), DistError> {
        self.nodes[rank.0]
            .sender
            .send(Envelope::Control(message))
            .map_err(|_| DistError::NodeFailure {
                rank,
                pid: None,
                error: RemoteError::TornDown(rank),
            })
    }

    async fn broadcast(&mut self) -> Result<(), DistError> {
        let peers: HashMap<_, _> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(rank, node)| (Rank(rank), node.sender.clone()))
            .collect();
        for rank in 0..self.nodes.len() {
            self.send(
                Rank(rank),
                ControlMessage::Broadcast {
                    peers: peers.clone(),
                    particle_to_rank: self.particle_to_rank.clone(),
                    particle_to_device: self.particle_to_device.clone(),
                },
            )?;
        }
        for _ in 0..self.nodes.len() {
            self.await_ack(|message| match message {
                ClientMessage::BroadcastAck { rank } => Ok(rank),
                other => Err(other),
            })
            .await?;
        }
        Ok(())
    }

    /// The acknowledgment carrying `key`, stashed or yet to arrive.
    async fn keyed(&mut self, key: FutureKey) -> Result<ClientMessage, DistError> {
        if let Some(message) = self.stashed.remove(&key) {
            return Ok(message);
        }
        self.await_ack(|message| match message.key() {
            Some(acked) if acked == key => Ok(message),
            _ => Err(message),
        })
        .await
    }

    /// Receive until `select` accepts a message. Keyed messages it rejects
    /// are stashed for later; a failure report ends the wait.
    async fn await_ack<T>(
        &mut self,
        mut select: impl FnMut(ClientMessage) -> Result<T, ClientMessage>,
    ) -> Result<T, DistError> {
        loop {
            let message = self.client.recv().await.ok_or(DistError::Disconnected)?;
            if let ClientMessage::Failure { rank, pid, error } = message {
                tracing::error!("{} reported failure: {}", rank, error);
                return Err(DistError::NodeFailure { rank, pid, error });
            }
            match select(message) {
                Ok(selected) => return Ok(selected),
                Err(other) => match other.key() {
                    Some(key) => {
                        self.stashed.insert(key, other);
                    }
                    None => tracing::warn!("dropping unexpected {:?}", other),
                },
            }
        }
    }
}

impl Drop for PushDist {
    fn drop(&mut self) {
        // Threads still attached were never shut down.
        for node in &self.nodes {
            if node.thread.is_some() {
                let _ = node.sender.send(Envelope::Control(ControlMessage::Shutdown));
            }
        }
    }
}
