/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The actor surface handed to user handlers.
//!
//! A [`Particle`] exists only for the duration of one handler invocation.
//! It borrows the node event loop, so everything a handler does (sending,
//! waiting, computing) is mediated by the node and its context switch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::PoisonError;

use push_messages::Device;
use push_messages::DeviceIndex;
use push_messages::Pid;
use push_messages::Tensor;
use push_messages::WireValue;

use crate::cache::Handle;
use crate::future::FromOutcome;
use crate::future::PFuture;
use crate::node::NodeEventLoop;
use crate::resource::LossFn;
use crate::resource::Module;

/// Per-particle user state.
pub type ParticleState = HashMap<String, WireValue>;

static EMPTY_STATE: LazyLock<ParticleState> = LazyLock::new(ParticleState::new);

/// A message handler registered on a particle.
pub type Handler =
    Arc<dyn Fn(&mut Particle<'_>, Vec<WireValue>) -> anyhow::Result<WireValue> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Particle<'_>, Vec<WireValue>) -> anyhow::Result<WireValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub struct Particle<'a> {
    node: &'a mut NodeEventLoop,
    pid: Pid,
    device: DeviceIndex,
}

impl<'a> Particle<'a> {
    pub(crate) fn new(node: &'a mut NodeEventLoop, pid: Pid, device: DeviceIndex) -> Self {
        Self { node, pid, device }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn state(&self) -> &ParticleState {
        self.node.state(self.pid).unwrap_or(&*EMPTY_STATE)
    }

    pub fn state_mut(&mut self) -> &mut ParticleState {
        self.node.state_mut(self.pid)
    }

    /// Run `f` against this particle's module once any unit in flight on
    /// its device has finished.
    pub fn with_module<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Module) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let handle = self.node.activate(self.pid)?;
        let mut resource = handle.lock().unwrap_or_else(PoisonError::into_inner);
        f(resource.module.as_mut())
    }

    /// Invoke handler `name` on `to`. Local targets run before this returns;
    /// remote targets resolve through the wait protocol.
    pub fn send(
        &mut self,
        to: Pid,
        name: &str,
        args: Vec<WireValue>,
    ) -> anyhow::Result<PFuture<WireValue>> {
        self.node.send(self.pid, to, name, args)
    }

    /// Like `send`, without a result.
    pub fn notify(&mut self, to: Pid, name: &str, args: Vec<WireValue>) -> anyhow::Result<()> {
        self.node.notify(self.pid, to, name, args)
    }

    /// A read-only copy of `to`'s parameters and gradients, placed on this
    /// particle's device.
    pub fn get(&mut self, to: Pid) -> anyhow::Result<PFuture<ParticleView>> {
        self.node.get(self.pid, to)
    }

    pub fn forward(&mut self, input: Tensor) -> anyhow::Result<PFuture<Tensor>> {
        self.node.forward(self.pid, input)
    }

    /// One optimizer step on `(data, label)`; resolves to the loss.
    pub fn step(
        &mut self,
        loss_fn: LossFn,
        data: Tensor,
        label: Tensor,
    ) -> anyhow::Result<PFuture<f64>> {
        self.node.step(self.pid, loss_fn, data, label)
    }

    pub fn zero_grad(&mut self) -> anyhow::Result<PFuture<()>> {
        self.node.zero_grad(self.pid)
    }

    pub fn scheduler_step(&mut self) -> anyhow::Result<PFuture<()>> {
        self.node.scheduler_step(self.pid)
    }

    pub fn wait<T: FromOutcome>(&mut self, future: PFuture<T>) -> anyhow::Result<T> {
        let outcome = self.node.wait(future.fid())??;
        T::from_outcome(outcome)
    }

    /// Wait on each future in order.
    pub fn wait_all<T: FromOutcome>(
        &mut self,
        futures: impl IntoIterator<Item = PFuture<T>>,
    ) -> anyhow::Result<Vec<T>> {
        futures.into_iter().map(|f| self.wait(f)).collect()
    }

    /// Every known particle except this one, in pid order.
    pub fn other_particles(&self) -> Vec<Pid> {
        self.node
            .particles()
            .into_iter()
            .filter(|pid| *pid != self.pid)
            .collect()
    }

    pub fn particles(&self) -> Vec<Pid> {
        self.node.particles()
    }
}

impl fmt::Debug for Particle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("pid", &self.pid)
            .field("device", &self.device)
            .finish()
    }
}

/// A frozen mirror of another particle's module. Reading a view never
/// touches the source particle, and the source's later updates are not
/// reflected.
#[derive(Clone)]
pub struct ParticleView {
    pid: Pid,
    device: DeviceIndex,
    module: Handle<Box<dyn Module>>,
}

impl ParticleView {
    pub(crate) fn new(pid: Pid, device: DeviceIndex, module: Handle<Box<dyn Module>>) -> Self {
        Self {
            pid,
            device,
            module,
        }
    }

    /// The particle this view mirrors.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        module.parameters().iter().map(|p| p.value.clone()).collect()
    }

    pub fn grads(&self) -> Vec<Option<Tensor>> {
        let module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        module.parameters().iter().map(|p| p.grad.clone()).collect()
    }

    pub fn forward(&self, input: &Tensor) -> anyhow::Result<Tensor> {
        let input = input.to(Device::Accelerator(self.device));
        let mut module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        module.forward(&input)
    }
}

impl fmt::Debug for ParticleView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleView")
            .field("pid", &self.pid)
            .field("device", &self.device)
            .finish()
    }
}
