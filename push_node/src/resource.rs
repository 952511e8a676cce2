/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The resource a particle owns, and the boundary traits for the numeric
//! code that runs inside it. The runtime never looks inside a [`Module`]; it
//! only moves modules between devices, snapshots their parameters, and
//! schedules their forward/backward/update calls.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use anyhow::ensure;
use push_messages::Device;
use push_messages::DeviceIndex;
use push_messages::ParamSnapshot;
use push_messages::Tensor;

/// A trainable value and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self { value, grad: None }
    }
}

/// A device-resident computational object.
pub trait Module: Send + 'static {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Accumulate parameter gradients for the last `forward(input)` given
    /// the gradient of the loss with respect to its output.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.grad = None;
        }
    }

    /// Switch between training and evaluation behavior.
    fn train(&mut self, _mode: bool) {}

    fn to_device(&mut self, device: Device) {
        for param in self.parameters_mut() {
            param.value.set_device(device);
            if let Some(grad) = param.grad.as_mut() {
                grad.set_device(device);
            }
        }
    }
}

/// The update rule applied after each backward pass.
pub trait Optimizer: Send + 'static {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// A cursor over an optimizer's learning-rate schedule.
pub trait Scheduler: Send + 'static {
    fn step(&mut self, optimizer: &mut dyn Optimizer) -> Result<()>;
}

/// Computes `(loss, d loss / d output)`.
pub type LossFn = Arc<dyn Fn(&Tensor, &Tensor) -> Result<(f64, Tensor)> + Send + Sync>;

/// Builds a fresh module on a device. Used both for a particle's own
/// resource and for the placeholders backing views.
pub type ModuleFactory = Arc<dyn Fn(DeviceIndex) -> Result<Box<dyn Module>> + Send + Sync>;

type OptimizerFactory = Arc<dyn Fn() -> Result<Box<dyn Optimizer>> + Send + Sync>;
type SchedulerFactory = Arc<dyn Fn() -> Result<Box<dyn Scheduler>> + Send + Sync>;

/// Per-particle constructors for the stepping state that travels with a
/// module: the optimizer and its schedule.
#[derive(Clone, Default)]
pub struct StepFactory {
    optimizer: Option<OptimizerFactory>,
    scheduler: Option<SchedulerFactory>,
}

impl StepFactory {
    /// No optimizer: `step` computes gradients but leaves parameters alone.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_optimizer<O, F>(mut self, mk_optim: F) -> Self
    where
        O: Optimizer,
        F: Fn() -> Result<O> + Send + Sync + 'static,
    {
        self.optimizer = Some(Arc::new(move || {
            mk_optim().map(|o| Box::new(o) as Box<dyn Optimizer>)
        }));
        self
    }

    pub fn with_scheduler<S, F>(mut self, mk_scheduler: F) -> Self
    where
        S: Scheduler,
        F: Fn() -> Result<S> + Send + Sync + 'static,
    {
        self.scheduler = Some(Arc::new(move || {
            mk_scheduler().map(|s| Box::new(s) as Box<dyn Scheduler>)
        }));
        self
    }

    pub(crate) fn build(&self, module: Box<dyn Module>) -> Result<Resource> {
        Ok(Resource {
            module,
            optimizer: self.optimizer.as_ref().map(|f| f()).transpose()?,
            scheduler: self.scheduler.as_ref().map(|f| f()).transpose()?,
        })
    }
}

impl fmt::Debug for StepFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFactory")
            .field("optimizer", &self.optimizer.is_some())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

/// Everything a particle owns on its device.
pub struct Resource {
    pub module: Box<dyn Module>,
    pub optimizer: Option<Box<dyn Optimizer>>,
    pub scheduler: Option<Box<dyn Scheduler>>,
}

impl Resource {
    /// One training step: clear gradients, forward, loss, backward, update.
    pub fn step(&mut self, loss_fn: &LossFn, data: &Tensor, label: &Tensor) -> Result<f64> {
        self.module.zero_grad();
        let output = self.module.forward(data)?;
        let (loss, grad_output) = loss_fn(&output, label)?;
        self.module.backward(data, &grad_output)?;
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.step(self.module.parameters_mut())?;
        }
        Ok(loss)
    }

    /// Advance the learning-rate schedule. A resource without a scheduler
    /// or optimizer is left untouched.
    pub fn scheduler_step(&mut self) -> Result<()> {
        if let (Some(scheduler), Some(optimizer)) =
            (self.scheduler.as_mut(), self.optimizer.as_mut())
        {
            scheduler.step(&mut **optimizer)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        snapshot(self.module.as_ref())
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("params", &self.module.parameters().len())
            .field("optimizer", &self.optimizer.is_some())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

/// Host-resident copies of `module`'s parameters and gradients.
pub fn snapshot(module: &dyn Module) -> ParamSnapshot {
    let params = module.parameters();
    ParamSnapshot {
        params: params.iter().map(|p| p.value.to_host()).collect(),
        grads: params
            .iter()
            .map(|p| p.grad.as_ref().map(Tensor::to_host))
            .collect(),
    }
}

/// Overwrite `module`'s parameters (and gradients, where the snapshot has
/// them) with the snapshot's values, keeping them on `device`.
pub fn load_snapshot(module: &mut dyn Module, snapshot: &ParamSnapshot, device: Device) -> Result<()> {
    let params = module.parameters_mut();
    ensure!(
        params.len() == snapshot.params.len(),
        "snapshot has {} parameters, module has {}",
        snapshot.params.len(),
        params.len()
    );
    for (i, param) in params.iter_mut().enumerate() {
        param.value.copy_from(&snapshot.params[i])?;
        param.value.set_device(device);
        param.grad = snapshot
            .grads
            .get(i)
            .and_then(Option::as_ref)
            .map(|g| g.to(device));
    }
    Ok(())
}
