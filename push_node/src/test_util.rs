/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Small numeric collaborators for tests: a linear model, plain SGD, a
//! step-decay schedule, mean squared error, and an instrumented module that
//! records when and where it runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use anyhow::ensure;
use push_messages::Device;
use push_messages::DeviceIndex;
use push_messages::Tensor;

use crate::resource::LossFn;
use crate::resource::Module;
use crate::resource::ModuleFactory;
use crate::resource::Optimizer;
use crate::resource::Parameter;
use crate::resource::Scheduler;

/// `y = sum(w * x) + b`, with `w` of shape `[n]` and `b` of shape `[1]`.
#[derive(Debug, Clone)]
pub struct Linear {
    params: Vec<Parameter>,
    training: bool,
}

impl Linear {
    pub fn new(n: usize, device: Device) -> Self {
        Self {
            params: vec![
                Parameter::new(Tensor::zeros(vec![n], device)),
                Parameter::new(Tensor::zeros(vec![1], device)),
            ],
            training: true,
        }
    }

    pub fn factory(n: usize) -> ModuleFactory {
        Arc::new(move |device| Ok(Box::new(Linear::new(n, device.into())) as Box<dyn Module>))
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Module for Linear {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let w = self.params[0].value.data();
        ensure!(
            input.numel() == w.len(),
            "expected {} inputs, got {}",
            w.len(),
            input.numel()
        );
        let y: f32 = w.iter().zip(input.data()).map(|(w, x)| w * x).sum::<f32>()
            + self.params[1].value.data()[0];
        let mut output = Tensor::scalar(y);
        output.set_device(self.params[0].value.device());
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<()> {
        let g = grad_output.data()[0];
        for (i, param) in self.params.iter_mut().enumerate() {
            let grad = param
                .grad
                .get_or_insert_with(|| Tensor::zeros(param.value.shape().to_vec(), param.value.device()));
            if i == 0 {
                for (dw, x) in grad.data_mut().iter_mut().zip(input.data()) {
                    *dw += g * x;
                }
            } else {
                grad.data_mut()[0] += g;
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}

#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        for param in params {
            if let Some(grad) = param.grad.as_ref() {
                let grad = grad.data().to_vec();
                for (v, g) in param.value.data_mut().iter_mut().zip(grad) {
                    *v -= self.lr as f32 * g;
                }
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Multiplies the learning rate by `gamma` on every step.
#[derive(Debug, Clone)]
pub struct StepDecay {
    gamma: f64,
}

impl StepDecay {
    pub fn new(gamma: f64) -> Self {
        Self { gamma }
    }
}

impl Scheduler for StepDecay {
    fn step(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        optimizer.set_learning_rate(optimizer.learning_rate() * self.gamma);
        Ok(())
    }
}

pub fn mse_loss() -> LossFn {
    Arc::new(|output, label| {
        ensure!(
            output.numel() == label.numel(),
            "output has {} elements, label has {}",
            output.numel(),
            label.numel()
        );
        let n = output.numel().max(1) as f32;
        let diff: Vec<f32> = output
            .data()
            .iter()
            .zip(label.data())
            .map(|(o, l)| o - l)
            .collect();
        let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
        let grad = Tensor::from_vec(
            output.shape().to_vec(),
            diff.iter().map(|d| 2.0 * d / n).collect(),
        )?;
        Ok((loss as f64, grad.to(output.device())))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Start { device: DeviceIndex, instance: usize },
    End { device: DeviceIndex, instance: usize },
}

#[derive(Debug, Default)]
struct TraceState {
    events: Vec<TraceEvent>,
    active: HashMap<DeviceIndex, usize>,
    max_active: HashMap<DeviceIndex, usize>,
    instances: usize,
}

/// Shared log written by every [`Tracer`] built from the same factory.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    state: Arc<Mutex<TraceState>>,
}

impl TraceLog {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// The most units ever observed running at once on `device`.
    pub fn max_concurrency(&self, device: DeviceIndex) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_active
            .get(&device)
            .copied()
            .unwrap_or(0)
    }

    /// How many tracers have been constructed.
    pub fn instances(&self) -> usize {
        self.state.lock().unwrap().instances
    }

    fn start(&self, device: DeviceIndex, instance: usize) {
        let mut state = self.state.lock().unwrap();
        let active = state.active.entry(device).or_default();
        *active += 1;
        let now = *active;
        let max = state.max_active.entry(device).or_default();
        *max = (*max).max(now);
        state.events.push(TraceEvent::Start { device, instance });
    }

    fn end(&self, device: DeviceIndex, instance: usize) {
        let mut state = self.state.lock().unwrap();
        *state.active.entry(device).or_default() -= 1;
        state.events.push(TraceEvent::End { device, instance });
    }
}

/// A one-parameter module whose forward pass takes `delay` and logs its
/// start and end. Output is `x * w` elementwise.
#[derive(Debug)]
pub struct Tracer {
    device: DeviceIndex,
    instance: usize,
    delay: Duration,
    log: TraceLog,
    params: Vec<Parameter>,
}

impl Tracer {
    pub fn factory(log: TraceLog, delay: Duration) -> ModuleFactory {
        Arc::new(move |device| {
            let instance = {
                let mut state = log.state.lock().unwrap();
                state.instances += 1;
                state.instances
            };
            let mut weight = Tensor::zeros(vec![1], device.into());
            weight.data_mut()[0] = 1.0;
            Ok(Box::new(Tracer {
                device,
                instance,
                delay,
                log: log.clone(),
                params: vec![Parameter::new(weight)],
            }) as Box<dyn Module>)
        })
    }
}

impl Module for Tracer {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.log.start(self.device, self.instance);
        std::thread::sleep(self.delay);
        let w = self.params[0].value.data()[0];
        let mut output = input.to(Device::Accelerator(self.device));
        for x in output.data_mut() {
            *x *= w;
        }
        self.log.end(self.device, self.instance);
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<()> {
        let g: f32 = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(x, g)| x * g)
            .sum();
        let param = &mut self.params[0];
        let grad = param
            .grad
            .get_or_insert_with(|| Tensor::zeros(vec![1], param.value.device()));
        grad.data_mut()[0] += g;
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}
