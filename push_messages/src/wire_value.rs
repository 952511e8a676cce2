/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use anyhow::ensure;
use derive_more::From;
use derive_more::TryInto;
use serde::Deserialize;
use serde::Serialize;

use crate::DeviceIndex;

/// Where a tensor's storage lives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(DeviceIndex),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl From<DeviceIndex> for Device {
    fn from(index: DeviceIndex) -> Self {
        Device::Accelerator(index)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(index) => write!(f, "{}", index),
        }
    }
}

/// A dense f32 tensor. The storage is always addressable from the host; the
/// device tag records where the runtime considers it resident, and moving a
/// tensor between devices always produces an independent copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tensor {
    device: Device,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> anyhow::Result<Self> {
        let numel: usize = shape.iter().product();
        ensure!(
            numel == data.len(),
            "shape {:?} needs {} elements, got {}",
            shape,
            numel,
            data.len()
        );
        Ok(Self {
            device: Device::Cpu,
            shape,
            data,
        })
    }

    pub fn zeros(shape: Vec<usize>, device: Device) -> Self {
        let numel = shape.iter().product();
        Self {
            device,
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            device: Device::Cpu,
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// A detached copy of this tensor placed on `device`.
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            device,
            shape: self.shape.clone(),
            data: self.data.clone(),
        }
    }

    pub fn to_host(&self) -> Tensor {
        self.to(Device::Cpu)
    }

    /// Move this tensor in place, without copying the storage.
    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    /// Overwrite this tensor's values with `other`'s, keeping this tensor's
    /// placement.
    pub fn copy_from(&mut self, other: &Tensor) -> anyhow::Result<()> {
        ensure!(
            self.shape == other.shape,
            "cannot copy tensor of shape {:?} into shape {:?}",
            other.shape,
            self.shape
        );
        self.data.copy_from_slice(&other.data);
        Ok(())
    }
}

/// A value passed to, or returned from, a particle operation.
// Bool goes before Int so that untagged formats keep booleans as booleans.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, From, TryInto)]
pub enum WireValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Tensor(Tensor),
    List(Vec<WireValue>),
    // Wraps unit rather than being a bare variant so `From<()>` works.
    None(()),
}

impl Default for WireValue {
    fn default() -> Self {
        WireValue::None(())
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::String(value.to_string())
    }
}

impl WireValue {
    /// Copy every tensor reachable from this value onto the host. This is
    /// the form values must take before crossing a node boundary.
    pub fn to_host(&self) -> WireValue {
        self.map_tensors(&|t| t.to_host())
    }

    /// Copy every tensor reachable from this value onto `device`.
    pub fn to_device(&self, device: Device) -> WireValue {
        self.map_tensors(&|t| t.to(device))
    }

    pub fn is_host_resident(&self) -> bool {
        match self {
            WireValue::Tensor(t) => t.device().is_host(),
            WireValue::List(items) => items.iter().all(WireValue::is_host_resident),
            _ => true,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, WireValue::None(()))
    }

    fn map_tensors(&self, f: &dyn Fn(&Tensor) -> Tensor) -> WireValue {
        match self {
            WireValue::Tensor(t) => WireValue::Tensor(f(t)),
            WireValue::List(items) => {
                WireValue::List(items.iter().map(|item| item.map_tensors(f)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Host-resident copies of a resource's parameters and their gradient
/// buffers, index-aligned.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ParamSnapshot {
    pub params: Vec<Tensor>,
    pub grads: Vec<Option<Tensor>>,
}

impl ParamSnapshot {
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn is_host_resident(&self) -> bool {
        self.params.iter().all(|p| p.device().is_host())
            && self.grads.iter().flatten().all(|g| g.device().is_host())
    }
}
