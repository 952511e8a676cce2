/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-node half of the PusH particle runtime.
//!
//! A node event loop owns a set of devices and the particles assigned to
//! them. Particle resources live in a bounded per-device cache and are
//! swapped in by a context switch that guarantees at most one compute unit
//! per device; read-only mirrors of other particles live in a separate view
//! cache. Handlers run on the loop's dispatch thread and talk to other
//! particles through futures that resolve without deadlocking the loop.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod future;
pub mod node;
pub mod particle;
pub mod resource;
pub mod telemetry;
pub mod test_util;

#[cfg(test)]
mod node_tests;

pub use crate::config::Config;
pub use crate::future::FromOutcome;
pub use crate::future::Outcome;
pub use crate::future::PFuture;
pub use crate::node::ControlMessage;
pub use crate::node::Envelope;
pub use crate::node::NodeEventLoop;
pub use crate::node::NodeSender;
pub use crate::particle::Handler;
pub use crate::particle::Particle;
pub use crate::particle::ParticleState;
pub use crate::particle::ParticleView;
pub use crate::particle::handler;
pub use crate::resource::LossFn;
pub use crate::resource::Module;
pub use crate::resource::ModuleFactory;
pub use crate::resource::StepFactory;
