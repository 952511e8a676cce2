/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Typed handles on results that resolve through the node's wait protocol.

use std::fmt;
use std::marker::PhantomData;

use anyhow::bail;
use push_messages::Fid;
use push_messages::FutureKey;
use push_messages::Pid;
use push_messages::Tensor;
use push_messages::WireValue;

use crate::particle::ParticleView;

/// What a future resolves to before it is given its static type.
#[derive(Debug, Clone)]
pub enum Outcome {
    Value(WireValue),
    View(ParticleView),
}

/// Conversion from a resolved [`Outcome`] into a future's result type.
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self>;
}

impl FromOutcome for Outcome {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        Ok(outcome)
    }
}

impl FromOutcome for WireValue {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::View(view) => bail!("expected a value, got a view of {}", view.pid()),
        }
    }
}

impl FromOutcome for Tensor {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        match WireValue::from_outcome(outcome)? {
            WireValue::Tensor(tensor) => Ok(tensor),
            other => bail!("expected a tensor, got {:?}", other),
        }
    }
}

impl FromOutcome for f64 {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        match WireValue::from_outcome(outcome)? {
            WireValue::Double(value) => Ok(value),
            other => bail!("expected a double, got {:?}", other),
        }
    }
}

impl FromOutcome for () {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        WireValue::from_outcome(outcome).map(|_| ())
    }
}

impl FromOutcome for ParticleView {
    fn from_outcome(outcome: Outcome) -> anyhow::Result<Self> {
        match outcome {
            Outcome::View(view) => Ok(view),
            Outcome::Value(value) => bail!("expected a view, got {:?}", value),
        }
    }
}

/// A pending result of type `T`, owned by particle `owner` and produced by
/// particle `target`. Only the owner's node can wait on it.
pub struct PFuture<T> {
    fid: Fid,
    owner: Pid,
    target: Pid,
    _result: PhantomData<fn() -> T>,
}

impl<T> PFuture<T> {
    pub(crate) fn new(fid: Fid, owner: Pid, target: Pid) -> Self {
        Self {
            fid,
            owner,
            target,
            _result: PhantomData,
        }
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn target(&self) -> Pid {
        self.target
    }

    pub fn key(&self) -> FutureKey {
        FutureKey::new(self.owner, self.fid)
    }

    /// Forget the result type, e.g. to wait on futures of mixed types.
    pub fn erase(self) -> PFuture<Outcome> {
        PFuture::new(self.fid, self.owner, self.target)
    }
}

impl<T> Clone for PFuture<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PFuture<T> {}

impl<T> PartialEq for PFuture<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fid == other.fid && self.owner == other.owner
    }
}

impl<T> fmt::Debug for PFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PFuture")
            .field("fid", &self.fid)
            .field("owner", &self.owner)
            .field("target", &self.target)
            .finish()
    }
}
