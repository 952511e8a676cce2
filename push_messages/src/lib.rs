/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Message protocol shared by the coordinator and the node event loops.
//!
//! Everything in this crate is plain data: identifiers, the value type that
//! crosses node boundaries ([`WireValue`]), host-resident tensors, and the
//! two message families exchanged at runtime:
//! - [`peer::PeerMessage`]: node-to-node requests and acknowledgments;
//! - [`client::ClientMessage`]: acknowledgments and failures reported back
//!   to the coordinator.

pub mod client;
pub mod peer;
pub mod wire_value;

use std::fmt;

use derive_more::From;
use serde::Deserialize;
use serde::Serialize;

pub use crate::wire_value::Device;
pub use crate::wire_value::ParamSnapshot;
pub use crate::wire_value::Tensor;
pub use crate::wire_value::WireValue;

/// Raw bytes of an encoded message.
pub type Data = Vec<u8>;

/// Identity of a particle. Assigned once by the coordinator and never reused.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    From
)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identity of a future, unique within the event loop that issued it.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    From
)]
pub struct Fid(pub u64);

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// The node event loop (one per process) that a particle lives on.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    From
)]
pub struct Rank(pub usize);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

/// A resource slot, typically an accelerator. Indices are global across
/// nodes; each node owns a disjoint set of them.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    From
)]
pub struct DeviceIndex(pub u16);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Routes a result back to a pending future: the particle that owns the
/// future, and the future's id on that particle's node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FutureKey {
    pub pid: Pid,
    pub fid: Fid,
}

impl FutureKey {
    pub fn new(pid: Pid, fid: Fid) -> Self {
        Self { pid, fid }
    }
}

impl fmt::Display for FutureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.fid)
    }
}

/// Structured error payload. Every acknowledgment that can fail carries one
/// of these instead of a success value.
#[derive(
    Debug,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    thiserror::Error
)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("unknown particle {0}")]
    UnknownParticle(Pid),

    #[error("particle {pid} has no handler for {name:?}")]
    UnknownHandler { pid: Pid, name: String },

    #[error("handler {name:?} on particle {pid} failed: {message}")]
    HandlerFailed {
        pid: Pid,
        name: String,
        message: String,
    },

    #[error("{op} on particle {pid} failed: {message}")]
    OperationFailed {
        pid: Pid,
        op: String,
        message: String,
    },

    #[error("codec: {0}")]
    Codec(String),

    #[error("node event loop on {0} was torn down")]
    TornDown(Rank),

    #[error("node event loop on {rank} failed: {message}")]
    NodeFailed { rank: Rank, message: String },
}

impl RemoteError {
    /// Whether receiving this error means the remote loop has stopped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RemoteError::UnknownHandler { .. } | RemoteError::UnknownParticle(_)
        )
    }
}
