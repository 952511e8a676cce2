/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::FutureKey;
use crate::Pid;
use crate::Rank;
use crate::RemoteError;
use crate::Tensor;
use crate::WireValue;

/// Messages a node event loop sends back to the coordinator. Each request
/// the coordinator issues is answered by exactly one of these, except for
/// `Failure`, which may arrive at any time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum ClientMessage {
    /// A particle was installed on the node.
    ParticleInitAck {
        pid: Pid,
        result: Result<(), RemoteError>,
    },

    /// A handler was added to a particle's table.
    RegisterAck {
        pid: Pid,
        name: String,
        result: Result<(), RemoteError>,
    },

    /// The node adopted a new routing table.
    BroadcastAck { rank: Rank },

    /// Result of an invocation launched by the coordinator.
    FuncAck {
        key: FutureKey,
        result: Result<WireValue, RemoteError>,
    },

    /// Host-resident copies of a particle's parameters.
    ParametersAck {
        key: FutureKey,
        result: Result<Vec<Tensor>, RemoteError>,
    },

    /// Every local particle has been handed to the checkpointer. Carries the
    /// same key the request did.
    SaveAck {
        key: FutureKey,
        result: Result<(), RemoteError>,
    },

    /// A handler or compute unit failed. The node stops dispatching after
    /// sending this.
    Failure {
        rank: Rank,
        pid: Option<Pid>,
        error: RemoteError,
    },
}

impl ClientMessage {
    /// The future this message resolves, if any.
    pub fn key(&self) -> Option<FutureKey> {
        match self {
            ClientMessage::FuncAck { key, .. }
            | ClientMessage::ParametersAck { key, .. }
            | ClientMessage::SaveAck { key, .. } => Some(*key),
            _ => None,
        }
    }
}
