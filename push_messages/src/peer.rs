/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Node-to-node messages. These always travel encoded, so a peer never
//! observes memory owned by the sending node.

use anyhow::Context;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::Data;
use crate::Fid;
use crate::FutureKey;
use crate::ParamSnapshot;
use crate::Pid;
use crate::RemoteError;
use crate::WireValue;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum PeerMessage {
    /// Run handler `name` of particle `pid` and answer `sender` with an
    /// [`PeerMessage::InvokeAck`].
    Invoke {
        sender: FutureKey,
        pid: Pid,
        name: String,
        args: Vec<WireValue>,
    },

    /// Fire-and-forget variant of `Invoke`: no acknowledgment is sent.
    Notify {
        sender: Pid,
        pid: Pid,
        name: String,
        args: Vec<WireValue>,
    },

    /// Result of an `Invoke`, addressed to the future `fid` on the sender's
    /// node.
    InvokeAck {
        fid: Fid,
        pid: Pid,
        result: Result<WireValue, RemoteError>,
    },

    /// Request a snapshot of particle `pid`'s parameters and gradients.
    Get { sender: FutureKey, pid: Pid },

    /// Snapshot answering a `Get`. `caller` is the particle that asked; its
    /// device determines where the view is materialized.
    GetAck {
        fid: Fid,
        caller: Pid,
        pid: Pid,
        result: Result<ParamSnapshot, RemoteError>,
    },
}

impl PeerMessage {
    pub fn encode(&self) -> anyhow::Result<Data> {
        bincode::serialize(self).context("encoding peer message")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(data).context("decoding peer message")
    }

    /// Whether this message asks the receiving node to run a handler.
    pub fn is_request(&self) -> bool {
        matches!(self, PeerMessage::Invoke { .. } | PeerMessage::Notify { .. })
    }
}
