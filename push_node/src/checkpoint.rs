/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Persisting particle parameters. Nodes only ever hand a checkpointer
//! host-resident snapshots; the on-disk layout is not a compatibility
//! promise.

use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use push_messages::ParamSnapshot;
use push_messages::Pid;

/// Errors that occur during checkpoint operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CheckpointError {
    #[error("save {0}")]
    Save(Pid, #[source] anyhow::Error),

    #[error("load {0}")]
    Load(Pid, #[source] anyhow::Error),
}

/// Receives a particle's parameters when the coordinator asks a node to save.
pub trait Checkpointer: Send + Sync + Debug {
    fn save(&self, pid: Pid, snapshot: &ParamSnapshot) -> Result<(), CheckpointError>;
}

/// Writes one bincode file per particle into a directory.
#[derive(Debug, Clone)]
pub struct DirCheckpointer {
    dir: PathBuf,
}

impl DirCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, pid: Pid) -> PathBuf {
        self.dir.join(format!("particle_{}.bin", pid.0))
    }

    pub fn load(&self, pid: Pid) -> Result<ParamSnapshot, CheckpointError> {
        let path = self.path(pid);
        let bytes = fs::read(&path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(|err| CheckpointError::Load(pid, err))?;
        bincode::deserialize(&bytes)
            .context("decoding snapshot")
            .map_err(|err| CheckpointError::Load(pid, err))
    }
}

impl Checkpointer for DirCheckpointer {
    fn save(&self, pid: Pid, snapshot: &ParamSnapshot) -> Result<(), CheckpointError> {
        let path = self.path(pid);
        let write = || -> anyhow::Result<()> {
            let bytes = bincode::serialize(snapshot).context("encoding snapshot")?;
            fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
            Ok(())
        };
        write().map_err(|err| CheckpointError::Save(pid, err))
    }
}

#[cfg(test)]
mod tests {
    use push_messages::Tensor;

    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = DirCheckpointer::new(dir.path().join("ckpt")).unwrap();
        let snapshot = ParamSnapshot {
            params: vec![Tensor::from_vec(vec![2], vec![1.0, -1.0]).unwrap()],
            grads: vec![None],
        };
        checkpointer.save(Pid(5), &snapshot).unwrap();
        assert!(checkpointer.dir().join("particle_5.bin").exists());
        assert_eq!(checkpointer.load(Pid(5)).unwrap(), snapshot);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = DirCheckpointer::new(dir.path()).unwrap();
        assert!(matches!(
            checkpointer.load(Pid(1)),
            Err(CheckpointError::Load(Pid(1), _))
        ));
    }
}
