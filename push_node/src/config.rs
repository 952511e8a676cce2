/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration.
//!
//! A [`Config`] starts from defaults, can be loaded from or saved to YAML,
//! and can be overridden from `PUSH_*` environment variables. Values that
//! fail to parse are logged and ignored.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::ensure;
use serde::Deserialize;
use serde::Serialize;

pub const NUM_NODES_ENV: &str = "PUSH_NUM_NODES";
pub const DEVICES_PER_NODE_ENV: &str = "PUSH_DEVICES_PER_NODE";
pub const CACHE_SIZE_ENV: &str = "PUSH_CACHE_SIZE";
pub const VIEW_SIZE_ENV: &str = "PUSH_VIEW_SIZE";
pub const EVICTION_ENV: &str = "PUSH_EVICTION";
pub const CHECKPOINT_DIR_ENV: &str = "PUSH_CHECKPOINT_DIR";

/// What happens to a particle's resource when it is evicted from its
/// device.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Park the resource on the host and restore it on the next load.
    #[default]
    Offload,
    /// Drop the resource; the next load builds a fresh one.
    Discard,
}

impl FromStr for EvictionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offload" => Ok(EvictionPolicy::Offload),
            "discard" => Ok(EvictionPolicy::Discard),
            other => anyhow::bail!("unknown eviction policy {:?}", other),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Node event loops to spawn.
    pub num_nodes: usize,
    /// Devices owned by each node.
    pub devices_per_node: u16,
    /// Resident particle resources per device.
    pub cache_size: usize,
    /// Resident views per device.
    pub view_size: usize,
    pub eviction: EvictionPolicy,
    /// Where `save` writes parameters. Saving without one is an error.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            devices_per_node: 1,
            cache_size: 4,
            view_size: 4,
            eviction: EvictionPolicy::Offload,
            checkpoint_dir: None,
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Override fields from `lookup`, which maps variable names to values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
        where
            T::Err: std::fmt::Display,
        {
            let val = lookup(key)?;
            match val.parse::<T>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::error!(
                        "failed to override config from value \"{}\" in ${}: {}",
                        val,
                        key,
                        e
                    );
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, NUM_NODES_ENV) {
            self.num_nodes = v;
        }
        if let Some(v) = parsed(&lookup, DEVICES_PER_NODE_ENV) {
            self.devices_per_node = v;
        }
        if let Some(v) = parsed(&lookup, CACHE_SIZE_ENV) {
            self.cache_size = v;
        }
        if let Some(v) = parsed(&lookup, VIEW_SIZE_ENV) {
            self.view_size = v;
        }
        if let Some(v) = parsed(&lookup, EVICTION_ENV) {
            self.eviction = v;
        }
        if let Some(dir) = lookup(CHECKPOINT_DIR_ENV) {
            self.checkpoint_dir = Some(dir.into());
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.num_nodes > 0, "num_nodes must be at least 1");
        ensure!(self.devices_per_node > 0, "devices_per_node must be at least 1");
        ensure!(self.cache_size > 0, "cache_size must be at least 1");
        ensure!(self.view_size > 0, "view_size must be at least 1");
        ensure!(
            self.total_devices() <= u16::MAX as usize,
            "{} nodes with {} devices each exceeds the device index space",
            self.num_nodes,
            self.devices_per_node
        );
        Ok(())
    }

    pub fn total_devices(&self) -> usize {
        self.num_nodes * self.devices_per_node as usize
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.num_nodes, 1);
        assert_eq!(config.devices_per_node, 1);
        assert_eq!(config.cache_size, 4);
        assert_eq!(config.view_size, 4);
        assert_eq!(config.eviction, EvictionPolicy::Offload);
        assert_eq!(config.checkpoint_dir, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            (NUM_NODES_ENV, "3"),
            (CACHE_SIZE_ENV, "not-a-number"),
            (VIEW_SIZE_ENV, "2"),
            (EVICTION_ENV, "Discard"),
            (CHECKPOINT_DIR_ENV, "/tmp/push"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.num_nodes, 3);
        assert_eq!(config.cache_size, 4);
        assert_eq!(config.view_size, 2);
        assert_eq!(config.eviction, EvictionPolicy::Discard);
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/tmp/push")));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = Config {
            cache_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            view_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_device_indices() {
        let config = Config {
            num_nodes: 2,
            devices_per_node: 32768,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            num_nodes: 1,
            devices_per_node: u16::MAX,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push.yaml");
        let config = Config {
            num_nodes: 2,
            eviction: EvictionPolicy::Discard,
            ..Default::default()
        };
        config.to_yaml(&path).unwrap();
        assert_eq!(Config::from_yaml(&path).unwrap(), config);

        std::fs::write(&path, "cache_size: 1\n").unwrap();
        let partial = Config::from_yaml(&path).unwrap();
        assert_eq!(partial.cache_size, 1);
        assert_eq!(partial.num_nodes, 1);
    }
}
