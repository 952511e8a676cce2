/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup shared by node loops and the coordinator.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directives, e.g.
/// `PUSH_LOG=push_node=debug,info`.
pub const LOG_ENV: &str = "PUSH_LOG";

const LOG_LEVEL_INFO: &str = "info";
const LOG_LEVEL_DEBUG: &str = "debug";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a formatting subscriber on stderr. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn initialize_logging() {
    if let Err(err) = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .with(filter(LOG_LEVEL_INFO))
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

/// Like `initialize_logging`, at debug level and through the test writer.
pub fn initialize_logging_for_test() {
    if let Err(err) = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_thread_names(true))
        .with(filter(LOG_LEVEL_DEBUG))
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}
