/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One long-lived worker thread per device. Compute units are queued on the
//! worker and run in submission order; the dispatch thread holds a
//! [`Completion`] for the unit currently occupying the device.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::Context;
use push_messages::DeviceIndex;
use push_messages::Pid;
use push_messages::RemoteError;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// A unit of work bound to a device.
pub type Job = Box<dyn FnOnce() -> Result<(), RemoteError> + Send + 'static>;

type Outcome = std::thread::Result<Result<(), RemoteError>>;
type Submission = (Job, oneshot::Sender<Outcome>);

#[derive(Debug)]
pub struct DeviceExecutor {
    device: DeviceIndex,
    sender: Option<mpsc::UnboundedSender<Submission>>,
    thread: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl DeviceExecutor {
    pub fn new(device: DeviceIndex) -> anyhow::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Submission>();
        // Jobs block for as long as the compute takes; no runtime here.
        let thread = std::thread::Builder::new()
            .name(format!("push-{}", device))
            .spawn(move || {
                while let Some((job, done)) = receiver.blocking_recv() {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(job));
                    // The waiter may have been torn down already.
                    let _ = done.send(outcome);
                }
                tracing::debug!("{}: executor exiting", device);
            })
            .with_context(|| format!("spawning executor thread for {}", device))?;
        Ok(Self {
            device,
            sender: Some(sender),
            thread: Some(thread),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Queue `job` on this device. The unit counts as in flight until its
    /// completion is joined or dropped.
    pub fn submit(&self, pid: Pid, op: &'static str, job: Job) -> Completion {
        let (done, receiver) = oneshot::channel();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let queued = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send((job, done)).is_ok());
        if !queued {
            tracing::error!("{}: executor is gone, dropping {} for {}", self.device, op, pid);
        }
        Completion {
            pid,
            op,
            receiver: Some(receiver),
            in_flight: self.in_flight.clone(),
        }
    }

    /// Units submitted and not yet retired.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of `in_flight` over the executor's lifetime.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for DeviceExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("{}: executor thread panicked", self.device);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Handle on a submitted unit.
#[derive(Debug)]
pub struct Completion {
    pid: Pid,
    op: &'static str,
    receiver: Option<oneshot::Receiver<Outcome>>,
    in_flight: Arc<AtomicUsize>,
}

impl Completion {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Block until the unit finishes. Must not be called from within an
    /// async context.
    pub fn join(mut self) -> Result<(), RemoteError> {
        let message = match self.receiver.take().map(|r| r.blocking_recv()) {
            Some(Ok(Ok(result))) => return result,
            Some(Ok(Err(panic))) => format!("panicked: {}", panic_message(panic.as_ref())),
            _ => "device executor exited before the unit completed".to_string(),
        };
        Err(RemoteError::OperationFailed {
            pid: self.pid,
            op: self.op.to_string(),
            message,
        })
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
