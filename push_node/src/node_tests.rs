/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Multi-particle scenarios driven through real node event loops, with the
//! test thread acting as coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use push_messages::DeviceIndex;
use push_messages::Fid;
use push_messages::FutureKey;
use push_messages::Pid;
use push_messages::Rank;
use push_messages::RemoteError;
use push_messages::Tensor;
use push_messages::WireValue;
use push_messages::client::ClientMessage;
use timed_test::timed_test;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::config::EvictionPolicy;
use crate::node::ControlMessage;
use crate::node::Envelope;
use crate::node::NodeEventLoop;
use crate::node::NodeSender;
use crate::particle::Handler;
use crate::particle::ParticleState;
use crate::particle::handler;
use crate::resource::ModuleFactory;
use crate::resource::StepFactory;
use crate::telemetry;
use crate::test_util::Linear;
use crate::test_util::Tracer;
use crate::test_util::TraceEvent;
use crate::test_util::TraceLog;
use crate::test_util::Sgd;
use crate::test_util::mse_loss;

/// A minimal coordinator: spawns the nodes, installs particles, launches
/// handlers, and collects acknowledgments.
struct Harness {
    config: Config,
    nodes: Vec<NodeSender>,
    threads: Vec<JoinHandle<anyhow::Result<()>>>,
    client: mpsc::UnboundedReceiver<ClientMessage>,
    particle_to_rank: HashMap<Pid, Rank>,
    particle_to_device: HashMap<Pid, DeviceIndex>,
    next_pid: u64,
    next_fid: u64,
    acks: HashMap<FutureKey, Result<WireValue, RemoteError>>,
    failures: Vec<(Option<Pid>, RemoteError)>,
}

impl Harness {
    fn new(config: Config, mk_module: ModuleFactory) -> Self {
        telemetry::initialize_logging_for_test();
        let (client_tx, client) = mpsc::unbounded_channel();
        let per_node = config.devices_per_node;
        let mut nodes = Vec::new();
        let mut threads = Vec::new();
        for rank in 0..config.num_nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            let first = rank as u16 * per_node;
            let node = NodeEventLoop::new(
                Rank(rank),
                (first..first + per_node).map(DeviceIndex),
                rx,
                client_tx.clone(),
                &config,
                mk_module.clone(),
            )
            .unwrap();
            threads.push(node.spawn().unwrap());
            nodes.push(tx);
        }
        let mut harness = Self {
            config,
            nodes,
            threads,
            client,
            particle_to_rank: HashMap::new(),
            particle_to_device: HashMap::new(),
            next_pid: 0,
            next_fid: 0,
            acks: HashMap::new(),
            failures: Vec::new(),
        };
        harness.broadcast();
        harness
    }

    fn control(&self, rank: Rank, message: ControlMessage) {
        self.nodes[rank.0]
            .send(Envelope::Control(message))
            .unwrap();
    }

    fn next_message(&mut self) -> ClientMessage {
        self.client.blocking_recv().expect("every node hung up")
    }

    fn broadcast(&mut self) {
        let peers: HashMap<_, _> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(rank, tx)| (Rank(rank), tx.clone()))
            .collect();
        for rank in 0..self.nodes.len() {
            self.control(
                Rank(rank),
                ControlMessage::Broadcast {
                    peers: peers.clone(),
                    particle_to_rank: self.particle_to_rank.clone(),
                    particle_to_device: self.particle_to_device.clone(),
                },
            );
        }
        for _ in 0..self.nodes.len() {
            match self.next_message() {
                ClientMessage::BroadcastAck { .. } => {}
                other => panic!("expected a broadcast ack, got {:?}", other),
            }
        }
    }

    fn create(&mut self, device: u16, steps: StepFactory, handlers: Vec<(&str, Handler)>) -> Pid {
        self.create_with_state(device, steps, ParticleState::new(), handlers)
    }

    fn create_with_state(
        &mut self,
        device: u16,
        steps: StepFactory,
        state: ParticleState,
        handlers: Vec<(&str, Handler)>,
    ) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let device = DeviceIndex(device);
        let rank = Rank(device.0 as usize / self.config.devices_per_node as usize);
        self.control(
            rank,
            ControlMessage::InitParticle {
                pid,
                device,
                state,
                handlers: handlers
                    .into_iter()
                    .map(|(name, h)| (name.to_string(), h))
                    .collect(),
                steps,
            },
        );
        match self.next_message() {
            ClientMessage::ParticleInitAck { pid: acked, result } => {
                assert_eq!(acked, pid);
                result.unwrap();
            }
            other => panic!("expected an init ack, got {:?}", other),
        }
        self.particle_to_rank.insert(pid, rank);
        self.particle_to_device.insert(pid, device);
        self.broadcast();
        pid
    }

    fn launch(&mut self, pid: Pid, name: &str, args: Vec<WireValue>) -> FutureKey {
        let key = FutureKey::new(pid, Fid(self.next_fid));
        self.next_fid += 1;
        self.control(
            self.particle_to_rank[&pid],
            ControlMessage::Launch {
                key,
                name: name.to_string(),
                args,
            },
        );
        key
    }

    fn result(&mut self, key: FutureKey) -> Result<WireValue, RemoteError> {
        loop {
            if let Some(result) = self.acks.remove(&key) {
                return result;
            }
            match self.next_message() {
                ClientMessage::FuncAck { key, result } => {
                    self.acks.insert(key, result);
                }
                ClientMessage::Failure { pid, error, .. } => self.failures.push((pid, error)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn call(&mut self, pid: Pid, name: &str, args: Vec<WireValue>) -> Result<WireValue, RemoteError> {
        let key = self.launch(pid, name, args);
        self.result(key)
    }

    fn parameters(&mut self, pid: Pid) -> Vec<Tensor> {
        let key = FutureKey::new(pid, Fid(self.next_fid));
        self.next_fid += 1;
        self.control(self.particle_to_rank[&pid], ControlMessage::FetchParameters { key });
        match self.next_message() {
            ClientMessage::ParametersAck { key: acked, result } => {
                assert_eq!(acked, key);
                result.unwrap()
            }
            other => panic!("expected parameters, got {:?}", other),
        }
    }

    /// Wait for every loop to exit on its own, then collect the failures
    /// reported on the way out.
    fn join(mut self) -> (Vec<anyhow::Result<()>>, Vec<(Option<Pid>, RemoteError)>) {
        let exits = std::mem::take(&mut self.threads)
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect();
        while let Ok(message) = self.client.try_recv() {
            if let ClientMessage::Failure { pid, error, .. } = message {
                self.failures.push((pid, error));
            }
        }
        (exits, self.failures)
    }

    /// Stop every node and return how each loop exited.
    fn shutdown(self) -> Vec<anyhow::Result<()>> {
        for node in &self.nodes {
            let _ = node.send(Envelope::Control(ControlMessage::Shutdown));
        }
        self.threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect()
    }
}

fn pid_arg(args: &[WireValue], index: usize) -> anyhow::Result<Pid> {
    match args.get(index) {
        Some(WireValue::Int(pid)) => Ok(Pid(*pid as u64)),
        other => bail!("expected a pid at {}, got {:?}", index, other),
    }
}

fn int_arg(args: &[WireValue], index: usize) -> anyhow::Result<i64> {
    match args.get(index) {
        Some(WireValue::Int(value)) => Ok(*value),
        other => bail!("expected an int at {}, got {:?}", index, other),
    }
}

fn pid_value(pid: Pid) -> WireValue {
    WireValue::Int(pid.0 as i64)
}

fn double_handler() -> Handler {
    handler(|_p, args| Ok(WireValue::Int(int_arg(&args, 0)? * 2)))
}

/// Sends `args[1]` to `args[0]`'s "double" handler and waits.
fn ask_handler() -> Handler {
    handler(|p, args| {
        let to = pid_arg(&args, 0)?;
        let future = p.send(to, "double", vec![args[1].clone()])?;
        p.wait(future)
    })
}

#[timed_test(timeout_secs = 60)]
fn test_same_rank_send_returns_handler_result() {
    let mut harness = Harness::new(Config::default(), Linear::factory(2));
    let asker = harness.create(0, StepFactory::none(), vec![("ask", ask_handler())]);
    let doubler = harness.create(0, StepFactory::none(), vec![("double", double_handler())]);
    assert_eq!(
        harness
            .call(asker, "ask", vec![pid_value(doubler), WireValue::Int(21)])
            .unwrap(),
        WireValue::Int(42)
    );
    assert!(harness.failures.is_empty());
    for exit in harness.shutdown() {
        exit.unwrap();
    }
}

#[timed_test(timeout_secs = 60)]
fn test_cross_rank_send_returns_handler_result() {
    let config = Config {
        num_nodes: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(2));
    let asker = harness.create(0, StepFactory::none(), vec![("ask", ask_handler())]);
    let doubler = harness.create(1, StepFactory::none(), vec![("double", double_handler())]);
    assert_eq!(
        harness
            .call(asker, "ask", vec![pid_value(doubler), WireValue::Int(-4)])
            .unwrap(),
        WireValue::Int(-8)
    );
    for exit in harness.shutdown() {
        exit.unwrap();
    }
}

#[timed_test(timeout_secs = 60)]
fn test_future_ids_strictly_increase() {
    let mut harness = Harness::new(Config::default(), Linear::factory(1));
    let fan_out = handler(|p, args| {
        let to = pid_arg(&args, 0)?;
        let mut futures = Vec::new();
        for i in 0..5 {
            futures.push(p.send(to, "double", vec![WireValue::Int(i)])?);
        }
        let fids: Vec<_> = futures.iter().map(|f| WireValue::Int(f.fid().0 as i64)).collect();
        let results = p.wait_all(futures)?;
        Ok(WireValue::List(vec![WireValue::List(fids), WireValue::List(results)]))
    });
    let a = harness.create(0, StepFactory::none(), vec![("fan_out", fan_out)]);
    let b = harness.create(0, StepFactory::none(), vec![("double", double_handler())]);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let WireValue::List(parts) = harness.call(a, "fan_out", vec![pid_value(b)]).unwrap() else {
            panic!("expected a list");
        };
        let WireValue::List(fids) = &parts[0] else {
            panic!("expected fids");
        };
        seen.extend(fids.iter().map(|f| match f {
            WireValue::Int(fid) => *fid,
            other => panic!("unexpected {:?}", other),
        }));
        assert_eq!(
            parts[1],
            WireValue::List((0..5).map(|i| WireValue::Int(i * 2)).collect())
        );
    }
    assert_eq!(seen.len(), 10);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_unknown_handler_is_not_fatal() {
    let mut harness = Harness::new(Config::default(), Linear::factory(1));
    let pid = harness.create(0, StepFactory::none(), vec![("double", double_handler())]);
    assert_eq!(
        harness.call(pid, "missing", vec![]),
        Err(RemoteError::UnknownHandler {
            pid,
            name: "missing".into()
        })
    );
    assert_eq!(
        harness.call(pid, "double", vec![WireValue::Int(3)]).unwrap(),
        WireValue::Int(6)
    );

    // The same holds for a send between particles.
    let asker = harness.create(0, StepFactory::none(), vec![(
        "ask_missing",
        handler(move |p, _args| {
            let future = p.send(pid, "nope", vec![])?;
            match p.wait(future) {
                Err(err) => Ok(WireValue::String(err.to_string())),
                Ok(value) => Err(anyhow!("unexpected {:?}", value)),
            }
        }),
    )]);
    let WireValue::String(message) = harness.call(asker, "ask_missing", vec![]).unwrap() else {
        panic!("expected an error message");
    };
    assert!(message.contains("nope"), "{}", message);
    assert!(harness.failures.is_empty());
    for exit in harness.shutdown() {
        exit.unwrap();
    }
}

#[timed_test(timeout_secs = 60)]
fn test_handler_error_reports_failure_and_stops() {
    let mut harness = Harness::new(Config::default(), Linear::factory(1));
    let pid = harness.create(0, StepFactory::none(), vec![(
        "boom",
        handler(|_p, _args| Err(anyhow!("bad input"))),
    )]);
    let result = harness.call(pid, "boom", vec![]);
    assert!(
        matches!(&result, Err(RemoteError::HandlerFailed { pid: failed, name, .. }) if *failed == pid && name == "boom"),
        "{:?}",
        result
    );
    assert_eq!(harness.failures.len(), 1);
    let (failed, error) = &harness.failures[0];
    assert_eq!(*failed, Some(pid));
    assert!(error.is_fatal());

    // The loop has already exited on its own.
    let exits = harness.shutdown();
    assert!(exits.into_iter().all(|exit| exit.is_ok()));
}

#[timed_test(timeout_secs = 60)]
fn test_compute_failure_is_reported() {
    let mut harness = Harness::new(Config::default(), Linear::factory(2));
    let pid = harness.create(0, StepFactory::none(), vec![(
        "bad_forward",
        handler(|p, _args| {
            let future = p.forward(Tensor::zeros(vec![3], Default::default()))?;
            p.wait(future).map(WireValue::Tensor)
        }),
    )]);
    assert!(harness.call(pid, "bad_forward", vec![]).is_err());
    assert!(
        harness.failures.iter().any(|(failed, error)| *failed == Some(pid)
            && matches!(error, RemoteError::OperationFailed { op, .. } if op == "forward")),
        "{:?}",
        harness.failures
    );
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_get_view_is_frozen() {
    let mut harness = Harness::new(Config::default(), Linear::factory(2));
    let trainer = harness.create(
        0,
        StepFactory::none().with_optimizer(|| Ok(Sgd::new(0.1))),
        vec![(
            "train",
            handler(|p, _args| {
                let data = Tensor::from_vec(vec![2], vec![1.0, 2.0])?;
                let future = p.step(mse_loss(), data, Tensor::scalar(3.0))?;
                p.wait(future).map(WireValue::Double)
            }),
        )],
    );
    let observer = harness.create(0, StepFactory::none(), vec![(
        "observe",
        handler(|p, args| {
            let to = pid_arg(&args, 0)?;
            let future = p.get(to)?;
            let view = p.wait(future)?;
            let before = view.parameters();
            anyhow::ensure!(view.device() == p.device());

            let future = p.send(to, "train", vec![])?;
            p.wait(future)?;

            let after = view.parameters();
            anyhow::ensure!(before == after, "view changed: {:?} -> {:?}", before, after);
            let output = view.forward(&Tensor::from_vec(vec![2], vec![1.0, 1.0])?)?;
            Ok(WireValue::List(vec![
                WireValue::Tensor(before[0].to_host()),
                WireValue::Tensor(output.to_host()),
            ]))
        }),
    )]);

    let WireValue::List(observed) = harness
        .call(observer, "observe", vec![pid_value(trainer)])
        .unwrap()
    else {
        panic!("expected a list");
    };
    let WireValue::Tensor(viewed) = &observed[0] else {
        panic!("expected a tensor");
    };
    assert_eq!(viewed.data(), &[0.0, 0.0]);
    let WireValue::Tensor(output) = &observed[1] else {
        panic!("expected a tensor");
    };
    assert_eq!(output.data(), &[0.0]);

    // The source moved on without the view.
    let trained = harness.parameters(trainer);
    assert_ne!(trained[0].data(), viewed.data());
    assert!(trained[0].device().is_host());
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_cross_rank_get() {
    let config = Config {
        num_nodes: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(2));
    let source = harness.create(
        1,
        StepFactory::none().with_optimizer(|| Ok(Sgd::new(0.5))),
        vec![(
            "train",
            handler(|p, _args| {
                let data = Tensor::from_vec(vec![2], vec![1.0, -1.0])?;
                let future = p.step(mse_loss(), data, Tensor::scalar(1.0))?;
                p.wait(future).map(WireValue::Double)
            }),
        )],
    );
    let reader = harness.create(0, StepFactory::none(), vec![(
        "read",
        handler(|p, args| {
            let future = p.get(pid_arg(&args, 0)?)?;
            let view = p.wait(future)?;
            anyhow::ensure!(view.device() == p.device());
            Ok(WireValue::List(
                view.parameters()
                    .into_iter()
                    .map(|t| WireValue::Tensor(t.to_host()))
                    .collect(),
            ))
        }),
    )]);

    harness.call(source, "train", vec![]).unwrap();
    let expected = harness.parameters(source);
    let WireValue::List(viewed) = harness.call(reader, "read", vec![pid_value(source)]).unwrap()
    else {
        panic!("expected a list");
    };
    let viewed: Vec<_> = viewed
        .into_iter()
        .map(|v| match v {
            WireValue::Tensor(t) => t,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(viewed, expected);
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_capacity_one_switch_waits_for_active_unit() {
    let log = TraceLog::default();
    let config = Config {
        cache_size: 1,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Tracer::factory(log.clone(), Duration::from_millis(100)));
    let second = harness.create(0, StepFactory::none(), vec![(
        "run",
        handler(|p, args| {
            let future = p.forward(Tensor::scalar(int_arg(&args, 0)? as f32))?;
            p.wait(future).map(WireValue::Tensor)
        }),
    )]);
    let first = harness.create(0, StepFactory::none(), vec![(
        "run_then_send",
        handler(|p, args| {
            let to = pid_arg(&args, 0)?;
            // Left in flight while `to` asks for the device.
            let mine = p.forward(Tensor::scalar(1.0))?;
            let theirs = p.send(to, "run", vec![WireValue::Int(2)])?;
            let theirs = p.wait(theirs)?;
            let mine = p.wait(mine)?;
            Ok(WireValue::List(vec![WireValue::Tensor(mine), theirs]))
        }),
    )]);

    let result = harness
        .call(first, "run_then_send", vec![pid_value(second)])
        .unwrap();
    let WireValue::List(outputs) = result else {
        panic!("expected a list");
    };
    let values: Vec<f32> = outputs
        .iter()
        .map(|v| match v {
            WireValue::Tensor(t) => t.data()[0],
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(values, vec![1.0, 2.0]);

    let device = DeviceIndex(0);
    assert_eq!(
        log.events(),
        vec![
            TraceEvent::Start { device, instance: 1 },
            TraceEvent::End { device, instance: 1 },
            TraceEvent::Start { device, instance: 2 },
            TraceEvent::End { device, instance: 2 },
        ]
    );
    assert_eq!(log.max_concurrency(device), 1);
    // The first particle's module was parked and restored, not rebuilt.
    assert_eq!(log.instances(), 2);
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_at_most_one_unit_per_device() {
    let log = TraceLog::default();
    let config = Config {
        cache_size: 2,
        devices_per_node: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Tracer::factory(log.clone(), Duration::from_millis(5)));
    let burst = || {
        handler(|p, _args| {
            for i in 0..3 {
                p.forward(Tensor::scalar(i as f32))?;
            }
            Ok(WireValue::None(()))
        })
    };
    let pids: Vec<_> = (0..6)
        .map(|i| harness.create(i % 2, StepFactory::none(), vec![("burst", burst())]))
        .collect();
    let keys: Vec<_> = pids
        .iter()
        .map(|pid| harness.launch(*pid, "burst", vec![]))
        .collect();
    for key in keys {
        harness.result(key).unwrap();
    }
    harness.shutdown();

    for device in [DeviceIndex(0), DeviceIndex(1)] {
        assert_eq!(log.max_concurrency(device), 1);
    }
    let starts = log
        .events()
        .iter()
        .filter(|e| matches!(e, TraceEvent::Start { .. }))
        .count();
    assert_eq!(starts, 18);
}

#[timed_test(timeout_secs = 60)]
fn test_requests_during_wait_are_replayed_in_order() {
    let config = Config {
        num_nodes: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(1));
    let journal = Arc::new(Mutex::new(Vec::<String>::new()));

    let slow = harness.create(1, StepFactory::none(), vec![("sleep", {
        let journal = journal.clone();
        handler(move |_p, _args| {
            std::thread::sleep(Duration::from_millis(300));
            journal.lock().unwrap().push("remote".to_string());
            Ok(WireValue::None(()))
        })
    })]);
    let waiter = harness.create(0, StepFactory::none(), vec![("wait_remote", {
        let journal = journal.clone();
        handler(move |p, args| {
            let future = p.send(pid_arg(&args, 0)?, "sleep", vec![])?;
            p.wait(future)?;
            journal.lock().unwrap().push("resumed".to_string());
            Ok(WireValue::None(()))
        })
    })]);
    let recorder = harness.create(0, StepFactory::none(), vec![("record", {
        let journal = journal.clone();
        handler(move |_p, args| {
            journal
                .lock()
                .unwrap()
                .push(format!("record {}", int_arg(&args, 0)?));
            Ok(WireValue::None(()))
        })
    })]);

    let waiting = harness.launch(waiter, "wait_remote", vec![pid_value(slow)]);
    let records: Vec<_> = (1..=3)
        .map(|i| harness.launch(recorder, "record", vec![WireValue::Int(i)]))
        .collect();
    harness.result(waiting).unwrap();
    for key in records {
        harness.result(key).unwrap();
    }

    assert_eq!(
        *journal.lock().unwrap(),
        vec!["remote", "record 1", "record 2", "record 3", "resumed"]
    );
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_cross_rank_notify_has_no_ack() {
    let config = Config {
        num_nodes: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(1));
    let target = harness.create(1, StepFactory::none(), vec![
        (
            "mark",
            handler(|p, args| {
                let value = args.into_iter().next().unwrap_or_default();
                p.state_mut().insert("mark".to_string(), value);
                Ok(WireValue::None(()))
            }),
        ),
        (
            "read",
            handler(|p, _args| Ok(p.state().get("mark").cloned().unwrap_or_default())),
        ),
    ]);
    let sender = harness.create(0, StepFactory::none(), vec![(
        "broadcast",
        handler(|p, _args| {
            for other in p.other_particles() {
                p.notify(other, "mark", vec![WireValue::String("hello".into())])?;
            }
            Ok(WireValue::Int(p.particles().len() as i64))
        }),
    )]);

    assert_eq!(harness.call(sender, "broadcast", vec![]).unwrap(), WireValue::Int(2));
    assert_eq!(
        harness.call(target, "read", vec![]).unwrap(),
        WireValue::String("hello".into())
    );
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_shutdown_during_wait_tears_down() {
    let config = Config {
        num_nodes: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(1));
    let slow = harness.create(1, StepFactory::none(), vec![(
        "sleep",
        handler(|_p, _args| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(WireValue::None(()))
        }),
    )]);
    let waiter = harness.create(0, StepFactory::none(), vec![(
        "wait_remote",
        handler(|p, args| {
            let future = p.send(pid_arg(&args, 0)?, "sleep", vec![])?;
            p.wait(future)
        }),
    )]);

    let key = harness.launch(waiter, "wait_remote", vec![pid_value(slow)]);
    harness.control(Rank(0), ControlMessage::Shutdown);
    let result = harness.result(key);
    assert!(
        matches!(&result, Err(RemoteError::HandlerFailed { message, .. }) if message.contains("torn down")),
        "{:?}",
        result
    );
    for exit in harness.shutdown() {
        exit.unwrap();
    }
}

#[timed_test(timeout_secs = 60)]
fn test_step_schedule_and_zero_grad() {
    let mut harness = Harness::new(Config::default(), Linear::factory(1));
    let pid = harness.create(
        0,
        StepFactory::none().with_optimizer(|| Ok(Sgd::new(0.1))),
        vec![(
            "epoch",
            handler(|p, _args| {
                let mut losses = Vec::new();
                for _ in 0..10 {
                    let future = p.step(mse_loss(), Tensor::scalar(1.0), Tensor::scalar(2.0))?;
                    losses.push(p.wait(future)?);
                }
                let future = p.scheduler_step()?;
                p.wait(future)?;
                anyhow::ensure!(p.with_module(|m| Ok(m.parameters()[0].grad.is_some()))?);
                let future = p.zero_grad()?;
                p.wait(future)?;
                anyhow::ensure!(p.with_module(|m| Ok(m.parameters().iter().all(|p| p.grad.is_none())))?);
                Ok(WireValue::List(losses.into_iter().map(WireValue::Double).collect()))
            }),
        )],
    );
    let WireValue::List(losses) = harness.call(pid, "epoch", vec![]).unwrap() else {
        panic!("expected a list");
    };
    let losses: Vec<f64> = losses
        .into_iter()
        .map(|l| match l {
            WireValue::Double(l) => l,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert!(losses.windows(2).all(|w| w[1] <= w[0]), "{:?}", losses);
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_save_writes_every_local_particle() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        cache_size: 1,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(2));
    let pids: Vec<_> = (0..3)
        .map(|_| harness.create(0, StepFactory::none(), vec![]))
        .collect();
    let key = FutureKey::new(pids[0], Fid(99));
    harness.control(Rank(0), ControlMessage::Save { key });
    match harness.next_message() {
        ClientMessage::SaveAck { key: acked, result } => {
            assert_eq!(acked, key);
            result.unwrap();
        }
        other => panic!("expected a save ack, got {:?}", other),
    }
    let checkpointer = crate::checkpoint::DirCheckpointer::new(dir.path()).unwrap();
    for pid in pids {
        assert_eq!(checkpointer.load(pid).unwrap().len(), 2);
    }
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_swallowed_compute_failure_stops_the_loop() {
    let config = Config {
        devices_per_node: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(2));
    let swallower = harness.create(0, StepFactory::none(), vec![(
        "swallow",
        handler(|p, _args| {
            let future = p.forward(Tensor::zeros(vec![3], Default::default()))?;
            match p.wait(future) {
                Err(_) => Ok(WireValue::Int(7)),
                Ok(output) => Ok(WireValue::Tensor(output)),
            }
        }),
    )]);
    harness.create(1, StepFactory::none(), vec![("double", double_handler())]);

    assert_eq!(
        harness.call(swallower, "swallow", vec![]),
        Err(RemoteError::TornDown(Rank(0)))
    );

    // No shutdown is sent: the loop has to stop by itself.
    let nodes = harness.nodes.clone();
    let (exits, failures) = harness.join();
    assert!(exits.into_iter().all(|exit| exit.is_ok()));
    assert!(
        failures.iter().any(|(failed, error)| *failed == Some(swallower)
            && matches!(error, RemoteError::OperationFailed { op, .. } if op == "forward")),
        "{:?}",
        failures
    );
    // Nothing is left to serve the particle on the other device.
    assert!(nodes[0].send(Envelope::Control(ControlMessage::Shutdown)).is_err());
}

#[timed_test(timeout_secs = 60)]
fn test_discard_rebuilds_evicted_particle() {
    let log = TraceLog::default();
    let config = Config {
        cache_size: 1,
        eviction: EvictionPolicy::Discard,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Tracer::factory(log.clone(), Duration::ZERO));
    let trained = harness.create(
        0,
        StepFactory::none().with_optimizer(|| Ok(Sgd::new(0.1))),
        vec![
            (
                "train",
                handler(|p, _args| {
                    let future = p.step(mse_loss(), Tensor::scalar(1.0), Tensor::scalar(3.0))?;
                    p.wait(future).map(WireValue::Double)
                }),
            ),
            (
                "weight",
                handler(|p, _args| {
                    p.with_module(|m| Ok(WireValue::Double(m.parameters()[0].value.data()[0] as f64)))
                }),
            ),
        ],
    );
    let other = harness.create(0, StepFactory::none(), vec![(
        "touch",
        handler(|p, _args| p.with_module(|_| Ok(WireValue::None(())))),
    )]);
    let weight = |harness: &mut Harness| match harness.call(trained, "weight", vec![]).unwrap() {
        WireValue::Double(w) => w,
        other => panic!("unexpected {:?}", other),
    };

    assert_eq!(harness.call(trained, "train", vec![]).unwrap(), WireValue::Double(4.0));
    assert!((weight(&mut harness) - 1.4).abs() < 1e-6);
    assert_eq!(log.instances(), 1);

    harness.call(other, "touch", vec![]).unwrap();
    assert_eq!(log.instances(), 2);

    // The trained module was dropped; the particle starts over.
    assert_eq!(weight(&mut harness), 1.0);
    assert_eq!(log.instances(), 3);
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_cross_rank_requests_during_wait_are_replayed_in_order() {
    let config = Config {
        num_nodes: 3,
        ..Default::default()
    };
    let mut harness = Harness::new(config, Linear::factory(1));
    let journal = Arc::new(Mutex::new(Vec::<String>::new()));

    let slow = harness.create(1, StepFactory::none(), vec![("sleep", {
        let journal = journal.clone();
        handler(move |_p, _args| {
            std::thread::sleep(Duration::from_millis(300));
            journal.lock().unwrap().push("remote".to_string());
            Ok(WireValue::None(()))
        })
    })]);
    let waiter = harness.create(0, StepFactory::none(), vec![("wait_remote", {
        let journal = journal.clone();
        handler(move |p, args| {
            let future = p.send(pid_arg(&args, 0)?, "sleep", vec![])?;
            p.wait(future)?;
            journal.lock().unwrap().push("resumed".to_string());
            Ok(WireValue::None(()))
        })
    })]);
    let recorder = harness.create(0, StepFactory::none(), vec![("record", {
        let journal = journal.clone();
        handler(move |_p, args| {
            journal
                .lock()
                .unwrap()
                .push(format!("record {}", int_arg(&args, 0)?));
            Ok(WireValue::None(()))
        })
    })]);
    let caller = harness.create(2, StepFactory::none(), vec![(
        "record_all",
        handler(|p, args| {
            let to = pid_arg(&args, 0)?;
            let futures = (1..=3)
                .map(|i| p.send(to, "record", vec![WireValue::Int(i)]))
                .collect::<anyhow::Result<Vec<_>>>()?;
            p.wait_all(futures).map(WireValue::List)
        }),
    )]);

    let waiting = harness.launch(waiter, "wait_remote", vec![pid_value(slow)]);
    let recording = harness.launch(caller, "record_all", vec![pid_value(recorder)]);
    harness.result(waiting).unwrap();
    assert_eq!(
        harness.result(recording).unwrap(),
        WireValue::List(vec![WireValue::None(()); 3])
    );

    assert_eq!(
        *journal.lock().unwrap(),
        vec!["remote", "record 1", "record 2", "record 3", "resumed"]
    );
    harness.shutdown();
}

#[timed_test(timeout_secs = 60)]
fn test_state_reads_leave_state_untouched() {
    let mut harness = Harness::new(Config::default(), Linear::factory(1));
    let seeded = harness.create_with_state(
        0,
        StepFactory::none(),
        ParticleState::from([("seed".to_string(), WireValue::Int(5))]),
        vec![(
            "peek",
            handler(|p, _args| {
                let state = p.state();
                Ok(WireValue::List(vec![
                    WireValue::Int(state.len() as i64),
                    state.get("seed").cloned().unwrap_or_default(),
                    WireValue::Bool(state.contains_key("absent")),
                ]))
            }),
        )],
    );
    let expected = WireValue::List(vec![
        WireValue::Int(1),
        WireValue::Int(5),
        WireValue::Bool(false),
    ]);
    assert_eq!(harness.call(seeded, "peek", vec![]).unwrap(), expected);
    assert_eq!(harness.call(seeded, "peek", vec![]).unwrap(), expected);
    harness.shutdown();
}
