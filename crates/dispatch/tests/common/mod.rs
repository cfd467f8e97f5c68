//! Shared harness for dispatch integration tests: a scripted executor,
//! loopback mediator/runner startup and small wait helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskline_dispatch::messages::{self, TaskRequest};
use taskline_dispatch::{
    DispatchError, ExecutionContext, Mediator, RunnableTask, RunnerHandle, RunnerItem, RunnerPool,
    RunnerServer, RunnerSettings, RunnerStatus, TaskExecutor, TASK_CHANNEL,
};
use taskline_link::{Connection, Connector, LinkConfig, LoopbackNetwork, MessageChannel};

pub const SETTLE: Duration = Duration::from_millis(100);
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for `spin` so a broken cancel path cannot hang the suite.
const SPIN_LIMIT: Duration = Duration::from_secs(10);

pub fn network() -> LoopbackNetwork {
    LoopbackNetwork::new(
        LinkConfig::default()
            .with_heartbeat(Duration::from_millis(500))
            .with_read_timeout(Duration::from_millis(50)),
    )
}

/// Records what the scripted executor saw.
#[derive(Clone, Default)]
pub struct Probe {
    started: Arc<Mutex<Vec<String>>>,
    cancels_observed: Arc<AtomicUsize>,
}

impl Probe {
    /// Scripts in the order their execution began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// How many executions stopped because they saw the cancel token.
    pub fn cancels_observed(&self) -> usize {
        self.cancels_observed.load(Ordering::SeqCst)
    }

    pub fn executor(&self) -> Arc<dyn TaskExecutor> {
        Arc::new(ScriptExecutor { probe: self.clone() })
    }

    pub async fn wait_for_cancels(&self, count: usize) {
        let deadline = Instant::now() + TIMEOUT;
        while self.cancels_observed() < count {
            assert!(Instant::now() < deadline, "expected {count} observed cancellations");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Payloads are UTF-8 scripts:
///
/// - `echo:<text>` returns `<text>`
/// - `sleep:<ms>` sleeps, stopping early when cancelled
/// - `spin` runs until cancelled
/// - `stubborn:<ms>` sleeps and ignores cancellation
/// - `fail:<message>` fails with `<message>`
/// - `panic` panics
/// - `boom` panics while decoding
///
/// Anything else fails to decode.
struct ScriptExecutor {
    probe: Probe,
}

impl TaskExecutor for ScriptExecutor {
    fn decode(&self, payload: &[u8]) -> Result<Box<dyn RunnableTask>, String> {
        let script = std::str::from_utf8(payload)
            .map_err(|e| format!("payload is not UTF-8: {e}"))?
            .to_string();
        let command = script.split(':').next().unwrap_or_default();
        if command == "boom" {
            panic!("decoder exploded on '{script}'");
        }
        if !matches!(command, "echo" | "sleep" | "spin" | "stubborn" | "fail" | "panic") {
            return Err(format!("unknown command '{command}'"));
        }
        let probe = self.probe.clone();
        Ok(Box::new(move |ctx: &ExecutionContext| run_script(&script, ctx, &probe)))
    }
}

fn run_script(script: &str, ctx: &ExecutionContext, probe: &Probe) -> Result<Vec<u8>, String> {
    probe.started.lock().unwrap().push(script.to_string());
    let (command, arg) = script.split_once(':').unwrap_or((script, ""));
    let millis = || arg.parse::<u64>().map(Duration::from_millis).map_err(|e| e.to_string());

    match command {
        "echo" => Ok(arg.as_bytes().to_vec()),
        "sleep" => pause(ctx, probe, millis()?).map(|()| b"slept".to_vec()),
        "spin" => pause(ctx, probe, SPIN_LIMIT).map(|()| b"spun out".to_vec()),
        "stubborn" => {
            std::thread::sleep(millis()?);
            Ok(b"ignored".to_vec())
        }
        "fail" => Err(arg.to_string()),
        "panic" => panic!("script asked to panic"),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn pause(ctx: &ExecutionContext, probe: &Probe, total: Duration) -> Result<(), String> {
    let until = Instant::now() + total;
    while Instant::now() < until {
        if ctx.is_cancelled() {
            probe.cancels_observed.fetch_add(1, Ordering::SeqCst);
            return Err("cancelled".into());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Mediator serving `endpoint` until `shutdown` fires.
pub struct MediatorHarness {
    pub mediator: Mediator,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), DispatchError>>,
}

pub fn start_mediator(network: &LoopbackNetwork, endpoint: &str) -> MediatorHarness {
    let listener = network.listen(endpoint).unwrap();
    let mediator = Mediator::new(Arc::new(RunnerPool::new()));
    let shutdown = CancellationToken::new();
    let task = {
        let mediator = mediator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { mediator.serve(listener, shutdown).await })
    };
    MediatorHarness {
        mediator,
        shutdown,
        task,
    }
}

/// Runner listening on `settings.endpoint`, registered with `mediator` when
/// given.
pub async fn start_runner(
    network: &LoopbackNetwork,
    settings: RunnerSettings,
    probe: &Probe,
    mediator: Option<&str>,
) -> RunnerHandle {
    let listener = network.listen(settings.endpoint.clone()).unwrap();
    let mediator = match mediator {
        Some(endpoint) => Some(network.connect(endpoint).await.unwrap()),
        None => None,
    };
    RunnerServer::new(settings, probe.executor()).spawn(listener, mediator)
}

pub async fn wait_for_status(
    handle: &RunnerHandle,
    predicate: impl Fn(&RunnerStatus) -> bool,
) -> RunnerStatus {
    let mut updates = handle.status_updates();
    timeout(TIMEOUT, updates.wait_for(|status| predicate(status)))
        .await
        .expect("runner status not reached in time")
        .map(|status| *status)
        .expect("runner stopped publishing")
}

/// Poll the mediator's pool until `predicate` holds.
pub async fn wait_for_pool(
    mediator: &Mediator,
    predicate: impl Fn(&[RunnerItem]) -> bool,
) -> Vec<RunnerItem> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let runners = mediator.snapshot();
        if predicate(&runners) {
            return runners;
        }
        assert!(Instant::now() < deadline, "pool never matched, last: {runners:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Raw task channel to `endpoint`. The connection must outlive the channel.
pub async fn connect_raw(network: &LoopbackNetwork, endpoint: &str) -> (Connection, MessageChannel) {
    let connection = network.connect(endpoint).await.unwrap();
    let channel = MessageChannel::new(
        connection.channel(TASK_CHANNEL),
        messages::shared_registry(),
        connection.config().max_message_size,
    );
    (connection, channel)
}

/// Submit without a `TaskClient` to look at the raw task channel.
pub async fn submit_raw(
    network: &LoopbackNetwork,
    endpoint: &str,
    script: &str,
    timeout_ms: u64,
) -> (Connection, MessageChannel) {
    let (connection, channel) = connect_raw(network, endpoint).await;
    channel
        .send_flushed(&TaskRequest {
            payload: script.as_bytes().to_vec(),
            timeout_ms,
            application_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
    (connection, channel)
}
