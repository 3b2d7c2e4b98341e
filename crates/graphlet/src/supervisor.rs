//! Process supervisor - spawns the worker and manages its lifecycle.
//!
//! Flow:
//! 1. Spawn the worker with piped stdin/stdout/stderr
//! 2. Route stdout frames (ready, streaming, terminal) as they arrive
//! 3. Race a startup deadline against the `ready` message
//! 4. On crash: reject all in-flight requests, restart with backoff
//! 5. On shutdown: graceful stop, force-kill after the grace period

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Map;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::bridge::{BridgeEvent, LifecycleState};
use crate::correlator::{Correlator, RequestOutcome};
use crate::error::BridgeError;
use crate::wire::{Decoded, NdJsonCodec, READY_REQUEST_ID, WorkerMessage, WorkerRequest};

pub(crate) type RequestWriter = FramedWrite<ChildStdin, NdJsonCodec<WorkerRequest>>;

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin, stdout and stderr; the bridge owns all
/// three streams.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> std::io::Result<Child>;
}

/// Spawner that runs a program with fixed arguments.
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Bridge configuration. Defaults match production behavior; tests dial
/// the timings down.
pub struct BridgeConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Deadline for the worker's one-time `ready` message.
    pub startup_timeout: Duration,
    /// Timeout on the graceful `stop` request during shutdown.
    pub stop_timeout: Duration,
    /// How long shutdown waits for the process to exit before killing it.
    pub kill_grace: Duration,
    /// Crash-restart budget; attempts since the last successful `ready`.
    pub max_restarts: u32,
    /// Backoff unit: restart attempt `n` waits `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// Capacity of the broadcast event channel. Slow subscribers observe
    /// `Lagged` and skip; the bridge never blocks on them.
    pub event_capacity: usize,
}

impl BridgeConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            startup_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            max_restarts: 3,
            backoff_base: Duration::from_secs(1),
            event_capacity: 256,
        }
    }

    /// Convenience for the common case of a program plus arguments.
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(CommandSpawner::new(program).args(args)))
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// State shared between the facade, the reader task and the monitor.
pub(crate) struct Shared {
    pub config: BridgeConfig,
    pub correlator: Correlator,
    pub events: broadcast::Sender<BridgeEvent>,
    pub state: watch::Sender<LifecycleState>,
    pub writer: tokio::sync::Mutex<Option<RequestWriter>>,
    pub shutdown: watch::Sender<bool>,
}

impl Shared {
    pub fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: LifecycleState) {
        tracing::debug!(?state, "Lifecycle transition");
        self.state.send_replace(state);
    }
}

/// A live worker process plus its I/O forwarding tasks.
pub(crate) struct SpawnedWorker {
    pub child: Child,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl SpawnedWorker {
    /// Wait for the forwarding tasks to drain. The reader finishes on
    /// stdout EOF, so any terminal responses the worker managed to write
    /// before exiting are routed before the caller rejects the remainder.
    async fn drain_io(&mut self) {
        let _ = (&mut self.reader_task).await;
        if let Some(task) = self.stderr_task.as_mut() {
            let _ = task.await;
        }
    }
}

/// Spawn the worker and wire up its three streams.
///
/// The returned receiver fires once when the worker sends `ready`.
pub(crate) async fn spawn_worker(
    shared: &Arc<Shared>,
) -> Result<(SpawnedWorker, oneshot::Receiver<()>), BridgeError> {
    tracing::info!("Spawning worker subprocess");
    let mut child = shared
        .config
        .spawner
        .spawn()
        .map_err(|e| BridgeError::Spawn(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Spawn("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Spawn("stdout not captured".to_string()))?;
    let stderr = child.stderr.take();

    *shared.writer.lock().await = Some(FramedWrite::new(stdin, NdJsonCodec::new()));

    let (ready_tx, ready_rx) = oneshot::channel();
    let frames = FramedRead::new(stdout, NdJsonCodec::<WorkerMessage>::new());
    let reader_task = tokio::spawn(read_loop(Arc::clone(shared), frames, ready_tx));

    // Stderr is diagnostic text only, never protocol.
    let stderr_task = stderr.map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "graphlet::worker", "{}", line);
            }
        })
    });

    Ok((
        SpawnedWorker {
            child,
            reader_task,
            stderr_task,
        },
        ready_rx,
    ))
}

async fn read_loop(
    shared: Arc<Shared>,
    mut frames: FramedRead<ChildStdout, NdJsonCodec<WorkerMessage>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    while let Some(item) = frames.next().await {
        match item {
            Ok(Decoded::Message(msg)) => route_message(&shared, msg, &mut ready_tx),
            Ok(Decoded::Malformed { line, error }) => {
                tracing::warn!(target: "graphlet::protocol", %error, "Dropping malformed line");
                shared.emit(BridgeEvent::Malformed { line, error });
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker stdout read error");
                break;
            }
        }
    }
    tracing::debug!("Worker stdout closed");
}

fn route_message(shared: &Shared, msg: WorkerMessage, ready_tx: &mut Option<oneshot::Sender<()>>) {
    match msg {
        WorkerMessage::Ready { request_id } => {
            if request_id != READY_REQUEST_ID {
                tracing::warn!(%request_id, "Ready message carried an unexpected correlation id");
            }
            match ready_tx.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => tracing::warn!("Duplicate ready message ignored"),
            }
        }
        streaming @ (WorkerMessage::Progress { .. }
        | WorkerMessage::Token { .. }
        | WorkerMessage::NodeComplete { .. }) => {
            // Streaming events never touch the pending table, including
            // ones sharing a correlation id with an in-flight request.
            shared.emit(BridgeEvent::Stream(streaming));
        }
        WorkerMessage::GraphComplete { request_id, result } => {
            if !shared.correlator.complete(&request_id, Ok(result)) {
                tracing::debug!(
                    target: "graphlet::protocol",
                    %request_id,
                    "Discarding terminal success with no pending request"
                );
            }
        }
        WorkerMessage::Error { request_id, error } => {
            if !shared
                .correlator
                .complete(&request_id, Err(BridgeError::Worker(error)))
            {
                tracing::debug!(
                    target: "graphlet::protocol",
                    %request_id,
                    "Discarding terminal failure with no pending request"
                );
            }
        }
    }
}

/// Race the startup deadline against the worker's `ready` message.
pub(crate) async fn await_ready(
    shared: &Shared,
    worker: &mut SpawnedWorker,
    ready_rx: oneshot::Receiver<()>,
) -> Result<(), BridgeError> {
    match tokio::time::timeout(shared.config.startup_timeout, ready_rx).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => {
            // Reader ended without ready: the worker died during startup.
            let code = worker.child.wait().await.ok().and_then(|s| s.code());
            Err(BridgeError::WorkerExit { code })
        }
        Err(_) => {
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
            Err(BridgeError::StartupTimeout(shared.config.startup_timeout))
        }
    }
}

/// Release the stdin writer and drain I/O tasks for a dead worker.
pub(crate) async fn teardown(shared: &Shared, mut worker: SpawnedWorker) {
    shared.writer.lock().await.take();
    worker.drain_io().await;
}

/// Reject everything outstanding and settle into the stopped state.
pub(crate) fn finalize_stopped(shared: &Shared) {
    shared.correlator.fail_all(BridgeError::ShutdownInProgress);
    shared.set_state(LifecycleState::Stopped);
}

/// Fire the graceful `stop` frame, best effort.
///
/// No correlator entry: the acknowledgment is the process exiting, and a
/// pending entry here would make that orderly exit look like a crash.
pub(crate) async fn send_stop(shared: &Shared) {
    let frame = WorkerRequest::new("stop", Uuid::new_v4().to_string());
    let write = async {
        match shared.writer.lock().await.as_mut() {
            Some(writer) => writer.send(frame).await,
            None => Ok(()),
        }
    };
    match tokio::time::timeout(shared.config.stop_timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(target: "graphlet::protocol", error = %e, "Stop frame not written");
        }
        Err(_) => {
            tracing::debug!(target: "graphlet::protocol", "Stop frame write timed out");
        }
    }
}

/// Graceful-then-forceful shutdown of a live worker.
pub(crate) async fn shutdown_worker(shared: &Shared, mut worker: SpawnedWorker) {
    // Closing stdin is the worker's cue to exit even if it missed the
    // stop frame. A sender stalled on a full pipe may be holding the
    // lock; skip the cue rather than wait behind it.
    if let Ok(mut guard) = shared.writer.try_lock() {
        guard.take();
    }

    let grace = shared.config.kill_grace;
    match tokio::time::timeout(grace, worker.child.wait()).await {
        Ok(status) => {
            tracing::debug!(?status, "Worker exited within the grace period");
        }
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "Worker ignored shutdown; killing");
            let _ = worker.child.kill().await;
        }
    }
    // The child is gone, so its end of the pipe is closed and any write
    // stalled against it has errored out and released the lock.
    shared.writer.lock().await.take();
    worker.drain_io().await;
    finalize_stopped(shared);
}

/// Write a request frame and wait for its terminal response.
pub(crate) async fn send_request(
    shared: &Arc<Shared>,
    operation: &str,
    payload: Map<String, serde_json::Value>,
    timeout: Duration,
) -> RequestOutcome {
    if *shared.state.borrow() != LifecycleState::Running {
        return Err(BridgeError::NotReady);
    }

    let (id, rx) = shared.correlator.register();
    let frame = WorkerRequest::with_payload(operation, id.clone(), payload);

    {
        let mut guard = shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            shared.correlator.discard(&id);
            return Err(BridgeError::NotReady);
        };
        // The flush itself is bounded by the caller's deadline: a worker
        // that stops draining stdin must not pin this caller (or the
        // writer lock) past it.
        match tokio::time::timeout(timeout, writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shared.correlator.discard(&id);
                return Err(BridgeError::TransportWrite(e.to_string()));
            }
            Err(_) => {
                // The frame is half-written; drop the writer so later
                // callers fail fast instead of inheriting a corrupt
                // stream.
                guard.take();
                shared.correlator.discard(&id);
                return Err(BridgeError::TransportWrite(format!(
                    "request frame not flushed within {timeout:?}"
                )));
            }
        }
    }

    shared.correlator.wait(&id, rx, timeout).await
}

enum WorkerEnd {
    Shutdown,
    Exited(Option<i32>),
}

/// Own the worker process: watch for exit, restart within budget, honor
/// the shutdown signal. One monitor runs per successful `start()`.
pub(crate) async fn monitor(shared: Arc<Shared>, mut worker: SpawnedWorker) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut attempts: u32 = 0;

    loop {
        let end = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => WorkerEnd::Shutdown,
            status = worker.child.wait() => {
                WorkerEnd::Exited(status.ok().and_then(|s| s.code()))
            }
        };

        let code = match end {
            WorkerEnd::Shutdown => {
                shutdown_worker(&shared, worker).await;
                return;
            }
            WorkerEnd::Exited(code) => code,
        };

        // Drain the reader first so terminals the worker flushed before
        // dying still resolve their callers.
        shared.writer.lock().await.take();
        worker.drain_io().await;

        let clean = code == Some(0) && shared.correlator.is_empty();
        shared.emit(BridgeEvent::WorkerExit { code, clean });

        if clean {
            tracing::info!("Worker exited cleanly");
            shared.set_state(LifecycleState::Stopped);
            return;
        }

        tracing::warn!(
            ?code,
            pending = shared.correlator.len(),
            "Worker exited unexpectedly"
        );
        shared.correlator.fail_all(BridgeError::WorkerExit { code });

        // Restart within the budget. A respawn that fails or misses the
        // readiness deadline burns an attempt; only `ready` resets it.
        worker = loop {
            attempts += 1;
            if attempts > shared.config.max_restarts {
                let exhausted = shared.config.max_restarts;
                tracing::error!(attempts = exhausted, "Restart budget exhausted");
                shared.emit(BridgeEvent::FatalExit {
                    attempts: exhausted,
                });
                shared.set_state(LifecycleState::FatallyStopped);
                return;
            }

            let delay = shared.config.backoff_base * 2u32.pow(attempts);
            shared.set_state(LifecycleState::Restarting);
            shared.emit(BridgeEvent::Restarting {
                attempt: attempts,
                delay,
            });
            tracing::info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Scheduling restart");

            let interrupted = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                finalize_stopped(&shared);
                return;
            }

            match spawn_worker(&shared).await {
                Ok((mut fresh, ready_rx)) => {
                    shared.set_state(LifecycleState::AwaitingReady);
                    // Shutdown must preempt the readiness deadline here
                    // just as it does on first start.
                    let readiness = tokio::select! {
                        _ = shutdown_rx.wait_for(|stop| *stop) => None,
                        res = await_ready(&shared, &mut fresh, ready_rx) => Some(res),
                    };
                    match readiness {
                        None => {
                            shutdown_worker(&shared, fresh).await;
                            return;
                        }
                        Some(Ok(())) => {
                            attempts = 0;
                            shared.set_state(LifecycleState::Running);
                            tracing::info!("Worker restarted and ready");
                            break fresh;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, attempt = attempts, "Restart attempt failed");
                            teardown(&shared, fresh).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempts, "Respawn failed");
                }
            }
        };

        if *shutdown_rx.borrow() {
            shutdown_worker(&shared, worker).await;
            return;
        }
    }
}
