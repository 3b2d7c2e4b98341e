//! Bridge facade - the single addressable unit owning one worker process.
//!
//! Owners construct a [`Bridge`], `start()` it, pipeline `send()` calls
//! against it, subscribe to its event stream, and `stop()` it on the way
//! out. There is deliberately no process-wide default instance; the bridge
//! lives exactly as long as its owner keeps the handle.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::supervisor::{self, BridgeConfig, Shared};
use crate::wire::WorkerMessage;

/// Worker lifecycle, observable through [`Bridge::state_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    AwaitingReady,
    Running,
    Restarting,
    /// Restart budget exhausted; only a fresh `start()` leaves this state.
    FatallyStopped,
}

/// Out-of-band events broadcast to every subscriber.
///
/// Delivery order per subscriber follows emission order. The channel is
/// bounded: a subscriber that falls behind observes `Lagged` and skips
/// ahead rather than back-pressuring the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A non-terminal streaming message, re-emitted as received.
    Stream(WorkerMessage),
    /// A line that could not be parsed as a known message.
    Malformed { line: String, error: String },
    /// The worker process exited. `clean` means code 0 with no pending
    /// requests; anything else triggers the restart policy.
    WorkerExit { code: Option<i32>, clean: bool },
    /// A crash restart has been scheduled.
    Restarting { attempt: u32, delay: Duration },
    /// The restart budget is exhausted; the bridge is fatally stopped.
    FatalExit { attempts: u32 },
}

/// Supervises one worker subprocess and multiplexes request/response
/// streams over its stdio.
pub struct Bridge {
    shared: Arc<Shared>,
    start_lock: StdMutex<()>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (state, _) = watch::channel(LifecycleState::Stopped);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                correlator: Correlator::new(),
                events,
                state,
                writer: tokio::sync::Mutex::new(None),
                shutdown,
            }),
            start_lock: StdMutex::new(()),
            monitor: StdMutex::new(None),
        }
    }

    /// Spawn the worker and wait for it to become ready.
    ///
    /// Fails fast with [`BridgeError::AlreadyStarted`] if a worker is
    /// already live; a stopped (or fatally stopped) bridge may be started
    /// again. On [`BridgeError::StartupTimeout`] the child is killed and
    /// the caller may retry.
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let _guard = match self.start_lock.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let state = *self.shared.state.borrow();
            if !matches!(
                state,
                LifecycleState::Stopped | LifecycleState::FatallyStopped
            ) {
                return Err(BridgeError::AlreadyStarted);
            }
            // Clear the shutdown flag before the new state becomes
            // visible: a stop() racing this start() then always sets the
            // flag after the reset and is honored.
            self.shared.shutdown.send_replace(false);
            self.shared.set_state(LifecycleState::Starting);
        }

        // A previous monitor has already finished (state was Stopped);
        // make sure its task is reaped before a new one begins.
        let previous = self.take_monitor();
        if let Some(handle) = previous {
            let _ = handle.await;
        }

        let result = self.spawn_and_await_ready().await;
        if result.is_err() && *self.shared.state.borrow() != LifecycleState::Stopped {
            self.shared.set_state(LifecycleState::Stopped);
        }
        result
    }

    async fn spawn_and_await_ready(&self) -> Result<(), BridgeError> {
        let (mut worker, ready_rx) = supervisor::spawn_worker(&self.shared).await?;
        self.shared.set_state(LifecycleState::AwaitingReady);

        let mut shutdown_rx = self.shared.shutdown.subscribe();
        let readiness = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => None,
            res = supervisor::await_ready(&self.shared, &mut worker, ready_rx) => Some(res),
        };

        match readiness {
            None => {
                // stop() raced the startup; tear the child down now.
                supervisor::shutdown_worker(&self.shared, worker).await;
                Err(BridgeError::ShutdownInProgress)
            }
            Some(Ok(())) => {
                self.shared.set_state(LifecycleState::Running);
                let handle = tokio::spawn(supervisor::monitor(Arc::clone(&self.shared), worker));
                *self.lock_monitor() = Some(handle);
                Ok(())
            }
            Some(Err(e)) => {
                supervisor::teardown(&self.shared, worker).await;
                Err(e)
            }
        }
    }

    /// Send one request and wait for its terminal response.
    ///
    /// The bridge injects a fresh correlation id; the payload shape is
    /// opaque. Many sends may be in flight at once and responses arrive in
    /// whatever order the worker produces them. A timeout rejects this
    /// caller only - it cannot recall work already handed to the worker.
    pub async fn send(
        &self,
        operation: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        supervisor::send_request(&self.shared, operation, payload, timeout).await
    }

    /// Shut the worker down.
    ///
    /// Best-effort graceful `stop` request first, then force-kill once the
    /// grace period lapses. Every outstanding request is rejected with a
    /// shutdown error exactly once. Idempotent; a second call is a no-op.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let state = *self.shared.state.borrow();
        if matches!(
            state,
            LifecycleState::Stopped | LifecycleState::FatallyStopped
        ) {
            return Ok(());
        }

        if state == LifecycleState::Running {
            // The frame must be on the wire before the monitor starts
            // tearing the writer down, so this is written inline (bounded
            // by stop_timeout) rather than raced on a separate task.
            supervisor::send_stop(&self.shared).await;
        }

        self.shared.shutdown.send_replace(true);

        let handle = self.take_monitor();
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => {
                // No monitor: either start() is mid-flight (its shutdown
                // branch finalizes) or nothing ever spawned.
                let mid_start = matches!(
                    *self.shared.state.borrow(),
                    LifecycleState::Starting | LifecycleState::AwaitingReady
                );
                if mid_start {
                    let mut state_rx = self.shared.state.subscribe();
                    let _ = state_rx
                        .wait_for(|s| *s == LifecycleState::Stopped)
                        .await;
                } else {
                    supervisor::finalize_stopped(&self.shared);
                }
            }
        }
        Ok(())
    }

    /// Subscribe to the out-of-band event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions, e.g. to surface worker health in a UI.
    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// Number of requests currently awaiting a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.monitor.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_monitor(&self) -> Option<JoinHandle<()>> {
        self.lock_monitor().take()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Owners should stop() first; this is the backstop. Aborting the
        // monitor drops the Child, and kill_on_drop reaps the worker.
        if let Some(handle) = self.take_monitor() {
            handle.abort();
        }
    }
}
