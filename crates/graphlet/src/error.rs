//! Error taxonomy for the worker bridge.

use std::time::Duration;

/// Errors surfaced by the bridge to callers and the owning application.
///
/// Variants carry owned strings rather than source errors so a single
/// failure can be cloned out to every waiter during bulk rejection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker did not send `ready` before the startup deadline.
    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// A write to the worker's stdin was rejected. The message was not
    /// delivered; the transport never retries on its own.
    #[error("failed to write to worker stdin: {0}")]
    TransportWrite(String),

    /// A line from the worker could not be parsed as a known message.
    #[error("malformed message from worker: {0}")]
    MalformedMessage(String),

    /// No terminal response arrived before the per-request deadline.
    /// Work already dispatched into the worker is not cancelled.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The worker answered with a terminal `error` message.
    #[error("worker reported failure: {0}")]
    Worker(String),

    /// The worker process exited while the request was in flight.
    #[error("worker exited{}", exit_code_suffix(.code))]
    WorkerExit { code: Option<i32> },

    /// The worker kept crashing and the restart budget ran out.
    #[error("worker restart budget exhausted after {attempts} attempts")]
    RestartBudgetExhausted { attempts: u32 },

    /// The bridge is shutting down; the request was rejected unresolved.
    #[error("bridge is shutting down")]
    ShutdownInProgress,

    /// `start()` was called while a worker is already live.
    #[error("bridge already started")]
    AlreadyStarted,

    /// `send()` was called before the worker reached the running state.
    #[error("worker is not ready")]
    NotReady,
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with code {c}"),
        None => " on a signal".to_string(),
    }
}

impl BridgeError {
    /// Whether this error ends the bridge rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RestartBudgetExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_exit_display() {
        let e = BridgeError::WorkerExit { code: Some(1) };
        assert_eq!(e.to_string(), "worker exited with code 1");

        let e = BridgeError::WorkerExit { code: None };
        assert_eq!(e.to_string(), "worker exited on a signal");
    }

    #[test]
    fn only_budget_exhaustion_is_fatal() {
        assert!(BridgeError::RestartBudgetExhausted { attempts: 3 }.is_fatal());
        assert!(!BridgeError::RequestTimeout(Duration::from_secs(5)).is_fatal());
        assert!(!BridgeError::WorkerExit { code: Some(1) }.is_fatal());
    }
}
