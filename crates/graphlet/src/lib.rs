//! graphlet: supervises a long-lived analysis worker subprocess and
//! multiplexes many logical request/response streams over its stdio.
//!
//! The worker speaks one UTF-8 JSON object per line on stdin/stdout;
//! stderr is diagnostic text. The bridge correlates terminal responses to
//! callers by request id, fans streaming events out to subscribers, and
//! recovers from worker crashes with bounded, backoff-governed restarts.
//!
//! ```no_run
//! use std::time::Duration;
//! use graphlet::{Bridge, BridgeConfig};
//!
//! # async fn example() -> Result<(), graphlet::BridgeError> {
//! let bridge = Bridge::new(BridgeConfig::command("python3", ["worker.py"]));
//! bridge.start().await?;
//!
//! let mut events = bridge.subscribe();
//! let payload = serde_json::Map::new();
//! let result = bridge.send("analyze", payload, Duration::from_secs(120)).await?;
//! # let _ = (events.recv().await, result);
//!
//! bridge.stop().await?;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod correlator;
mod error;
mod supervisor;
pub mod wire;

pub use bridge::{Bridge, BridgeEvent, LifecycleState};
pub use correlator::{Correlator, RequestOutcome};
pub use error::BridgeError;
pub use supervisor::{BridgeConfig, CommandSpawner, WorkerSpawner};
pub use wire::{WorkerMessage, WorkerRequest};
