//! Line-oriented JSON wire layer: framing codec and message types.

pub mod codec;
pub mod protocol;

pub use codec::{Decoded, NdJsonCodec};
pub use protocol::{READY_REQUEST_ID, WorkerMessage, WorkerRequest};
