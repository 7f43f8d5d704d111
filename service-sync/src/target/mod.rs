//! Target role: receive pairs from controllers and apply them locally.

mod receiver;
mod server;

pub use receiver::{ApplyOutcome, ReceiverResponse, SyncReceiver};
pub use server::{MAX_BODY_BYTES, TargetServer};
