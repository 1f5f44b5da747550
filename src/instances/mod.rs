//! Instance pool: process handles, the registry, and output aggregation.
//!
//! Each instance wraps one interactive `q chat` child process. The registry
//! owns the id → instance map and serializes structural changes; a per
//! instance monitor task turns the child's raw output lines into complete
//! replies on the instance's output queue.

pub mod instance;
pub mod manager;
mod monitor;
pub mod process;

pub use instance::{CompleteReply, Instance, InstanceSnapshot, InstanceStatus, OutputQueue};
pub use manager::{CleanupFailure, CleanupReport, InstanceManager};
