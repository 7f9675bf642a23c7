//! Boot shim for the Incus VM agent.
//!
//! Waits for the hypervisor's virtio-serial port and config drive, stages
//! the agent's TLS material from the drive into a runtime directory, then
//! execs `incus-agent` in place of itself. Restarts skip the drive entirely
//! once the runtime directory holds the full certificate set.

pub mod config;
pub mod error;
pub mod guard;
pub mod handoff;
pub mod orchestrator;
pub mod volume;
pub mod waiter;

pub use error::{WrapperError, WrapperResult};
pub use orchestrator::Orchestrator;
