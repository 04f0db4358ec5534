//! Worker registry — identity, capabilities, load, liveness.
//!
//! Core components:
//! - `model` — Worker entity and registration
//! - `registry` — capability matching and conditional worker updates
//! - `heartbeat` — liveness sweep feeding the recovery path

pub mod heartbeat;
pub mod model;
pub mod registry;

pub use heartbeat::spawn_heartbeat_monitor;
pub use model::{Worker, WorkerRegistration, WorkerStatus};
pub use registry::{WorkerRegistry, required_capabilities};
