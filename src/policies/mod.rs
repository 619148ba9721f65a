//! Restart policies.
//!
//! This module groups the knobs that control **if** a workload is respawned after
//! an attempt ends and **how long** the runner waits before the next spawn.
//!
//! ## Contents
//! - [`RestartPolicy`] when to respawn (once / until success / forever)
//!
//! ## Quick wiring
//! ```text
//! Options { restart: RestartPolicy, restart_interval: Duration, .. }
//!      └─► core::lifecycle::Lifecycle uses:
//!           - restart.decide(outcome) to return or back off
//!           - restart_interval as the fixed, cancellable backoff sleep
//! ```

mod restart;

pub use restart::{Decision, RestartPolicy};
