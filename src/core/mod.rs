//! Runner core: the lifecycle driver shared by every backend.
//!
//! Internal modules:
//! - [`backend`]: the seam a backend implements (spawn one attempt, wait, signal, clean up);
//! - [`lifecycle`]: drives attempts with the restart policy, backoff and stop handling;
//! - [`shutdown`]: SIGTERM → grace window → SIGKILL escalation for one attempt;
//! - [`state`]: the runner state machine.
//!
//! ```text
//! idle ── run() ──▶ running ── exit & decide(Finish) ──▶ done
//!                     │  └─ exit & decide(Restart) ─▶ backoff ─▶ running
//!                     └── stop() ─▶ stopping ─▶ done
//! ```

mod backend;
mod lifecycle;
mod shutdown;
mod state;

pub use backend::{Attempt, Backend, ExitStatus};
pub use lifecycle::Lifecycle;
pub use state::RunState;
