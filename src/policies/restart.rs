//! # Restart policies for runners.
//!
//! [`RestartPolicy`] determines whether a workload is spawned again after an attempt ends.
//!
//! - [`RestartPolicy::Once`] the workload runs exactly once; its outcome is the outcome of `run`.
//! - [`RestartPolicy::UntilSuccess`] failed attempts are retried; the first clean exit ends `run`.
//! - [`RestartPolicy::Forever`] the workload is respawned after every exit until `stop` (default).
//!
//! ## Choosing the right policy
//! ```text
//! RestartPolicy::Once          → bring-up step, result matters
//! RestartPolicy::UntilSuccess  → bring-up step that may race a dependency
//! RestartPolicy::Forever       → long-running service
//! ```
//!
//! `stop` always wins: whatever the policy, a stop request ends `run` successfully
//! once the child is torn down.

/// Policy controlling whether a workload is respawned after an attempt ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Run exactly once and return the child's outcome.
    Once,
    /// Respawn after failures; return success on the first exit code 0.
    UntilSuccess,
    /// Respawn indefinitely until `stop`.
    #[default]
    Forever,
}

/// What the lifecycle driver does after an attempt ended on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// `run` returns with the attempt's outcome.
    Finish,
    /// Sleep for the restart interval, then spawn again.
    Restart,
}

impl RestartPolicy {
    /// Decides the next step given whether the last attempt succeeded.
    pub fn decide(&self, succeeded: bool) -> Decision {
        match (self, succeeded) {
            (RestartPolicy::Once, _) => Decision::Finish,
            (RestartPolicy::UntilSuccess, true) => Decision::Finish,
            (RestartPolicy::UntilSuccess, false) => Decision::Restart,
            (RestartPolicy::Forever, _) => Decision::Restart,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RestartPolicy::Once => "once",
            RestartPolicy::UntilSuccess => "until_success",
            RestartPolicy::Forever => "forever",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_always_finishes() {
        assert_eq!(RestartPolicy::Once.decide(true), Decision::Finish);
        assert_eq!(RestartPolicy::Once.decide(false), Decision::Finish);
    }

    #[test]
    fn until_success_retries_failures_only() {
        assert_eq!(RestartPolicy::UntilSuccess.decide(true), Decision::Finish);
        assert_eq!(RestartPolicy::UntilSuccess.decide(false), Decision::Restart);
    }

    #[test]
    fn forever_always_restarts() {
        assert_eq!(RestartPolicy::Forever.decide(true), Decision::Restart);
        assert_eq!(RestartPolicy::Forever.decide(false), Decision::Restart);
        assert_eq!(RestartPolicy::default(), RestartPolicy::Forever);
    }
}
