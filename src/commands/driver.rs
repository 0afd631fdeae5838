use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CmdError;

/// Attempt budget for waiting on a handle. `max_attempts * interval` is the
/// effective deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Longest single wait, in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_interval_ms() -> u64 {
    500
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl LoopPolicy {
    pub fn new(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        self.interval()
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Waiting,
    Notified,
    Exhausted,
}

/// State machine behind the callback's wait loop. Each attempt is one
/// bounded suspension; the caller reports whether a terminal notification
/// arrived during it.
#[derive(Debug)]
pub struct PollDriver {
    policy: LoopPolicy,
    attempts: u32,
    state: LoopState,
}

impl PollDriver {
    pub fn new(policy: LoopPolicy) -> Self {
        let state = if policy.max_attempts == 0 {
            LoopState::Exhausted
        } else {
            LoopState::Waiting
        };
        Self {
            policy,
            attempts: 0,
            state,
        }
    }

    /// Record the result of one attempt and return the new state.
    /// Terminal states absorb further reports.
    pub fn advance(&mut self, notified: bool) -> LoopState {
        if self.state != LoopState::Waiting {
            return self.state;
        }
        if notified {
            self.state = LoopState::Notified;
        } else {
            self.attempts += 1;
            if self.attempts >= self.policy.max_attempts {
                self.state = LoopState::Exhausted;
            }
        }
        self.state
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    /// The error to surface once the budget is spent.
    pub fn timeout_error(&self) -> CmdError {
        CmdError::LockTimeout {
            attempts: self.attempts,
            waited: self
                .policy
                .interval()
                .checked_mul(self.attempts)
                .unwrap_or(Duration::MAX),
        }
    }
}
