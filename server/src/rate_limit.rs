//! Per-session flood control: a sliding one-second counter per opcode plus
//! the deployment-configured enforcement policy applied when a counter
//! exceeds its budget.

use crate::opcode::Opcode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of a single rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    OverBudget,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    second: u64,
    count: u32,
}

/// Per-opcode counters for one session. Entries appear lazily on first
/// observation of an opcode; each opcode's window resets independently when
/// the wall-clock second changes between two observations of it.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<Opcode, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one observation of `opcode` at `now_second` against `budget`.
    /// A budget of 0 means the opcode is never throttled.
    pub fn check(&mut self, opcode: Opcode, budget: u32, now_second: u64) -> RateDecision {
        if budget == 0 {
            return RateDecision::Allowed;
        }

        let window = self.windows.entry(opcode).or_insert(Window {
            second: now_second,
            count: 0,
        });

        if window.second != now_second {
            window.second = now_second;
            window.count = 0;
        }

        window.count += 1;
        if window.count > budget {
            RateDecision::OverBudget
        } else {
            RateDecision::Allowed
        }
    }

    /// Number of opcodes observed so far (test/diagnostic aid).
    pub fn tracked_opcodes(&self) -> usize {
        self.windows.len()
    }
}

/// Whose record a flood ban is written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanScope {
    Account,
    Address,
}

/// Deployment-configured response to a session exceeding an opcode budget.
/// Every policy drops the offending packet; only `Log` keeps accepting
/// further packets from the session afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitPolicy {
    /// Record the violation and carry on.
    Log,
    /// Close the connection; teardown follows the normal path.
    Disconnect,
    /// Write a timed ban through the account store, then disconnect.
    Ban { scope: BanScope, seconds: u64 },
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        RateLimitPolicy::Log
    }
}
