//! Reconciliation loop primitives.
//!
//! This library provides helpers for loops that reconcile two independent
//! sources of truth (what was requested from one system against what a second
//! system reports). Key concepts:
//!
//! - **Partition**: every observed item lands in exactly one bucket.
//! - **Retry budget**: a single decrementing integer bounds a retry loop.
//! - **Retry rounds**: successive failures trigger a fixed backoff, a bounded
//!   number of times, before the caller gives up.
//! - **Poll schedule**: observe at a fixed interval until converged or until
//!   a deadline passes, then stop.
//!
//! # Invariants
//!
//! - A partition never drops or duplicates an input item
//! - Budgets only ever decrease
//! - A poll schedule performs at least one observation and stops on the first
//!   terminal condition it sees

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Convergence status for a set of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Every resource reached the desired state.
    Converged,

    /// Some resources have not reached the desired state yet.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the resources have converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

// =============================================================================
// Partition
// =============================================================================

/// Items split into the ones that satisfied a predicate and the ones that did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<T> {
    /// Items for which the predicate held, in input order.
    pub matched: Vec<T>,

    /// Items for which it did not, in input order.
    pub unmatched: Vec<T>,
}

impl<T> Partition<T> {
    /// Split `items` by `is_match`.
    pub fn split<I, F>(items: I, is_match: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: Fn(&T) -> bool,
    {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();

        for item in items {
            if is_match(&item) {
                matched.push(item);
            } else {
                unmatched.push(item);
            }
        }

        Self { matched, unmatched }
    }

    /// Total number of items across both buckets.
    pub fn len(&self) -> usize {
        self.matched.len() + self.unmatched.len()
    }

    /// Returns true if both buckets are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converged once nothing is left unmatched.
    pub fn status(&self) -> ConvergenceStatus {
        if self.unmatched.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

// =============================================================================
// Retry budget
// =============================================================================

/// A bounded number of attempts for an iterative retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    total: u32,
    remaining: u32,
}

impl RetryBudget {
    /// Create a budget allowing `total` attempts.
    pub fn new(total: u32) -> Self {
        Self {
            total,
            remaining: total,
        }
    }

    /// Take one attempt from the budget.
    ///
    /// Returns false if the budget was already empty.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Number of attempts taken so far (1-based once the first is consumed).
    pub fn attempt(&self) -> u32 {
        self.total - self.remaining
    }

    /// Attempts left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// The size the budget started with.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Returns true if no attempts are left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

// =============================================================================
// Retry rounds
// =============================================================================

/// What the caller should do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Keep going immediately.
    Continue,

    /// Sleep for the given duration, then keep going.
    Backoff(Duration),

    /// All rounds are used up; surface the accumulated errors.
    Exhausted,
}

/// Tracks successive failures and the bounded backoff rounds they trigger.
///
/// When `ceiling` failures happen in a row the caller backs off for `delay`
/// and the successive counter resets, consuming one of `max_rounds` rounds.
/// Hitting the ceiling again with no rounds left is terminal.
#[derive(Debug, Clone)]
pub struct RetryRounds {
    ceiling: u32,
    max_rounds: u32,
    delay: Duration,
    successive: u32,
    rounds_used: u32,
}

impl RetryRounds {
    /// Create a tracker.
    pub fn new(ceiling: u32, max_rounds: u32, delay: Duration) -> Self {
        Self {
            ceiling: ceiling.max(1),
            max_rounds,
            delay,
            successive: 0,
            rounds_used: 0,
        }
    }

    /// Record a failure and decide what happens next.
    pub fn record_failure(&mut self) -> FailureVerdict {
        self.successive += 1;
        if self.successive < self.ceiling {
            return FailureVerdict::Continue;
        }

        match self.start_next_round() {
            Some(delay) => FailureVerdict::Backoff(delay),
            None => FailureVerdict::Exhausted,
        }
    }

    /// Consume one round outright, returning the delay to wait before it.
    ///
    /// Used by queue-based callers that batch failures into passes instead
    /// of counting them one by one. Returns `None` once no rounds are left.
    pub fn start_next_round(&mut self) -> Option<Duration> {
        if self.rounds_used >= self.max_rounds {
            return None;
        }
        self.rounds_used += 1;
        self.successive = 0;
        Some(self.delay)
    }

    /// Record a success, clearing the successive-failure streak.
    pub fn record_success(&mut self) {
        self.successive = 0;
    }

    /// Failures since the last success or backoff.
    pub fn successive_failures(&self) -> u32 {
        self.successive
    }

    /// Backoff rounds consumed so far.
    pub fn rounds_used(&self) -> u32 {
        self.rounds_used
    }
}

// =============================================================================
// Poll schedule
// =============================================================================

/// One observation made by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// The terminal condition holds; stop polling.
    Converged(T),

    /// Not there yet; keep polling until the deadline.
    Pending(T),
}

/// Result of running a [`PollSchedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome<T> {
    /// The last observation's value.
    pub value: T,

    /// Whether the last observation was terminal (as opposed to timing out).
    pub status: ConvergenceStatus,

    /// Number of observations made.
    pub polls: u32,
}

/// Fixed-interval polling bounded by a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Time between observations. The first observation happens one interval
    /// after the schedule starts.
    pub interval: Duration,

    /// Observations stop once this much time has elapsed.
    pub timeout: Duration,
}

impl PollSchedule {
    /// Create a schedule.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Observe repeatedly until converged or timed out.
    ///
    /// The timer is owned by this future and dropped on return, so nothing
    /// fires after the terminal condition. Within one tick the convergence
    /// check runs before the deadline check: an observation that converges
    /// exactly at the deadline counts as converged.
    pub async fn run<T, F, Fut>(&self, mut observe: F) -> PollOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Observation<T>>,
    {
        let period = self.interval.max(Duration::from_millis(1));
        let start = Instant::now();
        let mut ticker = tokio::time::interval_at(start + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut polls = 0u32;
        loop {
            ticker.tick().await;
            polls += 1;

            match observe().await {
                Observation::Converged(value) => {
                    return PollOutcome {
                        value,
                        status: ConvergenceStatus::Converged,
                        polls,
                    };
                }
                Observation::Pending(value) => {
                    if start.elapsed() >= self.timeout {
                        return PollOutcome {
                            value,
                            status: ConvergenceStatus::Converging,
                            polls,
                        };
                    }
                }
            }
        }
    }
}

/// Default registration poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default registration timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);
