//! Wall-clock budget helpers for a run.

use std::time::{Duration, Instant};

/// Time left before `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// True when a deadline is set and has passed.
pub fn budget_exhausted(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| remaining_budget(d).is_none())
}
