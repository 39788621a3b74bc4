//! Back-off policies for spin loops.
//!
//! A policy decides what a contending thread does after its Nth failed
//! acquisition attempt. Stages escalate strictly by attempt index: a CPU
//! pause while the holder is likely still on-core, a scheduler yield once
//! that stops paying off, and finally a 1 ms sleep for the case where the
//! holder itself has been descheduled. There is no adaptive measurement.

use std::thread;
use std::time::Duration;

/// Duration of one sleep-stage nap.
const SLEEP_QUANTUM: Duration = Duration::from_millis(1);

/// Which stage of the escalation ladder an attempt index falls into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// CPU pause hint (an SMT-friendly no-op on architectures without one).
    Pause,
    /// Yield the current timeslice to the scheduler.
    Yield,
    /// Sleep for [`SLEEP_QUANTUM`].
    Sleep,
}

/// A back-off discipline applied between failed lock attempts.
///
/// `backoff` receives the zero-based attempt index and returns whether
/// further spinning is worthwhile. Built-in policies never give up; the
/// return value exists so a caller-provided policy can report exhaustion.
pub trait SpinPolicy {
    fn backoff(attempt: usize) -> bool;
}

/// The default staged policy: `PAUSE` pause-stage attempts, then `YIELD`
/// yield-stage attempts, then sleeping forever after.
///
/// Defaults match short critical sections guarded by a handful of
/// instructions: 125 pauses keep the contender local while the holder
/// finishes, 250 yields hand the core over once it has not, and the sleep
/// stage caps the cost of contending with a blocked holder.
pub struct Staged<const PAUSE: usize = 125, const YIELD: usize = 250>;

impl<const PAUSE: usize, const YIELD: usize> Staged<PAUSE, YIELD> {
    /// Classify an attempt index into its escalation stage.
    #[inline]
    pub const fn stage(attempt: usize) -> Stage {
        if attempt < PAUSE {
            Stage::Pause
        } else if attempt < PAUSE + YIELD {
            Stage::Yield
        } else {
            Stage::Sleep
        }
    }
}

impl<const PAUSE: usize, const YIELD: usize> SpinPolicy for Staged<PAUSE, YIELD> {
    #[inline]
    fn backoff(attempt: usize) -> bool {
        match Self::stage(attempt) {
            Stage::Pause => std::hint::spin_loop(),
            Stage::Yield => thread::yield_now(),
            Stage::Sleep => thread::sleep(SLEEP_QUANTUM),
        }
        true
    }
}

/// A policy that performs no back-off at all.
///
/// Contenders re-attempt immediately; returns false to signal that the
/// policy has nothing further to offer.
pub struct NoBackoff;

impl SpinPolicy for NoBackoff {
    #[inline]
    fn backoff(_attempt: usize) -> bool {
        false
    }
}
