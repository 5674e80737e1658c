//! ISR safety envelope (§4.F.1): `isr_enter`/`isr_exit`, nesting bound,
//! duration metrics, and the stack-canary check.

use isanic_core::tick::elapsed;

/// Hard ceiling on interrupt-handler nesting. The envelope refuses a
/// fourth nested entry rather than let the stack grow unbounded.
pub const MAX_ISR_NESTING: u8 = 3;

/// Soft deadline, in microseconds, for one interrupt-context dispatch.
/// Exceeding it does not fail the call; it raises [`IsrError::Slow`] as a
/// non-fatal warning the foreground can act on later.
pub const ISR_SLOW_THRESHOLD_US: u32 = 100;

/// Canary value planted at a known stack offset on entry and checked on
/// exit.
pub const STACK_CANARY: u16 = 0xDEAD;

/// Errors and warnings the envelope can report. Only [`IsrError::Reentrant`]
/// and [`IsrError::StackOverflow`] are fatal to the call; [`IsrError::Slow`]
/// is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrError {
    /// Nesting would exceed [`MAX_ISR_NESTING`]; the envelope refused to
    /// proceed to the driver dispatch.
    Reentrant,
    /// The call completed, but its duration exceeded
    /// [`ISR_SLOW_THRESHOLD_US`].
    Slow,
    /// The stack canary did not match on exit.
    StackOverflow,
}

impl core::fmt::Display for IsrError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Reentrant => f.write_str("ISR nesting exceeds the envelope's bound"),
            Self::Slow => f.write_str("ISR dispatch exceeded the latency threshold"),
            Self::StackOverflow => f.write_str("ISR stack canary corrupted"),
        }
    }
}

/// Per-bridge ISR bookkeeping: nesting level, lock bit, lifetime count,
/// and duration metrics.
///
/// Invariants (§3 "Bridge instance", §8 property 6): the lock bit is set
/// on entry and cleared exactly when nesting returns to zero; nesting
/// never exceeds [`MAX_ISR_NESTING`]; if the lock bit is clear then
/// `nesting_level == 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsrState {
    locked: bool,
    nesting_level: u8,
    total_count: u32,
    last_duration_us: u32,
    max_duration_us: u32,
    canary: u16,
}

impl IsrState {
    /// A fresh, unentered state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: false,
            nesting_level: 0,
            total_count: 0,
            last_duration_us: 0,
            max_duration_us: 0,
            canary: STACK_CANARY,
        }
    }

    /// `true` while at least one interrupt-context call is in progress.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Current nesting depth (`0` outside any interrupt-context call).
    #[must_use]
    pub const fn nesting_level(&self) -> u8 {
        self.nesting_level
    }

    /// Lifetime count of interrupt-context entries.
    #[must_use]
    pub const fn total_count(&self) -> u32 {
        self.total_count
    }

    /// Duration, in microseconds, of the most recently completed call.
    #[must_use]
    pub const fn last_duration_us(&self) -> u32 {
        self.last_duration_us
    }

    /// Longest duration, in microseconds, observed across every call.
    #[must_use]
    pub const fn max_duration_us(&self) -> u32 {
        self.max_duration_us
    }

    /// Enters an interrupt-context call, returning the tick to pass back
    /// to [`IsrState::exit`].
    ///
    /// # Errors
    ///
    /// Returns [`IsrError::Reentrant`] without mutating nesting state if a
    /// fourth nested entry would be created; the caller must refuse to
    /// dispatch to the driver in that case.
    pub fn enter(&mut self, now: u32) -> Result<u32, IsrError> {
        if self.locked {
            if self.nesting_level >= MAX_ISR_NESTING {
                return Err(IsrError::Reentrant);
            }
            self.nesting_level += 1;
        } else {
            self.locked = true;
            self.nesting_level = 1;
            self.canary = STACK_CANARY;
        }
        self.total_count += 1;
        Ok(now)
    }

    /// Exits an interrupt-context call entered at `start_time`, observed at
    /// `now`. `canary_observed` is the value read back from the stack slot
    /// the entry planted [`STACK_CANARY`] into.
    ///
    /// Clears the lock bit exactly when nesting returns to zero.
    ///
    /// # Errors
    ///
    /// Returns [`IsrError::StackOverflow`] if `canary_observed` does not
    /// match (checked first, since a corrupted stack makes the duration
    /// metrics untrustworthy too); otherwise returns [`IsrError::Slow`] if
    /// the call ran longer than [`ISR_SLOW_THRESHOLD_US`].
    pub fn exit(&mut self, start_time: u32, now: u32, canary_observed: u16) -> Result<(), IsrError> {
        self.nesting_level = self.nesting_level.saturating_sub(1);
        if self.nesting_level == 0 {
            self.locked = false;
        }
        if canary_observed != STACK_CANARY {
            return Err(IsrError::StackOverflow);
        }
        let duration = elapsed(start_time, now);
        self.last_duration_us = duration;
        if duration > self.max_duration_us {
            self.max_duration_us = duration;
        }
        if duration > ISR_SLOW_THRESHOLD_US {
            return Err(IsrError::Slow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_locks_and_single_exit_unlocks() {
        let mut s = IsrState::new();
        let t = s.enter(0).unwrap();
        assert!(s.is_locked());
        assert_eq!(s.nesting_level(), 1);
        s.exit(t, 10, STACK_CANARY).unwrap();
        assert!(!s.is_locked());
        assert_eq!(s.nesting_level(), 0);
    }

    #[test]
    fn nesting_up_to_three_is_allowed() {
        let mut s = IsrState::new();
        s.enter(0).unwrap();
        s.enter(0).unwrap();
        s.enter(0).unwrap();
        assert_eq!(s.nesting_level(), 3);
    }

    #[test]
    fn fourth_nested_entry_is_refused() {
        let mut s = IsrState::new();
        s.enter(0).unwrap();
        s.enter(0).unwrap();
        s.enter(0).unwrap();
        assert_eq!(s.enter(0), Err(IsrError::Reentrant));
        assert_eq!(s.nesting_level(), 3);
    }

    #[test]
    fn lock_clears_only_on_outermost_exit() {
        let mut s = IsrState::new();
        let t1 = s.enter(0).unwrap();
        let t2 = s.enter(0).unwrap();
        s.exit(t2, 5, STACK_CANARY).unwrap();
        assert!(s.is_locked());
        s.exit(t1, 10, STACK_CANARY).unwrap();
        assert!(!s.is_locked());
    }

    #[test]
    fn slow_duration_is_reported_but_not_fatal() {
        let mut s = IsrState::new();
        let t = s.enter(0).unwrap();
        let result = s.exit(t, 150, STACK_CANARY);
        assert_eq!(result, Err(IsrError::Slow));
        assert_eq!(s.last_duration_us(), 150);
        assert!(s.max_duration_us() >= 150);
        assert!(!s.is_locked());
    }

    #[test]
    fn duration_handles_tick_wraparound() {
        let mut s = IsrState::new();
        let t = s.enter(u32::MAX - 10).unwrap();
        s.exit(t, 5, STACK_CANARY).unwrap();
        assert_eq!(s.last_duration_us(), 16);
    }

    #[test]
    fn corrupted_canary_reports_stack_overflow() {
        let mut s = IsrState::new();
        let t = s.enter(0).unwrap();
        assert_eq!(s.exit(t, 10, 0xBEEF), Err(IsrError::StackOverflow));
    }

    #[test]
    fn max_duration_tracks_the_longest_call() {
        let mut s = IsrState::new();
        let t1 = s.enter(0).unwrap();
        let _ = s.exit(t1, 50, STACK_CANARY);
        let t2 = s.enter(0).unwrap();
        let _ = s.exit(t2, 30, STACK_CANARY);
        assert_eq!(s.max_duration_us(), 50);
        assert_eq!(s.last_duration_us(), 30);
    }
}
