//! Persistence, the three-predicate gate, and the report/validation cycle.

use isanic_core::tick::is_monotonic_or_wrapped;

use crate::record::DmaPolicyRecord;

const MAX_WRITE_ATTEMPTS: u8 = 3;
const FAILURE_STRIKE_LIMIT: u8 = 3;

/// Errors the policy engine's persistence path can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    /// The backing store rejected every write attempt; the record was
    /// stashed in the degraded fallback instead.
    PersistFailedDegraded,
}

/// The durable backing store for a policy record: a named binary blob
/// written atomically (temp file, then rename).
pub trait PolicyStore {
    /// Reads the stored record, if any. A missing file and an I/O error
    /// are both `None` — from the engine's point of view they are
    /// indistinguishable ("treat the record as absent").
    fn read(&mut self) -> Option<[u8; 16]>;
    /// Attempts one write-to-temp-then-rename cycle.
    fn try_write(&mut self, bytes: [u8; 16]) -> Result<(), ()>;
}

/// Degraded persistence used when every `PolicyStore` write attempt fails.
pub trait DegradedFallback {
    /// Stashes the record (e.g. in a named environment variable).
    fn stash(&mut self, bytes: [u8; 16]);
    /// Recalls a previously stashed record.
    fn recall(&mut self) -> Option<[u8; 16]>;
}

/// The delay between write retries. The resident core has no scheduler to
/// sleep on, so the real implementation spins a calibrated busy loop; tests
/// implement this as a no-op.
pub trait Backoff {
    /// Waits out the backoff for retry attempt number `attempt` (0-based).
    fn wait(&mut self, attempt: u8);
}

/// Loads the policy record for `current_signature`, discarding anything
/// that fails CRC or carries a stale hardware signature.
pub fn load(store: &mut impl PolicyStore, fallback: &mut impl DegradedFallback, current_signature: u32) -> DmaPolicyRecord {
    let bytes = store.read().or_else(|| fallback.recall());
    let mut record = bytes.and_then(|b| DmaPolicyRecord::decode(&b)).unwrap_or(DmaPolicyRecord::disabled(current_signature));
    if record.hw_signature != current_signature {
        record.validation_passed = false;
        record.last_known_safe = false;
        record.hw_signature = current_signature;
    }
    record
}

/// Persists `record`, retrying up to three times with caller-supplied
/// backoff before falling back to degraded (environment-variable) storage.
///
/// # Errors
///
/// Returns [`PolicyError::PersistFailedDegraded`] if every store attempt
/// failed (the record is still preserved, just not in the primary store).
pub fn persist(
    store: &mut impl PolicyStore,
    fallback: &mut impl DegradedFallback,
    backoff: &mut impl Backoff,
    record: &DmaPolicyRecord,
) -> Result<(), PolicyError> {
    let bytes = record.encode();
    for attempt in 0..MAX_WRITE_ATTEMPTS {
        if store.try_write(bytes).is_ok() {
            return Ok(());
        }
        backoff.wait(attempt);
    }
    fallback.stash(bytes);
    Err(PolicyError::PersistFailedDegraded)
}

/// `true` once all three predicates hold: DMA may be attempted.
#[must_use]
pub const fn dma_permitted(record: &DmaPolicyRecord) -> bool {
    record.runtime_enable && record.validation_passed && record.last_known_safe
}

/// Running TX/RX/bounce/violation counters checked for monotonicity after
/// a validation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationCounters {
    /// Transmit completions observed.
    pub tx: u32,
    /// Receive completions observed.
    pub rx: u32,
    /// Bounce-buffer copies performed.
    pub bounce: u32,
    /// Coherency or ring violations observed.
    pub violations: u32,
}

/// `true` if every counter in `next` is non-decreasing (modulo 2^32, with
/// wraparound tolerance) relative to `prev`.
#[must_use]
pub fn counters_monotonic(prev: ValidationCounters, next: ValidationCounters) -> bool {
    is_monotonic_or_wrapped(prev.tx, next.tx)
        && is_monotonic_or_wrapped(prev.rx, next.rx)
        && is_monotonic_or_wrapped(prev.bounce, next.bounce)
        && is_monotonic_or_wrapped(prev.violations, next.violations)
}

/// Applies one validation cycle's outcome. `self_test_passed` is the
/// bus-master self-test result; `counters_ok` is the result of
/// [`counters_monotonic`]. A non-monotonic observation forces
/// `validation_passed` false regardless of the self-test result.
pub fn run_validation(record: &mut DmaPolicyRecord, self_test_passed: bool, counters_ok: bool) {
    record.validation_passed = self_test_passed && counters_ok;
    if record.validation_passed {
        record.last_known_safe = true;
        record.failure_count = 0;
    }
}

/// Feeds one DMA completion result into the three-strike rule.
///
/// A success resets the consecutive-failure counter. A failure increments
/// it; on the third consecutive failure, both `runtime_enable` and
/// `last_known_safe` are cleared (the caller is expected to persist the
/// record and fall back to PIO immediately after).
pub fn report_result(record: &mut DmaPolicyRecord, success: bool) {
    if success {
        record.failure_count = 0;
        return;
    }
    record.failure_count = record.failure_count.saturating_add(1);
    if record.failure_count >= FAILURE_STRIKE_LIMIT {
        record.runtime_enable = false;
        record.last_known_safe = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemStore {
        contents: Option<[u8; 16]>,
        fail_writes: bool,
    }
    impl PolicyStore for MemStore {
        fn read(&mut self) -> Option<[u8; 16]> {
            self.contents
        }
        fn try_write(&mut self, bytes: [u8; 16]) -> Result<(), ()> {
            if self.fail_writes {
                return Err(());
            }
            self.contents = Some(bytes);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemFallback {
        stashed: Option<[u8; 16]>,
    }
    impl DegradedFallback for MemFallback {
        fn stash(&mut self, bytes: [u8; 16]) {
            self.stashed = Some(bytes);
        }
        fn recall(&mut self) -> Option<[u8; 16]> {
            self.stashed
        }
    }

    struct NoWait;
    impl Backoff for NoWait {
        fn wait(&mut self, _attempt: u8) {}
    }

    fn enabled_safe_record(sig: u32) -> DmaPolicyRecord {
        DmaPolicyRecord {
            runtime_enable: true,
            validation_passed: true,
            last_known_safe: true,
            failure_count: 0,
            hw_signature: sig,
            cache_tier: 1,
            vds: false,
            ems: false,
            xms: false,
        }
    }

    #[test]
    fn corrupted_record_loads_as_fully_disabled() {
        let mut store = MemStore { contents: None, fail_writes: false };
        let mut fallback = MemFallback::default();
        let record = load(&mut store, &mut fallback, 42);
        assert!(!record.runtime_enable);
        assert!(!record.validation_passed);
        assert!(!record.last_known_safe);
    }

    #[test]
    fn corrupted_first_data_byte_is_treated_as_absent() {
        let mut bytes = enabled_safe_record(42).encode();
        bytes[4] ^= 0xFF;
        let mut store = MemStore { contents: Some(bytes), fail_writes: false };
        let mut fallback = MemFallback::default();
        let record = load(&mut store, &mut fallback, 42);
        assert!(!record.runtime_enable);
        assert!(!record.validation_passed);
        assert!(!record.last_known_safe);
    }

    #[test]
    fn stale_hardware_signature_clears_validation_and_safety() {
        let bytes = enabled_safe_record(42).encode();
        let mut store = MemStore { contents: Some(bytes), fail_writes: false };
        let mut fallback = MemFallback::default();
        let record = load(&mut store, &mut fallback, 99);
        assert!(record.runtime_enable);
        assert!(!record.validation_passed);
        assert!(!record.last_known_safe);
        assert_eq!(record.hw_signature, 99);
    }

    #[test]
    fn three_strike_demotion_clears_enable_and_safety() {
        let mut record = enabled_safe_record(1);
        report_result(&mut record, false);
        assert!(record.runtime_enable);
        report_result(&mut record, false);
        assert!(record.runtime_enable);
        report_result(&mut record, false);
        assert!(!record.runtime_enable);
        assert!(!record.last_known_safe);
        assert_eq!(record.failure_count, 3);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut record = enabled_safe_record(1);
        report_result(&mut record, false);
        report_result(&mut record, false);
        report_result(&mut record, true);
        assert_eq!(record.failure_count, 0);
        report_result(&mut record, false);
        report_result(&mut record, false);
        assert!(record.runtime_enable);
    }

    #[test]
    fn non_monotonic_counters_fail_validation_even_if_self_test_passed() {
        let mut record = enabled_safe_record(1);
        let prev = ValidationCounters { tx: 100, ..Default::default() };
        let next = ValidationCounters { tx: 50, ..Default::default() };
        let ok = counters_monotonic(prev, next);
        run_validation(&mut record, true, ok);
        assert!(!record.validation_passed);
    }

    #[test]
    fn first_passing_validation_sets_last_known_safe() {
        let mut record = DmaPolicyRecord::disabled(1);
        record.runtime_enable = true;
        run_validation(&mut record, true, true);
        assert!(record.validation_passed);
        assert!(record.last_known_safe);
        assert!(dma_permitted(&record));
    }

    #[test]
    fn persist_retries_then_degrades() {
        let mut store = MemStore { contents: None, fail_writes: true };
        let mut fallback = MemFallback::default();
        let record = enabled_safe_record(1);
        let result = persist(&mut store, &mut fallback, &mut NoWait, &record);
        assert_eq!(result, Err(PolicyError::PersistFailedDegraded));
        assert!(fallback.stashed.is_some());
    }

    #[test]
    fn persist_succeeds_without_touching_fallback() {
        let mut store = MemStore::default();
        let mut fallback = MemFallback::default();
        let record = enabled_safe_record(1);
        persist(&mut store, &mut fallback, &mut NoWait, &record).unwrap();
        assert!(fallback.stashed.is_none());
        assert_eq!(store.contents, Some(record.encode()));
    }
}
