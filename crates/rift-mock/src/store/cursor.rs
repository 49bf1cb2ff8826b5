use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-rule match counter driving sequence selection.
///
/// Lives in a snapshot; installing a new snapshot starts every rule from 0.
#[derive(Default)]
pub struct SequenceCursor(AtomicU64);

impl SequenceCursor {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Return the current value and advance by one.
    pub fn advance(&self) -> u64 {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(1))
            })
            .unwrap_or_else(|e| {
                debug_assert!(false, "we never return None from fetch_update");
                e
            })
    }

    #[must_use]
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SequenceCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SequenceCursor").field(&self.peek()).finish()
    }
}
