/// Timestamp boundary used to scope incremental fetches.
///
/// Advances are monotonic. Only [`CursorTracker::reset`] may move it, and
/// the janitor calls that once the list has emptied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorTracker {
    value: Option<u64>,
}

impl CursorTracker {
    pub fn value(&self) -> Option<u64> {
        self.value
    }

    /// Move forward to `created_at_ms`; older values are ignored.
    ///
    /// Returns `true` when the cursor moved.
    pub fn advance(&mut self, created_at_ms: u64) -> bool {
        match self.value {
            Some(current) if current >= created_at_ms => false,
            _ => {
                self.value = Some(created_at_ms);
                true
            }
        }
    }

    /// Advance to the newest timestamp in `stamps`, if any.
    pub fn advance_to_latest(&mut self, stamps: impl IntoIterator<Item = u64>) -> bool {
        stamps
            .into_iter()
            .max()
            .is_some_and(|latest| self.advance(latest))
    }

    /// Overwrite with the window start after the list emptied.
    pub fn reset(&mut self, window_start_ms: u64) {
        self.value = Some(window_start_ms);
    }

    /// Lower bound for the next fetch.
    pub fn since(&self, window_start_ms: u64) -> u64 {
        self.value.unwrap_or(window_start_ms)
    }
}
