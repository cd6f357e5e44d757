//! Admission control: a hard cap on concurrently accepted client connections, enforced by
//! the external side's accept loop before a session is ever registered with the multiplexer.
//!
//! Deliberately simpler than a time-windowed rate limiter keyed per remote address:
//! `player_limit` is a flat concurrent-connection ceiling, not a rate, so a plain counter with a
//! release call is the whole of it. Shared only across the accept loop and each connection's own
//! teardown path via an `Arc<Mutex<_>>` -- no atomics, since contention here is negligible next to
//! the socket I/O each connection already does.

/// Tracks how many client connections are currently admitted, rejecting new ones once `limit` is
/// reached.
pub struct AdmissionGate {
    limit: usize,
    current: usize,
}

impl AdmissionGate {
    /// Creates a gate capped at `limit` concurrent connections.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit, current: 0 }
    }

    /// Attempts to admit one more connection. Returns `true` and increments the live count if
    /// under the limit; returns `false` (and leaves the count unchanged) otherwise, so the caller
    /// can close the socket immediately, before registering it with the session multiplexer.
    pub fn try_admit(&mut self) -> bool {
        if self.current >= self.limit {
            return false;
        }
        self.current += 1;
        true
    }

    /// Releases one previously admitted connection's slot. Called when its session is torn down,
    /// not when it's merely queued or disconnecting.
    pub fn release(&mut self) {
        self.current = self.current.saturating_sub(1);
    }

    /// Number of connections currently counted against the limit.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let mut gate = AdmissionGate::new(2);
        assert!(gate.try_admit());
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
        assert_eq!(gate.current(), 2);
    }

    #[test]
    fn release_frees_a_slot_for_reuse() {
        let mut gate = AdmissionGate::new(1);
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
        gate.release();
        assert!(gate.try_admit());
    }

    #[test]
    fn release_below_zero_saturates() {
        let mut gate = AdmissionGate::new(1);
        gate.release();
        assert_eq!(gate.current(), 0);
        assert!(gate.try_admit());
    }
}
