//! Poll control bits and the per-connection pending-control word.
//!
//! The control word is what keeps a connection's event processing on one
//! thread at a time without ever blocking producers or the poller:
//!
//! ```text
//!   begin(bits):  RUNNING|SHUTDOWN|OFFLINE set?  -> CAS word|bits, return None
//!                 otherwise                       -> CAS to RUNNING, return pending|bits
//!                 CAS failed                      -> reload and decide again
//!   end():        fetch_and(!RUNNING), return previous word
//! ```
//! Bits OR-ed in while a pass is running are picked up by that pass's
//! `end()`, which tells the caller to schedule another pass.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU32, Ordering};

/// Poller readiness and connection control bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PollControl(u32);

impl PollControl {
    /// No bits.
    pub const NONE: Self = Self(0);
    /// Socket readable.
    pub const READ: Self = Self(0x01);
    /// Socket writable, or outbound data queued.
    pub const WRITE: Self = Self(0x02);
    /// Edge-triggered notifications requested.
    pub const EDGE_TRIGGERED: Self = Self(0x04);
    /// Termination requested.
    pub const TERMINATE: Self = Self(0x08);
    /// The connection is shutting down; sticky.
    pub const SHUTDOWN: Self = Self(0x10);
    /// The connection is not open yet (or closed).
    pub const OFFLINE: Self = Self(0x20);
    /// A pass is executing.
    pub const RUNNING: Self = Self(0x40);

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `self` without the bits of `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for PollControl {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollControl {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollControl {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PollControl {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for PollControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PollControl, &str); 7] = [
            (PollControl::READ, "Read"),
            (PollControl::WRITE, "Write"),
            (PollControl::EDGE_TRIGGERED, "EdgeTriggered"),
            (PollControl::TERMINATE, "Terminate"),
            (PollControl::SHUTDOWN, "Shutdown"),
            (PollControl::OFFLINE, "Offline"),
            (PollControl::RUNNING, "Running"),
        ];
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Atomic pending-control word of one connection.
#[derive(Debug)]
pub struct ControlWord(AtomicU32);

impl ControlWord {
    const BUSY: PollControl = PollControl(
        PollControl::RUNNING.0 | PollControl::SHUTDOWN.0 | PollControl::OFFLINE.0,
    );

    /// A word for a connection that is not open yet.
    pub fn offline() -> Self {
        Self(AtomicU32::new(PollControl::OFFLINE.0))
    }

    /// Current value.
    pub fn load(&self) -> PollControl {
        PollControl(self.0.load(Ordering::Acquire))
    }

    /// Try to claim the running bit for a pass triggered by `control`.
    ///
    /// Returns the bits to act on, or `None` if another pass is running (or
    /// the connection is offline or shutting down), in which case `control`
    /// has been recorded for later.
    pub fn begin(&self, control: PollControl) -> Option<PollControl> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            // Both arms are a single CAS so an `end()` landing in between
            // forces a re-check instead of leaving `control` in an idle word.
            let (next, claimed) = if PollControl(current).intersects(Self::BUSY) {
                (current | control.0, false)
            } else {
                (PollControl::RUNNING.0, true)
            };
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if claimed => return Some(PollControl(current) | control),
                Ok(_) => return None,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release the running bit; returns the word as it was.
    pub fn end(&self) -> PollControl {
        PollControl(self.0.fetch_and(!PollControl::RUNNING.0, Ordering::AcqRel))
    }

    /// OR in request bits; returns the previous word.
    pub fn request(&self, control: PollControl) -> PollControl {
        PollControl(self.0.fetch_or(control.0, Ordering::AcqRel))
    }

    /// Clear the offline bit; returns the previous word.
    pub fn go_online(&self) -> PollControl {
        PollControl(self.0.fetch_and(!PollControl::OFFLINE.0, Ordering::AcqRel))
    }

    /// Set the sticky shutdown bit.
    pub fn shutdown(&self) {
        self.0.fetch_or(PollControl::SHUTDOWN.0, Ordering::AcqRel);
    }

    /// Reset to offline after close.
    pub fn set_offline(&self) {
        self.0.store(PollControl::OFFLINE.0, Ordering::Release);
    }
}

/// Whether a finished pass must be followed by another one.
pub fn needs_retry(previous: PollControl) -> bool {
    !previous.without(PollControl::RUNNING).is_empty() && !previous.contains(PollControl::SHUTDOWN)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn test_bit_ops() {
        let bits = PollControl::READ | PollControl::WRITE;
        assert!(bits.contains(PollControl::READ));
        assert!(!bits.contains(PollControl::READ | PollControl::TERMINATE));
        assert!(bits.intersects(PollControl::WRITE | PollControl::TERMINATE));
        assert_eq!(bits.without(PollControl::READ), PollControl::WRITE);
        assert_eq!(format!("{bits:?}"), "Read|Write");
        assert_eq!(format!("{:?}", PollControl::NONE), "None");
    }

    #[test]
    fn test_offline_defers_events() {
        let word = ControlWord::offline();
        assert_eq!(word.begin(PollControl::READ), None);

        let previous = word.go_online();
        assert!(previous.contains(PollControl::OFFLINE | PollControl::READ));
        assert!(needs_retry(previous.without(PollControl::OFFLINE)));

        let action = word.begin(PollControl::NONE).unwrap();
        assert!(action.contains(PollControl::READ));
    }

    #[test]
    fn test_begin_claims_and_clears() {
        let word = ControlWord::offline();
        word.go_online();
        word.request(PollControl::WRITE);

        let action = word.begin(PollControl::READ).unwrap();
        assert_eq!(action, PollControl::READ | PollControl::WRITE);
        assert_eq!(word.load(), PollControl::RUNNING);

        let previous = word.end();
        assert_eq!(previous, PollControl::RUNNING);
        assert!(!needs_retry(previous));
    }

    #[test]
    fn test_events_during_pass_are_coalesced() {
        let word = ControlWord::offline();
        word.go_online();

        assert!(word.begin(PollControl::READ).is_some());
        assert_eq!(word.begin(PollControl::WRITE), None);
        assert_eq!(word.begin(PollControl::READ), None);

        let previous = word.end();
        assert!(needs_retry(previous));

        let action = word.begin(PollControl::NONE).unwrap();
        assert_eq!(action, PollControl::READ | PollControl::WRITE);
        word.end();
    }

    #[test]
    fn test_shutdown_is_sticky() {
        let word = ControlWord::offline();
        word.go_online();
        word.shutdown();

        assert_eq!(word.begin(PollControl::READ), None);
        assert!(word.load().contains(PollControl::SHUTDOWN));
        assert!(!needs_retry(word.load()));
    }

    #[test]
    fn test_single_runner_under_contention() {
        let word = Arc::new(ControlWord::offline());
        word.go_online();
        let running = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let word = Arc::clone(&word);
                let running = Arc::clone(&running);
                let passes = Arc::clone(&passes);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut control = PollControl::WRITE;
                        while word.begin(control).is_some() {
                            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                            passes.fetch_add(1, Ordering::SeqCst);
                            running.fetch_sub(1, Ordering::SeqCst);
                            if !needs_retry(word.end()) {
                                break;
                            }
                            control = PollControl::NONE;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(passes.load(Ordering::SeqCst) > 0);
        assert!(!word.load().contains(PollControl::RUNNING));
    }

    #[test]
    fn test_begin_racing_end_leaves_no_stranded_bits() {
        let word = Arc::new(ControlWord::offline());
        word.go_online();
        let delivered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let word = Arc::clone(&word);
                let delivered = Arc::clone(&delivered);
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        let Some(mut action) = word.begin(PollControl::READ) else {
                            continue;
                        };
                        loop {
                            if action.contains(PollControl::READ) {
                                delivered.fetch_add(1, Ordering::SeqCst);
                            }
                            if !needs_retry(word.end()) {
                                break;
                            }
                            match word.begin(PollControl::NONE) {
                                Some(next) => action = next,
                                None => break,
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every READ was either handed to a pass or made some `end()` ask
        // for another one, so nothing is left pending in an idle word.
        assert_eq!(word.load(), PollControl::NONE);
        assert!(delivered.load(Ordering::SeqCst) > 0);
    }
}
