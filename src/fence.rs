//! Client-importable synchronization events and the per-fence bookkeeping
//! used to sequence image visibility (wait side) and retirement
//! notification (signal side).
//!
//! A `SyncEvent` is the primitive a client imports: an eventfd plus a
//! process-unique token standing in for a kernel object identity. Once
//! signaled it stays signaled. The `watcher` submodule provides the thread
//! that turns eventfd readability into one-shot ready callbacks.

pub mod watcher;

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::eventfd::{EfdFlags, EventFd};

/// Token source. Tokens identify the underlying primitive, not the fence id
/// a client binds it to; two clones of one `SyncEvent` share a token.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A signal-capable primitive. Clones refer to the same underlying event.
#[derive(Clone, Debug)]
pub struct SyncEvent {
    token: u64,
    fd: Arc<EventFd>,
}

impl SyncEvent {
    pub fn new() -> io::Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            fd: Arc::new(fd),
        })
    }

    /// Identity of the underlying primitive.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Moves the event to the signaled state. Idempotent: signaling an
    /// already-signaled event has no further effect on observers.
    pub fn signal(&self) -> io::Result<()> {
        self.fd
            .arm()
            .map(|_| ())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

impl AsFd for SyncEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SyncEvent {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

/// State tracked for one imported fence id.
///
/// A fence can be claimed by at most one not-yet-presented image at a time
/// (wait side), and can owe any number of retirement signals (signal side).
/// Releasing the id defers teardown until both sides are quiet; outstanding
/// waits and signals scheduled before the release still complete.
#[derive(Debug)]
pub struct FenceRecord {
    event: SyncEvent,
    /// Set once the primitive has been observed (or driven) to the signaled
    /// state. Never cleared.
    pub signaled: bool,
    /// Whether a not-yet-presented image currently holds the wait side.
    pub claimed: bool,
    /// Retirement signals owed to the client through this fence.
    pub pending_signals: u32,
    /// The client released the id; tear down once idle.
    pub released: bool,
}

impl FenceRecord {
    pub fn new(event: SyncEvent) -> Self {
        Self {
            event,
            signaled: false,
            claimed: false,
            pending_signals: 0,
            released: false,
        }
    }

    pub fn event(&self) -> &SyncEvent {
        &self.event
    }

    pub fn token(&self) -> u64 {
        self.event.token()
    }

    /// Fires one owed retirement signal.
    pub fn fire_signal(&mut self) -> io::Result<()> {
        debug_assert!(self.pending_signals > 0);
        self.pending_signals = self.pending_signals.saturating_sub(1);
        self.signaled = true;
        self.event.signal()
    }

    /// Whether no wait or signal obligation is outstanding.
    pub fn is_idle(&self) -> bool {
        !self.claimed && self.pending_signals == 0
    }

    /// Whether the deferred-teardown sweep may drop this record.
    pub fn can_teardown(&self) -> bool {
        self.released && self.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_shared_by_clones() {
        let a = SyncEvent::new().unwrap();
        let b = SyncEvent::new().unwrap();
        assert_ne!(a.token(), b.token());
        let a2 = a.clone();
        assert_eq!(a.token(), a2.token());
    }

    #[test]
    fn signal_is_idempotent() {
        let event = SyncEvent::new().unwrap();
        event.signal().unwrap();
        event.signal().unwrap();
    }

    #[test]
    fn record_teardown_waits_for_obligations() {
        let mut record = FenceRecord::new(SyncEvent::new().unwrap());
        assert!(record.is_idle());
        assert!(!record.can_teardown());

        record.claimed = true;
        record.pending_signals = 1;
        record.released = true;
        assert!(!record.can_teardown());

        record.claimed = false;
        assert!(!record.can_teardown());

        record.fire_signal().unwrap();
        assert!(record.signaled);
        assert!(record.can_teardown());
    }
}
