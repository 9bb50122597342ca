//! Single-slot SPSC sample queue: a single-slot blocking channel with an
//! explicit "closed" state. Disposal semantics (both sides observe
//! closure) are load-bearing and must be preserved — a capacity-1 queue
//! has no ordering to speak of, so it is modeled as one slot rather than a
//! priority queue.

use tokio::sync::Notify;

use crate::error::Canceled;

struct Slot<T> {
    value: parking_lot::Mutex<Option<T>>,
    closed: std::sync::atomic::AtomicBool,
    /// Notified whenever the slot transitions from empty to full, or is
    /// closed while empty (wakes a blocked `recv`).
    filled: Notify,
    /// Notified whenever the slot transitions from full to empty, or is
    /// closed while full (wakes a blocked `send`).
    drained: Notify,
}

/// The producer half. One per session's transfer-phase producer routine.
/// `Clone`able (manually, so `T` need not be) because the session keeps a
/// copy to dispose the queue from `close()` while the producer task owns
/// the original.
pub struct Sender<T> {
    slot: std::sync::Arc<Slot<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

/// The consumer half. One per session's sender routine.
pub struct Receiver<T> {
    slot: std::sync::Arc<Slot<T>>,
}

/// Creates a connected sender/receiver pair sharing one slot.
#[must_use]
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let slot = std::sync::Arc::new(Slot {
        value: parking_lot::Mutex::new(None),
        closed: std::sync::atomic::AtomicBool::new(false),
        filled: Notify::new(),
        drained: Notify::new(),
    });
    (
        Sender {
            slot: slot.clone(),
        },
        Receiver { slot },
    )
}

impl<T> Sender<T> {
    /// Blocks until the slot is empty, then fills it. Returns
    /// `Err(Canceled)` if the queue is disposed while waiting or already
    /// disposed — a session's `close()` disposes the queue to unblock any
    /// blocked producer.
    ///
    /// The `Notified` future is constructed before the slot is checked, per
    /// `tokio::sync::Notify`'s documented pattern: `notify_waiters` (used by
    /// `dispose`) only wakes futures that already exist at the time of the
    /// call, so a `dispose()` landing after the check but before a freshly
    /// created `notified()` would otherwise be missed entirely.
    pub async fn send(&self, value: T) -> Result<(), Canceled> {
        loop {
            if self.slot.closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Canceled);
            }

            let notified = self.slot.drained.notified();

            let mut guard = self.slot.value.lock();
            if guard.is_none() {
                *guard = Some(value);
                drop(guard);
                self.slot.filled.notify_one();
                return Ok(());
            }
            drop(guard);

            if self.slot.closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Canceled);
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl<T> Receiver<T> {
    /// Blocks until the slot is full, then takes its value. Returns
    /// `Err(Canceled)` once the queue is disposed and no value remains to
    /// drain.
    ///
    /// Same ordering as `Sender::send`: the `Notified` future is constructed
    /// before the slot is checked so a concurrent `dispose()` can't land in
    /// the gap between the check and the await and go unobserved.
    pub async fn recv(&self) -> Result<T, Canceled> {
        loop {
            let notified = self.slot.filled.notified();

            let mut guard = self.slot.value.lock();
            if let Some(value) = guard.take() {
                drop(guard);
                self.slot.drained.notify_one();
                return Ok(value);
            }
            let closed = self.slot.closed.load(std::sync::atomic::Ordering::Acquire);
            drop(guard);

            if closed {
                return Err(Canceled);
            }
            notified.await;
        }
    }
}

/// Shared disposal handle. The session holds one of these (cloned onto
/// both the sender and receiver's owning tasks via the slot's `Arc`) and
/// calls `dispose()` from `Close`; both blocked `send` and `recv` wake
/// immediately with `Canceled`.
pub fn dispose<T>(sender: &Sender<T>) {
    sender.slot.closed.store(true, std::sync::atomic::Ordering::Release);
    sender.slot.filled.notify_waiters();
    sender.slot.drained.notify_waiters();
}
