use crate::addrspace::AddressSpace;
use crate::hal::Parker;
use crate::identity::{Caps, MessageId, ThreadId};
use crate::mailbox::Mailbox;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Scheduling state of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Ready,
    /// Waiting for the reply to an outstanding synchronous request.
    BlockedOn { on: ThreadId, request: MessageId },
    MarkedForDeletion,
    Dead,
}

/// A thread as the IPC core sees it: identity, capabilities, address space,
/// mailbox, scheduling state and remaining quantum. Real threads additionally
/// carry an execution parker; mailbox-only endpoints do not.
///
/// Storage is reclaimed when the last reference drops. References are held by
/// the registry, by every in-flight message naming the thread, and briefly by
/// the scheduler's pick path.
pub struct Thread {
    pub id: ThreadId,
    caps: Caps,
    addr_space: Arc<AddressSpace>,
    state: Mutex<ThreadState>,
    tick_count: AtomicI64,
    mailbox: Mutex<Mailbox>,
    exec: Mutex<Option<Arc<Parker>>>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        caps: Caps,
        addr_space: Arc<AddressSpace>,
        mailbox_capacity: usize,
    ) -> Arc<Thread> {
        Arc::new(Thread {
            id,
            caps,
            addr_space,
            state: Mutex::new(ThreadState::Ready),
            tick_count: AtomicI64::new(0),
            mailbox: Mutex::new(Mailbox::new(mailbox_capacity)),
            exec: Mutex::new(None),
        })
    }

    #[inline]
    pub fn addr_space(&self) -> &Arc<AddressSpace> {
        &self.addr_space
    }

    #[inline]
    pub fn has_capability(&self, cap: Caps) -> bool {
        self.caps.contains(cap)
    }

    /// The mailbox lock nests strictly inside the scheduler lock.
    #[inline]
    pub(crate) fn mailbox(&self) -> MutexGuard<Mailbox> {
        self.mailbox.lock().unwrap()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if let ThreadState::Ready | ThreadState::BlockedOn { .. } = *state {
            *state = ThreadState::Ready;
        }
    }

    pub(crate) fn set_blocked_on(&self, on: ThreadId, request: MessageId) {
        *self.state.lock().unwrap() = ThreadState::BlockedOn { on, request };
    }

    pub(crate) fn mark_for_deletion(&self) {
        *self.state.lock().unwrap() = ThreadState::MarkedForDeletion;
    }

    pub(crate) fn set_dead(&self) {
        *self.state.lock().unwrap() = ThreadState::Dead;
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == ThreadState::Ready
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::MarkedForDeletion | ThreadState::Dead
        )
    }

    /// The thread and request id of the outstanding synchronous send, if any.
    pub fn blocked_on(&self) -> Option<(ThreadId, MessageId)> {
        match self.state() {
            ThreadState::BlockedOn { on, request } => Some((on, request)),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn grant_quantum(&self, ticks: i64) {
        self.tick_count.store(ticks, Ordering::Relaxed);
    }

    /// Consume one tick, returning the remaining count.
    #[inline]
    pub(crate) fn consume_tick(&self) -> i64 {
        self.tick_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    #[inline]
    pub fn remaining_ticks(&self) -> i64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_parker(&self, parker: Arc<Parker>) {
        *self.exec.lock().unwrap() = Some(parker);
    }

    pub(crate) fn parker(&self) -> Option<Arc<Parker>> {
        self.exec.lock().unwrap().clone()
    }

    /// A virtual thread has a mailbox but no execution context of its own.
    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.exec.lock().unwrap().is_none()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Thread) -> bool {
        self.id == other.id
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
