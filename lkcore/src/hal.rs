use crate::thread::Thread;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wakeup token for a thread's execution context. The scheduler grants the
/// CPU by unparking; the thread consumes the grant and runs.
pub struct Parker {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Arc<Parker> {
        Arc::new(Parker {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn unpark(&self) {
        let mut granted = self.granted.lock().unwrap();
        *granted = true;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut granted = self.granted.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
        *granted = false;
    }
}

/// The slice of the hardware abstraction the IPC core interacts with: the
/// current-thread register, the context-switch primitive and the timestamp
/// source. Exactly one thread is current at a time; descheduled real threads
/// sit in `park_until_current`.
pub struct Hal {
    current: Mutex<Arc<Thread>>,
    need_resched: AtomicBool,
}

impl Hal {
    pub fn new(initial: Arc<Thread>) -> Hal {
        Hal {
            current: Mutex::new(initial),
            need_resched: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn current(&self) -> Arc<Thread> {
        self.current.lock().unwrap().clone()
    }

    #[inline]
    pub fn is_current(&self, thread: &Arc<Thread>) -> bool {
        Arc::ptr_eq(&*self.current.lock().unwrap(), thread)
    }

    /// Commit a context switch: `next` becomes current and, if it has an
    /// execution context, it is woken. The caller is responsible for parking
    /// itself afterwards if it was the thread being descheduled.
    pub fn switch_to(&self, next: &Arc<Thread>) {
        *self.current.lock().unwrap() = next.clone();
        if let Some(parker) = next.parker() {
            parker.unpark();
        }
    }

    /// Park the calling thread until it is scheduled again. Returns false if
    /// the thread was torn down while parked.
    pub fn park_until_current(&self, me: &Arc<Thread>) -> bool {
        let parker = match me.parker() {
            Some(parker) => parker,
            None => panic!("thread {} has no execution context", me.id),
        };
        loop {
            if me.is_deleted() {
                return false;
            }
            if self.is_current(me) {
                return true;
            }
            parker.wait();
        }
    }

    #[inline]
    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    #[inline]
    pub fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }
}

/// Monotonic-enough timestamp used to seed the scheduler PRNG at boot.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::AddressSpaceLayer;
    use crate::identity::{Caps, ThreadId};
    use std::thread as os_thread;
    use std::time::Duration;

    fn thread(id: i64) -> Arc<Thread> {
        let layer = AddressSpaceLayer::new();
        Thread::new(ThreadId::from(id), Caps::NONE, layer.create_space(), 8)
    }

    #[test]
    fn unpark_before_wait_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        parker.wait();
    }

    #[test]
    fn switch_wakes_the_next_thread() {
        let a = thread(1);
        let b = thread(2);
        a.attach_parker(Parker::new());
        b.attach_parker(Parker::new());

        let hal = Arc::new(Hal::new(a.clone()));
        assert!(hal.is_current(&a));

        let hal2 = hal.clone();
        let b2 = b.clone();
        let waiter = os_thread::spawn(move || hal2.park_until_current(&b2));

        os_thread::sleep(Duration::from_millis(10));
        hal.switch_to(&b);
        assert!(waiter.join().unwrap());
        assert!(hal.is_current(&b));
    }

    #[test]
    fn parked_thread_escapes_on_deletion() {
        let a = thread(1);
        let b = thread(2);
        b.attach_parker(Parker::new());
        let hal = Arc::new(Hal::new(a));

        let hal2 = hal.clone();
        let b2 = b.clone();
        let waiter = os_thread::spawn(move || hal2.park_until_current(&b2));

        os_thread::sleep(Duration::from_millis(10));
        b.mark_for_deletion();
        if let Some(parker) = b.parker() {
            parker.unpark();
        }
        assert!(!waiter.join().unwrap());
    }
}
