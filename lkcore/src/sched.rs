use crate::addrspace::AddressSpaceLayer;
use crate::config::KernelConfig;
use crate::hal::{self, Hal, Parker};
use crate::identity::{Caps, MessageId, MessageType, ThreadId};
use crate::mailbox::PutError;
use crate::message::Message;
use crate::pool::PendingPool;
use crate::status::{IpcResult, SendError, Status};
use crate::thread::Thread;
use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slog::{debug, info, trace, warn, Logger};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread as os_thread;

/// Monotonically increasing counters, readable at any time through the
/// kernel stats record.
pub struct Counters {
    pub message_count: AtomicU64,
    pub incomplete_count: AtomicU64,
    pub receive_error_count: AtomicU64,
    pub send_error_count: AtomicU64,
    pub lottery_count: AtomicU64,
    pub idle_count: AtomicU64,
    pub direct_handoff_count: AtomicU64,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            message_count: AtomicU64::new(0),
            incomplete_count: AtomicU64::new(0),
            receive_error_count: AtomicU64::new(0),
            send_error_count: AtomicU64::new(0),
            lottery_count: AtomicU64::new(0),
            idle_count: AtomicU64::new(0),
            direct_handoff_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State guarded by the scheduler lock: the thread registry, the pending
/// pool and the lottery PRNG. Every mailbox-membership transition happens
/// while this lock is held, together with the matching pool update.
struct SchedState {
    threads: IndexMap<ThreadId, Arc<Thread>>,
    pending: PendingPool,
    rng: SmallRng,
    next_user_id: i64,
}

enum Retrieved {
    Msg(Arc<Message>),
    Empty,
    Disabled,
}

/// The kernel context: the IPC-scheduler plus everything it owns. One
/// instance per system, created by `boot`, passed by reference everywhere.
pub struct Kernel {
    cfg: KernelConfig,
    log: Logger,
    sched: Mutex<SchedState>,
    hal: Hal,
    counters: Counters,
    layer: Arc<AddressSpaceLayer>,
    idle: Arc<Thread>,
    null: Arc<Thread>,
    cleanup: Arc<Thread>,
    boot: Arc<Thread>,
}

impl Kernel {
    /// Bring up the kernel context. Registers the idle, null, cleanup and
    /// boot threads, seeds the lottery PRNG and makes the calling OS thread
    /// current as the boot thread. The idle and null threads exist before
    /// any lottery can be held, and the cleanup thread before any deletion
    /// can be requested.
    pub fn boot(cfg: KernelConfig, log: Logger) -> Arc<Kernel> {
        let layer = AddressSpaceLayer::new();
        let cap = cfg.mailbox_capacity;

        let idle = Thread::new(ThreadId::IDLE, Caps::NONE, layer.create_space(), cap);
        let null = Thread::new(ThreadId::NULL, Caps::NONE, layer.create_space(), cap);
        let cleanup = Thread::new(ThreadId::CLEANUP, Caps::ALL, layer.create_space(), cap);
        let boot = Thread::new(ThreadId::BOOT, Caps::ALL, layer.create_space(), cap);
        boot.attach_parker(Parker::new());
        boot.grant_quantum(cfg.quantum);

        let mut threads = IndexMap::new();
        for thread in [&idle, &null, &cleanup, &boot].iter() {
            threads.insert(thread.id, (*thread).clone());
        }

        // Seed the PRNG before holding any lotteries.
        let seed = cfg.rng_seed.unwrap_or_else(hal::timestamp);

        let kernel = Arc::new(Kernel {
            sched: Mutex::new(SchedState {
                threads,
                pending: PendingPool::new(),
                rng: SmallRng::seed_from_u64(seed),
                next_user_id: 1,
            }),
            hal: Hal::new(boot.clone()),
            counters: Counters::new(),
            layer,
            idle,
            null,
            cleanup,
            boot,
            cfg,
            log,
        });

        assert!(kernel.find_thread(ThreadId::IDLE).is_some());
        assert!(kernel.find_thread(ThreadId::NULL).is_some());
        assert!(kernel.find_thread(ThreadId::CLEANUP).is_some());

        info!(kernel.log, "kernel context initialized";
            "quantum" => kernel.cfg.quantum,
            "mailbox_capacity" => kernel.cfg.mailbox_capacity);

        kernel
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.cfg
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[inline]
    pub(crate) fn layer(&self) -> &Arc<AddressSpaceLayer> {
        &self.layer
    }

    #[inline]
    pub(crate) fn hal(&self) -> &Hal {
        &self.hal
    }

    /// Draw a fresh non-atomic message id for a new transaction.
    pub fn fresh_message_id(&self) -> MessageId {
        let raw: u64 = self.sched.lock().unwrap().rng.gen();
        MessageId::from(raw >> 1)
    }

    #[inline]
    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn current_thread(&self) -> Arc<Thread> {
        self.hal.current()
    }

    #[inline]
    pub fn null_thread(&self) -> &Arc<Thread> {
        &self.null
    }

    #[inline]
    pub fn cleanup_thread(&self) -> &Arc<Thread> {
        &self.cleanup
    }

    #[inline]
    pub fn boot_thread(&self) -> &Arc<Thread> {
        &self.boot
    }

    pub fn find_thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.sched.lock().unwrap().threads.get(&id).cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.sched.lock().unwrap().threads.len()
    }

    pub fn pending_count(&self) -> usize {
        self.sched.lock().unwrap().pending.len()
    }

    /// Register a new thread with a fresh address space. Invoked by the
    /// thread-creation path; the core only cares about the mailbox.
    pub fn register_thread(&self, caps: Caps) -> Arc<Thread> {
        let mut st = self.sched.lock().unwrap();
        let id = ThreadId::from(st.next_user_id);
        st.next_user_id += 1;
        let thread = Thread::new(id, caps, self.layer.create_space(), self.cfg.mailbox_capacity);
        st.threads.insert(id, thread.clone());
        thread
    }

    /// Register a thread and bind an OS thread to it as its execution
    /// context. The new thread receives a start message so that it can win
    /// its first lottery, consumes it, runs `entry`, and exits gracefully
    /// through the cleanup thread.
    pub fn spawn<F>(
        self: &Arc<Self>,
        caps: Caps,
        entry: F,
    ) -> IpcResult<(Arc<Thread>, os_thread::JoinHandle<()>)>
    where
        F: FnOnce(&Arc<Kernel>, &Arc<Thread>) + Send + 'static,
    {
        let thread = self.register_thread(caps);
        thread.attach_parker(Parker::new());

        let start = Message::new_word(
            self.null.clone(),
            thread.clone(),
            MessageType::START_USER_THREAD,
            MessageId::ATOMIC,
            0,
        );
        if let Err(err) = self.enqueue(start) {
            self.sched.lock().unwrap().threads.swap_remove(&thread.id);
            return Err(err.status);
        }

        let kernel = self.clone();
        let me = thread.clone();
        let handle = os_thread::Builder::new()
            .name(format!("lk-{}", thread.id))
            .spawn(move || {
                if !kernel.hal.park_until_current(&me) {
                    return;
                }
                let _ = kernel.receive(false);
                entry(&kernel, &me);
                kernel.exit_thread(&me);
            })
            .map_err(|_: io::Error| Status::InsufficientMemory)?;

        Ok((thread, handle))
    }

    /// Graceful exit path for a spawned thread: ask the cleanup thread to
    /// reclaim us, then surrender the CPU until it does.
    fn exit_thread(&self, me: &Arc<Thread>) {
        let request = Message::new_word(
            me.clone(),
            self.cleanup.clone(),
            MessageType::DELETE_THREAD,
            MessageId::ATOMIC,
            ThreadId::LOOPBACK.to_word(),
        );
        if let Err(err) = self.send(request) {
            warn!(self.log, "thread exit request failed";
                "thread" => %me.id, "status" => %err.status);
        }
        while !me.is_deleted() {
            self.yield_now();
        }
    }

    /// Queue a message to its destination mailbox. On success, ownership
    /// transfers to the recipient and the caller must not touch the message
    /// again; on failure the caller gets it back.
    ///
    /// Non-blocking; safe to invoke from interrupt context.
    pub fn send(&self, mut msg: Message) -> Result<(), SendError> {
        // Gather the payload in the sender's context, outside the lock:
        // this may fault.
        if let Err(status) = msg.collect_payload() {
            trace!(self.log, "unable to collect payload"; "status" => %status);
            Counters::bump(&self.counters.send_error_count);
            return Err(SendError { status, message: msg });
        }
        self.enqueue(msg)
    }

    /// Lock-guarded half of `send`: mailbox put and pool insertion happen
    /// atomically with respect to the scheduler.
    fn enqueue(&self, msg: Message) -> Result<(), SendError> {
        let dest = msg.destination.clone();
        let source_id = msg.source_id();
        let arc = Arc::new(msg);

        let status = {
            let mut st = self.sched.lock().unwrap();

            // The awaited reply of a blocked destination bypasses the FIFO.
            let to_wakeup = match dest.blocked_on() {
                Some((on, request)) => on == source_id && request == arc.id,
                None => false,
            };

            let put = dest.mailbox().put(dest.id, arc.clone(), to_wakeup);
            match put {
                Ok(()) => {
                    st.pending.insert(&arc);
                    Counters::bump(&self.counters.message_count);
                    if !arc.id.is_atomic() {
                        // If this settles a synchronous transaction, clear
                        // the replier's ledger entry.
                        arc.source.mailbox().reply_posted(dest.id, arc.id);
                    }
                    None
                }
                Err(PutError::Overflow) => Some(Status::MailboxOverflow),
                Err(PutError::Disabled) => Some(Status::MailboxDisabled),
                Err(PutError::Deadlock) => Some(Status::MessageDeadlock),
            }
        };

        match status {
            None => Ok(()),
            Some(status) => {
                Counters::bump(&self.counters.send_error_count);
                let message = match Arc::try_unwrap(arc) {
                    Ok(message) => message,
                    Err(_) => panic!("failed send left a shared message"),
                };
                if status == Status::MailboxOverflow {
                    self.kill_overflowed(&dest);
                }
                Err(SendError { status, message })
            }
        }
    }

    /// A full mailbox means its owner has stopped retrieving messages.
    /// Schedule it for deletion rather than let senders spin forever.
    fn kill_overflowed(&self, victim: &Arc<Thread>) {
        if victim.id == self.cleanup.id || victim.id == self.null.id || victim.id == self.idle.id {
            return;
        }
        warn!(self.log, "killing thread after mailbox overflow"; "thread" => %victim.id);
        let request = Message::new_word(
            self.null.clone(),
            self.cleanup.clone(),
            MessageType::DELETE_THREAD,
            MessageId::ATOMIC,
            victim.id.to_word(),
        );
        if let Err(err) = self.enqueue(request) {
            warn!(self.log, "unable to queue overflow deletion"; "status" => %err.status);
        }
    }

    /// Reply to `request` with a plain status word.
    pub(crate) fn put_response(&self, request: &Message, mtype: MessageType, status: Status) {
        let reply = Message::reply_to(request, mtype, status.code() as usize);
        if let Err(err) = self.enqueue(reply) {
            debug!(self.log, "unable to deliver response";
                "to" => %request.source_id(), "status" => %err.status);
        }
    }

    /// Retrieve the next message pending for the current thread. Runs in
    /// the recipient's context; delivering the payload makes it visible in
    /// the recipient's address space.
    ///
    /// With `wait` unset this never blocks and may be invoked from
    /// interrupt context.
    pub fn receive(&self, wait: bool) -> IpcResult<Message> {
        loop {
            if self.hal.take_resched() {
                self.reschedule_current();
            }
            let me = self.hal.current();

            let retrieved = {
                let mut st = self.sched.lock().unwrap();
                let mut mailbox = me.mailbox();
                if mailbox.is_disabled() {
                    Retrieved::Disabled
                } else {
                    match mailbox.get() {
                        Some(arc) => {
                            drop(mailbox);
                            // Claimed: it no longer counts towards future
                            // lotteries.
                            st.pending.remove(&arc);
                            if let Some((_, request)) = me.blocked_on() {
                                if arc.id == request {
                                    me.set_ready();
                                }
                            }
                            Retrieved::Msg(arc)
                        }
                        None => Retrieved::Empty,
                    }
                }
            };

            match retrieved {
                Retrieved::Msg(arc) => {
                    let mut msg = match Arc::try_unwrap(arc) {
                        Ok(msg) => msg,
                        Err(_) => panic!("retrieved message still shared"),
                    };
                    // Deliver outside the lock; this may fault.
                    if let Err(status) = msg.deliver_payload() {
                        debug!(self.log, "unable to deliver message payload";
                            "to" => %me.id, "status" => %status);
                        Counters::bump(&self.counters.receive_error_count);
                        if msg.is_blocking() {
                            self.put_response(&msg, MessageType::ABORT, Status::IoError);
                        }
                        return Err(status);
                    }
                    return Ok(msg);
                }
                Retrieved::Disabled => return Err(Status::MailboxDisabled),
                Retrieved::Empty if !wait => return Err(Status::MailboxEmpty),
                Retrieved::Empty => {
                    self.yield_now();
                    if me.is_deleted() {
                        return Err(Status::MailboxDisabled);
                    }
                }
            }
        }
    }

    /// Synchronous transaction: send `request` and block until the reply
    /// arrives. On success the caller owns exactly one reply; a broken
    /// transaction yields a synthesized ABORT reply instead, so the
    /// ownership contract holds on every path.
    pub fn send_and_receive(&self, mut request: Message) -> Result<Message, SendError> {
        request.set_blocking();

        // The recipient may destroy the request at any moment after the
        // send; cache what the abort path needs.
        let recipient = request.destination.clone();
        let request_id = request.id;
        let me = self.hal.current();

        self.send(request)?;
        me.set_blocked_on(recipient.id, request_id);
        self.yield_now();

        let reply = match self.receive(false) {
            Ok(reply) => reply,
            Err(status) => {
                // Discard whatever woke us and inject an explicit abort in
                // place of the expected reply.
                self.discard_wakeup(&me);
                Message::new_word(
                    recipient.clone(),
                    me.clone(),
                    MessageType::ABORT,
                    request_id,
                    status.code() as usize,
                )
            }
        };
        me.set_ready();

        if reply.mtype == MessageType::ABORT {
            Counters::bump(&self.counters.incomplete_count);
        }
        Ok(reply)
    }

    fn discard_wakeup(&self, me: &Arc<Thread>) {
        let mut st = self.sched.lock().unwrap();
        let stale = me.mailbox().take_wakeup();
        if let Some(arc) = stale {
            st.pending.remove(&arc);
        }
    }

    /// Surrender the CPU. The boot thread doubles as the interrupt/timer
    /// context and therefore keeps executing even while not current; every
    /// other real thread parks until scheduled again.
    pub fn yield_now(&self) {
        let me = self.hal.current();
        let next = {
            let mut st = self.sched.lock().unwrap();
            self.pick_next(&mut st, &me)
        };
        if !Arc::ptr_eq(&next, &me) {
            trace!(self.log, "context switch"; "from" => %me.id, "to" => %next.id);
            self.hal.switch_to(&next);
            if !me.is_virtual() && me.id != ThreadId::BOOT {
                self.hal.park_until_current(&me);
            }
        }
    }

    /// Commit a preemption recorded by the timer while this thread was
    /// executing user code.
    fn reschedule_current(&self) {
        let me = self.hal.current();
        {
            let mut st = self.sched.lock().unwrap();
            self.put_null_if_eligible(&mut st, &me);
        }
        self.yield_now();
    }

    /// The selection algorithm. Three possibilities: the current thread is
    /// blocked on another thread and donates its slice to it; or a lottery
    /// is held over the pending messages; or nothing is pending and the
    /// idle thread fills the gap.
    fn pick_next(&self, st: &mut SchedState, current: &Arc<Thread>) -> Arc<Thread> {
        let mut winner = None;

        if let Some((on, _)) = current.blocked_on() {
            if let Some(target) = st.threads.get(&on) {
                if target.is_ready() {
                    Counters::bump(&self.counters.direct_handoff_count);
                    winner = Some(target.clone());
                }
            }
        }

        let winner = match winner {
            Some(winner) => winner,
            None => {
                if !st.pending.is_empty() {
                    Counters::bump(&self.counters.lottery_count);
                    let ticket = st.pending.select_random(&mut st.rng);
                    let mut winner = ticket.destination.clone();
                    // A blocked winner passes its winnings to the thread
                    // preventing its progress.
                    if let Some((on, _)) = winner.blocked_on() {
                        if let Some(target) = st.threads.get(&on) {
                            if target.is_ready() {
                                trace!(self.log, "blocked winner passes its winnings";
                                    "winner" => %winner.id, "to" => %target.id);
                                winner = target.clone();
                            }
                        }
                    }
                    winner
                } else {
                    Counters::bump(&self.counters.idle_count);
                    self.idle.clone()
                }
            }
        };

        // The idle thread re-runs the lottery on every tick so that pending
        // work is picked up promptly.
        let quantum = if Arc::ptr_eq(&winner, &self.idle) {
            1
        } else {
            self.cfg.quantum
        };
        winner.grant_quantum(quantum);
        winner
    }

    /// Clock tick. The current thread has consumed one tick; once its
    /// quantum is exhausted it is preempted. A thread losing the CPU with
    /// an empty mailbox gets an empty message so that preemption alone does
    /// not strip it from the lottery.
    pub fn timer_tick(&self) {
        let me = self.hal.current();
        if me.consume_tick() > 0 {
            return;
        }
        if me.is_virtual() {
            let next = {
                let mut st = self.sched.lock().unwrap();
                self.put_null_if_eligible(&mut st, &me);
                self.pick_next(&mut st, &me)
            };
            if !Arc::ptr_eq(&next, &me) {
                self.hal.switch_to(&next);
            }
        } else {
            // A running thread is preempted at its next kernel entry.
            self.hal.request_resched();
        }
    }

    fn put_null_if_eligible(&self, st: &mut SchedState, thread: &Arc<Thread>) {
        if thread.id == self.idle.id || thread.id == self.null.id {
            return;
        }
        if !thread.is_ready() || !thread.mailbox().wants_null_message() {
            return;
        }
        let msg = Arc::new(Message::new_word(
            self.null.clone(),
            thread.clone(),
            MessageType::NULL,
            MessageId::ATOMIC,
            0,
        ));
        if thread.mailbox().put(thread.id, msg.clone(), false).is_ok() {
            st.pending.insert(&msg);
            Counters::bump(&self.counters.message_count);
        }
    }

    /// First stage of thread teardown: disable the victim's mailbox, pull
    /// its pending messages out of the lottery and abort any synchronous
    /// transactions aimed at it so their senders do not block forever. On
    /// return the victim can win at most one more lottery.
    pub(crate) fn drain_messages(&self, victim: &Arc<Thread>, ack: Option<Message>) {
        let drained = {
            let mut st = self.sched.lock().unwrap();
            let drained = victim.mailbox().mark_for_deletion(ack.map(Arc::new));
            for msg in drained.iter() {
                st.pending.remove(msg);
            }
            victim.mark_for_deletion();
            drained
        };

        info!(self.log, "drained mailbox"; "thread" => %victim.id, "messages" => drained.len());

        for arc in drained {
            let msg = match Arc::try_unwrap(arc) {
                Ok(msg) => msg,
                Err(_) => panic!("drained message still shared"),
            };
            if msg.is_blocking() {
                self.put_response(&msg, MessageType::ABORT, Status::ThreadExited);
            }
        }
    }

    /// Final stage of teardown: remove the victim from the registry, send
    /// the stashed completion acknowledgment and release its execution
    /// context. Remaining message references only pin the storage.
    pub(crate) fn unregister(&self, victim: &Arc<Thread>) {
        let ack = {
            let mut st = self.sched.lock().unwrap();
            st.threads.swap_remove(&victim.id);
            victim.mailbox().take_wakeup()
        };
        victim.set_dead();
        if let Some(parker) = victim.parker() {
            parker.unpark();
        }
        if let Some(arc) = ack {
            let msg = match Arc::try_unwrap(arc) {
                Ok(msg) => msg,
                Err(_) => panic!("deletion acknowledgment already shared"),
            };
            if let Err(err) = self.enqueue(msg) {
                debug!(self.log, "unable to deliver deletion acknowledgment";
                    "status" => %err.status);
            }
        }
    }
}
