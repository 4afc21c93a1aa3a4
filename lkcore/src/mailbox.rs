use crate::identity::{MessageId, ThreadId};
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Arc;

/// Why a message could not be enqueued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutError {
    /// The queue is at capacity; the owner is presumed unresponsive.
    Overflow,
    /// The mailbox has been marked for deletion.
    Disabled,
    /// A thread cannot synchronously wait on itself.
    Deadlock,
}

/// Per-thread bounded FIFO of in-transit messages.
///
/// Besides the queue proper, the mailbox tracks which senders are blocked on
/// the owner (until the owner posts their reply) and keeps a wakeup slot: the
/// reply that unblocks the owner of a synchronous transaction jumps the queue
/// into this slot so the owner always resumes with its reply, never with an
/// older message. During teardown the slot carries the deletion
/// acknowledgment instead.
pub struct Mailbox {
    queue: VecDeque<Arc<Message>>,
    capacity: usize,
    disabled: bool,
    blocking_senders: Vec<(ThreadId, MessageId)>,
    wakeup: Option<Arc<Message>>,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Mailbox {
        Mailbox {
            queue: VecDeque::new(),
            capacity,
            disabled: false,
            blocking_senders: Vec::new(),
            wakeup: None,
        }
    }

    /// Number of messages pending for the owner, wakeup slot included.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len() + self.wakeup.is_some() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Whether preempting the owner should synthesize a null message to keep
    /// it in the lottery.
    #[inline]
    pub fn wants_null_message(&self) -> bool {
        !self.disabled && self.is_empty()
    }

    /// Enqueue a message for the owner. `to_wakeup_slot` routes the awaited
    /// reply of a blocked owner past the FIFO; such a delivery is exempt from
    /// the capacity bound.
    pub fn put(
        &mut self,
        owner: ThreadId,
        msg: Arc<Message>,
        to_wakeup_slot: bool,
    ) -> Result<(), PutError> {
        if msg.is_blocking() && msg.source_id() == owner {
            return Err(PutError::Deadlock);
        }
        if self.disabled {
            return Err(PutError::Disabled);
        }
        if to_wakeup_slot {
            debug_assert!(self.wakeup.is_none());
            self.wakeup = Some(msg);
            return Ok(());
        }
        if self.queue.len() >= self.capacity {
            return Err(PutError::Overflow);
        }
        if msg.is_blocking() {
            self.blocking_senders.push((msg.source_id(), msg.id));
        }
        self.queue.push_back(msg);
        Ok(())
    }

    /// Retrieve the next pending message: the wakeup slot first, then the
    /// FIFO head. The blocking-senders entry of a retrieved message stays
    /// until the owner posts the reply.
    pub fn get(&mut self) -> Option<Arc<Message>> {
        if let Some(msg) = self.wakeup.take() {
            return Some(msg);
        }
        self.queue.pop_front()
    }

    /// The owner has posted the reply owed to `sender` for `request`.
    pub fn reply_posted(&mut self, sender: ThreadId, request: MessageId) {
        if let Some(pos) = self
            .blocking_senders
            .iter()
            .position(|&(s, id)| s == sender && id == request)
        {
            self.blocking_senders.swap_remove(pos);
        }
    }

    /// Senders currently blocked on the owner.
    pub fn blocking_senders(&self) -> &[(ThreadId, MessageId)] {
        &self.blocking_senders
    }

    /// Begin teardown: disable the mailbox, hand every pending message back
    /// to the caller and stash the completion acknowledgment, if any, in the
    /// wakeup slot for delivery once the owner is gone.
    pub fn mark_for_deletion(&mut self, ack: Option<Arc<Message>>) -> Vec<Arc<Message>> {
        self.disabled = true;
        let mut drained: Vec<Arc<Message>> = self.wakeup.take().into_iter().collect();
        drained.extend(self.queue.drain(..));
        self.blocking_senders.clear();
        self.wakeup = ack;
        drained
    }

    /// Take the stashed deletion acknowledgment.
    pub fn take_wakeup(&mut self) -> Option<Arc<Message>> {
        self.wakeup.take()
    }
}
