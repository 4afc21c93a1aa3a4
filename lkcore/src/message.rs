use crate::addrspace::{Frame, MEDIUM_SLOT_SIZE, USER_BASE};
use crate::identity::{MessageId, MessageType, ThreadId};
use crate::status::{IpcResult, Status};
use crate::thread::Thread;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Largest payload that is copied inline rather than delivered by frame
/// sharing. Matches the medium payload slot size.
pub const INLINE_PAYLOAD_MAX: usize = MEDIUM_SLOT_SIZE;

/// `pool_index` value of a message that is not in the pending pool.
pub(crate) const POOL_INDEX_NONE: usize = usize::MAX;

const CONTROL_BLOCKING: u8 = 0x01;

/// Payload transport strategy, selected by size and delivery requirements.
/// The overwhelming majority of system messages carry a single word; the
/// inline and shared flavors exist for everything else.
pub enum Payload {
    /// One opaque word carried in the message itself.
    Word(usize),
    /// Up to `INLINE_PAYLOAD_MAX` bytes, copied out of the sender at collect
    /// time and into a medium-pool slot of the recipient at delivery.
    Inline {
        sender_ptr: usize,
        len: usize,
        data: Vec<u8>,
        receiver_ptr: usize,
    },
    /// Arbitrarily large payload delivered by mapping the backing frames
    /// into the recipient, optionally at a recipient-chosen address.
    Shared {
        sender_ptr: usize,
        len: usize,
        frames: Vec<Arc<Frame>>,
        offset: usize,
        dest_hint: Option<usize>,
        receiver_ptr: usize,
    },
}

/// A message in flight between two threads. Holds a reference on both
/// endpoints for as long as it exists.
pub struct Message {
    pub source: Arc<Thread>,
    pub destination: Arc<Thread>,
    pub mtype: MessageType,
    pub id: MessageId,
    control: u8,
    /// Back-reference into the pending pool while the message is pending.
    pub(crate) pool_index: AtomicUsize,
    payload: Payload,
}

impl Message {
    pub fn new_word(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        mtype: MessageType,
        id: MessageId,
        word: usize,
    ) -> Message {
        Message {
            source,
            destination,
            mtype,
            id,
            control: 0,
            pool_index: AtomicUsize::new(POOL_INDEX_NONE),
            payload: Payload::Word(word),
        }
    }

    /// Build a message of the right flavor for the given payload: a
    /// recipient-chosen delivery address or an oversized payload forces
    /// frame sharing, a small nonzero payload is copied inline, and an
    /// empty payload travels as a single word.
    pub fn build(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        mtype: MessageType,
        id: MessageId,
        data_ptr: usize,
        data_size: usize,
        dest_addr: Option<usize>,
    ) -> Message {
        let payload = if data_size > INLINE_PAYLOAD_MAX || dest_addr.is_some() {
            Payload::Shared {
                sender_ptr: data_ptr,
                len: data_size,
                frames: Vec::new(),
                offset: 0,
                dest_hint: dest_addr,
                receiver_ptr: 0,
            }
        } else if data_size > 0 {
            Payload::Inline {
                sender_ptr: data_ptr,
                len: data_size,
                data: Vec::new(),
                receiver_ptr: 0,
            }
        } else {
            Payload::Word(data_ptr)
        };

        Message {
            source,
            destination,
            mtype,
            id,
            control: 0,
            pool_index: AtomicUsize::new(POOL_INDEX_NONE),
            payload,
        }
    }

    /// Build a word reply to `request`: endpoints swapped, id preserved.
    pub fn reply_to(request: &Message, mtype: MessageType, word: usize) -> Message {
        Message::new_word(
            request.destination.clone(),
            request.source.clone(),
            mtype,
            request.id,
            word,
        )
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.control & CONTROL_BLOCKING != 0
    }

    #[inline]
    pub fn set_blocking(&mut self) {
        self.control |= CONTROL_BLOCKING;
    }

    #[inline]
    pub fn source_id(&self) -> ThreadId {
        self.source.id
    }

    #[inline]
    pub fn destination_id(&self) -> ThreadId {
        self.destination.id
    }

    /// Gather the payload out of the sender's address space. Runs exactly
    /// once, in sender context, before the message is enqueued.
    pub fn collect_payload(&mut self) -> IpcResult<()> {
        match self.payload {
            Payload::Word(_) => Ok(()),
            Payload::Inline {
                sender_ptr,
                len,
                ref mut data,
                ..
            } => {
                if len == 0 || len > INLINE_PAYLOAD_MAX {
                    return Err(Status::InvalidData);
                }
                // A payload must not straddle the kernel/user boundary.
                if sender_ptr < USER_BASE && sender_ptr + len > USER_BASE {
                    return Err(Status::InvalidData);
                }
                *data = self.source.addr_space().read_bytes(sender_ptr, len)?;
                Ok(())
            }
            Payload::Shared {
                sender_ptr,
                len,
                ref mut frames,
                ref mut offset,
                ..
            } => {
                let (shared, start) = self.source.addr_space().share_frames(sender_ptr, len)?;
                *frames = shared;
                *offset = start;
                Ok(())
            }
        }
    }

    /// Make the payload visible in the recipient's address space. Runs
    /// exactly once, in recipient context, after retrieval.
    pub fn deliver_payload(&mut self) -> IpcResult<()> {
        match self.payload {
            Payload::Word(_) => Ok(()),
            Payload::Inline {
                ref data,
                ref mut receiver_ptr,
                ..
            } => {
                let space = self.destination.addr_space();
                let slot = space.alloc_medium_slot()?;
                space.write_bytes(slot, data)?;
                *receiver_ptr = slot;
                Ok(())
            }
            Payload::Shared {
                ref frames,
                offset,
                dest_hint,
                ref mut receiver_ptr,
                ..
            } => {
                let base = self.destination.addr_space().map_shared(frames, dest_hint)?;
                *receiver_ptr = base + offset;
                Ok(())
            }
        }
    }

    /// The delivered payload as (pointer-or-word, size). For a word payload
    /// the word itself is returned and the size is zero.
    pub fn read_payload(&self) -> (usize, usize) {
        match self.payload {
            Payload::Word(word) => (word, 0),
            Payload::Inline {
                receiver_ptr, len, ..
            } => (receiver_ptr, len),
            Payload::Shared {
                receiver_ptr, len, ..
            } => (receiver_ptr, len),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("source", &self.source.id)
            .field("destination", &self.destination.id)
            .field("type", &self.mtype)
            .field("id", &self.id)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::{AddressSpaceLayer, PAGE_SIZE};
    use crate::identity::Caps;

    fn endpoints() -> (Arc<Thread>, Arc<Thread>) {
        let layer = AddressSpaceLayer::new();
        let a = Thread::new(ThreadId::from(1), Caps::NONE, layer.create_space(), 8);
        let b = Thread::new(ThreadId::from(2), Caps::NONE, layer.create_space(), 8);
        (a, b)
    }

    #[test]
    fn word_payload_needs_no_transport() {
        let (a, b) = endpoints();
        let mut msg = Message::new_word(a, b, MessageType::NULL, MessageId::ATOMIC, 0xBEEF);
        msg.collect_payload().unwrap();
        msg.deliver_payload().unwrap();
        assert_eq!(msg.read_payload(), (0xBEEF, 0));
    }

    #[test]
    fn build_selects_the_variant_by_size() {
        let (a, b) = endpoints();
        let word = Message::build(a.clone(), b.clone(), MessageType::NULL, MessageId::ATOMIC, 7, 0, None);
        assert!(matches!(word.payload, Payload::Word(7)));

        let inline = Message::build(a.clone(), b.clone(), MessageType::NULL, MessageId::ATOMIC, 0, 100, None);
        assert!(matches!(inline.payload, Payload::Inline { .. }));

        let large = Message::build(a.clone(), b.clone(), MessageType::NULL, MessageId::ATOMIC, 0, 5000, None);
        assert!(matches!(large.payload, Payload::Shared { .. }));

        // A recipient-chosen address forces sharing regardless of size.
        let pinned = Message::build(a, b, MessageType::NULL, MessageId::ATOMIC, 0, 100, Some(0x4000_0000));
        assert!(matches!(pinned.payload, Payload::Shared { .. }));
    }

    #[test]
    fn inline_round_trip_preserves_bytes() {
        let (a, b) = endpoints();
        let src = a.addr_space().alloc_user(128);
        let bytes: Vec<u8> = (0..128u8).collect();
        a.addr_space().write_bytes(src, &bytes).unwrap();

        let mut msg = Message::build(a, b.clone(), MessageType::WRITE, MessageId::from(1), src, 128, None);
        msg.collect_payload().unwrap();
        msg.deliver_payload().unwrap();

        let (ptr, len) = msg.read_payload();
        assert_eq!(len, 128);
        assert_eq!(b.addr_space().read_bytes(ptr, len).unwrap(), bytes);
    }

    #[test]
    fn inline_collect_rejects_unreadable_source() {
        let (a, b) = endpoints();
        let mut msg = Message::build(a, b, MessageType::WRITE, MessageId::from(1), 0x4800_0000, 32, None);
        assert_eq!(msg.collect_payload(), Err(Status::InvalidData));
    }

    #[test]
    fn shared_round_trip_aliases_the_frames() {
        let (a, b) = endpoints();
        let len = 2 * PAGE_SIZE;
        let src = a.addr_space().alloc_user(len);
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        a.addr_space().write_bytes(src, &bytes).unwrap();

        let mut msg = Message::build(a.clone(), b.clone(), MessageType::WRITE, MessageId::from(2), src, len, None);
        msg.collect_payload().unwrap();
        msg.deliver_payload().unwrap();

        let (ptr, size) = msg.read_payload();
        assert_eq!(size, len);
        assert_eq!(b.addr_space().read_bytes(ptr, size).unwrap(), bytes);

        // Writes through the recipient's view land in the sender's frames.
        b.addr_space().write_bytes(ptr + 17, &[0xEE]).unwrap();
        assert_eq!(a.addr_space().read_bytes(src + 17, 1).unwrap(), vec![0xEE]);
    }

    #[test]
    fn shared_collect_denies_unauthorized_kernel_frames() {
        let (a, b) = endpoints();
        let kernel_addr = 0x8000;
        a.addr_space().write_bytes(kernel_addr, &[1; 64]).unwrap();

        let mut msg = Message::build(
            a.clone(),
            b.clone(),
            MessageType::NULL,
            MessageId::from(3),
            kernel_addr,
            PAGE_SIZE + 1,
            None,
        );
        assert_eq!(msg.collect_payload(), Err(Status::AccessDenied));

        a.addr_space().authorize_kernel_share(kernel_addr, PAGE_SIZE + 1);
        let mut msg = Message::build(a, b, MessageType::NULL, MessageId::from(3), kernel_addr, PAGE_SIZE + 1, None);
        msg.collect_payload().unwrap();
        msg.deliver_payload().unwrap();
    }

    #[test]
    fn reply_swaps_endpoints_and_keeps_the_id() {
        let (a, b) = endpoints();
        let mut request = Message::new_word(a.clone(), b.clone(), MessageType::OPEN, MessageId::from(42), 0);
        request.set_blocking();
        assert!(request.is_blocking());

        let reply = Message::reply_to(&request, MessageType::OPEN_COMPLETE, 0);
        assert_eq!(reply.source_id(), b.id);
        assert_eq!(reply.destination_id(), a.id);
        assert_eq!(reply.id, MessageId::from(42));
        assert!(!reply.is_blocking());
    }
}
