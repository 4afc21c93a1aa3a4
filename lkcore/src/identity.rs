use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Unique numeric thread identity. No two threads share an id simultaneously,
/// even across address spaces. Negative values are reserved for well-known
/// kernel threads and sentinels.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ThreadId(i64);

impl ThreadId {
    pub const INVALID: ThreadId = ThreadId(-1);
    /// Loopback to the sending thread itself.
    pub const LOOPBACK: ThreadId = ThreadId(-2);
    pub const CLEANUP: ThreadId = ThreadId(-15);
    pub const BOOT: ThreadId = ThreadId(-16);
    pub const IDLE: ThreadId = ThreadId(-255);
    pub const NULL: ThreadId = ThreadId(-256);

    #[inline]
    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }

    /// Reconstructs an id from a raw syscall word.
    #[inline]
    pub fn from_word(word: usize) -> ThreadId {
        ThreadId(word as i64)
    }

    #[inline]
    pub fn to_word(self) -> usize {
        self.0 as usize
    }
}

impl From<i64> for ThreadId {
    #[inline]
    fn from(id: i64) -> Self {
        ThreadId(id)
    }
}

impl Into<i64> for ThreadId {
    #[inline]
    fn into(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque correlator tying a request to its reply.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Self-contained message: not part of a transaction, no reply expected.
    pub const ATOMIC: MessageId = MessageId(u64::MAX);

    #[inline]
    pub fn is_atomic(self) -> bool {
        self == MessageId::ATOMIC
    }

    #[inline]
    pub fn from_word(word: usize) -> MessageId {
        MessageId(word as u64)
    }

    #[inline]
    pub fn to_word(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for MessageId {
    #[inline]
    fn from(id: u64) -> Self {
        MessageId(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Message type tag. The upper half of the tag space is reserved for system
/// messages; the lower half is free for applications.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MessageType(u64);

const SYSTEM_FLAG: u64 = 1 << 63;

const fn system(v: u64) -> MessageType {
    MessageType(SYSTEM_FLAG | v)
}

impl MessageType {
    pub const NULL: MessageType = system(0);
    pub const ABORT: MessageType = system(1);
    pub const DELETE_THREAD: MessageType = system(2);
    pub const DELETE_THREAD_COMPLETE: MessageType = system(3);
    pub const LOAD_ADDRESS_SPACE: MessageType = system(4);
    pub const START_USER_THREAD: MessageType = system(5);

    pub const HANDLE_INTERRUPT: MessageType = system(6);
    pub const ACKNOWLEDGE_INTERRUPT: MessageType = system(7);
    pub const DEFER_INTERRUPT: MessageType = system(8);
    pub const DISABLE_INTERRUPT_HANDLER: MessageType = system(9);
    pub const ENABLE_INTERRUPT_HANDLER: MessageType = system(10);

    pub const OPEN: MessageType = system(32);
    pub const OPEN_COMPLETE: MessageType = system(33);
    pub const CLOSE: MessageType = system(34);
    pub const CLOSE_COMPLETE: MessageType = system(35);
    pub const READ: MessageType = system(36);
    pub const READ_COMPLETE: MessageType = system(37);
    pub const WRITE: MessageType = system(38);
    pub const WRITE_COMPLETE: MessageType = system(39);
    pub const FLUSH: MessageType = system(40);
    pub const FLUSH_COMPLETE: MessageType = system(41);
    pub const RESET: MessageType = system(42);
    pub const RESET_COMPLETE: MessageType = system(43);

    #[inline]
    pub fn is_system(self) -> bool {
        self.0 & SYSTEM_FLAG != 0
    }

    #[inline]
    pub fn from_word(word: usize) -> MessageType {
        MessageType(word as u64)
    }

    #[inline]
    pub fn to_word(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for MessageType {
    #[inline]
    fn from(tag: u64) -> Self {
        MessageType(tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Capability set carried by a thread, checked at privileged operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Caps(u32);

impl Caps {
    pub const NONE: Caps = Caps(0);
    pub const DELETE_THREAD: Caps = Caps(1 << 0);
    pub const ALL: Caps = Caps(u32::MAX);

    #[inline]
    pub fn contains(self, other: Caps) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn with(self, other: Caps) -> Caps {
        Caps(self.0 | other.0)
    }
}
