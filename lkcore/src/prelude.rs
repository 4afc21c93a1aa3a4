pub use crate::config::KernelConfig;
pub use crate::identity::{Caps, MessageId, MessageType, ThreadId};
pub use crate::message::Message;
pub use crate::monitor::KernelStats;
pub use crate::sched::Kernel;
pub use crate::status::{IpcResult, SendError, Status};
