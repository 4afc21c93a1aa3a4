use crate::addrspace::LARGE_PAYLOAD_POOL_BASE;
use crate::identity::{MessageId, MessageType, ThreadId};
use crate::message::{Message, INLINE_PAYLOAD_MAX};
use crate::sched::Kernel;
use crate::status::{Status, STATUS_SUCCESS};

/// System-call vectors exported by the IPC core.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Vector {
    SendMessage,
    SendAndReceiveMessage,
    ReceiveMessage,
    DeleteMessage,
    ReadKernelStats,
}

/// The fixed argument block every system call reads and writes: six generic
/// word-sized fields plus a status output.
#[derive(Clone, Debug, Default)]
pub struct SyscallFrame {
    pub data: [usize; 6],
    pub status: isize,
}

impl SyscallFrame {
    pub fn new(data: [usize; 6]) -> SyscallFrame {
        SyscallFrame { data, status: 0 }
    }

    fn store_message(&mut self, msg: &Message) {
        let (payload, payload_size) = msg.read_payload();
        self.data[0] = msg.source_id().to_word();
        self.data[1] = msg.mtype.to_word();
        self.data[2] = msg.id.to_word();
        self.data[3] = payload;
        self.data[4] = payload_size;
        self.status = STATUS_SUCCESS;
    }
}

/// Dispatch one system call on behalf of the current thread.
pub fn dispatch(kernel: &Kernel, vector: Vector, frame: &mut SyscallFrame) {
    match vector {
        Vector::SendMessage => send_message(kernel, frame),
        Vector::SendAndReceiveMessage => send_and_receive_message(kernel, frame),
        Vector::ReceiveMessage => receive_message(kernel, frame),
        Vector::DeleteMessage => delete_message(kernel, frame),
        Vector::ReadKernelStats => read_kernel_stats(kernel, frame),
    }
}

fn build_request(kernel: &Kernel, frame: &SyscallFrame) -> Result<Message, Status> {
    let destination = kernel
        .find_thread(ThreadId::from_word(frame.data[0]))
        .ok_or(Status::InvalidData)?;
    let dest_addr = match frame.data[5] {
        0 => None,
        addr => Some(addr),
    };
    Ok(Message::build(
        kernel.current_thread(),
        destination,
        MessageType::from_word(frame.data[1]),
        MessageId::from_word(frame.data[2]),
        frame.data[3],
        frame.data[4],
        dest_addr,
    ))
}

/// Queue a message to its destination, returning without waiting for any
/// response.
///
/// in:  data0..data5 = dest id, type, id, payload ptr, payload size, dest addr
/// out: status
fn send_message(kernel: &Kernel, frame: &mut SyscallFrame) {
    frame.status = match build_request(kernel, frame) {
        Ok(msg) => match kernel.send(msg) {
            Ok(()) => STATUS_SUCCESS,
            Err(err) => err.status.code(),
        },
        Err(status) => status.code(),
    };
}

/// Send a message, block until the recipient replies, and return the reply
/// to the calling thread.
///
/// in:  data0..data5 = dest id, type, id, payload ptr, payload size, dest addr
/// out: data0..data4 = source id, type, id, payload ptr, payload size; status
fn send_and_receive_message(kernel: &Kernel, frame: &mut SyscallFrame) {
    match build_request(kernel, frame) {
        Ok(request) => match kernel.send_and_receive(request) {
            Ok(reply) => frame.store_message(&reply),
            Err(err) => frame.status = err.status.code(),
        },
        Err(status) => frame.status = status.code(),
    }
}

/// Retrieve the next message pending for the calling thread.
///
/// in:  data0 = wait for a message if the mailbox is empty?
/// out: data0..data4 = source id, type, id, payload ptr, payload size; status
fn receive_message(kernel: &Kernel, frame: &mut SyscallFrame) {
    match kernel.receive(frame.data[0] != 0) {
        Ok(msg) => frame.store_message(&msg),
        Err(status) => frame.status = status.code(),
    }
}

/// Free a delivered payload after the application is done reading it. The
/// address decides which per-space window the payload came from; a word
/// payload needs no cleanup.
///
/// in:  data0 = payload ptr, data1 = payload size
/// out: status
fn delete_message(kernel: &Kernel, frame: &mut SyscallFrame) {
    let payload = frame.data[0];
    let payload_size = frame.data[1];
    if payload_size > 0 {
        let current = kernel.current_thread();
        let space = current.addr_space();
        if payload >= LARGE_PAYLOAD_POOL_BASE {
            space.unshare(payload, payload_size);
            space.free_large_block(payload);
        } else {
            debug_assert!(payload_size <= INLINE_PAYLOAD_MAX);
            space.free_medium_slot(payload);
        }
    }
    frame.status = STATUS_SUCCESS;
}

/// Serialize the kernel stats record into a caller-supplied buffer.
///
/// in:  data0 = buffer ptr, data1 = buffer capacity
/// out: data1 = record length; status
fn read_kernel_stats(kernel: &Kernel, frame: &mut SyscallFrame) {
    let stats = kernel.read_stats();
    let encoded = match serde_json::to_vec(&stats) {
        Ok(encoded) => encoded,
        Err(_) => {
            frame.status = Status::IoError.code();
            return;
        }
    };
    if encoded.len() > frame.data[1] {
        frame.status = Status::InvalidData.code();
        return;
    }
    let current = kernel.current_thread();
    frame.status = match current.addr_space().write_bytes(frame.data[0], &encoded) {
        Ok(()) => {
            frame.data[1] = encoded.len();
            STATUS_SUCCESS
        }
        Err(status) => status.code(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::PAGE_SIZE;
    use crate::monitor::KernelStats;
    use crate::sched::tests::test_kernel;

    #[test]
    fn word_message_round_trip() {
        let kernel = test_kernel(40);
        let me = kernel.boot_thread().id.to_word();

        let mut send = SyscallFrame::new([me, 0x11, MessageId::ATOMIC.to_word(), 0xFACE, 0, 0]);
        dispatch(&kernel, Vector::SendMessage, &mut send);
        assert_eq!(send.status, STATUS_SUCCESS);

        let mut recv = SyscallFrame::new([0, 0, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::ReceiveMessage, &mut recv);
        assert_eq!(recv.status, STATUS_SUCCESS);
        assert_eq!(recv.data[0], me);
        assert_eq!(recv.data[1], 0x11);
        assert_eq!(recv.data[3], 0xFACE);
        assert_eq!(recv.data[4], 0);

        // Word payloads need no DELETE_MESSAGE.
        let mut del = SyscallFrame::new([recv.data[3], recv.data[4], 0, 0, 0, 0]);
        dispatch(&kernel, Vector::DeleteMessage, &mut del);
        assert_eq!(del.status, STATUS_SUCCESS);
    }

    #[test]
    fn inline_payload_round_trip_and_free() {
        let kernel = test_kernel(41);
        let boot = kernel.boot_thread().clone();
        let me = boot.id.to_word();

        let src = boot.addr_space().alloc_user(64);
        let bytes: Vec<u8> = (100u8..164).collect();
        boot.addr_space().write_bytes(src, &bytes).unwrap();

        let mut send = SyscallFrame::new([me, 0x22, 1, src, bytes.len(), 0]);
        dispatch(&kernel, Vector::SendMessage, &mut send);
        assert_eq!(send.status, STATUS_SUCCESS);

        let mut recv = SyscallFrame::new([0, 0, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::ReceiveMessage, &mut recv);
        assert_eq!(recv.status, STATUS_SUCCESS);
        let delivered = recv.data[3];
        assert_ne!(delivered, src);
        assert_eq!(
            boot.addr_space().read_bytes(delivered, recv.data[4]).unwrap(),
            bytes
        );

        let mut del = SyscallFrame::new([delivered, recv.data[4], 0, 0, 0, 0]);
        dispatch(&kernel, Vector::DeleteMessage, &mut del);
        assert_eq!(del.status, STATUS_SUCCESS);
        // The slot is back on the free list.
        assert_eq!(boot.addr_space().alloc_medium_slot().unwrap(), delivered);
    }

    #[test]
    fn large_payload_round_trip_and_free() {
        let kernel = test_kernel(42);
        let boot = kernel.boot_thread().clone();
        let me = boot.id.to_word();

        let len = 2 * PAGE_SIZE;
        let src = boot.addr_space().alloc_user(len);
        let bytes: Vec<u8> = (0..len).map(|i| (i % 131) as u8).collect();
        boot.addr_space().write_bytes(src, &bytes).unwrap();

        let mut send = SyscallFrame::new([me, 0x33, 2, src, len, 0]);
        dispatch(&kernel, Vector::SendMessage, &mut send);
        assert_eq!(send.status, STATUS_SUCCESS);

        let mut recv = SyscallFrame::new([0, 0, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::ReceiveMessage, &mut recv);
        assert_eq!(recv.status, STATUS_SUCCESS);
        let delivered = recv.data[3];
        assert!(delivered >= LARGE_PAYLOAD_POOL_BASE);
        assert_eq!(boot.addr_space().read_bytes(delivered, len).unwrap(), bytes);

        let mut del = SyscallFrame::new([delivered, len, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::DeleteMessage, &mut del);
        assert_eq!(del.status, STATUS_SUCCESS);
        assert!(boot.addr_space().read_bytes(delivered, 1).is_err());
    }

    #[test]
    fn unknown_destination_is_invalid() {
        let kernel = test_kernel(43);
        let mut send = SyscallFrame::new([9999, 0x11, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::SendMessage, &mut send);
        assert_eq!(send.status, Status::InvalidData.code());
    }

    #[test]
    fn transaction_with_self_reports_the_deadlock() {
        let kernel = test_kernel(44);
        let me = kernel.boot_thread().id.to_word();
        let mut frame = SyscallFrame::new([me, 0x11, 3, 0, 0, 0]);
        dispatch(&kernel, Vector::SendAndReceiveMessage, &mut frame);
        assert_eq!(frame.status, Status::MessageDeadlock.code());
    }

    #[test]
    fn stats_land_in_the_caller_buffer() {
        let kernel = test_kernel(45);
        let boot = kernel.boot_thread().clone();
        let buffer = boot.addr_space().alloc_user(4096);

        let mut frame = SyscallFrame::new([buffer, 4096, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::ReadKernelStats, &mut frame);
        assert_eq!(frame.status, STATUS_SUCCESS);

        let raw = boot.addr_space().read_bytes(buffer, frame.data[1]).unwrap();
        let stats: KernelStats = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stats.thread_count, 4);

        // A buffer that cannot hold the record is rejected.
        let mut small = SyscallFrame::new([buffer, 8, 0, 0, 0, 0]);
        dispatch(&kernel, Vector::ReadKernelStats, &mut small);
        assert_eq!(small.status, Status::InvalidData.code());
    }
}
