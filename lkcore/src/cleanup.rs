use crate::hal::Parker;
use crate::identity::{Caps, MessageType, ThreadId};
use crate::message::Message;
use crate::sched::Kernel;
use crate::status::{Status, STATUS_SUCCESS};
use slog::{trace, warn};
use std::sync::Arc;
use std::thread as os_thread;

/// Bind an OS thread to the well-known cleanup thread and start its message
/// loop. All thread deletion funnels through here; a thread wishing to exit,
/// or to kill another thread, sends it a DELETE_THREAD message.
pub fn spawn(kernel: &Arc<Kernel>) -> os_thread::JoinHandle<()> {
    let cleanup = kernel.cleanup_thread().clone();
    cleanup.attach_parker(Parker::new());
    let kernel = kernel.clone();
    os_thread::Builder::new()
        .name("lk-cleanup".into())
        .spawn(move || {
            if kernel.hal().park_until_current(&cleanup) {
                run(&kernel);
            }
        })
        .unwrap_or_else(|e| panic!("unable to start the cleanup thread: {}", e))
}

/// Main loop of the cleanup thread. Blocks when no deletion requests are
/// pending; never returns under normal operation.
fn run(kernel: &Arc<Kernel>) {
    trace!(kernel.log(), "cleanup thread starting");
    loop {
        let msg = match kernel.receive(true) {
            Ok(msg) => msg,
            Err(Status::MailboxDisabled) => break,
            Err(status) => {
                warn!(kernel.log(), "cleanup thread unable to receive"; "status" => %status);
                continue;
            }
        };
        match msg.mtype {
            MessageType::DELETE_THREAD => handle_delete(kernel, &msg),
            MessageType::NULL | MessageType::START_USER_THREAD => {}
            other => {
                trace!(kernel.log(), "cleanup thread ignoring message"; "type" => %other);
            }
        }
    }
}

/// Handler for a single DELETE_THREAD request.
///
/// The victim is named by the payload word; the LOOPBACK sentinel means the
/// sender itself. The sender must either be the victim or hold the deletion
/// capability. A blocking request from a third party is acknowledged with
/// DELETE_THREAD_COMPLETE once the victim is gone.
pub(crate) fn handle_delete(kernel: &Kernel, msg: &Message) {
    let requested = ThreadId::from_word(msg.read_payload().0);
    let sender = &msg.source;

    let victim_id = if requested == ThreadId::LOOPBACK {
        sender.id
    } else {
        requested
    };

    if !sender.has_capability(Caps::DELETE_THREAD) && sender.id != victim_id {
        trace!(kernel.log(), "insufficient privileges to destroy thread";
            "victim" => %victim_id, "sender" => %sender.id);
        kernel.put_response(msg, MessageType::ABORT, Status::AccessDenied);
        return;
    }

    let victim = match kernel.find_thread(victim_id) {
        Some(victim) => victim,
        None => {
            trace!(kernel.log(), "unable to reclaim nonexistent thread"; "victim" => %victim_id);
            kernel.put_response(msg, MessageType::ABORT, Status::InvalidData);
            return;
        }
    };

    // A third party blocked on this deletion wants to know when it is done.
    // A gracefully exiting thread will not survive to care.
    let ack = if sender.id != victim.id && msg.is_blocking() {
        Some(Message::reply_to(
            msg,
            MessageType::DELETE_THREAD_COMPLETE,
            STATUS_SUCCESS as usize,
        ))
    } else {
        None
    };

    kernel.drain_messages(&victim, ack);
    kernel.unregister(&victim);
}

/// Ask the cleanup thread to destroy `victim` and block until it has been.
/// The caller must not hold a reference that would keep the victim alive
/// forever. Mirrors graceful exit when `victim` is the calling thread.
pub fn request_delete(kernel: &Kernel, victim: ThreadId) -> Result<(), Status> {
    let request = Message::new_word(
        kernel.current_thread(),
        kernel.cleanup_thread().clone(),
        MessageType::DELETE_THREAD,
        kernel.fresh_message_id(),
        victim.to_word(),
    );
    let reply = kernel.send_and_receive(request).map_err(|e| e.status)?;

    let (word, _) = reply.read_payload();
    match word as isize {
        STATUS_SUCCESS => Ok(()),
        code => Err(Status::from_code(code).unwrap_or(Status::IoError)),
    }
}
