use crate::sched::Kernel;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// Kernel statistics reported out to user space.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KernelStats {
    // Memory stats
    pub address_space_count: u32,
    pub cow_fault_count: u64,
    pub page_fault_count: u64,
    pub total_memory_size: u64,
    pub paged_memory_size: u64,
    pub paged_region_count: u32,

    // Message stats
    pub message_count: u64,
    pub pending_count: u32,
    pub incomplete_count: u64,
    pub receive_error_count: u64,
    pub send_error_count: u64,

    // Scheduling stats
    pub lottery_count: u64,
    pub idle_count: u64,
    pub direct_handoff_count: u64,

    // Thread stats
    pub thread_count: u32,
}

impl Kernel {
    /// Snapshot the kernel counters. Callable at any time; the individual
    /// fields are read without mutual exclusion and may lag one another by
    /// an event or two.
    pub fn read_stats(&self) -> KernelStats {
        let counters = self.counters();
        let layer = self.layer();
        KernelStats {
            address_space_count: layer.space_count(),
            cow_fault_count: 0,
            page_fault_count: layer.page_fault_count(),
            total_memory_size: layer.mapped_bytes(),
            paged_memory_size: 0,
            paged_region_count: 0,
            message_count: counters.message_count.load(Ordering::Relaxed),
            pending_count: self.pending_count() as u32,
            incomplete_count: counters.incomplete_count.load(Ordering::Relaxed),
            receive_error_count: counters.receive_error_count.load(Ordering::Relaxed),
            send_error_count: counters.send_error_count.load(Ordering::Relaxed),
            lottery_count: counters.lottery_count.load(Ordering::Relaxed),
            idle_count: counters.idle_count.load(Ordering::Relaxed),
            direct_handoff_count: counters.direct_handoff_count.load(Ordering::Relaxed),
            thread_count: self.thread_count() as u32,
        }
    }
}
