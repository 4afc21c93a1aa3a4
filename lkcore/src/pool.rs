use crate::message::{Message, POOL_INDEX_NONE};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The global pool of undelivered messages, i.e. the lottery tickets.
///
/// A dense vector with swap-remove; each message carries its own position as
/// an atomic back-reference, giving O(1) insertion, removal and uniform
/// random selection. A message is in the pool exactly while it sits in some
/// mailbox undelivered.
pub struct PendingPool {
    entries: Vec<Arc<Message>>,
}

impl PendingPool {
    pub fn new() -> PendingPool {
        PendingPool {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, msg: &Arc<Message>) {
        debug_assert_eq!(msg.pool_index.load(Ordering::Relaxed), POOL_INDEX_NONE);
        msg.pool_index.store(self.entries.len(), Ordering::Relaxed);
        self.entries.push(msg.clone());
    }

    pub fn remove(&mut self, msg: &Arc<Message>) {
        let index = msg.pool_index.swap(POOL_INDEX_NONE, Ordering::Relaxed);
        if index >= self.entries.len() || !Arc::ptr_eq(&self.entries[index], msg) {
            panic!("pending pool index corrupted for message {:?}", msg);
        }
        self.entries.swap_remove(index);
        if index < self.entries.len() {
            self.entries[index].pool_index.store(index, Ordering::Relaxed);
        }
    }

    /// Draw one ticket uniformly. The draw does not remove the message.
    pub fn select_random<R: Rng>(&self, rng: &mut R) -> Arc<Message> {
        debug_assert!(!self.entries.is_empty());
        self.entries[rng.gen_range(0..self.entries.len())].clone()
    }

    /// Every entry's back-reference matches its position.
    pub fn is_consistent(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, msg)| msg.pool_index.load(Ordering::Relaxed) == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::AddressSpaceLayer;
    use crate::identity::{Caps, MessageId, MessageType, ThreadId};
    use crate::thread::Thread;
    use hashbrown::HashMap;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn thread(id: i64) -> Arc<Thread> {
        let layer = AddressSpaceLayer::new();
        Thread::new(ThreadId::from(id), Caps::NONE, layer.create_space(), 8)
    }

    fn word(source: &Arc<Thread>, dest: &Arc<Thread>, id: u64) -> Arc<Message> {
        Arc::new(Message::new_word(
            source.clone(),
            dest.clone(),
            MessageType::NULL,
            MessageId::from(id),
            0,
        ))
    }

    #[test]
    fn insert_remove_keeps_indices_consistent() {
        let a = thread(1);
        let b = thread(2);
        let mut pool = PendingPool::new();

        let msgs: Vec<_> = (0..5).map(|i| word(&a, &b, i)).collect();
        for msg in &msgs {
            pool.insert(msg);
        }
        assert_eq!(pool.len(), 5);
        assert!(pool.is_consistent());

        // Removing from the middle exercises the swap-remove fixup.
        pool.remove(&msgs[1]);
        assert!(pool.is_consistent());
        pool.remove(&msgs[4]);
        assert!(pool.is_consistent());
        pool.remove(&msgs[0]);
        pool.remove(&msgs[2]);
        pool.remove(&msgs[3]);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic(expected = "pending pool index corrupted")]
    fn double_remove_is_corruption() {
        let a = thread(1);
        let b = thread(2);
        let mut pool = PendingPool::new();
        let msg = word(&a, &b, 1);
        pool.insert(&msg);
        pool.remove(&msg);
        pool.remove(&msg);
    }

    #[test]
    fn draw_does_not_remove() {
        let a = thread(1);
        let b = thread(2);
        let mut pool = PendingPool::new();
        pool.insert(&word(&a, &b, 1));

        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..10 {
            pool.select_random(&mut rng);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn selection_is_uniform_over_tickets() {
        // Destinations hold 1, 2, 3 and 4 tickets; the winner distribution
        // must converge to those proportions (chi-squared, 3 degrees of
        // freedom).
        let source = thread(0);
        let dests: Vec<_> = (1..=4).map(thread).collect();
        let mut pool = PendingPool::new();
        for (weight, dest) in dests.iter().enumerate() {
            for i in 0..=weight {
                pool.insert(&word(&source, dest, i as u64));
            }
        }
        assert_eq!(pool.len(), 10);

        let draws = 10_000usize;
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
        let mut wins: HashMap<ThreadId, usize> = HashMap::new();
        for _ in 0..draws {
            let msg = pool.select_random(&mut rng);
            *wins.entry(msg.destination_id()).or_insert(0) += 1;
        }

        let mut chi2 = 0.0f64;
        for (weight, dest) in dests.iter().enumerate() {
            let expected = draws as f64 * (weight + 1) as f64 / 10.0;
            let observed = *wins.get(&dest.id).unwrap_or(&0) as f64;
            chi2 += (observed - expected) * (observed - expected) / expected;
        }
        assert!(chi2 < 25.0, "chi-squared statistic too large: {}", chi2);
    }
}
