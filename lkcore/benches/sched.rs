use criterion::{criterion_group, criterion_main, Criterion};
use lkcore::config::KernelConfig;
use lkcore::identity::{Caps, MessageId, MessageType, ThreadId};
use lkcore::mailbox::Mailbox;
use lkcore::message::Message;
use lkcore::pool::PendingPool;
use lkcore::sched::Kernel;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use slog::o;
use std::sync::Arc;

fn kernel() -> Arc<Kernel> {
    let cfg = KernelConfig {
        rng_seed: Some(7),
        ..KernelConfig::default()
    };
    Kernel::boot(cfg, slog::Logger::root(slog::Discard, o!()))
}

fn pool_selection(c: &mut Criterion) {
    let kernel = kernel();
    let boot = kernel.boot_thread().clone();
    let mut pool = PendingPool::new();
    for _ in 0..64 {
        let dest = kernel.register_thread(Caps::NONE);
        let msg = Arc::new(Message::new_word(
            boot.clone(),
            dest,
            MessageType::NULL,
            MessageId::ATOMIC,
            0,
        ));
        pool.insert(&msg);
    }
    let mut rng = SmallRng::seed_from_u64(3);
    c.bench_function("pool_select_random", move |b| {
        b.iter(|| pool.select_random(&mut rng))
    });
}

fn mailbox_cycle(c: &mut Criterion) {
    let kernel = kernel();
    let boot = kernel.boot_thread().clone();
    let owner = ThreadId::from(500);
    let mut mailbox = Mailbox::new(64);
    c.bench_function("mailbox_put_get", move |b| {
        b.iter(|| {
            let msg = Arc::new(Message::new_word(
                boot.clone(),
                boot.clone(),
                MessageType::NULL,
                MessageId::ATOMIC,
                0,
            ));
            mailbox.put(owner, msg, false).unwrap();
            mailbox.get().unwrap()
        })
    });
}

fn self_send_receive(c: &mut Criterion) {
    let kernel = kernel();
    c.bench_function("self_send_receive", move |b| {
        b.iter(|| {
            let boot = kernel.boot_thread().clone();
            let msg = Message::new_word(
                boot.clone(),
                boot,
                MessageType::NULL,
                MessageId::ATOMIC,
                0,
            );
            kernel.send(msg).unwrap();
            kernel.receive(false).unwrap()
        })
    });
}

criterion_group!(benches, pool_selection, mailbox_cycle, self_send_receive);
criterion_main!(benches);
