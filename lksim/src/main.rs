use clap::{App, Arg};
use lkcore::cleanup;
use lkcore::config::KernelConfig;
use lkcore::identity::{Caps, MessageType};
use lkcore::message::Message;
use lkcore::sched::Kernel;
use slog::{info, warn};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::thread;
use std::time::Duration;

/// Boots the kernel core and runs a synthetic workload against it: one echo
/// server plus a handful of client threads issuing synchronous transactions,
/// with this thread acting as the timer. Prints the kernel stats record when
/// the workload completes.
fn main() {
    let matches = App::new("lksim")
        .about("message-passing kernel core simulator")
        .arg(
            Arg::with_name("ticks")
                .long("ticks")
                .takes_value(true)
                .default_value("200000")
                .help("Maximum number of timer ticks to drive"),
        )
        .arg(
            Arg::with_name("workers")
                .long("workers")
                .takes_value(true)
                .default_value("4")
                .help("Number of client threads"),
        )
        .arg(
            Arg::with_name("requests")
                .long("requests")
                .takes_value(true)
                .default_value("50")
                .help("Transactions issued per client"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("Lottery PRNG seed override"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("Kernel config TOML file"),
        )
        .arg(Arg::with_name("verbose").short("v").long("verbose"))
        .get_matches();

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if matches.is_present("verbose") {
        Severity::Trace
    } else {
        Severity::Info
    });
    builder.destination(Destination::Stderr);
    let log = builder.build().expect("unable to build the logger");

    let mut cfg: KernelConfig = match matches.value_of("config") {
        Some(path) => serdeconv::from_toml_file(path).expect("unable to read the config file"),
        None => KernelConfig::default(),
    };
    if let Some(seed) = matches.value_of("seed") {
        cfg.rng_seed = Some(seed.parse().expect("seed must be an integer"));
    }

    let max_ticks: u64 = matches
        .value_of("ticks")
        .unwrap()
        .parse()
        .expect("ticks must be an integer");
    let workers: usize = matches
        .value_of("workers")
        .unwrap()
        .parse()
        .expect("workers must be an integer");
    let requests: usize = matches
        .value_of("requests")
        .unwrap()
        .parse()
        .expect("requests must be an integer");

    let kernel = Kernel::boot(cfg, log.clone());
    cleanup::spawn(&kernel);

    // The echo server answers READ transactions until told to CLOSE.
    let (server, server_handle) = kernel
        .spawn(Caps::NONE, |kernel, _me| loop {
            match kernel.receive(true) {
                Ok(request) => match request.mtype {
                    MessageType::READ => {
                        let (word, _) = request.read_payload();
                        let reply = Message::reply_to(&request, MessageType::READ_COMPLETE, word);
                        let _ = kernel.send(reply);
                    }
                    MessageType::CLOSE => break,
                    _ => {}
                },
                Err(_) => break,
            }
        })
        .expect("unable to spawn the echo server");
    let server_id = server.id;

    let mut clients = Vec::with_capacity(workers);
    for worker in 0..workers {
        let log = log.clone();
        let (_, handle) = kernel
            .spawn(Caps::NONE, move |kernel, me| {
                let dest = match kernel.find_thread(server_id) {
                    Some(dest) => dest,
                    None => return,
                };
                for i in 0..requests {
                    let payload = worker * 1_000_000 + i;
                    let request = Message::new_word(
                        me.clone(),
                        dest.clone(),
                        MessageType::READ,
                        kernel.fresh_message_id(),
                        payload,
                    );
                    match kernel.send_and_receive(request) {
                        Ok(reply)
                            if reply.mtype == MessageType::READ_COMPLETE
                                && reply.read_payload().0 == payload => {}
                        Ok(reply) => {
                            warn!(log, "transaction aborted";
                                "worker" => worker, "type" => %reply.mtype);
                            break;
                        }
                        Err(err) => {
                            warn!(log, "send failed";
                                "worker" => worker, "status" => %err.status);
                            break;
                        }
                    }
                }
            })
            .expect("unable to spawn a client");
        clients.push(handle);
    }

    // This thread is the clock. Hand the CPU off and drive ticks until the
    // workload drains.
    kernel.yield_now();
    let mut driven = 0u64;
    while driven < max_ticks {
        kernel.timer_tick();
        driven += 1;
        thread::sleep(Duration::from_micros(20));
        if clients.iter().all(|handle| handle.is_finished()) {
            break;
        }
    }
    for handle in clients {
        let _ = handle.join();
    }

    // Retire the server and let the cleanup thread reclaim it.
    let close = Message::new_word(
        kernel.boot_thread().clone(),
        server,
        MessageType::CLOSE,
        kernel.fresh_message_id(),
        0,
    );
    let _ = kernel.send(close);
    let mut shutdown_ticks = 0u64;
    while !server_handle.is_finished() && shutdown_ticks < 100_000 {
        kernel.timer_tick();
        shutdown_ticks += 1;
        thread::sleep(Duration::from_micros(20));
    }
    let _ = server_handle.join();

    info!(log, "simulation complete"; "ticks" => driven);
    let stats = kernel.read_stats();
    match serde_json::to_string_pretty(&stats) {
        Ok(rendered) => println!("{}", rendered),
        Err(e) => warn!(log, "unable to render stats"; "error" => %e),
    }
}
