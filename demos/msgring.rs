//! Message ring benchmark
//!
//! `loop_size` processes form a ring and pass `batch` tokens around it until
//! `messages` hops have been made in total.
//!
//! ```text
//! cargo run --release --example msgring -- -t 4 -l 1000 -m 50000 -b 1
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use libtask::{Process, Scheduler};

struct Ring {
    members: Vec<Arc<Process>>,
    master: Arc<Process>,
    hops: AtomicUsize,
    target: usize,
    outstanding: AtomicUsize,
    started: Instant,
}

fn pass_token(ring: Arc<Ring>, at: usize) {
    let hops = ring.hops.fetch_add(1, Ordering::Relaxed) + 1;
    if hops < ring.target {
        let next = (at + 1) % ring.members.len();
        let member = Arc::clone(&ring.members[next]);
        member.enqueue_message(move || pass_token(ring, next));
    } else if ring.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
        let master = Arc::clone(&ring.master);
        master.enqueue_message(move || finish(ring));
    }
}

fn finish(ring: Arc<Ring>) {
    let secs = ring.started.elapsed().as_secs_f64();
    let hops = ring.hops.load(Ordering::Relaxed);
    println!(
        "Msgring  loopsize: {}  messages: {}  secs: {:.3}  rate: {:.0} msg/s",
        ring.members.len(),
        hops,
        secs,
        hops as f64 / secs
    );
    for member in &ring.members {
        let me = Arc::clone(member);
        member.enqueue_message(move || me.exit());
    }
    ring.master.exit();
}

fn parse_args() -> Result<(usize, usize, usize, usize), String> {
    let (mut threads, mut loop_size, mut messages, mut batch) =
        (Scheduler::num_processors(), 1000, 50_000, 1);
    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        let value: usize = args
            .next()
            .ok_or_else(|| format!("{} needs a value", flag))?
            .parse()
            .map_err(|e| format!("{}: {}", flag, e))?;
        match flag.as_str() {
            "-t" => threads = value,
            "-l" => loop_size = value,
            "-m" => messages = value,
            "-b" => batch = value,
            other => return Err(format!("unknown option {}", other)),
        }
    }
    if loop_size == 0 || batch == 0 {
        return Err("loop size and batch must be positive".to_string());
    }
    Ok((threads, loop_size, messages, batch))
}

fn main() -> ExitCode {
    let (threads, loop_size, messages, batch) = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("msgring: {}", e);
            eprintln!("usage: msgring [-t threads] [-l loop_size] [-m messages] [-b batch]");
            return ExitCode::FAILURE;
        }
    };

    let master = Process::new("msgring-master");
    let me = Arc::clone(&master);
    master.enqueue_message(move || {
        // Created on a scheduler so the mailboxes use the configured lock.
        let members: Vec<_> = (0..loop_size)
            .map(|i| Process::new(format!("msgring-{}", i)))
            .collect();
        let ring = Arc::new(Ring {
            members,
            master: me,
            hops: AtomicUsize::new(0),
            target: messages,
            outstanding: AtomicUsize::new(batch),
            started: Instant::now(),
        });
        for b in 0..batch {
            let at = b % loop_size;
            let ring = Arc::clone(&ring);
            let member = Arc::clone(&ring.members[at]);
            member.enqueue_message(move || pass_token(ring, at));
        }
    });

    match Scheduler::start_schedulers(threads, master, true) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("msgring: {}", e);
            ExitCode::FAILURE
        }
    }
}
