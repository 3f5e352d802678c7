//! Socket pair throughput
//!
//! One actor writes `bytes` bytes into a non-blocking socket pair and
//! another reads them back, both driven by fd watcher readiness callbacks.
//!
//! ```text
//! cargo run --release --example pipe_pair -- -b 1000000 -t 2
//! ```

use std::env;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use libtask::{fd_watcher, Actor, Events, Process, Scheduler};

const CHUNK: usize = 16 * 1024;

struct Side {
    stream: UnixStream,
    total: usize,
    done: usize,
    calls: usize,
}

type Step = fn(&mut Side, &Actor<Side>);

/// Run `step` on `actor` the next time `fd` is ready for `events`.
fn arm(actor: Actor<Side>, fd: RawFd, events: Events, step: Step) {
    match fd_watcher() {
        Ok(watcher) => watcher.register_fd_callback(fd, events, move |_, _| actor.tell(step)),
        Err(e) => {
            eprintln!("pipe_pair: {}", e);
            actor.tell(|_, me| me.exit());
        }
    }
}

fn advance(side: &mut Side, me: &Actor<Side>, result: io::Result<usize>, events: Events, step: Step) {
    match result {
        Ok(0) if events == Events::READ => {
            eprintln!("pipe_pair: peer closed after {} bytes", side.done);
            side.done = side.total;
        }
        Ok(n) => side.done += n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            eprintln!("pipe_pair: {}", e);
            side.done = side.total;
        }
    }
    side.calls += 1;
    if side.done >= side.total {
        println!(
            "{}: {} bytes in {} calls",
            me.process().process_name(),
            side.done,
            side.calls
        );
        me.exit();
    } else {
        arm(me.clone(), side.stream.as_raw_fd(), events, step);
    }
}

fn write_some(side: &mut Side, me: &Actor<Side>) {
    let buf = [0x5au8; CHUNK];
    let want = (side.total - side.done).min(CHUNK);
    let result = (&side.stream).write(&buf[..want]);
    advance(side, me, result, Events::WRITE, write_some);
}

fn read_some(side: &mut Side, me: &Actor<Side>) {
    let mut buf = [0u8; CHUNK];
    let result = (&side.stream).read(&mut buf);
    advance(side, me, result, Events::READ, read_some);
}

fn parse_args() -> Result<(usize, usize), String> {
    let (mut bytes, mut threads) = (1_000_000, Scheduler::num_processors());
    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        let value: usize = args
            .next()
            .ok_or_else(|| format!("{} needs a value", flag))?
            .parse()
            .map_err(|e| format!("{}: {}", flag, e))?;
        match flag.as_str() {
            "-b" => bytes = value,
            "-t" => threads = value,
            other => return Err(format!("unknown option {}", other)),
        }
    }
    Ok((bytes, threads))
}

fn main() -> ExitCode {
    let (bytes, threads) = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("pipe_pair: {}", e);
            eprintln!("usage: pipe_pair [-b bytes] [-t threads]");
            return ExitCode::FAILURE;
        }
    };
    let (read_end, write_end) = match UnixStream::pair().and_then(|(r, w)| {
        r.set_nonblocking(true)?;
        w.set_nonblocking(true)?;
        Ok((r, w))
    }) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("pipe_pair: socketpair: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let starter = Process::new("pipe_pair");
    let me = Arc::clone(&starter);
    starter.enqueue_message(move || {
        let (read_fd, write_fd) = (read_end.as_raw_fd(), write_end.as_raw_fd());
        let side = |stream| Side {
            stream,
            total: bytes,
            done: 0,
            calls: 0,
        };
        arm(Actor::new("reader", side(read_end)), read_fd, Events::READ, read_some);
        arm(Actor::new("writer", side(write_end)), write_fd, Events::WRITE, write_some);
        me.exit();
    });

    let started = Instant::now();
    if let Err(e) = Scheduler::start_schedulers(threads, starter, true) {
        eprintln!("pipe_pair: {}", e);
        return ExitCode::FAILURE;
    }
    let secs = started.elapsed().as_secs_f64();
    println!("Bytes: {}", bytes);
    println!("Time: {:.3}", secs);
    println!("Rate: {:.0} bytes/s", bytes as f64 / secs);
    ExitCode::SUCCESS
}
