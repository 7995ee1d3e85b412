//! # tracehook - Main Entry Point
//!
//! Builds an [`Engine`] over either the running Linux host or the simulated
//! host (`--simulate`), then runs control commands from the command line and,
//! with `--stdin`, from standard input. With `--watch <secs>` breakpoint hits
//! are delivered to the engine for that long afterwards.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};

use tracehook::cli::Args;
use tracehook::control::ControlReply;
use tracehook::engine::{Engine, HitOutcome};
use tracehook::host::linux::{self, perf, LinuxHost};
use tracehook::host::sim::SimulatedHost;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// How often the hit pump polls trap counters
const HIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Simulated host with hook entry points and one scripted process
fn simulated_host() -> Arc<SimulatedHost> {
    let host = SimulatedHost::new();
    host.add_symbol("do_faccessat", 0xffff_ffc0_1020_0000);
    host.add_symbol("do_sys_openat2", 0xffff_ffc0_1021_0000);
    host.add_symbol("__arm64_sys_kill", 0xffff_ffc0_1030_0000);
    host.add_process(1000, "com.example.app", "example");
    host.map(1000, 0x7000_0000, 0x7000_4000, Some("/system/lib64/libexample.so"));
    host.write_memory(1000, 0x7000_1000, b"tracehook simulated memory\0");
    host
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.is_empty() {
        bail!(
            "Missing required argument: COMMAND or --stdin\n\n\
             Usage:\n  \
             tracehook --simulate get_status     Status of the simulated host\n  \
             tracehook help                      List control commands\n\n\
             Run 'tracehook --help' for more options"
        );
    }

    let settings = args.settings()?;

    let mut simulated = None;
    let mut live = None;
    let caps = if args.simulate {
        let host = simulated_host();
        let caps = host.capabilities();
        simulated = Some(host);
        caps
    } else {
        linux::check_privileges()?;
        let host = LinuxHost::open()?;
        match host.version() {
            Some(version) => match settings.layout_for(version) {
                Ok(_) => info!("Kernel {version}: structure layout available"),
                Err(e) => warn!("Kernel {version}: {e}"),
            },
            None => warn!("Could not determine the kernel version"),
        }
        let caps = host.capabilities();
        live = Some(host);
        caps
    };

    let engine = Engine::new(&settings, caps).context("Failed to build engine")?;

    if let Some(host) = &simulated {
        let report = engine.attach(host.as_ref(), host.as_ref())?;
        if !args.quiet {
            print!("{report}");
        }
    }

    if !args.quiet {
        eprintln!("tracehook v{}", env!("CARGO_PKG_VERSION"));
    }

    let mut failed = 0usize;
    for command in &args.commands {
        if !run_command(&engine, command, args.json)? {
            failed += 1;
        }
    }
    if args.stdin {
        for line in std::io::stdin().lock().lines() {
            let line = line.context("Failed to read stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            if !run_command(&engine, &line, args.json)? {
                failed += 1;
            }
        }
    }

    if args.watch > 0 {
        match &live {
            Some(host) => watch(&engine, host, Duration::from_secs(args.watch), args.quiet)?,
            None => warn!("--watch delivers hits from the live host only; ignored with --simulate"),
        }
    }

    if let Some(host) = &simulated {
        engine.detach(host.as_ref());
    }

    if failed > 0 {
        bail!("{failed} command(s) failed");
    }
    Ok(())
}

/// Run one command and print its reply; returns whether it succeeded
fn run_command(engine: &Engine, line: &str, json: bool) -> Result<bool> {
    let reply: ControlReply = engine.execute(line);
    if json {
        if reply.is_ok() && line.trim() == "get_status" {
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
        } else {
            println!("{}", serde_json::to_string(&reply)?);
        }
    } else if reply.is_ok() {
        println!("{reply}");
    } else {
        eprintln!("{reply}");
    }
    Ok(reply.is_ok())
}

/// Deliver breakpoint hits from the perf facility to the engine for `duration`
fn watch(engine: &Engine, host: &LinuxHost, duration: Duration, quiet: bool) -> Result<()> {
    let traps = host.traps().context("Hardware traps are not available on this host")?;
    let stop = Arc::new(AtomicBool::new(false));
    let (pump, rx) = perf::spawn_hit_pump(Arc::clone(traps), HIT_POLL_INTERVAL, stop.clone())?;

    let deadline = Instant::now() + duration;
    let mut delivered = 0u64;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let hit = match rx.recv_timeout(remaining.min(Duration::from_millis(100))) {
            Ok(hit) => hit,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        delivered += 1;
        let outcome = engine.breakpoints().on_hit(hit.handle, hit.address);
        if !quiet {
            match outcome {
                HitOutcome::SteppedPast { index, hits } => {
                    println!("bp[{index}] hit at 0x{:x} (count {hits})", hit.address);
                }
                HitOutcome::Retired { index } => println!("bp[{index}] hit once and was retired"),
                HitOutcome::Restored { .. } | HitOutcome::Stuck { .. } | HitOutcome::Ignored => {}
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    pump.join().ok();
    if !quiet {
        eprintln!("watch finished: {delivered} hit(s) delivered");
    }
    Ok(())
}
