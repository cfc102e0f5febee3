mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cli::{Cli, Commands, RunArgs};
use sysgate::channel::ptrace::PtraceChannel;
use sysgate::event::{DecisionRecord, EventSink, ExecRecord, ReportEvent, Verdict};
use sysgate::{spawn, Engine};

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let rules = args.deny_rules()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .context("failed to set signal handler")?;

    let sink = match &args.output {
        Some(path) => EventSink::file(path)?,
        None => EventSink::stdout(),
    };
    let sink = Rc::new(RefCell::new(sink));

    let channel = PtraceChannel::open()?;
    let mut engine = Engine::new(channel).with_shutdown(shutdown);

    for (name, errno) in rules {
        let sink = sink.clone();
        engine
            .register("linux", &name, move |_channel, ctx| {
                let _ = sink.borrow_mut().emit(&ReportEvent::Decision(DecisionRecord {
                    timestamp: Utc::now(),
                    pid: ctx.pid.as_raw(),
                    emulation: ctx.emulation.to_string(),
                    syscall: ctx.name.to_string(),
                    verdict: Verdict::Deny { errno },
                }));
                errno
            })
            .with_context(|| format!("cannot intercept syscall '{}'", name))?;
    }

    let log_sink = sink.clone();
    engine.register_generic(move |_channel, ctx| {
        let _ = log_sink.borrow_mut().emit(&ReportEvent::Decision(DecisionRecord {
            timestamp: Utc::now(),
            pid: ctx.pid.as_raw(),
            emulation: ctx.emulation.to_string(),
            syscall: ctx.name.to_string(),
            verdict: Verdict::Permit,
        }));
        0
    });

    let exec_sink = sink.clone();
    engine.register_exec(move |_channel, notice| {
        let _ = exec_sink.borrow_mut().emit(&ReportEvent::Exec(ExecRecord {
            timestamp: Utc::now(),
            pid: notice.pid.as_raw(),
            path: notice.path.display().to_string(),
        }));
    });

    let handle = spawn::spawn_under_trace(args.background, &args.command[0], &args.command[1..])?;
    let pid = handle.pid();
    engine
        .attach(pid)
        .with_context(|| format!("failed to attach to spawned child {}", pid))?;
    // The child execs its target only after attachment is confirmed.
    handle.release()?;

    engine.run().context("tracer failed")?;
    sink.borrow_mut().flush()?;
    Ok(())
}
