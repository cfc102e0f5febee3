//! Race-free process bootstrap.
//!
//! The target is forked but blocks on a one-shot pipe until the tracer has
//! confirmed attachment, so no instruction of the target program runs
//! unsupervised. With `background`, the tracer first detaches itself into
//! a new session.

use crate::error::{Result, SpawnError};
use nix::unistd::{execvp, fork, pipe, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;

/// Handle to a spawned-but-gated child. The child execs its target only
/// after [`SpawnHandle::release`] is called; dropping the handle without
/// releasing makes the child exit instead of running untraced.
pub struct SpawnHandle {
    pid: Pid,
    gate: OwnedFd,
}

impl SpawnHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Confirm attachment and let the child exec its target.
    pub fn release(self) -> Result<()> {
        let mut gate = File::from(self.gate);
        gate.write_all(&[1])?;
        Ok(())
    }
}

/// Fork the target program, gated behind attach confirmation.
pub fn spawn_under_trace(background: bool, path: &str, args: &[String]) -> Result<SpawnHandle> {
    if background {
        daemonize()?;
    }

    let (rx, tx) = pipe().map_err(SpawnError::Sync)?;

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => {
            drop(tx);
            wait_for_gate(rx);
            exec_target(path, args)
        }
        ForkResult::Parent { child } => {
            drop(rx);
            log::debug!("spawned gated child {}", child);
            Ok(SpawnHandle {
                pid: child,
                gate: tx,
            })
        }
    }
}

/// Child side: block until the tracer writes the go byte. EOF means the
/// tracer died before attaching; running the target untraced is not an
/// option, so exit.
fn wait_for_gate(rx: OwnedFd) {
    let mut gate = File::from(rx);
    let mut byte = [0u8; 1];
    if gate.read_exact(&mut byte).is_err() {
        std::process::exit(1);
    }
}

fn exec_target(path: &str, args: &[String]) -> ! {
    let Ok(prog) = CString::new(path) else {
        eprintln!("sysgate: invalid program path");
        std::process::exit(127);
    };
    let mut argv = vec![prog.clone()];
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(a) => argv.push(a),
            Err(_) => {
                eprintln!("sysgate: invalid argument");
                std::process::exit(127);
            }
        }
    }

    let err = execvp(&prog, &argv).unwrap_err();
    eprintln!("sysgate: failed to execute {}: {}", path, err);
    std::process::exit(127);
}

/// Detach the tracer into a new session; the original process exits once
/// the fork succeeds.
fn daemonize() -> Result<()> {
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(SpawnError::Daemonize)?;
    Ok(())
}
