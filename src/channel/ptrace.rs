//! Linux tracing transport built on ptrace.
//!
//! Syscall-entry and -exit stops, fork events and process exits are mapped
//! onto the abstract [`Event`] stream. Deny decisions are enforced by
//! pointing the call at an invalid syscall number on entry and injecting
//! the requested errno into the return register on exit.

use crate::channel::{numbers, ArgBlock, Channel, Decision, Event, Notification, Phase};
use crate::error::{ChannelError, Result};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;

const EMULATION: &str = "linux";

/// Syscall number no kernel implements; entering it yields ENOSYS, which
/// the exit stop then rewrites with the policy's errno.
const DISABLED_SYSCALL: u64 = u64::MAX;

#[derive(Debug, Default)]
struct TraceeState {
    in_syscall: bool,
    pending: Option<PendingCall>,
    /// Set on a fork child registered before its initial SIGSTOP arrived;
    /// that stop is part of the attach handshake and must be swallowed,
    /// not re-injected.
    awaiting_first_stop: bool,
}

#[derive(Debug)]
struct PendingCall {
    number: u64,
    deny_errno: Option<i32>,
    observe_return: bool,
}

pub struct PtraceChannel {
    tracees: HashMap<Pid, TraceeState>,
}

impl PtraceChannel {
    /// Open the tracing transport. For ptrace there is no descriptor to
    /// configure; per-tracee setup happens at attach time.
    pub fn open() -> Result<Self> {
        Ok(Self {
            tracees: HashMap::new(),
        })
    }

    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        match ptrace::syscall(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                // Tracee vanished between the stop and the resume; its exit
                // will surface through waitpid.
                log::debug!("pid {} vanished before resume", pid);
                self.tracees.remove(&pid);
                Ok(())
            }
            Err(e) => Err(ChannelError::Ptrace {
                pid: pid.as_raw(),
                source: e,
            }
            .into()),
        }
    }

    /// First stop of a fork/clone child that ptrace auto-attached for us.
    fn adopt(&mut self, pid: Pid) -> Result<()> {
        log::debug!("adopting auto-attached child {}", pid);
        self.tracees.insert(pid, TraceeState::default());
        self.resume(pid, None)
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<Option<Event>> {
        let state = self.tracees.entry(pid).or_default();

        if !state.in_syscall {
            let regs = match ptrace::getregs(pid) {
                Ok(r) => r,
                Err(Errno::ESRCH) => {
                    self.tracees.remove(&pid);
                    return Ok(None);
                }
                Err(e) => {
                    return Err(ChannelError::Ptrace {
                        pid: pid.as_raw(),
                        source: e,
                    }
                    .into())
                }
            };

            let number = regs.orig_rax;
            let args = ArgBlock::new(&[regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]);
            state.in_syscall = true;
            state.pending = Some(PendingCall {
                number,
                deny_errno: None,
                observe_return: false,
            });

            return Ok(Some(Event::Syscall(Notification {
                pid,
                // ptrace carries no kernel-side policy session; a single
                // policy set (id 0) applies to every tracee.
                policy_id: 0,
                syscall_number: number,
                syscall_name: numbers::name(number).unwrap_or("unknown").to_string(),
                emulation: EMULATION.to_string(),
                args,
                phase: Phase::Entry,
            })));
        }

        state.in_syscall = false;
        let Some(pending) = state.pending.take() else {
            self.resume(pid, None)?;
            return Ok(None);
        };

        let mut regs = match ptrace::getregs(pid) {
            Ok(r) => r,
            Err(Errno::ESRCH) => {
                self.tracees.remove(&pid);
                return Ok(None);
            }
            Err(e) => {
                return Err(ChannelError::Ptrace {
                    pid: pid.as_raw(),
                    source: e,
                }
                .into())
            }
        };

        if let Some(errno) = pending.deny_errno {
            regs.rax = (-(errno as i64)) as u64;
            ptrace::setregs(pid, regs).map_err(|e| ChannelError::Ptrace {
                pid: pid.as_raw(),
                source: e,
            })?;
        }

        if pending.observe_return {
            let ret = regs.rax as i64;
            let (result, error) = if ret < 0 { (-1, (-ret) as i32) } else { (ret, 0) };
            return Ok(Some(Event::Syscall(Notification {
                pid,
                policy_id: 0,
                syscall_number: pending.number,
                syscall_name: numbers::name(pending.number).unwrap_or("unknown").to_string(),
                emulation: EMULATION.to_string(),
                args: ArgBlock::default(),
                phase: Phase::Exit { result, error },
            })));
        }

        self.resume(pid, None)?;
        Ok(None)
    }
}

impl Channel for PtraceChannel {
    fn attach(&mut self, pid: Pid) -> Result<()> {
        ptrace::attach(pid).map_err(|e| ChannelError::AttachFailed {
            pid: pid.as_raw(),
            source: e,
        })?;

        let status = waitpid(pid, Some(WaitPidFlag::__WALL))
            .map_err(ChannelError::WaitFailed)?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            other => log::warn!("unexpected first stop for pid {}: {:?}", pid, other),
        }

        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC;
        ptrace::setoptions(pid, options).map_err(|e| ChannelError::AttachFailed {
            pid: pid.as_raw(),
            source: e,
        })?;

        self.tracees.insert(pid, TraceeState::default());
        self.resume(pid, None)
    }

    fn detach(&mut self, pid: Pid) -> Result<()> {
        self.tracees.remove(&pid);
        match ptrace::detach(pid, None) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ChannelError::DetachFailed {
                pid: pid.as_raw(),
                source: e,
            }
            .into()),
        }
    }

    fn wait_readable(&mut self) -> Result<()> {
        loop {
            match waitid(
                Id::All,
                WaitPidFlag::WEXITED | WaitPidFlag::WSTOPPED | WaitPidFlag::WNOWAIT,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::WaitFailed(e).into()),
            }
        }
    }

    fn read_event(&mut self) -> Result<Event> {
        loop {
            let status = match waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)) {
                Ok(s) => s,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::WaitFailed(e).into()),
            };

            match status {
                WaitStatus::PtraceSyscall(pid) => {
                    if let Some(event) = self.on_syscall_stop(pid)? {
                        return Ok(event);
                    }
                }
                WaitStatus::Stopped(pid, signal) => {
                    if signal != Signal::SIGSTOP {
                        // Pass the signal through to the tracee.
                        self.resume(pid, Some(signal))?;
                        continue;
                    }
                    match self.tracees.get_mut(&pid) {
                        None => self.adopt(pid)?,
                        Some(state) if state.awaiting_first_stop => {
                            state.awaiting_first_stop = false;
                            self.resume(pid, None)?;
                        }
                        Some(_) => self.resume(pid, Some(signal))?,
                    }
                }
                WaitStatus::PtraceEvent(pid, _, event) => match event {
                    libc::PTRACE_EVENT_FORK
                    | libc::PTRACE_EVENT_VFORK
                    | libc::PTRACE_EVENT_CLONE => {
                        let raw = ptrace::getevent(pid).map_err(|e| ChannelError::Ptrace {
                            pid: pid.as_raw(),
                            source: e,
                        })?;
                        self.resume(pid, None)?;
                        return Ok(Event::Fork {
                            parent: pid,
                            child: Pid::from_raw(raw as i32),
                        });
                    }
                    // Exec tracking happens through the execve syscall
                    // notifications themselves.
                    _ => self.resume(pid, None)?,
                },
                WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                    self.tracees.remove(&pid);
                    return Ok(Event::Gone { pid });
                }
                _ => {}
            }
        }
    }

    fn answer(&mut self, pid: Pid, decision: Decision, observe_return: bool) -> Result<()> {
        let at_entry = self
            .tracees
            .get(&pid)
            .map(|s| s.in_syscall)
            .unwrap_or(false);

        if at_entry {
            if let Some(pending) = self.tracees.get_mut(&pid).and_then(|s| s.pending.as_mut()) {
                pending.observe_return = observe_return;
                if let Decision::Deny(errno) = decision {
                    pending.deny_errno = Some(errno);
                }
            }

            if let Decision::Deny(_) = decision {
                match ptrace::getregs(pid) {
                    Ok(mut regs) => {
                        regs.orig_rax = DISABLED_SYSCALL;
                        ptrace::setregs(pid, regs).map_err(|e| ChannelError::Ptrace {
                            pid: pid.as_raw(),
                            source: e,
                        })?;
                    }
                    Err(Errno::ESRCH) => {
                        self.tracees.remove(&pid);
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(ChannelError::Ptrace {
                            pid: pid.as_raw(),
                            source: e,
                        }
                        .into())
                    }
                }
            }
        }

        self.resume(pid, None)
    }

    fn read_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
        // process_vm_readv first, word-by-word ptrace reads as fallback.
        match read_memory_process_vm(pid, addr, len) {
            Ok(data) => Ok(data),
            Err(e) => {
                log::debug!("process_vm_readv failed, falling back to ptrace: {}", e);
                read_memory_ptrace(pid, addr, len)
            }
        }
    }

    fn cwd(&mut self, pid: Pid) -> Result<PathBuf> {
        std::fs::read_link(format!("/proc/{}/cwd", pid)).map_err(|e| {
            ChannelError::PathResolveFailed {
                pid: pid.as_raw(),
                reason: format!("cannot read cwd: {}", e),
            }
            .into()
        })
    }

    fn resolve_syscall(&self, emulation: &str, name: &str) -> Option<u64> {
        if emulation != EMULATION {
            return None;
        }
        numbers::number(name)
    }

    fn release(&mut self, pid: Pid) {
        self.tracees.remove(&pid);
    }

    fn clone_state(&mut self, parent: Pid, child: Pid) -> Result<()> {
        // The child starts at syscall-entry phase regardless of where the
        // parent was when it forked.
        if !self.tracees.contains_key(&parent) {
            return Err(ChannelError::UnknownTracee {
                pid: parent.as_raw(),
            }
            .into());
        }
        // A child already adopted through its SIGSTOP keeps its state; a
        // fresh record marks that stop as still owed.
        self.tracees.entry(child).or_insert_with(|| TraceeState {
            awaiting_first_stop: true,
            ..TraceeState::default()
        });
        Ok(())
    }
}

fn read_memory_process_vm(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];

    let local_iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: len,
    };
    let remote_iov = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: len,
    };

    let res = unsafe { libc::process_vm_readv(pid.as_raw(), &local_iov, 1, &remote_iov, 1, 0) };

    if res < 0 {
        return Err(ChannelError::RemoteReadFailed {
            pid: pid.as_raw(),
            addr,
            len,
            source: Box::new(std::io::Error::last_os_error()),
        }
        .into());
    }

    buf.truncate(res as usize);
    Ok(buf)
}

/// Word-granularity fallback for ranges `process_vm_readv` cannot service.
/// Stops at the first unreadable word; a shortened result is fine for
/// callers that scan for a terminator.
fn read_memory_ptrace(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(len + std::mem::size_of::<libc::c_long>());

    while buf.len() < len {
        let cursor = addr + buf.len() as u64;
        match ptrace::read(pid, cursor as *mut libc::c_void) {
            Ok(word) => buf.extend_from_slice(&word.to_le_bytes()),
            Err(_) if !buf.is_empty() => break,
            Err(e) => {
                return Err(ChannelError::RemoteReadFailed {
                    pid: pid.as_raw(),
                    addr,
                    len,
                    source: Box::new(std::io::Error::from(e)),
                }
                .into())
            }
        }
    }

    buf.truncate(len);
    Ok(buf)
}
