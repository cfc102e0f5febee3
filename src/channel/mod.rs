use crate::error::{ChannelError, Result};
use nix::unistd::Pid;
use std::io;
use std::path::{Component, Path, PathBuf};

pub mod numbers;
pub mod ptrace;

/// Fixed maximum number of argument slots carried per notification.
pub const MAX_ARGS: usize = 8;

/// Chunk size for remote string reads.
const STRING_CHUNK: usize = 32;

/// Hard cap on remote string length; exceeding it is an error.
const STRING_CAP: usize = 4096;

/// Opaque handle identifying which policy set applies to a traced process.
/// Owned and interpreted by policy code, never by the engine.
pub type PolicyId = u32;

/// In-memory scratch copy of a syscall's raw argument block. Translations
/// rewrite slots here, never in the traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgBlock {
    slots: [u64; MAX_ARGS],
    len: usize,
}

impl ArgBlock {
    pub fn new(args: &[u64]) -> Self {
        let len = args.len().min(MAX_ARGS);
        let mut slots = [0u64; MAX_ARGS];
        slots[..len].copy_from_slice(&args[..len]);
        Self { slots, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        if idx < self.len {
            Some(self.slots[idx])
        } else {
            None
        }
    }

    /// Returns false if the slot does not exist.
    pub fn set(&mut self, idx: usize, value: u64) -> bool {
        if idx < self.len {
            self.slots[idx] = value;
            true
        } else {
            false
        }
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.slots[..self.len]
    }
}

/// Outcome of dispatch for one syscall-entry notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permit,
    /// Deny the call, synthesizing the given error code for the tracee.
    Deny(i32),
}

impl Decision {
    /// Normalize a policy callback's return value: `<= 0` permits, `> 0`
    /// is the errno to synthesize.
    pub fn from_verdict(verdict: i32) -> Self {
        if verdict > 0 {
            Decision::Deny(verdict)
        } else {
            Decision::Permit
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entry,
    Exit { result: i64, error: i32 },
}

/// One syscall notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pid: Pid,
    pub policy_id: PolicyId,
    pub syscall_number: u64,
    pub syscall_name: String,
    pub emulation: String,
    pub args: ArgBlock,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Syscall(Notification),
    /// A tracee forked. A non-positive child pid means the parent died
    /// instead of forking.
    Fork { parent: Pid, child: Pid },
    /// The backend reports the process gone.
    Gone { pid: Pid },
}

/// Abstract handle to the kernel tracing transport.
///
/// Implementations deliver syscall and lifecycle events for attached pids
/// and accept exactly one resume answer per syscall notification.
pub trait Channel {
    /// Add a pid to the set the backend delivers notifications for.
    fn attach(&mut self, pid: Pid) -> Result<()>;

    /// Remove a pid from the notification set.
    fn detach(&mut self, pid: Pid) -> Result<()>;

    /// Block until an event is available, retrying transparently on
    /// interrupted waits.
    fn wait_readable(&mut self) -> Result<()>;

    /// Read the next event. Performs exactly one backend read.
    fn read_event(&mut self) -> Result<Event>;

    /// Resume a tracee with the given decision. For entry notifications of
    /// calls whose return value must be observed, `observe_return` asks the
    /// backend to deliver the matching exit notification.
    fn answer(&mut self, pid: Pid, decision: Decision, observe_return: bool) -> Result<()>;

    /// Read up to `len` bytes out of the tracee's address space. May return
    /// fewer bytes than requested.
    fn read_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Current working directory of the tracee.
    fn cwd(&mut self, pid: Pid) -> Result<PathBuf>;

    /// Resolve (emulation, name) to this backend's syscall number.
    fn resolve_syscall(&self, emulation: &str, name: &str) -> Option<u64>;

    /// Per-process backend teardown; invoked before the process record is
    /// dropped. A pid the backend does not know is a no-op.
    fn release(&mut self, pid: Pid);

    /// Duplicate backend-private per-process state from parent to child.
    fn clone_state(&mut self, parent: Pid, child: Pid) -> Result<()>;
}

/// Read a NUL-terminated string out of the tracee's address space, in small
/// fixed-size chunks, growing until a terminator is found or the hard cap
/// is reached.
pub fn resolve_string<C: Channel + ?Sized>(channel: &mut C, pid: Pid, addr: u64) -> Result<String> {
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = addr;

    loop {
        let chunk = channel.read_memory(pid, cursor, STRING_CHUNK)?;
        if chunk.is_empty() {
            return Err(ChannelError::RemoteReadFailed {
                pid: pid.as_raw(),
                addr: cursor,
                len: STRING_CHUNK,
                source: Box::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "empty read from tracee",
                )),
            }
            .into());
        }

        if let Some(nul) = chunk.iter().position(|b| *b == 0) {
            collected.extend_from_slice(&chunk[..nul]);
            break;
        }

        collected.extend_from_slice(&chunk);
        if collected.len() > STRING_CAP {
            return Err(ChannelError::StringTooLong {
                pid: pid.as_raw(),
                addr,
                cap: STRING_CAP,
            }
            .into());
        }
        cursor = addr + collected.len() as u64;
    }

    String::from_utf8(collected).map_err(|_| {
        ChannelError::BadString {
            pid: pid.as_raw(),
            addr,
        }
        .into()
    })
}

/// Resolve the string at `addr` to an absolute, canonicalized path. A
/// relative path is anchored at the tracee's current working directory.
pub fn resolve_path<C: Channel + ?Sized>(channel: &mut C, pid: Pid, addr: u64) -> Result<PathBuf> {
    let raw = resolve_string(channel, pid, addr)?;
    if raw.is_empty() {
        return Err(ChannelError::PathResolveFailed {
            pid: pid.as_raw(),
            reason: "empty path".into(),
        }
        .into());
    }

    let joined = if raw.starts_with('/') {
        PathBuf::from(raw)
    } else {
        channel.cwd(pid)?.join(raw)
    };
    Ok(normalize_path(&joined))
}

/// Lexical canonicalization: collapses `.`, `..` and redundant separators
/// without touching the filesystem (the path lives in another process's
/// namespace).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
