//! Syscall interception and policy-decision engine.
//!
//! For every syscall entry and exit made by a traced process, the engine
//! identifies the call, runs registered argument translations, asks a policy
//! callback for a permit/deny decision, and relays that decision back to the
//! tracing transport so the process resumes exactly once. Process lifecycle
//! (fork, exec, exit) is tracked alongside.
//!
//! The transport is abstract: [`Channel`] is the seam between the engine and
//! the kernel-side tracing facility. [`channel::ptrace::PtraceChannel`] is the
//! Linux implementation; tests drive the engine through scripted channels.

pub mod channel;
pub mod engine;
pub mod error;
pub mod event;
pub mod spawn;

pub use channel::{ArgBlock, Channel, Decision, Event, Notification, Phase, PolicyId, MAX_ARGS};
pub use engine::registry::{ProcessRegistry, TrackedProcess};
pub use engine::table::{DispatchTable, ExecNotice, SyscallCtx, SyscallHandler, Translation};
pub use engine::Engine;
pub use error::{ChannelError, RegisterError, Result, SpawnError, SysgateError};
