use thiserror::Error;

#[derive(Error, Debug)]
pub enum SysgateError {
    #[error("registration error: {0}")]
    Register(#[from] RegisterError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registration-time caller errors. Returned, never fatal; the dispatch
/// table is left unchanged when one of these comes back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("handler already registered for {emulation}/{name}")]
    DuplicateHandler { emulation: String, name: String },

    #[error("{emulation}/{name} is not a syscall known to the backend")]
    UnknownSyscall { emulation: String, name: String },

    #[error("no handler registered for {emulation}/{name}")]
    UnknownHandler { emulation: String, name: String },

    #[error("argument offset {offset} exceeds maximum of {max}")]
    OffsetOutOfRange { offset: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to open tracing channel: {0}")]
    OpenFailed(#[source] nix::Error),

    #[error("failed to attach pid {pid}: {source}")]
    AttachFailed {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to detach pid {pid}: {source}")]
    DetachFailed {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("wait on tracing channel failed: {0}")]
    WaitFailed(#[source] nix::Error),

    #[error("ptrace request failed for pid {pid}: {source}")]
    Ptrace {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("remote read of {len} bytes at {addr:#x} in pid {pid} failed: {source}")]
    RemoteReadFailed {
        pid: i32,
        addr: u64,
        len: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("string at {addr:#x} in pid {pid} exceeds {cap} bytes")]
    StringTooLong { pid: i32, addr: u64, cap: usize },

    #[error("string at {addr:#x} in pid {pid} is not valid UTF-8")]
    BadString { pid: i32, addr: u64 },

    #[error("path resolution failed for pid {pid}: {reason}")]
    PathResolveFailed { pid: i32, reason: String },

    #[error("no tracee state for pid {pid}")]
    UnknownTracee { pid: i32 },
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("bootstrap pipe failed: {0}")]
    Sync(#[source] nix::Error),

    #[error("failed to detach into background: {0}")]
    Daemonize(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, SysgateError>;
