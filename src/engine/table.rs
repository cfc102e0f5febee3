use crate::channel::{ArgBlock, PolicyId, MAX_ARGS};
use crate::error::{RegisterError, Result};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::Path;

/// Full call context handed to policy callbacks. `args` is the in-memory
/// scratch copy after translation; `translated` says how many of the
/// handler's translations were applied before the callback ran.
#[derive(Debug)]
pub struct SyscallCtx<'a> {
    pub pid: Pid,
    pub policy_id: PolicyId,
    pub emulation: &'a str,
    pub name: &'a str,
    pub number: u64,
    pub args: ArgBlock,
    pub translated: usize,
}

/// Notification of a committed exec, handed to the exec callback.
#[derive(Debug)]
pub struct ExecNotice<'a> {
    pub pid: Pid,
    pub policy_id: PolicyId,
    pub emulation: &'a str,
    pub path: &'a Path,
}

/// Policy decision callback: `<= 0` permits the call, `> 0` is the errno
/// to synthesize for the tracee.
pub type VerdictFn<C> = Box<dyn FnMut(&mut C, &SyscallCtx) -> i32>;

pub type ExecFn<C> = Box<dyn FnMut(&mut C, &ExecNotice)>;

/// Argument transform: maps the raw slot value to a rewritten one, given
/// the target process.
pub type TransformFn<C> = Box<dyn FnMut(&mut C, Pid, u64) -> Result<u64>>;

/// One registered per-argument rewrite.
pub struct Translation<C> {
    pub offset: usize,
    pub transform: TransformFn<C>,
}

/// Registered handler for one (emulation, name) pair.
pub struct SyscallHandler<C> {
    pub emulation: String,
    pub name: String,
    pub number: u64,
    pub callback: VerdictFn<C>,
    /// Insertion order is application order.
    pub translations: Vec<Translation<C>>,
}

/// Ordered (emulation, name) -> handler index plus the two single global
/// slots: a generic fallback and an exec-notification callback. The global
/// slots follow last-registration-wins semantics.
pub struct DispatchTable<C> {
    handlers: BTreeMap<(String, String), SyscallHandler<C>>,
    generic: Option<VerdictFn<C>>,
    exec: Option<ExecFn<C>>,
}

impl<C> Default for DispatchTable<C> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            generic: None,
            exec: None,
        }
    }
}

impl<C> DispatchTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler whose syscall number the backend already resolved.
    pub fn insert(
        &mut self,
        emulation: &str,
        name: &str,
        number: u64,
        callback: VerdictFn<C>,
    ) -> std::result::Result<(), RegisterError> {
        let key = (emulation.to_string(), name.to_string());
        if self.handlers.contains_key(&key) {
            return Err(RegisterError::DuplicateHandler {
                emulation: emulation.to_string(),
                name: name.to_string(),
            });
        }
        self.handlers.insert(
            key,
            SyscallHandler {
                emulation: emulation.to_string(),
                name: name.to_string(),
                number,
                callback,
                translations: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append a translation to an existing handler's ordered list.
    pub fn register_translation(
        &mut self,
        emulation: &str,
        name: &str,
        offset: usize,
        transform: TransformFn<C>,
    ) -> std::result::Result<(), RegisterError> {
        if offset >= MAX_ARGS {
            return Err(RegisterError::OffsetOutOfRange {
                offset,
                max: MAX_ARGS - 1,
            });
        }
        let handler = self
            .handlers
            .get_mut(&(emulation.to_string(), name.to_string()))
            .ok_or_else(|| RegisterError::UnknownHandler {
                emulation: emulation.to_string(),
                name: name.to_string(),
            })?;
        handler.translations.push(Translation { offset, transform });
        Ok(())
    }

    pub fn register_generic(&mut self, callback: VerdictFn<C>) {
        self.generic = Some(callback);
    }

    pub fn register_exec(&mut self, callback: ExecFn<C>) {
        self.exec = Some(callback);
    }

    pub fn find(&self, emulation: &str, name: &str) -> Option<&SyscallHandler<C>> {
        self.handlers.get(&(emulation.to_string(), name.to_string()))
    }

    pub fn find_mut(&mut self, emulation: &str, name: &str) -> Option<&mut SyscallHandler<C>> {
        self.handlers.get_mut(&(emulation.to_string(), name.to_string()))
    }

    pub fn generic_mut(&mut self) -> Option<&mut VerdictFn<C>> {
        self.generic.as_mut()
    }

    pub fn exec_mut(&mut self) -> Option<&mut ExecFn<C>> {
        self.exec.as_mut()
    }
}
