//! Policy decision protocol: ties the registry, dispatch table and
//! translation pipeline to the tracing channel.
//!
//! The engine is single-threaded and synchronous. Each syscall-entry
//! notification is taken through lookup, translation, policy callback and
//! answer before the next event is read; exactly one answer goes back to
//! the channel per notification.

use crate::channel::{self, Channel, Decision, Event, Notification, Phase};
use crate::error::{ChannelError, RegisterError, Result};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod registry;
pub mod table;
pub mod translate;

use registry::ProcessRegistry;
use table::{DispatchTable, ExecNotice, SyscallCtx, SyscallHandler};

/// The process-replacement call gets entry and exit special-casing.
const EXEC_CALL: &str = "execve";

pub struct Engine<C: Channel> {
    channel: C,
    registry: ProcessRegistry,
    table: DispatchTable<C>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<C: Channel> Engine<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            registry: ProcessRegistry::new(),
            table: DispatchTable::new(),
            shutdown: None,
        }
    }

    /// Install a flag checked once per loop iteration; setting it stops
    /// the event loop at the next notification boundary.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Register a policy callback for one (emulation, name) pair. Fails if
    /// the pair is already registered or the backend cannot resolve it to
    /// a syscall number.
    pub fn register<F>(&mut self, emulation: &str, name: &str, callback: F) -> Result<()>
    where
        F: FnMut(&mut C, &SyscallCtx) -> i32 + 'static,
    {
        let number = self.channel.resolve_syscall(emulation, name).ok_or_else(|| {
            RegisterError::UnknownSyscall {
                emulation: emulation.to_string(),
                name: name.to_string(),
            }
        })?;
        self.table.insert(emulation, name, number, Box::new(callback))?;
        Ok(())
    }

    /// Append an argument translation to an already-registered handler.
    pub fn register_translation<F>(
        &mut self,
        emulation: &str,
        name: &str,
        offset: usize,
        transform: F,
    ) -> Result<()>
    where
        F: FnMut(&mut C, Pid, u64) -> Result<u64> + 'static,
    {
        self.table
            .register_translation(emulation, name, offset, Box::new(transform))?;
        Ok(())
    }

    /// Fallback callback for calls with no specific handler. One slot,
    /// last registration wins.
    pub fn register_generic<F>(&mut self, callback: F)
    where
        F: FnMut(&mut C, &SyscallCtx) -> i32 + 'static,
    {
        self.table.register_generic(Box::new(callback));
    }

    /// Callback invoked exactly once per committed exec. One slot, last
    /// registration wins.
    pub fn register_exec<F>(&mut self, callback: F)
    where
        F: FnMut(&mut C, &ExecNotice) + 'static,
    {
        self.table.register_exec(Box::new(callback));
    }

    pub fn handler(&self, emulation: &str, name: &str) -> Option<&SyscallHandler<C>> {
        self.table.find(emulation, name)
    }

    /// Start supervising a pid: backend attach plus a fresh tracking
    /// record.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        self.channel.attach(pid)?;
        self.registry.get_or_create(pid);
        Ok(())
    }

    /// Stop supervising a pid. A pid that is not tracked is a no-op, so
    /// calling this twice is harmless.
    pub fn detach(&mut self, pid: Pid) -> Result<()> {
        if self.registry.get(pid).is_none() {
            return Ok(());
        }
        self.channel.detach(pid)?;
        self.remove_process(pid);
        Ok(())
    }

    /// Run until no process is tracked anymore (or the shutdown flag is
    /// set). One notification is processed to completion per iteration.
    pub fn run(&mut self) -> Result<()> {
        while self.registry.has_processes() {
            if let Some(flag) = &self.shutdown {
                if flag.load(Ordering::Relaxed) {
                    log::info!("shutdown requested, stopping event loop");
                    break;
                }
            }
            self.channel.wait_readable()?;
            let event = self.channel.read_event()?;
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Syscall(notif) => match notif.phase {
                Phase::Entry => self.handle_entry(notif),
                Phase::Exit { result, error } => self.handle_exit(notif, result, error),
            },
            Event::Fork { parent, child } => self.on_fork(parent, child),
            Event::Gone { pid } => {
                self.remove_process(pid);
                Ok(())
            }
        }
    }

    /// Entry protocol: exec special case, then dispatch, then exactly one
    /// answer.
    fn handle_entry(&mut self, notif: Notification) -> Result<()> {
        let mut observe_return = false;

        if notif.syscall_name == EXEC_CALL {
            let Some(addr) = notif.args.get(0) else {
                return Err(ChannelError::PathResolveFailed {
                    pid: notif.pid.as_raw(),
                    reason: "execve carried no path argument".into(),
                }
                .into());
            };
            // Fail closed: a path we cannot resolve means a call we cannot
            // police, and the error propagates out of the loop.
            let path = channel::resolve_path(&mut self.channel, notif.pid, addr)?;

            let proc = self.registry.get_or_create(notif.pid);
            proc.exec_in_flight = Some(notif.syscall_number);
            proc.policy_id = notif.policy_id;
            proc.pending_name = Some(path);
            observe_return = true;
        }

        let mut ctx = SyscallCtx {
            pid: notif.pid,
            policy_id: notif.policy_id,
            emulation: &notif.emulation,
            name: &notif.syscall_name,
            number: notif.syscall_number,
            args: notif.args,
            translated: 0,
        };

        let verdict = if let Some(handler) = self.table.find_mut(&notif.emulation, &notif.syscall_name)
        {
            ctx.translated = translate::apply(
                &mut self.channel,
                notif.pid,
                &mut ctx.args,
                &mut handler.translations,
            );
            (handler.callback)(&mut self.channel, &ctx)
        } else if let Some(generic) = self.table.generic_mut() {
            // The generic handler sees the untranslated arguments.
            (generic)(&mut self.channel, &ctx)
        } else {
            0
        };

        let decision = Decision::from_verdict(verdict);
        if let Decision::Deny(errno) = decision {
            log::debug!(
                "denying {} for pid {} with errno {}",
                notif.syscall_name,
                notif.pid,
                errno
            );
        }
        self.channel.answer(notif.pid, decision, observe_return)
    }

    /// Exit protocol, used for the process-replacement call: commit or
    /// discard the pending image name, notify, and always resume with
    /// permit.
    fn handle_exit(&mut self, notif: Notification, result: i64, error: i32) -> Result<()> {
        let mut committed = None;
        let mut policy_id = notif.policy_id;

        if let Some(proc) = self.registry.get_mut(notif.pid) {
            if proc.exec_in_flight == Some(notif.syscall_number) {
                proc.exec_in_flight = None;
                let pending = proc.pending_name.take();
                if error == 0 {
                    if let Some(path) = pending {
                        proc.name = Some(path.clone());
                        policy_id = proc.policy_id;
                        committed = Some(path);
                    }
                } else {
                    log::debug!(
                        "execve by pid {} failed (result {}, errno {}), discarding pending name",
                        notif.pid,
                        result,
                        error
                    );
                }
            }
        }

        if let Some(path) = committed {
            if let Some(callback) = self.table.exec_mut() {
                let notice = ExecNotice {
                    pid: notif.pid,
                    policy_id,
                    emulation: &notif.emulation,
                    path: &path,
                };
                (callback)(&mut self.channel, &notice);
            }
        }

        // Exit notifications are informational; they never deny.
        self.channel.answer(notif.pid, Decision::Permit, false)
    }

    /// Fork bookkeeping. Must complete before any syscall notification for
    /// the child is processed: the child's decisions depend on the policy
    /// id copied here. A non-positive child pid means the parent died
    /// instead of forking.
    pub fn on_fork(&mut self, parent: Pid, child: Pid) -> Result<()> {
        if child.as_raw() <= 0 {
            log::debug!("parent {} gone during fork bookkeeping", parent);
            self.remove_process(parent);
            return Ok(());
        }

        let parent_rec = self.registry.get_or_create(parent);
        let policy_id = parent_rec.policy_id;
        let name = parent_rec.name.clone();

        let child_rec = self.registry.get_or_create(child);
        child_rec.policy_id = policy_id;
        child_rec.name = name;

        self.channel.clone_state(parent, child)
    }

    fn remove_process(&mut self, pid: Pid) {
        self.channel.release(pid);
        if self.registry.remove(pid).is_some() {
            log::debug!(
                "dropped tracking record for pid {} ({} still tracked)",
                pid,
                self.registry.len()
            );
        }
    }
}
