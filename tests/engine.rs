//! Engine behavior against a scripted in-memory channel.

use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

use sysgate::{
    ArgBlock, Channel, ChannelError, Decision, Engine, Event, Notification, Phase, RegisterError,
    Result, SysgateError, MAX_ARGS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct AnswerRecord {
    pid: i32,
    decision: Decision,
    observe_return: bool,
}

/// Scripted transport: events are popped from a queue, answers and
/// bookkeeping calls are recorded, remote memory and cwds come from maps.
#[derive(Default)]
struct MockChannel {
    events: VecDeque<Event>,
    answers: Vec<AnswerRecord>,
    memory: HashMap<u64, Vec<u8>>,
    cwds: HashMap<i32, PathBuf>,
    syscalls: HashMap<(String, String), u64>,
    attached: Vec<i32>,
    detached: Vec<i32>,
    released: Vec<i32>,
    cloned: Vec<(i32, i32)>,
}

impl MockChannel {
    fn linux() -> Self {
        let mut mock = Self::default();
        for (name, nr) in [("read", 0), ("open", 2), ("connect", 42), ("execve", 59)] {
            mock.syscalls
                .insert(("linux".to_string(), name.to_string()), nr);
        }
        mock
    }

    fn store_string(&mut self, addr: u64, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.memory.insert(addr, bytes);
    }
}

impl Channel for MockChannel {
    fn attach(&mut self, pid: Pid) -> Result<()> {
        self.attached.push(pid.as_raw());
        Ok(())
    }

    fn detach(&mut self, pid: Pid) -> Result<()> {
        self.detached.push(pid.as_raw());
        Ok(())
    }

    fn wait_readable(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_event(&mut self) -> Result<Event> {
        self.events
            .pop_front()
            .ok_or_else(|| ChannelError::WaitFailed(nix::errno::Errno::ECHILD).into())
    }

    fn answer(&mut self, pid: Pid, decision: Decision, observe_return: bool) -> Result<()> {
        self.answers.push(AnswerRecord {
            pid: pid.as_raw(),
            decision,
            observe_return,
        });
        Ok(())
    }

    fn read_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
        for (&base, bytes) in &self.memory {
            if addr >= base && addr < base + bytes.len() as u64 {
                let offset = (addr - base) as usize;
                let end = (offset + len).min(bytes.len());
                return Ok(bytes[offset..end].to_vec());
            }
        }
        Err(ChannelError::RemoteReadFailed {
            pid: pid.as_raw(),
            addr,
            len,
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address not mapped",
            )),
        }
        .into())
    }

    fn cwd(&mut self, pid: Pid) -> Result<PathBuf> {
        self.cwds.get(&pid.as_raw()).cloned().ok_or_else(|| {
            ChannelError::PathResolveFailed {
                pid: pid.as_raw(),
                reason: "no cwd scripted".into(),
            }
            .into()
        })
    }

    fn resolve_syscall(&self, emulation: &str, name: &str) -> Option<u64> {
        self.syscalls
            .get(&(emulation.to_string(), name.to_string()))
            .copied()
    }

    fn release(&mut self, pid: Pid) {
        self.released.push(pid.as_raw());
    }

    fn clone_state(&mut self, parent: Pid, child: Pid) -> Result<()> {
        self.cloned.push((parent.as_raw(), child.as_raw()));
        Ok(())
    }
}

fn entry(pid: i32, policy_id: u32, name: &str, number: u64, args: &[u64]) -> Event {
    Event::Syscall(Notification {
        pid: Pid::from_raw(pid),
        policy_id,
        syscall_number: number,
        syscall_name: name.to_string(),
        emulation: "linux".to_string(),
        args: ArgBlock::new(args),
        phase: Phase::Entry,
    })
}

fn exit(pid: i32, policy_id: u32, name: &str, number: u64, result: i64, error: i32) -> Event {
    Event::Syscall(Notification {
        pid: Pid::from_raw(pid),
        policy_id,
        syscall_number: number,
        syscall_name: name.to_string(),
        emulation: "linux".to_string(),
        args: ArgBlock::default(),
        phase: Phase::Exit { result, error },
    })
}

#[test]
fn unregistered_syscall_defaults_to_permit() {
    let mut engine = Engine::new(MockChannel::linux());
    engine
        .handle_event(entry(100, 0, "open", 2, &[1, 2, 3]))
        .unwrap();

    assert_eq!(
        engine.channel().answers,
        vec![AnswerRecord {
            pid: 100,
            decision: Decision::Permit,
            observe_return: false,
        }]
    );
}

#[test]
fn registered_handler_permits_open() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();

    let mut engine = Engine::new(MockChannel::linux());
    engine
        .register("linux", "open", move |_channel, ctx| {
            log.borrow_mut().push((ctx.pid.as_raw(), ctx.name.to_string()));
            0
        })
        .unwrap();

    engine.handle_event(entry(100, 0, "open", 2, &[7])).unwrap();

    assert_eq!(seen.borrow().as_slice(), &[(100, "open".to_string())]);
    assert_eq!(
        engine.channel().answers,
        vec![AnswerRecord {
            pid: 100,
            decision: Decision::Permit,
            observe_return: false,
        }]
    );
}

#[test]
fn generic_handler_denies_everything() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.register_generic(|_channel, _ctx| 13);

    engine.handle_event(entry(4, 0, "read", 0, &[0])).unwrap();
    engine.handle_event(entry(5, 0, "connect", 42, &[9])).unwrap();

    let decisions: Vec<_> = engine
        .channel()
        .answers
        .iter()
        .map(|a| a.decision)
        .collect();
    assert_eq!(decisions, vec![Decision::Deny(13), Decision::Deny(13)]);
}

#[test]
fn specific_handler_wins_over_generic() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.register("linux", "open", |_channel, _ctx| 0).unwrap();
    engine.register_generic(|_channel, _ctx| 13);

    engine.handle_event(entry(1, 0, "open", 2, &[])).unwrap();
    assert_eq!(engine.channel().answers[0].decision, Decision::Permit);
}

#[test]
fn negative_verdicts_normalize_to_permit() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.register_generic(|_channel, _ctx| -42);

    engine.handle_event(entry(1, 0, "read", 0, &[])).unwrap();
    assert_eq!(engine.channel().answers[0].decision, Decision::Permit);
}

#[test]
fn translations_apply_in_order_and_failure_skips_rest() {
    let observed = Rc::new(RefCell::new(None));
    let sink = observed.clone();

    let mut engine = Engine::new(MockChannel::linux());
    engine
        .register("linux", "open", move |_channel, ctx| {
            *sink.borrow_mut() = Some((ctx.args.as_slice().to_vec(), ctx.translated));
            0
        })
        .unwrap();

    engine
        .register_translation("linux", "open", 0, |_channel, _pid, raw| Ok(raw + 1))
        .unwrap();
    engine
        .register_translation("linux", "open", 1, |_channel, pid, _raw| {
            Err(ChannelError::BadString {
                pid: pid.as_raw(),
                addr: 0,
            }
            .into())
        })
        .unwrap();
    engine
        .register_translation("linux", "open", 2, |_channel, _pid, raw| Ok(raw * 10))
        .unwrap();

    engine
        .handle_event(entry(100, 0, "open", 2, &[10, 20, 30]))
        .unwrap();

    // First transform applied, second failed, third skipped; the callback
    // still ran with the partially translated block.
    let (args, translated) = observed.borrow().clone().unwrap();
    assert_eq!(args, vec![11, 20, 30]);
    assert_eq!(translated, 1);
    assert_eq!(engine.channel().answers.len(), 1);
}

#[test]
fn registration_error_taxonomy() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.register("linux", "open", |_c, _x| 0).unwrap();

    let err = engine.register("linux", "open", |_c, _x| 0).unwrap_err();
    assert!(matches!(
        err,
        SysgateError::Register(RegisterError::DuplicateHandler { .. })
    ));

    let err = engine.register("linux", "frobnicate", |_c, _x| 0).unwrap_err();
    assert!(matches!(
        err,
        SysgateError::Register(RegisterError::UnknownSyscall { .. })
    ));

    let err = engine
        .register_translation("linux", "read", 0, |_c, _p, v| Ok(v))
        .unwrap_err();
    assert!(matches!(
        err,
        SysgateError::Register(RegisterError::UnknownHandler { .. })
    ));

    let err = engine
        .register_translation("linux", "open", MAX_ARGS, |_c, _p, v| Ok(v))
        .unwrap_err();
    assert!(matches!(
        err,
        SysgateError::Register(RegisterError::OffsetOutOfRange { .. })
    ));
}

#[test]
fn register_then_find_round_trip() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.register("linux", "open", |_c, _x| 0).unwrap();

    let handler = engine.handler("linux", "open").unwrap();
    assert_eq!(handler.number, 2);
    assert!(handler.translations.is_empty());

    engine
        .register_translation("linux", "open", 0, |_c, _p, v| Ok(v))
        .unwrap();
    let handler = engine.handler("linux", "open").unwrap();
    assert_eq!(handler.translations.len(), 1);
    assert_eq!(handler.translations[0].offset, 0);
}

#[test]
fn execve_entry_resolves_pending_name_against_cwd() {
    let mut mock = MockChannel::linux();
    mock.store_string(0x1000, "bin/ls");
    mock.cwds.insert(100, PathBuf::from("/usr"));

    let mut engine = Engine::new(mock);
    engine.handle_event(entry(100, 7, "execve", 59, &[0x1000])).unwrap();

    let proc = engine.registry().get(Pid::from_raw(100)).unwrap();
    assert_eq!(proc.pending_name, Some(PathBuf::from("/usr/bin/ls")));
    assert_eq!(proc.exec_in_flight, Some(59));
    assert_eq!(proc.policy_id, 7);
    assert_eq!(proc.name, None);

    // Entry answers ask the backend to observe the return value.
    assert_eq!(
        engine.channel().answers,
        vec![AnswerRecord {
            pid: 100,
            decision: Decision::Permit,
            observe_return: true,
        }]
    );
}

#[test]
fn execve_success_commits_name_and_fires_exec_callback_once() {
    let mut mock = MockChannel::linux();
    mock.store_string(0x1000, "bin/ls");
    mock.cwds.insert(100, PathBuf::from("/usr"));

    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = fired.clone();

    let mut engine = Engine::new(mock);
    engine.register_exec(move |_channel, notice| {
        sink.borrow_mut().push((
            notice.pid.as_raw(),
            notice.policy_id,
            notice.path.display().to_string(),
        ));
    });

    engine.handle_event(entry(100, 7, "execve", 59, &[0x1000])).unwrap();
    engine.handle_event(exit(100, 7, "execve", 59, 0, 0)).unwrap();

    let proc = engine.registry().get(Pid::from_raw(100)).unwrap();
    assert_eq!(proc.name, Some(PathBuf::from("/usr/bin/ls")));
    assert_eq!(proc.pending_name, None);
    assert_eq!(proc.exec_in_flight, None);

    assert_eq!(fired.borrow().as_slice(), &[(100, 7, "/usr/bin/ls".to_string())]);

    // Exit answers are always permit and never observe.
    let last = engine.channel().answers.last().unwrap();
    assert_eq!(last.decision, Decision::Permit);
    assert!(!last.observe_return);
}

#[test]
fn execve_failure_discards_pending_name() {
    let mut mock = MockChannel::linux();
    mock.store_string(0x1000, "/bin/missing");

    let fired = Rc::new(RefCell::new(0u32));
    let sink = fired.clone();

    let mut engine = Engine::new(mock);
    engine.register_exec(move |_channel, _notice| {
        *sink.borrow_mut() += 1;
    });

    engine.handle_event(entry(100, 7, "execve", 59, &[0x1000])).unwrap();
    engine.handle_event(exit(100, 7, "execve", 59, -1, 2)).unwrap();

    let proc = engine.registry().get(Pid::from_raw(100)).unwrap();
    assert_eq!(proc.name, None);
    assert_eq!(proc.pending_name, None);
    assert_eq!(proc.exec_in_flight, None);
    assert_eq!(*fired.borrow(), 0);
}

#[test]
fn absolute_exec_path_skips_cwd_lookup() {
    // No cwd is scripted for this pid; an absolute path must not need one.
    let mut mock = MockChannel::linux();
    mock.store_string(0x2000, "/bin/../usr/./bin/env");

    let mut engine = Engine::new(mock);
    engine.handle_event(entry(5, 0, "execve", 59, &[0x2000])).unwrap();

    let proc = engine.registry().get(Pid::from_raw(5)).unwrap();
    assert_eq!(proc.pending_name, Some(PathBuf::from("/usr/bin/env")));
}

#[test]
fn unresolvable_exec_path_fails_closed() {
    let mut engine = Engine::new(MockChannel::linux());
    let err = engine
        .handle_event(entry(100, 0, "execve", 59, &[0xdead_0000]))
        .unwrap_err();
    assert!(matches!(err, SysgateError::Channel(_)));
    assert!(engine.channel().answers.is_empty());
}

#[test]
fn overlong_exec_path_is_an_error() {
    let mut mock = MockChannel::linux();
    // 5000 bytes, no terminator within the cap.
    mock.memory.insert(0x3000, vec![b'a'; 5000]);

    let mut engine = Engine::new(mock);
    let err = engine
        .handle_event(entry(100, 0, "execve", 59, &[0x3000]))
        .unwrap_err();
    assert!(matches!(
        err,
        SysgateError::Channel(ChannelError::StringTooLong { .. })
    ));
}

#[test]
fn fork_child_inherits_policy_and_name_at_fork_time() {
    let mut mock = MockChannel::linux();
    mock.store_string(0x1000, "/usr/bin/ls");
    mock.store_string(0x2000, "/bin/sh");

    let mut engine = Engine::new(mock);
    engine.handle_event(entry(100, 7, "execve", 59, &[0x1000])).unwrap();
    engine.handle_event(exit(100, 7, "execve", 59, 0, 0)).unwrap();

    engine
        .handle_event(Event::Fork {
            parent: Pid::from_raw(100),
            child: Pid::from_raw(101),
        })
        .unwrap();

    let child = engine.registry().get(Pid::from_raw(101)).unwrap();
    assert_eq!(child.policy_id, 7);
    assert_eq!(child.name, Some(PathBuf::from("/usr/bin/ls")));
    assert_eq!(engine.channel().cloned, vec![(100, 101)]);

    // Later parent mutation must not leak into the child.
    engine.handle_event(entry(100, 9, "execve", 59, &[0x2000])).unwrap();
    engine.handle_event(exit(100, 9, "execve", 59, 0, 0)).unwrap();

    let parent = engine.registry().get(Pid::from_raw(100)).unwrap();
    assert_eq!(parent.name, Some(PathBuf::from("/bin/sh")));
    assert_eq!(parent.policy_id, 9);

    let child = engine.registry().get(Pid::from_raw(101)).unwrap();
    assert_eq!(child.policy_id, 7);
    assert_eq!(child.name, Some(PathBuf::from("/usr/bin/ls")));
}

#[test]
fn fork_with_dead_parent_removes_parent_record() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.attach(Pid::from_raw(100)).unwrap();

    engine
        .handle_event(Event::Fork {
            parent: Pid::from_raw(100),
            child: Pid::from_raw(-1),
        })
        .unwrap();

    assert!(engine.registry().get(Pid::from_raw(100)).is_none());
    assert_eq!(engine.channel().released, vec![100]);
}

#[test]
fn detach_twice_is_a_noop_the_second_time() {
    let mut engine = Engine::new(MockChannel::linux());
    engine.attach(Pid::from_raw(100)).unwrap();
    assert!(engine.registry().get(Pid::from_raw(100)).is_some());

    engine.detach(Pid::from_raw(100)).unwrap();
    engine.detach(Pid::from_raw(100)).unwrap();

    // The backend saw exactly one detach.
    assert_eq!(engine.channel().detached, vec![100]);
    assert!(!engine.registry().has_processes());
}

#[test]
fn exec_callback_slot_last_registration_wins() {
    let mut mock = MockChannel::linux();
    mock.store_string(0x1000, "/bin/true");

    let first = Rc::new(RefCell::new(0u32));
    let second = Rc::new(RefCell::new(0u32));

    let mut engine = Engine::new(mock);
    let a = first.clone();
    engine.register_exec(move |_c, _n| *a.borrow_mut() += 1);
    let b = second.clone();
    engine.register_exec(move |_c, _n| *b.borrow_mut() += 1);

    engine.handle_event(entry(1, 0, "execve", 59, &[0x1000])).unwrap();
    engine.handle_event(exit(1, 0, "execve", 59, 0, 0)).unwrap();

    assert_eq!(*first.borrow(), 0);
    assert_eq!(*second.borrow(), 1);
}

#[test]
fn run_loop_drains_until_no_process_is_tracked() {
    let mut mock = MockChannel::linux();
    mock.events.push_back(entry(100, 0, "open", 2, &[1]));
    mock.events.push_back(Event::Gone {
        pid: Pid::from_raw(100),
    });

    let mut engine = Engine::new(mock);
    engine.attach(Pid::from_raw(100)).unwrap();
    engine.run().unwrap();

    assert!(!engine.registry().has_processes());
    assert_eq!(engine.channel().answers.len(), 1);
    assert_eq!(engine.channel().released, vec![100]);
}

#[test]
fn gone_event_for_unknown_pid_is_harmless() {
    let mut engine = Engine::new(MockChannel::linux());
    engine
        .handle_event(Event::Gone {
            pid: Pid::from_raw(555),
        })
        .unwrap();
    assert_eq!(engine.channel().released, vec![555]);
}
