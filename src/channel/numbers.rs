//! x86_64 syscall numbers for the `"linux"` emulation (selected common ones).

use std::collections::HashMap;
use std::sync::LazyLock;

static NAMES: LazyLock<HashMap<u64, &'static str>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert(0, "read");
    m.insert(1, "write");
    m.insert(2, "open");
    m.insert(3, "close");
    m.insert(4, "stat");
    m.insert(5, "fstat");
    m.insert(6, "lstat");
    m.insert(7, "poll");
    m.insert(8, "lseek");
    m.insert(9, "mmap");
    m.insert(10, "mprotect");
    m.insert(11, "munmap");
    m.insert(12, "brk");
    m.insert(13, "rt_sigaction");
    m.insert(14, "rt_sigprocmask");
    m.insert(16, "ioctl");
    m.insert(17, "pread64");
    m.insert(18, "pwrite64");
    m.insert(19, "readv");
    m.insert(20, "writev");
    m.insert(21, "access");
    m.insert(22, "pipe");
    m.insert(23, "select");
    m.insert(24, "sched_yield");
    m.insert(25, "mremap");
    m.insert(28, "madvise");
    m.insert(32, "dup");
    m.insert(33, "dup2");
    m.insert(35, "nanosleep");
    m.insert(39, "getpid");
    m.insert(41, "socket");
    m.insert(42, "connect");
    m.insert(43, "accept");
    m.insert(44, "sendto");
    m.insert(45, "recvfrom");
    m.insert(46, "sendmsg");
    m.insert(47, "recvmsg");
    m.insert(48, "shutdown");
    m.insert(49, "bind");
    m.insert(50, "listen");
    m.insert(51, "getsockname");
    m.insert(52, "getpeername");
    m.insert(53, "socketpair");
    m.insert(54, "setsockopt");
    m.insert(55, "getsockopt");
    m.insert(56, "clone");
    m.insert(57, "fork");
    m.insert(58, "vfork");
    m.insert(59, "execve");
    m.insert(60, "exit");
    m.insert(61, "wait4");
    m.insert(62, "kill");
    m.insert(63, "uname");
    m.insert(72, "fcntl");
    m.insert(74, "fsync");
    m.insert(78, "getdents");
    m.insert(79, "getcwd");
    m.insert(80, "chdir");
    m.insert(81, "fchdir");
    m.insert(82, "rename");
    m.insert(83, "mkdir");
    m.insert(84, "rmdir");
    m.insert(85, "creat");
    m.insert(86, "link");
    m.insert(87, "unlink");
    m.insert(88, "symlink");
    m.insert(89, "readlink");
    m.insert(90, "chmod");
    m.insert(92, "chown");
    m.insert(95, "umask");
    m.insert(96, "gettimeofday");
    m.insert(97, "getrlimit");
    m.insert(102, "getuid");
    m.insert(104, "getgid");
    m.insert(105, "setuid");
    m.insert(106, "setgid");
    m.insert(107, "geteuid");
    m.insert(108, "getegid");
    m.insert(110, "getppid");
    m.insert(157, "prctl");
    m.insert(158, "arch_prctl");
    m.insert(186, "gettid");
    m.insert(201, "time");
    m.insert(202, "futex");
    m.insert(217, "getdents64");
    m.insert(218, "set_tid_address");
    m.insert(228, "clock_gettime");
    m.insert(230, "clock_nanosleep");
    m.insert(231, "exit_group");
    m.insert(234, "tgkill");
    m.insert(257, "openat");
    m.insert(258, "mkdirat");
    m.insert(262, "newfstatat");
    m.insert(263, "unlinkat");
    m.insert(265, "linkat");
    m.insert(266, "symlinkat");
    m.insert(267, "readlinkat");
    m.insert(268, "fchmodat");
    m.insert(269, "faccessat");
    m.insert(273, "set_robust_list");
    m.insert(281, "epoll_pwait");
    m.insert(288, "accept4");
    m.insert(293, "pipe2");
    m.insert(302, "prlimit64");
    m.insert(318, "getrandom");
    m.insert(322, "execveat");
    m.insert(332, "statx");
    m.insert(334, "rseq");
    m.insert(435, "clone3");
    m.insert(439, "faccessat2");
    m
});

static NUMBERS: LazyLock<HashMap<&'static str, u64>> =
    LazyLock::new(|| NAMES.iter().map(|(nr, name)| (*name, *nr)).collect());

pub fn name(nr: u64) -> Option<&'static str> {
    NAMES.get(&nr).copied()
}

pub fn number(name: &str) -> Option<u64> {
    NUMBERS.get(name).copied()
}
