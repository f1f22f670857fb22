//! Variant A: signalfd-backed wakeup.
//!
//! `SIGUSR2` is blocked process-wide so it never invokes a signal handler;
//! instead a `signalfd` turns its delivery into a readable fd the foreground
//! event loop can poll like any other descriptor.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

/// Blocks `SIGUSR2` in the calling thread (propagates to threads spawned
/// afterwards) and creates a `signalfd` observing it.
///
/// Returns `None` if signalfd creation fails, in which case the caller
/// should fall back to the pipe-ack variant.
pub fn try_init() -> Option<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGUSR2);
    // Block in this thread; child threads spawned by the worker pool
    // inherit the mask, so SIGUSR2 never reaches a signal handler anywhere.
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .expect("sigprocmask(SIG_BLOCK, SIGUSR2) should not fail");

    SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK).ok()
}

/// Sends `SIGUSR2` to this process, the way a worker wakes the foreground
/// after appending to `finished_list`.
pub fn notify_process() {
    signal::kill(nix::unistd::getpid(), Signal::SIGUSR2).expect("kill(getpid(), SIGUSR2) failed");
}

/// Drains every pending `signalfd_siginfo` record from `fd`. The contents
/// are discarded; only the wakeup edge matters — the
/// actual completions are read out of `finished_list` separately.
pub fn drain(fd: &SignalFd) {
    // `SignalFd::read_signal` pulls one `signalfd_siginfo` per call and
    // returns `Ok(None)` once the fd would block (EAGAIN), so looping here
    // bounds the drain to exactly what's pending right now.
    while let Ok(Some(_siginfo)) = fd.read_signal() {}
}

pub fn raw_fd(fd: &SignalFd) -> RawFd {
    fd.as_raw_fd()
}
