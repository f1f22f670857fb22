//! Variant B: self-pipe + dedicated ack thread.
//!
//! Used only when signalfd creation fails. Two pipes ping-pong a single
//! token back and forth between the foreground and a dedicated `ack_thread`,
//! which is the only thing allowed to touch `ack_list` besides the
//! foreground — the alternation the pipe protocol enforces is what makes
//! that safe without a lock.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};

use nix::errno::Errno;
use nix::unistd;

use crate::command::Command;

/// `ack_list`: owned exclusively by whichever side the pipe protocol
/// currently grants it to. `Sync` is sound only because the foreground and
/// the ack thread strictly alternate access via the `command_fd`/`done_fd`
/// handshake in [`super::CompletionSink`] — never call [`AckList::get_mut`]
/// except from inside that handshake.
pub(super) struct AckList<C> {
    inner: UnsafeCell<VecDeque<C>>,
}

unsafe impl<C: Send> Sync for AckList<C> {}

impl<C> AckList<C> {
    pub(super) fn new() -> Self {
        AckList {
            inner: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// # Safety
    /// Caller must hold the pipe-ack handoff (i.e. be the ack thread between
    /// draining `finished_list` and writing `done_fd`, or be the foreground
    /// between reading `done_fd` and writing `command_fd`).
    pub(super) unsafe fn get_mut(&self) -> &mut VecDeque<C> {
        &mut *self.inner.get()
    }
}

/// One end of a `pipe(2)` pair, read and written as 4-byte tokens.
pub(super) struct PipePair {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

pub(super) fn new_pipe() -> nix::Result<PipePair> {
    let (read, write) = unistd::pipe()?;
    Ok(PipePair { read, write })
}

pub(super) fn write_token(fd: RawFd, token: i32) -> nix::Result<()> {
    let bytes = token.to_ne_bytes();
    loop {
        match unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &bytes) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
}

pub(super) fn read_token(fd: RawFd) -> nix::Result<i32> {
    let mut bytes = [0u8; 4];
    loop {
        match unistd::read(fd, &mut bytes) {
            Ok(0) => return Err(Errno::EPIPE),
            Ok(_) => return Ok(i32::from_ne_bytes(bytes)),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Shared state the worker pool and the ack thread both touch: the same
/// `finished_list`/`finished_cond` pair the signalfd variant's workers use
/// to hand off completions, just consumed differently here.
pub(super) struct Finished<C> {
    pub list: Mutex<VecDeque<C>>,
    pub cond: Condvar,
}

impl<C> Finished<C> {
    pub(super) fn new() -> Self {
        Finished {
            list: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }
}

/// `bs_thread_ack_fn`: the ack thread's main loop.
///
/// Runs until `command_fd` read fails with something other than
/// `EINTR`/`EAGAIN` (the `STOPPED` state) — in practice this
/// only happens once the process is tearing down and the write end is
/// dropped, since the completion sink otherwise lives for the process.
pub(super) fn ack_thread_main<C: Command>(
    command_fd: RawFd,
    done_fd: RawFd,
    finished: Arc<Finished<C>>,
    ack_list: Arc<AckList<C>>,
) {
    loop {
        // AWAIT_COMMAND
        if read_token(command_fd).is_err() {
            log::debug!("pipe-ack thread exiting: command_fd closed");
            return;
        }

        // AWAIT_FINISHED
        {
            let mut guard = finished.list.lock().expect("finished_lock poisoned");
            while guard.is_empty() {
                guard = finished.cond.wait(guard).expect("finished_cond poisoned");
            }
            // SAFETY: we are the ack thread and have not yet handed the list
            // to the foreground via done_fd.
            let dst = unsafe { ack_list.get_mut() };
            dst.extend(guard.drain(..));
        }

        // DELIVER
        if write_token(done_fd, 1).is_err() {
            log::debug!("pipe-ack thread exiting: done_fd closed");
            return;
        }
    }
}

pub(super) fn raw_fd(fd: &OwnedFd) -> RawFd {
    fd.as_raw_fd()
}
