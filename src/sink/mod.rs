//! Completion Sink: the mechanism by which a worker thread informs the
//! foreground that a command is done.
//!
//! Exposes one capability set — `push_finished` (worker → sink) and a
//! registration with the event loop that drains onto the foreground thread
//! — behind two selectable implementations, chosen once in [`CompletionSink::init`].

mod pipe_ack;
mod signal;

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::signalfd::SignalFd;

use crate::command::Command;
use crate::error::CoreError;
use crate::eventloop::EventLoop;

/// Which wakeup mechanism a [`CompletionSink`] ended up using. Only
/// meaningful for logging/diagnostics — callers interact with the sink the
/// same way regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Signal,
    PipeAck,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Signal => write!(f, "signalfd"),
            SinkKind::PipeAck => write!(f, "pipe-ack"),
        }
    }
}

enum Variant<C: Command> {
    Signal {
        sig_fd: SignalFd,
    },
    PipeAck {
        // Kept alive for the sink's lifetime; dropping any of these would
        // close the fd out from under the ack thread or the foreground.
        _ack_thread: JoinHandle<()>,
        command_write: OwnedFd,
        done_read: OwnedFd,
        _command_read_keepalive: OwnedFd,
        _done_write_keepalive: OwnedFd,
        ack_list: Arc<pipe_ack::AckList<C>>,
    },
}

struct Inner<C: Command> {
    finished: Mutex<VecDeque<C>>,
    pipe_finished: Option<Arc<pipe_ack::Finished<C>>>,
    variant: Variant<C>,
}

/// Process-wide completion sink. Cloning shares the same underlying state
/// (it's an `Arc` handle) — this is what worker pools hold so every pool's
/// workers can hand completions to the same sink.
pub struct CompletionSink<C: Command> {
    inner: Arc<Inner<C>>,
}

impl<C: Command> Clone for CompletionSink<C> {
    fn clone(&self) -> Self {
        CompletionSink {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Command> CompletionSink<C> {
    /// `core_init`: prefer signalfd, fall back to pipe-ack, fail only if
    /// neither works.
    ///
    /// `on_complete` is `target_cmd_io_done` — invoked on the foreground
    /// thread, once per finished command, in the order workers appended
    /// them to `finished_list`.
    pub fn init(
        event_loop: &dyn EventLoop,
        on_complete: impl FnMut(C) + Send + 'static,
    ) -> Result<Self, CoreError> {
        if let Some(sig_fd) = signal::try_init() {
            log::info!("completion sink: using signalfd notification");
            return Ok(Self::init_signal(event_loop, sig_fd, on_complete));
        }

        log::info!("completion sink: signalfd unavailable, using pipe-ack notification");
        Self::init_pipe_ack(event_loop, on_complete)
    }

    fn init_signal(
        event_loop: &dyn EventLoop,
        sig_fd: SignalFd,
        mut on_complete: impl FnMut(C) + Send + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            finished: Mutex::new(VecDeque::new()),
            pipe_finished: None,
            variant: Variant::Signal { sig_fd },
        });

        let fd = match &inner.variant {
            Variant::Signal { sig_fd } => signal::raw_fd(sig_fd),
            Variant::PipeAck { .. } => unreachable!(),
        };
        let drain_inner = inner.clone();
        event_loop.event_add(
            fd,
            Box::new(move |_fd| {
                let Variant::Signal { sig_fd } = &drain_inner.variant else {
                    unreachable!()
                };
                signal::drain(sig_fd);
                let local: VecDeque<C> = {
                    let mut guard = drain_inner.finished.lock().expect("finished_lock poisoned");
                    std::mem::take(&mut *guard)
                };
                for cmd in local {
                    on_complete(cmd);
                }
            }),
        );

        CompletionSink { inner }
    }

    fn init_pipe_ack(
        event_loop: &dyn EventLoop,
        mut on_complete: impl FnMut(C) + Send + 'static,
    ) -> Result<Self, CoreError> {
        let command = pipe_ack::new_pipe().map_err(|_| CoreError::SinkInitFailed)?;
        let done = pipe_ack::new_pipe().map_err(|_| CoreError::SinkInitFailed)?;

        let pipe_finished = Arc::new(pipe_ack::Finished::new());
        let ack_list = Arc::new(pipe_ack::AckList::new());

        let pipe_ack::PipePair {
            read: command_read,
            write: command_write,
        } = command;
        let pipe_ack::PipePair {
            read: done_read,
            write: done_write,
        } = done;

        let command_read_raw = command_read.as_raw_fd();
        let command_write_raw = command_write.as_raw_fd();
        let done_read_raw = done_read.as_raw_fd();
        let done_write_raw = done_write.as_raw_fd();

        let ack_thread = {
            let finished = pipe_finished.clone();
            let ack_list = ack_list.clone();
            std::thread::Builder::new()
                .name("bs-ack".into())
                .spawn(move || pipe_ack::ack_thread_main(command_read_raw, done_write_raw, finished, ack_list))
                .map_err(|_| CoreError::SinkInitFailed)?
        };

        let ack_list_for_handler = ack_list.clone();
        let inner = Arc::new(Inner {
            finished: Mutex::new(VecDeque::new()),
            pipe_finished: Some(pipe_finished),
            variant: Variant::PipeAck {
                _ack_thread: ack_thread,
                command_write,
                done_read,
                _command_read_keepalive: command_read,
                _done_write_keepalive: done_write,
                ack_list,
            },
        });

        event_loop.event_add(
            done_read_raw,
            Box::new(move |_fd| {
                if pipe_ack::read_token(done_read_raw).is_err() {
                    log::warn!("pipe-ack: wrong wakeup on done_fd");
                    return;
                }
                // SAFETY: the foreground only touches ack_list after reading
                // done_fd and before writing command_fd, which is exactly
                // the window the ack thread hands it ownership for.
                let drained: Vec<C> = unsafe { ack_list_for_handler.get_mut().drain(..).collect() };
                for cmd in drained {
                    on_complete(cmd);
                }
                if pipe_ack::write_token(command_write_raw, 1).is_err() {
                    log::warn!("pipe-ack: failed to rearm ack thread");
                }
            }),
        );

        // Prime the ack thread so it enters AWAIT_FINISHED.
        pipe_ack::write_token(command_write_raw, 1).map_err(|_| CoreError::SinkInitFailed)?;

        Ok(CompletionSink { inner })
    }

    /// Which variant is active. Purely informational.
    pub fn kind(&self) -> SinkKind {
        match &self.inner.variant {
            Variant::Signal { .. } => SinkKind::Signal,
            Variant::PipeAck { .. } => SinkKind::PipeAck,
        }
    }

    /// Worker → sink handoff: append `cmd` to
    /// `finished_list` and wake whichever side is responsible for noticing.
    pub fn push_finished(&self, cmd: C) {
        match &self.inner.variant {
            Variant::Signal { .. } => {
                self.inner
                    .finished
                    .lock()
                    .expect("finished_lock poisoned")
                    .push_back(cmd);
                signal::notify_process();
            }
            Variant::PipeAck { .. } => {
                let finished = self
                    .inner
                    .pipe_finished
                    .as_ref()
                    .expect("pipe_finished set for PipeAck variant");
                finished.list.lock().expect("finished_lock poisoned").push_back(cmd);
                finished.cond.notify_one();
            }
        }
    }
}
