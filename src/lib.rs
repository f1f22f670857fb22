//! Backing-store worker pool core for a SCSI/iSCSI target daemon.
//!
//! Three collaborating pieces, leaves first: a [`registry`] of named
//! backend templates, a [`sink`] that wakes the foreground when workers
//! finish, and a [`pool`] of worker threads that feed it. Everything else
//! about a command — opcode, LBA, buffers — is opaque to this crate; a
//! caller's command type only needs to implement [`command::Command`].
//!
//! This crate does not run an event loop itself (see [`eventloop::EventLoop`])
//! and does not implement any backing-store backend; both are supplied by
//! the host daemon.

pub mod command;
pub mod config;
pub mod error;
pub mod eventloop;
pub mod pool;
pub mod registry;
pub mod sink;

pub use command::{Command, NodeSplitter};
pub use config::{NumaPolicy, PoolConfig, DEFAULT_WORKER_THREADS};
pub use error::CoreError;
pub use eventloop::{EventLoop, ReadHandler};
pub use pool::WorkerPool;
pub use registry::{BackendTemplate, Registry};
pub use sink::{CompletionSink, SinkKind};
