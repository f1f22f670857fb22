use std::fmt;

/// Failure modes the core can surface to the rest of the daemon.
///
/// `pool_submit` never returns one of these — see the module docs on
/// [`crate::pool`] for why the submit path is infallible.
#[derive(Debug)]
pub enum CoreError {
    /// A worker thread failed to spawn, or one of the primitives backing a
    /// pool (mutex, condvar, pending queue) could not be allocated.
    NoMemory,
    /// Neither the signalfd nor the pipe-ack completion sink could be
    /// initialized. Fatal to the daemon.
    SinkInitFailed,
    /// NUMA mode was requested but the host does not expose NUMA topology
    /// information (no `libnuma`, or `numa_available() != 0`).
    NumaUnavailable,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NoMemory => write!(f, "failed to allocate worker pool resources"),
            CoreError::SinkInitFailed => {
                write!(f, "completion sink initialization failed (signalfd and pipe-ack both unavailable)")
            }
            CoreError::NumaUnavailable => write!(f, "NUMA topology is not available on this host"),
        }
    }
}

impl std::error::Error for CoreError {}
