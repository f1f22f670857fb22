//! Bindings to the handful of `libnuma` entry points the sharded-queue pool
//! policy needs. No `numa` crate exists to pull in, so this mirrors them by
//! hand the way `usr/bs.c` itself only ever calls four functions from it.
//!
//! Compiled unconditionally; the actual `extern "C"` declarations and their
//! bodies are gated behind the `numa` feature so a default build links
//! against nothing and simply reports NUMA as unavailable.

use crate::error::CoreError;

#[cfg(feature = "numa")]
mod ffi {
    extern "C" {
        pub fn numa_available() -> libc::c_int;
        pub fn numa_num_configured_nodes() -> libc::c_int;
        pub fn numa_run_on_node(node: libc::c_int) -> libc::c_int;
        pub fn numa_set_preferred(node: libc::c_int);
    }
}

/// Number of configured NUMA nodes on this host, or `None` if the `numa`
/// feature wasn't compiled in or the host has no NUMA topology
/// (`numa_available() == -1`).
#[cfg(feature = "numa")]
pub fn num_configured_nodes() -> Option<usize> {
    // SAFETY: both calls take no pointers and are documented as safe to call
    // from any thread at any time.
    unsafe {
        if ffi::numa_available() < 0 {
            return None;
        }
        let n = ffi::numa_num_configured_nodes();
        if n <= 0 {
            None
        } else {
            Some(n as usize)
        }
    }
}

#[cfg(not(feature = "numa"))]
pub fn num_configured_nodes() -> Option<usize> {
    None
}

/// Pin the calling thread to `node` and set it as the preferred allocation
/// node, the way `bs_thread_worker_fn` does right after joining the startup
/// barrier.
#[cfg(feature = "numa")]
pub fn pin_to_node(node: usize) -> Result<(), CoreError> {
    let node = node as libc::c_int;
    // SAFETY: `node` was obtained from `num_configured_nodes`, so it names a
    // node libnuma already told us exists.
    let rc = unsafe { ffi::numa_run_on_node(node) };
    if rc != 0 {
        return Err(CoreError::NumaUnavailable);
    }
    unsafe { ffi::numa_set_preferred(node) };
    Ok(())
}

#[cfg(not(feature = "numa"))]
pub fn pin_to_node(_node: usize) -> Result<(), CoreError> {
    Err(CoreError::NumaUnavailable)
}
