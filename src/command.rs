/// The part of a SCSI command descriptor the core needs to touch.
///
/// Everything else about the command (opcode, LBA, length, data buffers) is
/// opaque to the core; callers plug their own command type in and implement
/// this trait on it. The core never inspects a command's identity beyond
/// moving it by value between queues, so there is no intrusive list hook to
/// thread through the struct (contrast with `bs_list` in `usr/bs.c`).
pub trait Command: Send + 'static {
    /// Read back the result code a `request_fn` set.
    fn result(&self) -> i32;

    /// Record the result of executing this command. Called exactly once,
    /// from the worker thread that ran `request_fn` for it.
    fn set_result(&mut self, result: i32);

    /// NUMA node this command has been assigned to, or `-1` if unassigned.
    /// Ignored entirely outside NUMA mode.
    fn node_id(&self) -> i32 {
        -1
    }

    /// Assign a NUMA node to this command. Ignored outside NUMA mode.
    fn set_node_id(&mut self, _node_id: i32) {}
}

/// Splits a command into a NUMA node id, the way `split_io(cmd, &hc)` does
/// in `usr/bs.c`. Only consulted in NUMA mode, and only once per command
/// (the worker caches the answer in `Command::set_node_id`).
pub trait NodeSplitter<C>: Send + Sync {
    fn split(&self, cmd: &C) -> usize;
}

impl<C, F> NodeSplitter<C> for F
where
    F: Fn(&C) -> usize + Send + Sync,
{
    fn split(&self, cmd: &C) -> usize {
        self(cmd)
    }
}
