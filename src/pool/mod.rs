//! Worker Pool (`bs_thread_info`): a per-LU group of worker threads that
//! pull commands off a pending queue, run the backend's `request_fn`, and
//! hand completions to a [`CompletionSink`].
//!
//! `pool_submit` is infallible by design: anything that would prevent an
//! enqueue is the caller's responsibility to have caught first.

mod numa;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use nix::sys::signal::{self, SigSet};
use rand::Rng;

use crate::command::{Command, NodeSplitter};
use crate::config::{NumaPolicy, PoolConfig};
use crate::error::CoreError;
use crate::sink::CompletionSink;

struct QueueState<C> {
    pending: VecDeque<C>,
    stop: bool,
}

/// One pending queue (the only one outside NUMA mode, one per node inside
/// it), each with its own lock so contention on one node never blocks
/// another.
struct Queue<C> {
    state: Mutex<QueueState<C>>,
    cond: Condvar,
}

impl<C> Queue<C> {
    fn new() -> Self {
        Queue {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn enqueue(&self, cmd: C) {
        self.state.lock().expect("pending lock poisoned").pending.push_back(cmd);
        self.cond.notify_one();
    }

    fn len(&self) -> usize {
        self.state.lock().expect("pending lock poisoned").pending.len()
    }

    fn set_stop(&self, stop: bool) {
        self.state.lock().expect("pending lock poisoned").stop = stop;
        self.cond.notify_all();
    }
}

/// Block on `queue` until either a command is available (pop it) or `stop`
/// becomes true (give up `None`) — the worker main loop's steps a-c.
fn dequeue<C>(queue: &Queue<C>) -> Option<C> {
    let mut guard = queue.state.lock().expect("pending lock poisoned");
    loop {
        if let Some(cmd) = guard.pending.pop_front() {
            return Some(cmd);
        }
        if guard.stop {
            return None;
        }
        guard = queue.cond.wait(guard).expect("pending cond poisoned");
    }
}

enum QueueSet<C> {
    Single(Queue<C>),
    Sharded(Vec<Queue<C>>),
}

impl<C> QueueSet<C> {
    fn single() -> Self {
        QueueSet::Single(Queue::new())
    }

    fn sharded(nr_nodes: usize) -> Self {
        QueueSet::Sharded((0..nr_nodes).map(|_| Queue::new()).collect())
    }

    fn node_count(&self) -> usize {
        match self {
            QueueSet::Single(_) => 1,
            QueueSet::Sharded(queues) => queues.len(),
        }
    }

    fn get(&self, node: usize) -> &Queue<C> {
        match self {
            QueueSet::Single(queue) => queue,
            QueueSet::Sharded(queues) => &queues[node % queues.len()],
        }
    }

    fn submit_random(&self, cmd: C, rng: &mut impl Rng) {
        match self {
            QueueSet::Single(queue) => queue.enqueue(cmd),
            QueueSet::Sharded(queues) => {
                let idx = rng.gen_range(0..queues.len());
                queues[idx].enqueue(cmd);
            }
        }
    }

    fn set_stop_all(&self, stop: bool) {
        match self {
            QueueSet::Single(queue) => queue.set_stop(stop),
            QueueSet::Sharded(queues) => {
                for queue in queues {
                    queue.set_stop(stop);
                }
            }
        }
    }

    fn pending_len(&self) -> usize {
        match self {
            QueueSet::Single(queue) => queue.len(),
            QueueSet::Sharded(queues) => queues.iter().map(Queue::len).sum(),
        }
    }
}

struct StartupState {
    ready: bool,
    next_node: usize,
}

/// One-shot start barrier: workers block here until the creator has either
/// finished spawning the whole pool or given up, instead of a long-held
/// mutex. Also hands out NUMA node assignments round-robin, since that
/// assignment has to happen under the same lock as the ready check.
struct StartupGate {
    state: Mutex<StartupState>,
    cond: Condvar,
}

impl StartupGate {
    fn new() -> Self {
        StartupGate {
            state: Mutex::new(StartupState {
                ready: false,
                next_node: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut guard = self.state.lock().expect("startup lock poisoned");
        while !guard.ready {
            guard = self.cond.wait(guard).expect("startup cond poisoned");
        }
    }

    fn wait_and_assign_node(&self, nr_nodes: usize) -> usize {
        let mut guard = self.state.lock().expect("startup lock poisoned");
        while !guard.ready {
            guard = self.cond.wait(guard).expect("startup cond poisoned");
        }
        let node = guard.next_node % nr_nodes;
        guard.next_node += 1;
        node
    }

    fn release(&self) {
        self.state.lock().expect("startup lock poisoned").ready = true;
        self.cond.notify_all();
    }
}

fn block_all_signals() {
    let all = SigSet::all();
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&all), None)
        .expect("sigprocmask(SIG_BLOCK, all) should not fail");
}

struct WorkerContext<C: Command> {
    queues: Arc<QueueSet<C>>,
    gate: Arc<StartupGate>,
    request_fn: Arc<dyn Fn(&mut C) + Send + Sync>,
    sink: CompletionSink<C>,
    splitter: Option<Arc<dyn NodeSplitter<C>>>,
    numa_enabled: bool,
}

fn worker_main<C: Command>(ctx: WorkerContext<C>) {
    block_all_signals();

    let my_node = if ctx.numa_enabled {
        ctx.gate.wait_and_assign_node(ctx.queues.node_count())
    } else {
        ctx.gate.wait();
        0
    };

    if ctx.numa_enabled {
        if let Err(e) = numa::pin_to_node(my_node) {
            log::warn!("worker on node {my_node} failed to pin: {e}");
        }
    }

    loop {
        let queue = ctx.queues.get(my_node);
        let Some(mut cmd) = dequeue(queue) else {
            log::trace!("worker on node {my_node} exiting: pool stopped");
            return;
        };

        if ctx.numa_enabled {
            if cmd.node_id() < 0 {
                let splitter = ctx
                    .splitter
                    .as_ref()
                    .expect("NUMA-enabled pool opened without a NodeSplitter");
                let node = splitter.split(&cmd);
                cmd.set_node_id(node as i32);
            }
            let target = cmd.node_id() as usize;
            if target != my_node {
                ctx.queues.get(target).enqueue(cmd);
                continue;
            }
        }

        (ctx.request_fn)(&mut cmd);
        ctx.sink.push_finished(cmd);
    }
}

/// A running pool of worker threads bound to one backend's `request_fn`.
pub struct WorkerPool<C: Command> {
    queues: Arc<QueueSet<C>>,
    workers: Vec<JoinHandle<()>>,
    numa_enabled: bool,
}

impl<C: Command> WorkerPool<C> {
    /// `pool_open`: spawn `config.nr_worker_threads` workers bound to
    /// `request_fn`, delivering completions to `sink`.
    ///
    /// `splitter` is required when `config.numa` is
    /// [`NumaPolicy::Enabled`][crate::config::NumaPolicy::Enabled] — it
    /// stands in for the host daemon's `split_io`, used to decide which
    /// node's data a re-routed command actually belongs to. Ignored
    /// otherwise. `open` rejects `numa` enabled with no `splitter` up front
    /// with [`CoreError::NumaUnavailable`], before spawning any threads.
    ///
    /// On partial spawn failure, already-spawned workers are stopped and
    /// joined before returning [`CoreError::NoMemory`] — no worker is ever
    /// left running outside of a `WorkerPool` that owns it.
    pub fn open(
        config: PoolConfig,
        request_fn: impl Fn(&mut C) + Send + Sync + 'static,
        sink: CompletionSink<C>,
        splitter: Option<Arc<dyn NodeSplitter<C>>>,
    ) -> Result<Self, CoreError> {
        let numa_enabled = matches!(config.numa, NumaPolicy::Enabled);
        if numa_enabled && splitter.is_none() {
            log::error!("worker pool: NUMA mode requires a NodeSplitter");
            return Err(CoreError::NumaUnavailable);
        }
        let queues = if numa_enabled {
            let nr_nodes = numa::num_configured_nodes().ok_or(CoreError::NumaUnavailable)?;
            Arc::new(QueueSet::sharded(nr_nodes))
        } else {
            Arc::new(QueueSet::single())
        };

        let gate = Arc::new(StartupGate::new());
        let request_fn: Arc<dyn Fn(&mut C) + Send + Sync> = Arc::new(request_fn);

        let mut workers = Vec::with_capacity(config.nr_worker_threads);
        for i in 0..config.nr_worker_threads {
            let ctx = WorkerContext {
                queues: queues.clone(),
                gate: gate.clone(),
                request_fn: request_fn.clone(),
                sink: sink.clone(),
                splitter: splitter.clone(),
                numa_enabled,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("bs-worker-{i}"))
                .spawn(move || worker_main(ctx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::error!("worker pool: thread spawn failed at index {i}: {e}");
                    queues.set_stop_all(true);
                    gate.release();
                    for w in workers {
                        let _ = w.join();
                    }
                    return Err(CoreError::NoMemory);
                }
            }
        }

        log::info!(
            "worker pool: opened with {} thread(s){}",
            workers.len(),
            if numa_enabled { ", NUMA sharded" } else { "" }
        );
        gate.release();

        Ok(WorkerPool {
            queues,
            workers,
            numa_enabled,
        })
    }

    /// `pool_submit`: enqueue `cmd`. Always succeeds.
    ///
    /// Outside NUMA mode this just appends to the one pending queue. In
    /// NUMA mode the destination node is chosen uniformly at random and
    /// `cmd`'s node id is reset to unassigned, so the worker that dequeues
    /// it computes the real destination via the splitter and re-routes if
    /// the random guess was wrong.
    pub fn submit(&self, mut cmd: C) {
        if self.numa_enabled {
            cmd.set_node_id(-1);
            let mut rng = rand::thread_rng();
            self.queues.submit_random(cmd, &mut rng);
        } else {
            self.queues.get(0).enqueue(cmd);
        }
    }

    /// Number of commands still sitting in pending queues. Exposed for
    /// tests exercising shutdown mid-burst; not part of steady-state use.
    pub fn pending_len(&self) -> usize {
        self.queues.pending_len()
    }

    /// `pool_close`: stop accepting work, wake every worker, and join them
    /// all. Does not drain the pending queues — whatever is left there when
    /// this returns is the caller's to recover via device teardown.
    pub fn close(self) {
        self.queues.set_stop_all(true);
        for worker in self.workers {
            let _ = worker.join();
        }
        log::info!("worker pool: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventloop::{EventLoop, ReadHandler};
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex, OnceLock};

    // `CompletionSink::init`'s signalfd variant blocks SIGUSR2 process-wide;
    // running more than one of these tests concurrently in the same binary
    // risks one test's wakeup being observed by another's signalfd. Cargo
    // runs `#[test]` functions in parallel threads within one process, so
    // serialize anything that constructs a sink.
    fn signal_test_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<StdMutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| StdMutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
    }

    #[derive(Debug)]
    struct TestCmd {
        id: u32,
        result: i32,
        node_id: i32,
    }

    impl Command for TestCmd {
        fn result(&self) -> i32 {
            self.result
        }
        fn set_result(&mut self, result: i32) {
            self.result = result;
        }
        fn node_id(&self) -> i32 {
            self.node_id
        }
        fn set_node_id(&mut self, node_id: i32) {
            self.node_id = node_id;
        }
    }

    struct RecordingEventLoop {
        handlers: StdMutex<Vec<(RawFd, ReadHandler)>>,
    }

    impl RecordingEventLoop {
        fn new() -> Self {
            RecordingEventLoop {
                handlers: StdMutex::new(Vec::new()),
            }
        }

        fn fire_all(&self) {
            let mut handlers = self.handlers.lock().unwrap();
            for (fd, handler) in handlers.iter_mut() {
                handler(*fd);
            }
        }
    }

    impl EventLoop for RecordingEventLoop {
        fn event_add(&self, fd: RawFd, handler: ReadHandler) {
            self.handlers.lock().unwrap().push((fd, handler));
        }
        fn event_del(&self, fd: RawFd) {
            self.handlers.lock().unwrap().retain(|(f, _)| *f != fd);
        }
    }

    #[test]
    fn echoes_every_submission_exactly_once() {
        let _guard = signal_test_lock();
        let event_loop = RecordingEventLoop::new();
        let completed = Arc::new(StdMutex::new(Vec::new()));
        let completed_cb = completed.clone();
        let sink = CompletionSink::init(&event_loop, move |cmd: TestCmd| {
            completed_cb.lock().unwrap().push(cmd);
        })
        .expect("sink init");

        let pool = WorkerPool::open(
            PoolConfig::new(3),
            |cmd: &mut TestCmd| cmd.set_result(0),
            sink,
            None,
        )
        .expect("pool open");

        for id in 0..3 {
            pool.submit(TestCmd {
                id,
                result: -1,
                node_id: -1,
            });
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            event_loop.fire_all();
            if completed.lock().unwrap().len() == 3 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for completions");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        pool.close();

        let done = completed.lock().unwrap();
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|c| c.result == 0));
        let mut ids: Vec<u32> = done.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn burst_of_commands_all_complete_exactly_once() {
        let _guard = signal_test_lock();
        const N: usize = 2_000;
        let event_loop = RecordingEventLoop::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let sink = CompletionSink::init(&event_loop, move |cmd: TestCmd| {
            assert_eq!(cmd.result, (cmd.id % 7) as i32);
            count_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("sink init");

        let pool = WorkerPool::open(
            PoolConfig::new(4),
            |cmd: &mut TestCmd| {
                let r = (cmd.id % 7) as i32;
                cmd.set_result(r);
            },
            sink,
            None,
        )
        .expect("pool open");

        for id in 0..N {
            pool.submit(TestCmd {
                id: id as u32,
                result: -1,
                node_id: -1,
            });
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            event_loop.fire_all();
            if count.load(Ordering::SeqCst) == N {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for burst completion");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        pool.close();
        assert_eq!(count.load(Ordering::SeqCst), N);
    }

    #[test]
    fn close_joins_without_draining_pending_queue() {
        let _guard = signal_test_lock();
        let event_loop = RecordingEventLoop::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let completed_cb = completed.clone();
        let sink = CompletionSink::init(&event_loop, move |_cmd: TestCmd| {
            completed_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("sink init");

        // A single slow worker so most submissions are still pending when we
        // close, exercising the "no drain" shutdown guarantee.
        let pool = WorkerPool::open(
            PoolConfig::new(1),
            |cmd: &mut TestCmd| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                cmd.set_result(0);
            },
            sink,
            None,
        )
        .expect("pool open");

        for id in 0..50 {
            pool.submit(TestCmd {
                id,
                result: -1,
                node_id: -1,
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(10));
        let pending_before = pool.pending_len();
        pool.close();

        assert!(pending_before > 0, "expected commands still pending at close");
    }

    #[test]
    fn open_rejects_numa_enabled_without_a_splitter() {
        let _guard = signal_test_lock();
        let event_loop = RecordingEventLoop::new();
        let sink = CompletionSink::init(&event_loop, |_cmd: TestCmd| {}).expect("sink init");

        let err = WorkerPool::open(
            PoolConfig::new(2).with_numa(NumaPolicy::Enabled),
            |cmd: &mut TestCmd| cmd.set_result(0),
            sink,
            None,
        )
        .expect_err("open should reject NUMA mode with no splitter before spawning anything");

        assert!(matches!(err, CoreError::NumaUnavailable));
    }

    #[test]
    fn numa_rerouted_commands_execute_on_their_assigned_node() {
        let _guard = signal_test_lock();
        struct FixedSplitter;
        impl NodeSplitter<TestCmd> for FixedSplitter {
            fn split(&self, _cmd: &TestCmd) -> usize {
                0
            }
        }

        let event_loop = RecordingEventLoop::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let completed_cb = completed.clone();
        let sink = CompletionSink::init(&event_loop, move |_cmd: TestCmd| {
            completed_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("sink init");

        // Two shards, both hosted by this process regardless of whether the
        // `numa` feature is compiled in, by going through the non-feature
        // queue-set path directly.
        let queues = Arc::new(QueueSet::<TestCmd>::sharded(2));
        let gate = Arc::new(StartupGate::new());
        let request_fn: Arc<dyn Fn(&mut TestCmd) + Send + Sync> =
            Arc::new(|cmd: &mut TestCmd| cmd.set_result(0));
        let splitter: Arc<dyn NodeSplitter<TestCmd>> = Arc::new(FixedSplitter);

        let mut workers = Vec::new();
        for _ in 0..2 {
            let ctx = WorkerContext {
                queues: queues.clone(),
                gate: gate.clone(),
                request_fn: request_fn.clone(),
                sink: sink.clone(),
                splitter: Some(splitter.clone()),
                numa_enabled: true,
            };
            workers.push(std::thread::spawn(move || worker_main(ctx)));
        }
        gate.release();

        // Spray everything onto node 1; the splitter always says node 0, so
        // every command must be re-routed and still complete.
        for id in 0..20 {
            queues.get(1).enqueue(TestCmd {
                id,
                result: -1,
                node_id: -1,
            });
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            event_loop.fire_all();
            if completed.load(Ordering::SeqCst) == 20 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for reroute completion");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        queues.set_stop_all(true);
        for w in workers {
            let _ = w.join();
        }
    }
}
