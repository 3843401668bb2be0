//!
//! Scheduler & Worker Pool
//!
//! `Runtime` owns one task queue, one group registry, and an elastic pool of
//! worker threads. A single control thread resizes the pool with hysteresis,
//! drains the deferred-cancellation list, and decides when the runtime may
//! shut down; workers dequeue and execute task bodies, writing results into
//! each task's single-assignment cell.
//!

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::PartaskError;
use crate::future::{Future, Outcome, TaskId, TaskIdAllocator};
use crate::group::{CancelReason, Group, GroupId, GroupRegistry};
use crate::once::AssignCell;
use crate::queue::{Body, CancelCb, TaskQueueInner};

/// The task a worker thread is currently executing, so that sub-forks made
/// from inside a task body inherit its group and `join` can tell a worker
/// caller from an external one (§4.4).
struct WorkerContext {
    task_id: TaskId,
    group: Group,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.task_id))
}

fn current_group() -> Option<Group> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.group.clone()))
}

fn is_worker_thread() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Hysteresis threshold from §4.4 step 3: the pool only resizes once the
/// smoothed demand/supply trend crosses this magnitude.
const TREND_THRESHOLD: i64 = 50;

struct WorkerSlot {
    id: usize,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct PoolState {
    slots: Vec<WorkerSlot>,
    next_slot_id: usize,
    trend: i64,
}

struct Inner {
    queue: Mutex<TaskQueueInner>,
    groups: Arc<GroupRegistry>,
    alloc: TaskIdAllocator,
    /// Signaled whenever new ready work appears (or on shutdown), to wake
    /// idle workers and the control thread.
    work_available: Condvar,
    /// Signaled whenever any task finishes, for `join`'s work-stealing wait
    /// and for `dequeue_towards` retries.
    work_finished: Condvar,
    pool: Mutex<PoolState>,
    active_workers: AtomicUsize,
    host_threads: usize,
    tick: Duration,
    shutdown_requested: AtomicBool,
    trend_signal: AtomicI64,
    deferred_cancel: Mutex<HashSet<GroupId>>,
    control: Mutex<Option<JoinHandle<()>>>,
}

/// One runtime instance: its own queue, group tree, and worker pool. Most
/// programs use the single process-wide instance behind [`crate::global`],
/// but tests construct independent runtimes freely.
#[derive(Clone)]
pub struct Runtime(Arc<Inner>);

pub struct RuntimeBuilder {
    tick: Duration,
    host_threads: Option<usize>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            tick: Duration::from_millis(50),
            host_threads: None,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        RuntimeBuilder::default()
    }

    /// Control-thread tick period; §4.4 calls for ~20 Hz, i.e. 50 ms.
    pub fn set_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Overrides the host thread count the pool sizes itself against.
    /// Defaults to `std::thread::available_parallelism()`.
    pub fn set_host_threads(mut self, n: usize) -> Self {
        self.host_threads = Some(n.max(1));
        self
    }

    pub fn build(self) -> Runtime {
        let host_threads = self.host_threads.unwrap_or_else(|| {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        });
        let inner = Arc::new(Inner {
            queue: Mutex::new(TaskQueueInner::new()),
            groups: GroupRegistry::new(),
            alloc: TaskIdAllocator::new(),
            work_available: Condvar::new(),
            work_finished: Condvar::new(),
            pool: Mutex::new(PoolState {
                slots: Vec::new(),
                next_slot_id: 0,
                trend: 0,
            }),
            active_workers: AtomicUsize::new(0),
            host_threads,
            tick: self.tick,
            shutdown_requested: AtomicBool::new(false),
            trend_signal: AtomicI64::new(0),
            deferred_cancel: Mutex::new(HashSet::new()),
            control: Mutex::new(None),
        });
        let runtime = Runtime(inner);
        runtime.spawn_control_thread();
        runtime
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    fn spawn_control_thread(&self) {
        let runtime = self.clone();
        let handle = thread::spawn(move || runtime.control_loop());
        *self.0.control.lock().unwrap() = Some(handle);
    }

    fn control_loop(&self) {
        loop {
            self.reap_dead_workers();
            self.adjust_pool();
            self.drain_deferred_cancellations();

            if self.0.shutdown_requested.load(Ordering::SeqCst)
                && self.queue_all_passive()
                && self.pool_is_empty()
            {
                tracing::info!("partask runtime shutting down: queue quiescent, pool empty");
                return;
            }

            let guard = self.0.queue.lock().unwrap();
            let _ = self
                .0
                .work_available
                .wait_timeout(guard, self.0.tick)
                .unwrap();
        }
    }

    fn pool_is_empty(&self) -> bool {
        self.0.pool.lock().unwrap().slots.is_empty()
    }

    fn queue_all_passive(&self) -> bool {
        self.0.queue.lock().unwrap().all_passive()
    }

    fn reap_dead_workers(&self) {
        let mut pool = self.0.pool.lock().unwrap();
        pool.slots.retain_mut(|slot| {
            if slot.alive.load(Ordering::SeqCst) {
                true
            } else {
                if let Some(handle) = slot.handle.take() {
                    let _ = handle.join();
                }
                false
            }
        });
    }

    /// §4.4 step 3: hysteresis on a smoothed trend counter. Demand is
    /// approximated as the queue's ready+running count; the pool grows or
    /// shrinks by one worker per tick once the trend exceeds the threshold,
    /// or immediately collapses to zero on zero demand plus shutdown.
    fn adjust_pool(&self) {
        let demand = {
            let q = self.0.queue.lock().unwrap();
            let status = q.status();
            status.ready + status.running
        };

        let mut pool = self.0.pool.lock().unwrap();
        let current = pool.slots.len();

        if demand == 0 && self.0.shutdown_requested.load(Ordering::SeqCst) {
            pool.trend = 0;
            for slot in &pool.slots {
                slot.alive.store(false, Ordering::SeqCst);
            }
            self.0.work_available.notify_all();
            return;
        }

        pool.trend += if demand > current { 1 } else { -1 };
        let target = if pool.trend > TREND_THRESHOLD {
            pool.trend = 0;
            (current + 1).min(self.0.host_threads)
        } else if pool.trend < -TREND_THRESHOLD {
            pool.trend = 0;
            current.saturating_sub(1)
        } else {
            current
        };

        if target > current {
            for _ in current..target {
                self.spawn_worker(&mut pool);
            }
        } else if target < current {
            for slot in pool.slots.iter().rev().take(current - target) {
                slot.alive.store(false, Ordering::SeqCst);
            }
        }
        drop(pool);
        self.0.work_available.notify_all();
    }

    fn spawn_worker(&self, pool: &mut PoolState) {
        let id = pool.next_slot_id;
        pool.next_slot_id += 1;
        let alive = Arc::new(AtomicBool::new(true));
        let runtime = self.clone();
        let worker_alive = alive.clone();
        let handle = thread::spawn(move || runtime.worker_loop(id, worker_alive));
        pool.slots.push(WorkerSlot {
            id,
            alive,
            handle: Some(handle),
        });
    }

    fn drain_deferred_cancellations(&self) {
        let mut deferred = self.0.deferred_cancel.lock().unwrap();
        if deferred.is_empty() {
            return;
        }
        let pending: Vec<GroupId> = deferred.iter().copied().collect();
        let mut still_deferred = HashSet::new();
        for group in pending {
            let mut groups = HashSet::new();
            groups.insert(group);
            let had_running = self.0.queue.lock().unwrap().cancel(&groups);
            if had_running {
                still_deferred.insert(group);
            } else {
                self.maybe_reap_chain(group);
            }
        }
        *deferred = still_deferred;
    }

    /// Orphan rule (§3): walks from `group` up toward the root, reaping each
    /// group that is cancelled and has no tasks and no children left,
    /// stopping at the first group that is still alive, still has queued
    /// tasks, or still has children. Alive groups are never reaped here —
    /// only a cancelled group is guaranteed not to accept new forks.
    fn maybe_reap_chain(&self, mut group: GroupId) {
        loop {
            if group == GroupId::ROOT || self.0.groups.is_alive(group) {
                return;
            }
            if !self.0.queue.lock().unwrap().group_is_empty(group) {
                return;
            }
            let Some(parent) = self.0.groups.parent_of(group) else {
                return;
            };
            self.0.groups.reap(group);
            group = parent;
        }
    }

    /// §4.4 worker loop steps 1-4.
    fn worker_loop(&self, id: usize, alive: Arc<AtomicBool>) {
        tracing::debug!(worker = id, "worker started");
        self.0.active_workers.fetch_add(1, Ordering::SeqCst);
        while alive.load(Ordering::SeqCst) {
            let dequeued = self
                .0
                .queue
                .lock()
                .unwrap()
                .dequeue(|g| self.0.groups.is_alive(g));
            let Some((task_id, group_id, bodies)) = dequeued else {
                let guard = self.0.queue.lock().unwrap();
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let _ = self
                    .0
                    .work_available
                    .wait_timeout(guard, Duration::from_millis(20))
                    .unwrap();
                continue;
            };

            let group = Group::from_parts(self.0.groups.clone(), group_id);
            CURRENT.with(|c| {
                *c.borrow_mut() = Some(WorkerContext {
                    task_id,
                    group: group.clone(),
                });
            });
            for body in bodies {
                body();
            }
            CURRENT.with(|c| *c.borrow_mut() = None);

            let was_empty = self.0.queue.lock().unwrap().finish(task_id);
            self.0.work_finished.notify_all();
            if was_empty {
                self.0.work_available.notify_all();
            }
            self.maybe_reap_chain(group_id);
        }
        self.0.active_workers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker = id, "worker exiting");
    }

    // -- future construction -------------------------------------------

    fn group_for_fork(&self) -> Group {
        current_group().unwrap_or_else(|| Group::root(self.0.groups.clone()))
    }

    fn wake(&self, was_first_ready: bool) {
        if was_first_ready {
            self.0.work_available.notify_all();
        }
    }

    /// Runs `closure` in the given group, with the group-liveness check and
    /// group-cancel-on-failure behavior from §4.4 "Fork".
    fn fork_body<T, F>(cell: Arc<AssignCell<Outcome<T>>>, group: Group, closure: F) -> Body
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        Box::new(move || {
            if !group.is_alive() {
                let _ = cell.assign(Err(PartaskError::Interrupted));
                return;
            }
            let outcome = closure();
            if let Err(ref e) = outcome {
                if !e.is_cancellation() {
                    group.cancel(CancelReason::Failure(e.clone()));
                }
            }
            let _ = cell.assign(outcome);
        })
    }

    fn cancel_cb<T: Clone + Send + 'static>(cell: Arc<AssignCell<Outcome<T>>>) -> CancelCb {
        Box::new(move || {
            let _ = cell.assign(Err(PartaskError::Interrupted));
        })
    }

    /// `fork(closure) -> Future<T>`. Inherits the calling worker's group, if
    /// any, otherwise the root group.
    pub fn fork<T, F>(&self, closure: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let group = self.group_for_fork();
        self.fork_in(group, closure)
    }

    /// `fork_in(group, closure) -> Future<T>`.
    pub fn fork_in<T, F>(&self, group: Group, closure: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        self.fork_deps_in(group, &[], 0, closure)
    }

    /// `fork_deps(deps, priority, closure) -> Future<T>`, using the caller's
    /// current group.
    pub fn fork_deps<T, F>(&self, deps: &[TaskId], priority: i64, closure: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let group = self.group_for_fork();
        self.fork_deps_in(group, deps, priority, closure)
    }

    fn fork_deps_in<T, F>(&self, group: Group, deps: &[TaskId], priority: i64, closure: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let task_id = self.0.alloc.alloc();
        let (future, cell) = Future::new(task_id, group.clone(), false);

        if !group.is_alive() {
            let _ = cell.assign(Err(PartaskError::Interrupted));
            return future;
        }

        let body = Self::fork_body(cell.clone(), group.clone(), closure);
        let cancel_cb = Self::cancel_cb(cell);
        let was_first_ready = self
            .0
            .queue
            .lock()
            .unwrap()
            .enqueue(task_id, group.id(), deps, priority, body, cancel_cb);
        self.wake(was_first_ready);
        future
    }

    /// Internal: like `fork_deps_in`, but the closure already produces an
    /// `Outcome<T>` that must propagate unchanged (no `UserFailure` wrapping)
    /// — used by `map`'s slow path so an already-`PartaskError` failure
    /// from the source future isn't double-wrapped.
    fn fork_outcome<T, F>(&self, group: Group, deps: &[TaskId], priority: i64, closure: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        self.fork_deps_in(group, deps, priority, closure)
    }

    /// `value(v) -> Future<T>`, already resolved.
    pub fn value<T: Clone + Send + 'static>(&self, v: T) -> Future<T> {
        Future::resolved(self.group_for_fork(), v)
    }

    /// `map(f, x) -> Future<U>`. Fast path per §4.4: if `x`'s task is still
    /// queued and not running, append a continuation body to its entry and
    /// share its task id; otherwise fall back to a normal dependent fork.
    /// The check-then-extend sequence holds the queue mutex for its whole
    /// duration so a worker can't start running `x` in between (which would
    /// otherwise silently drop the appended closure).
    pub fn map<T, U, F>(&self, x: Future<T>, f: F) -> Future<U>
    where
        T: Clone + Send + 'static,
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let task_id = x.task_id();
        if task_id != TaskId::DUMMY {
            let mut q = self.0.queue.lock().unwrap();
            if q.can_extend(task_id) {
                // `can_extend` and `extend` share this one lock acquisition,
                // so the state this checked against cannot change underneath
                // us; `extend` is guaranteed to succeed.
                let (_, new_cell) = Future::<U>::new(task_id, x.group().clone(), false);
                let source_cell = x.cell().clone();
                let target_cell = new_cell.clone();
                q.extend(
                    task_id,
                    Box::new(move || {
                        let outcome = source_cell.peek().unwrap_or(Err(PartaskError::Interrupted));
                        let mapped = outcome.and_then(f);
                        let _ = target_cell.assign(mapped);
                    }),
                );
                return Future::from_cell(task_id, x.group().clone(), new_cell);
            }
        }

        let group = x.group().clone();
        let dep = x.task_id();
        let deps: &[TaskId] = if dep == TaskId::DUMMY { &[] } else { std::slice::from_ref(&dep) };
        self.fork_outcome(group, deps, 0, move || {
            let outcome = x.peek().unwrap_or_else(|| x.cell().await_value());
            outcome.and_then(f)
        })
    }

    /// `promise(group) -> Future<T>`.
    pub fn promise<T: Clone + Send + 'static>(&self, group: Option<Group>) -> Future<T> {
        let group = group.unwrap_or_else(|| self.group_for_fork());
        let task_id = self.0.alloc.alloc();
        let (future, cell) = Future::new(task_id, group.clone(), true);
        let cancel_cb = Self::cancel_cb(cell);
        self.0
            .queue
            .lock()
            .unwrap()
            .enqueue_passive(task_id, group.id(), cancel_cb);
        future
    }

    /// `fulfill(f, outcome)`. Double-fulfillment is a fatal misuse (§7).
    pub fn fulfill<T: Clone + Send + 'static>(&self, f: &Future<T>, outcome: Outcome<T>) {
        if !f.is_promised() {
            panic!("partask: fulfill called on a future that was not created by promise()");
        }
        match f.cell().assign(outcome) {
            Ok(()) => {
                let was_empty = self.0.queue.lock().unwrap().finish(f.task_id());
                self.0.work_finished.notify_all();
                if was_empty {
                    self.0.work_available.notify_all();
                }
                self.maybe_reap_chain(f.group().id());
            }
            Err(_) => panic!("partask: double-fulfillment of promise {:?}", f.task_id()),
        }
    }

    /// `join(f) -> Outcome<T>`.
    ///
    /// Panics if called while the current thread holds a [`crate::cell::SyncCell`]
    /// critical section (§4.4 "Forbidden").
    pub fn join<T: Clone + Send + 'static>(&self, f: &Future<T>) -> Outcome<T> {
        if crate::cell::in_critical_section() {
            panic!("partask: join called while holding a synchronized cell's critical section");
        }

        let outcome = if let Some(ready) = f.peek() {
            ready
        } else if is_worker_thread() {
            self.join_as_worker(f)
        } else {
            f.cell().await_value()
        };

        match outcome {
            Err(e) if e.is_cancellation() => {
                let collected = f.group().collected_failures();
                Err(e.flatten_with(collected))
            }
            other => other,
        }
    }

    /// Work-stealing wait used when the caller is itself a worker thread:
    /// rather than blocking (which would starve the pool), it repeatedly
    /// tries to dequeue work on the critical path toward `f`.
    fn join_as_worker<T: Clone + Send + 'static>(&self, f: &Future<T>) -> Outcome<T> {
        let targets = [f.task_id()];
        loop {
            if let Some(outcome) = f.peek() {
                return outcome;
            }
            let dequeued = self
                .0
                .queue
                .lock()
                .unwrap()
                .dequeue_towards(&targets, |g| self.0.groups.is_alive(g));
            if let Some((task_id, group_id, bodies)) = dequeued {
                let group = Group::from_parts(self.0.groups.clone(), group_id);
                let saved = CURRENT.with(|c| c.borrow_mut().take());
                CURRENT.with(|c| {
                    *c.borrow_mut() = Some(WorkerContext { task_id, group });
                });
                for body in bodies {
                    body();
                }
                CURRENT.with(|c| *c.borrow_mut() = saved);
                let was_empty = self.0.queue.lock().unwrap().finish(task_id);
                self.0.work_finished.notify_all();
                if was_empty {
                    self.0.work_available.notify_all();
                }
                self.maybe_reap_chain(group_id);
                continue;
            }
            if let Some(outcome) = f.peek() {
                return outcome;
            }
            let guard = self.0.queue.lock().unwrap();
            let _ = self
                .0
                .work_finished
                .wait_timeout(guard, Duration::from_millis(20))
                .unwrap();
        }
    }

    /// `join_results(futures) -> Vec<Outcome<T>>`, never raising.
    pub fn join_results<T: Clone + Send + 'static>(&self, futures: &[Future<T>]) -> Vec<Outcome<T>> {
        futures.iter().map(|f| self.join(f)).collect()
    }

    /// Convenience over `join_results`: raises the first failure found in
    /// list order, per §7 "the first-failure variant raises the first
    /// failure found in list order".
    pub fn join_all<T: Clone + Send + 'static>(&self, futures: &[Future<T>]) -> Outcome<Vec<T>> {
        let mut out = Vec::with_capacity(futures.len());
        for outcome in self.join_results(futures) {
            out.push(outcome?);
        }
        Ok(out)
    }

    pub fn new_group(&self, parent: Option<&Group>) -> Group {
        let parent_id = parent.map(|g| g.id());
        let id = self.0.groups.new_group(parent_id);
        Group::from_parts(self.0.groups.clone(), id)
    }

    pub fn root_group(&self) -> Group {
        Group::root(self.0.groups.clone())
    }

    /// `cancel(f)`: cancels `f`'s group (there is no per-future cancel
    /// independent of its group in this runtime, matching §6's
    /// `cancel(Future<_>) / cancel_group(group)` pairing).
    pub fn cancel<T>(&self, f: &Future<T>) {
        self.cancel_group(f.group());
    }

    /// `cancel_group(group)`. Idempotent and monotonic (§5). Running tasks
    /// in the group are left to finish and are recorded on the deferred
    /// list so the control thread retries.
    pub fn cancel_group(&self, group: &Group) {
        let affected = group.registry().cancel(group.id(), CancelReason::Interrupted);
        if affected.is_empty() {
            return;
        }
        let affected_set: HashSet<GroupId> = affected.into_iter().collect();
        let had_running = self.0.queue.lock().unwrap().cancel(&affected_set);
        if had_running {
            self.0.deferred_cancel.lock().unwrap().extend(affected_set.iter().copied());
        }
        for group in &affected_set {
            self.maybe_reap_chain(*group);
        }
        self.0.work_finished.notify_all();
        self.0.work_available.notify_all();
        tracing::info!(groups = affected_set.len(), "cancelled group subtree");
    }

    /// `shutdown()`. Requests the control thread to drain the pool once the
    /// queue is quiescent, then blocks until it has.
    pub fn shutdown(&self) {
        self.0.shutdown_requested.store(true, Ordering::SeqCst);
        self.0.work_available.notify_all();
        let handle = self.0.control.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.0.active_workers.load(Ordering::SeqCst)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    fn test_runtime() -> Runtime {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        Runtime::builder()
            .set_tick(Duration::from_millis(5))
            .set_host_threads(4)
            .build()
    }

    #[test]
    fn value_join_roundtrip() {
        let rt = test_runtime();
        let f = rt.value(42i32);
        assert_eq!(rt.join(&f).unwrap(), 42);
        rt.shutdown();
    }

    #[test]
    fn fork_join_runs_closure() {
        let rt = test_runtime();
        let f = rt.fork(|| Ok(2 + 2));
        assert_eq!(rt.join(&f).unwrap(), 4);
        rt.shutdown();
    }

    #[test]
    fn fork_failure_cancels_siblings() {
        let rt = test_runtime();
        let g = rt.new_group(None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let a: Future<i32> = rt.fork_in(g.clone(), move || {
            thread::sleep(Duration::from_millis(20));
            Err(PartaskError::from_user(crate::error::StringError::new("boom")))
        });
        let b: Future<i32> = rt.fork_in(g.clone(), move || {
            thread::sleep(Duration::from_millis(40));
            ran2.store(true, Ordering::SeqCst);
            Ok(1)
        });
        assert!(rt.join(&a).is_err());
        let result_b = rt.join(&b);
        assert!(result_b.is_err() || !ran.load(Ordering::SeqCst));
        rt.shutdown();
    }

    #[test]
    fn promise_fulfilled_from_other_thread() {
        let rt = test_runtime();
        let p: Future<i32> = rt.promise(None);
        let rt2 = rt.clone();
        let p2 = p.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            rt2.fulfill(&p2, Ok(42));
        });
        assert_eq!(rt.join(&p).unwrap(), 42);
        rt.shutdown();
    }

    #[test]
    #[should_panic]
    fn double_fulfill_panics() {
        let rt = test_runtime();
        let p: Future<i32> = rt.promise(None);
        rt.fulfill(&p, Ok(1));
        rt.fulfill(&p, Ok(2));
    }

    #[test]
    fn fast_path_map_shares_task_id() {
        let rt = test_runtime();
        let counter = Arc::new(AtomicI32::new(0));
        let c = counter.clone();
        let f: Future<i32> = rt.fork(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(10)
        });
        let g = rt.map(f.clone(), |x| Ok(x + 1));
        assert_eq!(rt.join(&g).unwrap(), 11);
    }

    #[test]
    fn cancel_group_interrupts_unstarted_tasks() {
        let rt = test_runtime();
        let g = rt.new_group(None);
        let futures: Vec<Future<i32>> = (0..20)
            .map(|i| {
                rt.fork_in(g.clone(), move || {
                    thread::sleep(Duration::from_millis(50));
                    Ok(i)
                })
            })
            .collect();
        rt.cancel_group(&g);
        for f in &futures {
            let _ = rt.join(f);
        }
        rt.shutdown();
    }

    #[test]
    fn cancelled_groups_are_reaped_once_drained() {
        let rt = test_runtime();
        let before = rt.0.groups.node_count();
        for _ in 0..10 {
            let g = rt.new_group(None);
            let f: Future<i32> = rt.fork_in(g.clone(), || Ok(1));
            let _ = rt.join(&f);
            rt.cancel_group(&g);
        }
        // Finishing a group's only task also drains it via the normal
        // `finish` path, then `cancel_group` reaps the now-empty, now-dead
        // node; the registry should not have grown by 10 live entries.
        assert!(rt.0.groups.node_count() <= before + 1);
        rt.shutdown();
    }

    #[test]
    fn join_results_never_raises() {
        let rt = test_runtime();
        let ok: Future<i32> = rt.fork(|| Ok(1));
        let err: Future<i32> = rt.fork(|| Err(PartaskError::from_user(crate::error::StringError::new("x"))));
        let results = rt.join_results(&[ok, err]);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        rt.shutdown();
    }
}
