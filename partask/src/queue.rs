//!
//! Task Queue
//!
//! A priority + dependency queue of runnable/pending/passive jobs, grouped
//! by cancellation group. This module is a plain data structure: all
//! locking is done by the caller (`Scheduler` holds it behind one mutex, per
//! §5 "the task queue is protected by a single mutex; every mutator
//! acquires it").
//!

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::future::TaskId;
use crate::group::GroupId;

/// A queued task's executable body. Each element of `bodies` runs in
/// sequence when the task is dequeued; `extend` appends to this list, which
/// is how the fast-path `map` avoids a fresh task (§4.4).
pub(crate) type Body = Box<dyn FnOnce() + Send + 'static>;

/// Invoked instead of a task's bodies when the task is resolved by
/// cancellation rather than execution (§4.3 "Failure semantics").
pub(crate) type CancelCb = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Ready,
    Pending,
    Running,
    Passive,
}

pub(crate) struct TaskEntry {
    pub(crate) group: GroupId,
    priority: i64,
    deps_remaining: HashSet<TaskId>,
    dependents: HashSet<TaskId>,
    bodies: Vec<Body>,
    cancel_cb: Option<CancelCb>,
    state: TaskState,
}

#[derive(Default)]
pub(crate) struct TaskQueueInner {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Ready tasks ordered by `(Reverse(priority), task_id)` so the
    /// `BTreeSet`'s natural ascending order gives "highest priority first,
    /// ties broken by lowest task_id" directly.
    ready: BTreeSet<(std::cmp::Reverse<i64>, TaskId)>,
    by_group: HashMap<GroupId, HashSet<TaskId>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStatus {
    pub ready: usize,
    pub pending: usize,
    pub running: usize,
    pub passive: usize,
}

impl TaskQueueInner {
    pub(crate) fn new() -> Self {
        TaskQueueInner::default()
    }

    fn mark_ready(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.state = TaskState::Ready;
            self.ready.insert((std::cmp::Reverse(entry.priority), id));
        }
    }

    /// Enqueue a runnable task. Returns the assigned id and whether it
    /// (transitioned to) the ready state immediately, i.e. had no
    /// unresolved dependencies.
    pub(crate) fn enqueue(
        &mut self,
        id: TaskId,
        group: GroupId,
        deps: &[TaskId],
        priority: i64,
        body: Body,
        cancel_cb: CancelCb,
    ) -> bool {
        let deps_remaining: HashSet<TaskId> = deps
            .iter()
            .copied()
            .filter(|d| self.tasks.contains_key(d))
            .collect();
        let is_ready = deps_remaining.is_empty();
        let state = if is_ready {
            TaskState::Ready
        } else {
            TaskState::Pending
        };

        for dep in &deps_remaining {
            if let Some(dep_entry) = self.tasks.get_mut(dep) {
                dep_entry.dependents.insert(id);
            }
        }

        self.tasks.insert(
            id,
            TaskEntry {
                group,
                priority,
                deps_remaining,
                dependents: HashSet::new(),
                bodies: vec![body],
                cancel_cb: Some(cancel_cb),
                state,
            },
        );
        self.by_group.entry(group).or_default().insert(id);
        if is_ready {
            self.ready.insert((std::cmp::Reverse(priority), id));
        }
        is_ready
    }

    /// Enqueue a passive task: no dependencies, no body, resolved externally
    /// via the scheduler's `fulfill`.
    pub(crate) fn enqueue_passive(&mut self, id: TaskId, group: GroupId, cancel_cb: CancelCb) {
        self.tasks.insert(
            id,
            TaskEntry {
                group,
                priority: 0,
                deps_remaining: HashSet::new(),
                dependents: HashSet::new(),
                bodies: Vec::new(),
                cancel_cb: Some(cancel_cb),
                state: TaskState::Passive,
            },
        );
        self.by_group.entry(group).or_default().insert(id);
    }

    /// Whether `id` exists and is not currently `Running` — the precondition
    /// for `extend` to succeed. Callers that need "check then extend" to be
    /// atomic should hold the queue's mutex across both calls.
    pub(crate) fn can_extend(&self, id: TaskId) -> bool {
        matches!(self.tasks.get(&id), Some(entry) if entry.state != TaskState::Running)
    }

    /// Append a continuation body to an already-queued, not-started task.
    /// Returns `false` if the task doesn't exist, is already running, or is
    /// finished (removed).
    pub(crate) fn extend(&mut self, id: TaskId, body: Body) -> bool {
        match self.tasks.get_mut(&id) {
            Some(entry) if entry.state != TaskState::Running => {
                entry.bodies.push(body);
                true
            }
            _ => false,
        }
    }

    /// Pop the highest-priority ready task whose group is still alive
    /// according to `is_alive`. Tasks whose group has been cancelled are
    /// dropped silently (their cancel callback is invoked) rather than
    /// returned, and the search continues.
    pub(crate) fn dequeue(
        &mut self,
        is_alive: impl Fn(GroupId) -> bool,
    ) -> Option<(TaskId, GroupId, Vec<Body>)> {
        loop {
            let key = *self.ready.iter().next()?;
            self.ready.remove(&key);
            let (_, id) = key;
            let group = self.tasks.get(&id).map(|e| e.group)?;
            if !is_alive(group) {
                self.drop_cancelled_ready(id);
                continue;
            }
            let entry = self.tasks.get_mut(&id).unwrap();
            entry.state = TaskState::Running;
            let bodies = std::mem::take(&mut entry.bodies);
            return Some((id, group, bodies));
        }
    }

    fn drop_cancelled_ready(&mut self, id: TaskId) {
        if let Some(mut entry) = self.tasks.remove(&id) {
            if let Some(group_set) = self.by_group.get_mut(&entry.group) {
                group_set.remove(&id);
            }
            if let Some(cb) = entry.cancel_cb.take() {
                cb();
            }
        }
    }

    /// Find a ready task that is a transitive dependency of any id in
    /// `targets`, preferring the one closest to a target (smallest BFS
    /// distance), tie-broken by priority then task id. Used by `join` while
    /// work-stealing.
    pub(crate) fn dequeue_towards(
        &mut self,
        targets: &[TaskId],
        is_alive: impl Fn(GroupId) -> bool,
    ) -> Option<(TaskId, GroupId, Vec<Body>)> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut frontier: Vec<TaskId> = targets.to_vec();
        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            let mut candidates: Vec<(std::cmp::Reverse<i64>, TaskId)> = Vec::new();
            for id in &frontier {
                if !seen.insert(*id) {
                    continue;
                }
                let Some(entry) = self.tasks.get(id) else {
                    continue;
                };
                if entry.state == TaskState::Ready {
                    candidates.push((std::cmp::Reverse(entry.priority), *id));
                }
                for dep in &entry.deps_remaining {
                    next_frontier.push(*dep);
                }
            }
            if let Some(&(_, id)) = candidates.iter().min() {
                self.ready.remove(&(std::cmp::Reverse(self.tasks[&id].priority), id));
                let group = self.tasks[&id].group;
                if !is_alive(group) {
                    self.drop_cancelled_ready(id);
                    // The chosen candidate's group died; retry with the
                    // remaining frontier rather than restarting from scratch.
                    return self.dequeue_towards(targets, is_alive);
                }
                let entry = self.tasks.get_mut(&id).unwrap();
                entry.state = TaskState::Running;
                let bodies = std::mem::take(&mut entry.bodies);
                return Some((id, group, bodies));
            }
            frontier = next_frontier;
        }
        None
    }

    /// Register dependency edges for a `join`-initiated wait: `task` now
    /// additionally depends on everything in `deps` (only meaningful for
    /// bookkeeping/diagnostics; `dequeue_towards` is given its targets
    /// explicitly and does not require these edges to have been recorded).
    pub(crate) fn depend(&mut self, task: TaskId, deps: &[TaskId]) {
        if let Some(entry) = self.tasks.get_mut(&task) {
            for dep in deps {
                if self.tasks.contains_key(dep) {
                    entry.deps_remaining.insert(*dep);
                }
            }
        }
        for dep in deps {
            if let Some(dep_entry) = self.tasks.get_mut(dep) {
                dep_entry.dependents.insert(task);
            }
        }
    }

    /// Remove a finished task and its outgoing edges, promoting any
    /// dependent whose last dependency just resolved to `Ready`. Returns
    /// whether the ready queue was empty immediately before this call —
    /// the scheduler's cue that promoting dependents here may be the only
    /// new work available, and idle workers should be woken.
    pub(crate) fn finish(&mut self, id: TaskId) -> bool {
        let was_empty = self.ready.is_empty();
        let Some(entry) = self.tasks.remove(&id) else {
            return was_empty;
        };
        if let Some(group_set) = self.by_group.get_mut(&entry.group) {
            group_set.remove(&id);
        }
        for dependent in entry.dependents {
            if let Some(dep_entry) = self.tasks.get_mut(&dependent) {
                dep_entry.deps_remaining.remove(&id);
                if dep_entry.deps_remaining.is_empty() && dep_entry.state == TaskState::Pending {
                    self.mark_ready(dependent);
                }
            }
        }
        was_empty
    }

    /// Resolve every non-finished task belonging to one of `groups` as
    /// cancelled, invoking each one's cancel callback instead of its body and
    /// promoting any dependent whose last outstanding dependency was one of
    /// these removed tasks, exactly as `finish` does for a normal
    /// completion — otherwise a task outside the cancelled groups that
    /// depends on one inside them would wait on an edge that never clears.
    /// Returns whether any `Running` task was among them (the caller uses
    /// this to decide whether the group needs to go on the deferred
    /// cancellation list).
    pub(crate) fn cancel(&mut self, groups: &HashSet<GroupId>) -> bool {
        let mut affected_running = false;
        let mut to_remove = Vec::new();
        for group in groups {
            if let Some(ids) = self.by_group.get(group) {
                to_remove.extend(ids.iter().copied());
            }
        }
        for id in to_remove {
            let Some(entry) = self.tasks.get(&id) else {
                continue;
            };
            if entry.state == TaskState::Running {
                affected_running = true;
                continue; // let it finish; it will observe cancellation itself
            }
            if entry.state == TaskState::Ready {
                self.ready.remove(&(std::cmp::Reverse(entry.priority), id));
            }
            let mut entry = self.tasks.remove(&id).unwrap();
            if let Some(group_set) = self.by_group.get_mut(&entry.group) {
                group_set.remove(&id);
            }
            for dependent in entry.dependents.drain() {
                if let Some(dep_entry) = self.tasks.get_mut(&dependent) {
                    dep_entry.deps_remaining.remove(&id);
                    if dep_entry.deps_remaining.is_empty() && dep_entry.state == TaskState::Pending {
                        self.mark_ready(dependent);
                    }
                }
            }
            if let Some(cb) = entry.cancel_cb.take() {
                cb();
            }
        }
        affected_running
    }

    /// Whether `group` currently has no tasks of any state recorded against
    /// it. Used by the scheduler to decide when a finished or cancelled
    /// group's bookkeeping node is safe to reap.
    pub(crate) fn group_is_empty(&self, group: GroupId) -> bool {
        self.by_group.get(&group).map_or(true, |ids| ids.is_empty())
    }

    pub(crate) fn status(&self) -> QueueStatus {
        let mut status = QueueStatus::default();
        for entry in self.tasks.values() {
            match entry.state {
                TaskState::Ready => status.ready += 1,
                TaskState::Pending => status.pending += 1,
                TaskState::Running => status.running += 1,
                TaskState::Passive => status.passive += 1,
            }
        }
        status
    }

    pub(crate) fn all_passive(&self) -> bool {
        self.tasks.values().all(|e| e.state == TaskState::Passive)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALWAYS_ALIVE: fn(GroupId) -> bool = |_| true;

    #[test]
    fn fifo_among_equal_priority() {
        let alloc = crate::future::TaskIdAllocator::new();
        let mut q = TaskQueueInner::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        q.enqueue(a, GroupId::ROOT, &[], 0, Box::new(|| {}), Box::new(|| {}));
        q.enqueue(b, GroupId::ROOT, &[], 0, Box::new(|| {}), Box::new(|| {}));
        let (first, _, _) = q.dequeue(ALWAYS_ALIVE).unwrap();
        assert_eq!(first, a);
        let (second, _, _) = q.dequeue(ALWAYS_ALIVE).unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn higher_priority_first() {
        let alloc = crate::future::TaskIdAllocator::new();
        let mut q = TaskQueueInner::new();
        let low = alloc.alloc();
        let high = alloc.alloc();
        q.enqueue(low, GroupId::ROOT, &[], 0, Box::new(|| {}), Box::new(|| {}));
        q.enqueue(high, GroupId::ROOT, &[], 10, Box::new(|| {}), Box::new(|| {}));
        let (first, _, _) = q.dequeue(ALWAYS_ALIVE).unwrap();
        assert_eq!(first, high);
    }

    #[test]
    fn dependency_holds_task_pending_until_dep_finishes() {
        let alloc = crate::future::TaskIdAllocator::new();
        let mut q = TaskQueueInner::new();
        let dep = alloc.alloc();
        let dependent = alloc.alloc();
        let was_first_ready = q.enqueue(dep, GroupId::ROOT, &[], 0, Box::new(|| {}), Box::new(|| {}));
        assert!(was_first_ready);
        let was_ready = q.enqueue(
            dependent,
            GroupId::ROOT,
            &[dep],
            0,
            Box::new(|| {}),
            Box::new(|| {}),
        );
        assert!(!was_ready);
        assert!(q.dequeue(ALWAYS_ALIVE).is_some()); // dep dequeued
        assert!(q.dequeue(ALWAYS_ALIVE).is_none()); // dependent still pending
        q.finish(dep);
        let (ready_id, _, _) = q.dequeue(ALWAYS_ALIVE).unwrap();
        assert_eq!(ready_id, dependent);
    }

    #[test]
    fn cancel_drops_non_running_tasks_in_group() {
        let alloc = crate::future::TaskIdAllocator::new();
        let mut q = TaskQueueInner::new();
        let g = GroupId::ROOT;
        let a = alloc.alloc();
        let cancelled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cancelled.clone();
        q.enqueue(
            a,
            g,
            &[],
            0,
            Box::new(|| {}),
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        let mut groups = HashSet::new();
        groups.insert(g);
        let had_running = q.cancel(&groups);
        assert!(!had_running);
        assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
        assert!(q.dequeue(ALWAYS_ALIVE).is_none());
    }

    #[test]
    fn cancel_promotes_dependent_outside_the_cancelled_group() {
        let alloc = crate::future::TaskIdAllocator::new();
        let mut q = TaskQueueInner::new();
        let cancelled_group = GroupId::ROOT;
        let other_group = crate::group::GroupRegistry::new().new_group(None);
        let dep = alloc.alloc();
        let dependent = alloc.alloc();
        q.enqueue(dep, cancelled_group, &[], 0, Box::new(|| {}), Box::new(|| {}));
        let was_ready = q.enqueue(
            dependent,
            other_group,
            &[dep],
            0,
            Box::new(|| {}),
            Box::new(|| {}),
        );
        assert!(!was_ready);

        let mut groups = HashSet::new();
        groups.insert(cancelled_group);
        q.cancel(&groups);

        let (ready_id, _, _) = q.dequeue(ALWAYS_ALIVE).unwrap();
        assert_eq!(ready_id, dependent);
    }
}
