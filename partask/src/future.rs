//!
//! Future values
//!
//! A `Future<T>` carries a task id, the cancellation group it belongs to,
//! and a single-assignment result cell. It is `finished` iff that cell is
//! assigned.
//!

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::PartaskError;
use crate::group::Group;
use crate::once::AssignCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Reserved for already-resolved values created with `Runtime::value`.
    pub const DUMMY: TaskId = TaskId(0);

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

pub(crate) struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    pub(crate) fn new() -> Self {
        TaskIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn alloc(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// `Ok(value)` or a `PartaskError`.
pub type Outcome<T> = Result<T, PartaskError>;

/// A value produced by `fork`, `value`, `promise`, or `map`. Cheap to
/// clone: cloning shares the same underlying result cell.
#[derive(Clone)]
pub struct Future<T> {
    promised: bool,
    task_id: TaskId,
    group: Group,
    cell: Arc<AssignCell<Outcome<T>>>,
}

impl<T: Clone + Send + 'static> Future<T> {
    pub(crate) fn new(task_id: TaskId, group: Group, promised: bool) -> (Self, Arc<AssignCell<Outcome<T>>>) {
        let cell = Arc::new(AssignCell::new(format!("future:{}", task_id.as_u64())));
        (
            Future {
                promised,
                task_id,
                group,
                cell: cell.clone(),
            },
            cell,
        )
    }

    /// Builds a future sharing `task_id` but wrapping a fresh (or
    /// independently obtained) result cell. Used by `map`'s fast path to
    /// produce a `Future<U>` that still reports the source task's id.
    pub(crate) fn from_cell(task_id: TaskId, group: Group, cell: Arc<AssignCell<Outcome<T>>>) -> Self {
        Future {
            promised: false,
            task_id,
            group,
            cell,
        }
    }

    /// Builds an already-resolved future sharing `TaskId::DUMMY`, used by
    /// `Runtime::value`.
    pub(crate) fn resolved(group: Group, value: T) -> Self {
        let cell = Arc::new(AssignCell::new("value"));
        cell.assign(Ok(value)).expect("fresh cell assigns once");
        Future {
            promised: false,
            task_id: TaskId::DUMMY,
            group,
            cell,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn is_promised(&self) -> bool {
        self.promised
    }

    pub fn is_finished(&self) -> bool {
        self.cell.is_assigned()
    }

    /// Non-blocking peek at the outcome, if resolved.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.cell.peek()
    }

    pub(crate) fn cell(&self) -> &Arc<AssignCell<Outcome<T>>> {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupRegistry;

    #[test]
    fn resolved_future_is_finished_immediately() {
        let reg = GroupRegistry::new();
        let group = Group::root(reg);
        let f = Future::resolved(group, 42i32);
        assert!(f.is_finished());
        assert_eq!(f.peek(), Some(Ok(42)));
        assert_eq!(f.task_id(), TaskId::DUMMY);
    }
}
