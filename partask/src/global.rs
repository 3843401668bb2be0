//!
//! Process-wide runtime
//!
//! A convenience facade over a single, lazily-constructed [`crate::Runtime`],
//! modeled on the teacher's `naml_std_threads::scheduler` module (a
//! `static SCHEDULER: OnceLock<Scheduler>` behind a `get_scheduler()`
//! accessor). Most programs only ever need this one runtime; tests and
//! programs that want isolated runtimes should build their own
//! [`crate::Runtime`] directly instead.
//!

use std::sync::OnceLock;

use crate::future::{Future, Outcome, TaskId};
use crate::group::Group;
use crate::scheduler::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime, built with default settings on first use.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::new)
}

pub fn fork<T, F>(closure: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Outcome<T> + Send + 'static,
{
    runtime().fork(closure)
}

pub fn fork_in<T, F>(group: Group, closure: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Outcome<T> + Send + 'static,
{
    runtime().fork_in(group, closure)
}

pub fn fork_deps<T, F>(deps: &[TaskId], priority: i64, closure: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Outcome<T> + Send + 'static,
{
    runtime().fork_deps(deps, priority, closure)
}

pub fn value<T: Clone + Send + 'static>(v: T) -> Future<T> {
    runtime().value(v)
}

pub fn map<T, U, F>(x: Future<T>, f: F) -> Future<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnOnce(T) -> Outcome<U> + Send + 'static,
{
    runtime().map(x, f)
}

pub fn promise<T: Clone + Send + 'static>(group: Option<Group>) -> Future<T> {
    runtime().promise(group)
}

pub fn fulfill<T: Clone + Send + 'static>(f: &Future<T>, outcome: Outcome<T>) {
    runtime().fulfill(f, outcome)
}

pub fn join<T: Clone + Send + 'static>(f: &Future<T>) -> Outcome<T> {
    runtime().join(f)
}

pub fn join_results<T: Clone + Send + 'static>(futures: &[Future<T>]) -> Vec<Outcome<T>> {
    runtime().join_results(futures)
}

pub fn join_all<T: Clone + Send + 'static>(futures: &[Future<T>]) -> Outcome<Vec<T>> {
    runtime().join_all(futures)
}

pub fn new_group(parent: Option<&Group>) -> Group {
    runtime().new_group(parent)
}

pub fn root_group() -> Group {
    runtime().root_group()
}

pub fn cancel<T>(f: &Future<T>) {
    runtime().cancel(f)
}

pub fn cancel_group(group: &Group) {
    runtime().cancel_group(group)
}

/// Shuts down the process-wide runtime's worker pool and control thread.
/// After this call the runtime is still addressable (the `OnceLock` isn't
/// reset) but will not process further work; this mirrors `Runtime::shutdown`
/// being a one-way drain rather than a restartable pause.
pub fn shutdown() {
    runtime().shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-wide runtime is a singleton shared across the whole test
    // binary, so these tests avoid `shutdown()` (which would wedge every
    // other test in the binary that still expects it to run) and only
    // exercise the read side.
    #[test]
    fn fork_join_roundtrip_on_process_wide_runtime() {
        let f = fork(|| Ok(2 + 2));
        assert_eq!(join(&f).unwrap(), 4);
    }

    #[test]
    fn value_is_immediately_joinable() {
        let f = value(99i32);
        assert_eq!(join(&f).unwrap(), 99);
    }
}
