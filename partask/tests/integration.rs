//!
//! End-to-end scenarios exercising the scheduler, compactor, and parallel
//! tree together through the public API, corresponding to the runtime's
//! documented test scenarios S1-S6.
//!

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use partask::{
    compute_tree, CancelReason, Compactor, Future, NodeOutcome, ParallelTree, PartaskError,
    Runtime, StringError,
};

fn test_runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Runtime::builder()
        .set_tick(Duration::from_millis(5))
        .set_host_threads(4)
        .build()
}

/// S1: a static compactor with a fixed group size of 5 over 100 unit
/// thunks produces groups that sum back to 100.
#[test]
fn s1_static_compactor_preserves_total() {
    let compactor = Compactor::new_static(5);
    let items: Vec<i64> = std::iter::repeat(1).take(100).collect();
    let groups: Vec<_> = compactor
        .compact_with_list(items, |acc, x| acc + x, || 0i64)
        .collect();
    assert_eq!(groups.len(), 20);
    let total: i64 = groups.into_iter().map(|(thunk, _size)| thunk()).sum();
    assert_eq!(total, 100);
}

/// S2: a dynamic compactor primed toward a 10ms target over 100 thunks
/// still visits every thunk exactly once, with every suggested size at
/// least 1, regardless of how its estimate adapts mid-run.
#[test]
fn s2_dynamic_compactor_with_priming_preserves_total() {
    let compactor = Compactor::new_dynamic(Duration::from_millis(10))
        .set_estimated_number(8)
        .prime(Some(5), true);
    let items: Vec<i64> = (0..100).collect();
    let groups: Vec<_> = compactor
        .compact_with_list(items, |acc, x| acc + x, || 0i64)
        .collect();
    assert!(!groups.is_empty());
    let mut total = 0i64;
    for (thunk, size) in groups {
        assert!(size >= 1);
        total += thunk();
    }
    assert_eq!(total, (0..100).sum::<i64>());
}

fn dfs_expected(node: u32, max_depth: u32, branching: u32) -> Vec<u32> {
    if node == 0 {
        return Vec::new();
    }
    let depth = max_depth - node;
    let mut out = vec![depth * 100, depth * 100 + 1];
    for _ in 0..branching {
        out.extend(dfs_expected(node - 1, max_depth, branching));
    }
    out
}

fn tree_expand(max_depth: u32, branching: u32) -> impl Fn(u32) -> Result<Vec<NodeOutcome<u32, u32>>, PartaskError> + Send + Sync + 'static {
    move |n: u32| {
        if n == 0 {
            return Ok(Vec::new());
        }
        let depth = max_depth - n;
        let mut out = vec![NodeOutcome::Leaf(depth * 100), NodeOutcome::Leaf(depth * 100 + 1)];
        for _ in 0..branching {
            out.push(NodeOutcome::Node(n - 1));
        }
        Ok(out)
    }
}

/// S3: a parallel tree traversal in ordered mode over a constant-shape
/// tree (branching 3, depth 4) yields leaves in the same order a plain
/// sequential DFS would.
#[test]
fn s3_ordered_parallel_tree_matches_sequential_dfs() {
    let rt = test_runtime();
    let max_depth = 4;
    let branching = 3;
    let tree = ParallelTree::new().set_order_matters(true).set_node_limit(4);
    let leaves: Vec<u32> = compute_tree(&rt, &tree, max_depth, tree_expand(max_depth, branching))
        .map(|r| r.expect("no node in this tree fails"))
        .collect();
    assert_eq!(leaves, dfs_expected(max_depth, max_depth, branching));
    rt.shutdown();
}

/// S3 (unordered variant): the same tree in unordered mode yields the same
/// multiset of leaves, just not necessarily in DFS order.
#[test]
fn s3_unordered_parallel_tree_yields_same_multiset() {
    let rt = test_runtime();
    let max_depth = 4;
    let branching = 3;
    let tree = ParallelTree::new().set_order_matters(false).set_node_limit(4);
    let mut leaves: Vec<u32> = compute_tree(&rt, &tree, max_depth, tree_expand(max_depth, branching))
        .map(|r| r.expect("no node in this tree fails"))
        .collect();
    let mut expected = dfs_expected(max_depth, max_depth, branching);
    leaves.sort_unstable();
    expected.sort_unstable();
    assert_eq!(leaves, expected);
    rt.shutdown();
}

/// S4: cancelling a group interrupts its unstarted members; every
/// `join` on the group still returns (either the last chance result or
/// an interrupted outcome), and none of the unreachable work executes.
#[test]
fn s4_group_cancellation_interrupts_siblings() {
    let rt = test_runtime();
    let group = rt.new_group(None);
    let ran = Arc::new(AtomicUsize::new(0));
    let futures: Vec<Future<i32>> = (0..20)
        .map(|i| {
            let ran = ran.clone();
            rt.fork_in(group.clone(), move || {
                thread::sleep(Duration::from_millis(30));
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();
    rt.cancel_group(&group);
    for f in &futures {
        let _ = rt.join(f);
    }
    // Cancellation is best-effort against already-running tasks, but bounds
    // how many of the 20 ever get to run at all.
    assert!(ran.load(Ordering::SeqCst) < 20);
    rt.shutdown();
}

/// S5: a promise fulfilled from another thread unblocks a `join` on this
/// one, and a double-fulfillment is rejected as misuse.
#[test]
fn s5_promise_fulfilled_across_threads() {
    let rt = test_runtime();
    let p: Future<String> = rt.promise(None);
    let rt2 = rt.clone();
    let p2 = p.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(15));
        rt2.fulfill(&p2, Ok("done".to_string()));
    });
    assert_eq!(rt.join(&p).unwrap(), "done");
    worker.join().unwrap();
    rt.shutdown();
}

/// S6: `map` applied to a future whose source task has not yet been
/// dequeued by any worker takes the fast path and shares the source's
/// task id, rather than forking an independent dependent task.
#[test]
fn s6_fast_path_map_shares_task_id_before_dequeue() {
    let rt = test_runtime();
    let counter = Arc::new(AtomicBool::new(false));
    let c = counter.clone();
    let source: Future<i32> = rt.fork(move || {
        c.store(true, Ordering::SeqCst);
        Ok(21)
    });
    let source_id = source.task_id();
    let mapped = rt.map(source, |x| Ok(x * 2));
    assert_eq!(mapped.task_id(), source_id);
    assert_eq!(rt.join(&mapped).unwrap(), 42);
    rt.shutdown();
}

/// A node's expansion failure cancels its enclosing group and surfaces as
/// an error leaf at the position the failing node would have contributed,
/// without derailing the rest of the traversal's bookkeeping.
#[test]
fn failing_node_expansion_surfaces_as_error_leaf_and_cancels_subtree() {
    let rt = test_runtime();
    let tree = ParallelTree::new();
    let expand = |n: u32| -> Result<Vec<NodeOutcome<u32, u32>>, PartaskError> {
        if n == 2 {
            Err(PartaskError::from_user(StringError::new("expansion failed")))
        } else {
            Ok(vec![NodeOutcome::Leaf(n), NodeOutcome::Node(n + 1)])
        }
    };
    let leaves: Vec<_> = compute_tree(&rt, &tree, 0u32, expand).collect();
    assert!(leaves.iter().any(|l| l.is_err()));
    assert!(leaves.iter().filter(|l| l.is_ok()).count() >= 2);
    rt.shutdown();
}

#[test]
fn cancel_reason_failure_is_reachable_from_public_api() {
    // CancelReason is exported so callers building their own group trees
    // (outside fork/map) can cancel with a specific recorded cause.
    let rt = test_runtime();
    let group = rt.new_group(None);
    let reason = CancelReason::Failure(PartaskError::from_user(StringError::new("manual")));
    group.cancel(reason);
    assert!(!group.is_alive());
    rt.shutdown();
}
