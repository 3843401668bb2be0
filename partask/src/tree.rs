//!
//! Parallel Tree
//!
//! Turns a node-expansion function into a lazy-in-depth, parallel-in-breadth
//! traversal: siblings revealed by one expansion are dispatched to the
//! scheduler through the Compactor, but an unpulled subtree's recursive
//! expansion stays dormant until the consumer's demand reaches it.
//!

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::compactor::Compactor;
use crate::error::PartaskError;
use crate::future::{Future, Outcome};
use crate::group::{CancelReason, Group};
use crate::scheduler::Runtime;

/// One child revealed by expanding a node: either an immediate value, or
/// more state to recurse into.
#[derive(Clone)]
pub enum NodeOutcome<L, N> {
    Leaf(L),
    Node(N),
}

struct ChannelState<L> {
    buffer: VecDeque<Outcome<L>>,
    closed: bool,
}

/// A bounded mutex+condvar channel, modeled on the teacher's
/// `namlc::runtime::channel::NamlChannel`: `send` blocks while the buffer is
/// at capacity, `recv` blocks while it is empty and open. Its capacity is
/// what gives a dispatched subtree's recursive expansion real backpressure
/// — a producer outrunning the consumer stalls on `send` rather than
/// materializing an unbounded prefix of leaves.
pub struct LeafChannel<L> {
    capacity: usize,
    state: Mutex<ChannelState<L>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<L> LeafChannel<L> {
    pub fn new(capacity: usize) -> Self {
        LeafChannel {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn send(&self, item: Outcome<L>) {
        let mut state = self.state.lock().unwrap();
        while state.buffer.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).unwrap();
        }
        if state.closed {
            return;
        }
        state.buffer.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn recv(&self) -> Option<Outcome<L>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.buffer.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

enum Segment<L, N> {
    Leaves(Vec<L>),
    Nodes(Vec<N>),
}

/// Splits a node's children into maximal contiguous runs of the same
/// variant. Only a contiguous `Nodes` run is ever fed to the Compactor as
/// one unit, so a compacted group's members are always adjacent in the
/// original order — necessary for ordered-mode output to stay correct
/// without the Compactor needing any notion of leaf position.
fn partition_segments<L, N>(children: Vec<NodeOutcome<L, N>>) -> Vec<Segment<L, N>> {
    let mut segments = Vec::new();
    for child in children {
        match child {
            NodeOutcome::Leaf(l) => match segments.last_mut() {
                Some(Segment::Leaves(v)) => v.push(l),
                _ => segments.push(Segment::Leaves(vec![l])),
            },
            NodeOutcome::Node(n) => match segments.last_mut() {
                Some(Segment::Nodes(v)) => v.push(n),
                _ => segments.push(Segment::Nodes(vec![n])),
            },
        }
    }
    segments
}

type ExpandFn<L, N> = dyn Fn(N) -> Outcome<Vec<NodeOutcome<L, N>>> + Send + Sync + 'static;

/// Composes `expand` with itself `k` times before handing work to the
/// scheduler, collapsing a deep tight recursion into fewer, larger
/// dispatch points (§9 "node coarsening"). Implemented as an explicit
/// frontier loop rather than recursive calls, per the same design note.
pub fn coarsen_expand<L, N>(expand: Arc<ExpandFn<L, N>>, k: usize) -> Arc<ExpandFn<L, N>>
where
    L: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    Arc::new(move |node: N| {
        let mut frontier = vec![NodeOutcome::Node(node)];
        for _ in 0..k.max(1) {
            let mut next = Vec::with_capacity(frontier.len());
            let mut any_node = false;
            for item in frontier {
                match item {
                    NodeOutcome::Leaf(l) => next.push(NodeOutcome::Leaf(l)),
                    NodeOutcome::Node(n) => {
                        any_node = true;
                        next.extend(expand(n)?);
                    }
                }
            }
            frontier = next;
            if !any_node {
                break;
            }
        }
        Ok(frontier)
    })
}

/// Configuration for one traversal. A plain, cheaply-`Clone`able value type
/// (the compactor it wraps is itself clone-and-share, per §3).
#[derive(Clone)]
pub struct ParallelTree<N> {
    order_matters: bool,
    no_groups: bool,
    group_count: usize,
    compactor: Compactor,
    node_limit: usize,
    estimator: Option<Arc<dyn Fn(&N) -> usize + Send + Sync>>,
}

impl<N: Clone + Send + 'static> ParallelTree<N> {
    pub fn new() -> Self {
        ParallelTree {
            order_matters: true,
            no_groups: false,
            group_count: 1,
            compactor: Compactor::new_static(1),
            node_limit: 8,
            estimator: None,
        }
    }

    pub fn set_order_matters(mut self, v: bool) -> Self {
        self.order_matters = v;
        self
    }

    /// Collapses cancellation-group fan-out to the single ambient group
    /// (see the resolution of `group_count`/`set_no_groups` in DESIGN.md).
    pub fn set_no_groups(mut self) -> Self {
        self.no_groups = true;
        self
    }

    pub fn set_group_count(mut self, n: usize) -> Self {
        self.group_count = n.max(1);
        self
    }

    pub fn set_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = compactor;
        self
    }

    /// Also doubles as the max number of compacted groups dispatched ahead
    /// of the consumer at any one recursion level (see `dispatch_segment`).
    pub fn set_node_limit(mut self, n: usize) -> Self {
        self.node_limit = n.max(1);
        self
    }

    pub fn set_estimator(mut self, f: impl Fn(&N) -> usize + Send + Sync + 'static) -> Self {
        self.estimator = Some(Arc::new(f));
        self
    }

    fn child_groups(&self, parent: &Group) -> Vec<Group> {
        if self.no_groups {
            vec![parent.clone()]
        } else {
            (0..self.group_count).map(|_| parent.new_child()).collect()
        }
    }
}

impl<N: Clone + Send + 'static> Default for ParallelTree<N> {
    fn default() -> Self {
        ParallelTree::new()
    }
}

fn stream_node_into<L, N>(
    runtime: &Runtime,
    tree: &ParallelTree<N>,
    expand: &Arc<ExpandFn<L, N>>,
    node: N,
    group: &Group,
    out: &Arc<LeafChannel<L>>,
) where
    L: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    if !group.is_alive() {
        return;
    }
    let children = match expand(node) {
        Ok(c) => c,
        Err(e) => {
            group.cancel(CancelReason::Failure(e.clone()));
            out.send(Err(e));
            return;
        }
    };
    for segment in partition_segments(children) {
        if !group.is_alive() {
            return;
        }
        match segment {
            Segment::Leaves(ls) => {
                for l in ls {
                    out.send(Ok(l));
                }
            }
            Segment::Nodes(ns) => dispatch_segment(runtime, tree, expand, ns, group, out),
        }
    }
}

/// Compacts a contiguous run of `Node` children and forks each compacted
/// group, bounding how many groups are in flight at once to `node_limit`
/// (the same constant that bounds each `LeafChannel`'s capacity). This is
/// the "parallel in breadth, lazy in depth" boundary: within the window the
/// scheduler runs groups concurrently; beyond it, dispatch waits for the
/// oldest in-flight group to drain before starting the next.
fn dispatch_segment<L, N>(
    runtime: &Runtime,
    tree: &ParallelTree<N>,
    expand: &Arc<ExpandFn<L, N>>,
    nodes: Vec<N>,
    group: &Group,
    out: &Arc<LeafChannel<L>>,
) where
    L: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    let child_groups = tree.child_groups(group);
    let window = tree.node_limit;
    let mut group_index = 0usize;

    let mut iter = tree
        .compactor
        .compact_with_list(nodes, |mut acc: Vec<N>, n| {
            acc.push(n);
            acc
        }, Vec::new);

    if tree.order_matters {
        let mut in_flight: VecDeque<(Future<()>, Arc<LeafChannel<L>>)> = VecDeque::new();
        loop {
            while in_flight.len() < window {
                let Some((thunk, _size)) = iter.next() else { break };
                let child_group = child_groups[group_index % child_groups.len()].clone();
                group_index += 1;
                let child_channel = Arc::new(LeafChannel::new(tree.node_limit));
                let fut = spawn_group(runtime, tree, expand, thunk, child_group, child_channel.clone());
                in_flight.push_back((fut, child_channel));
            }
            let Some((fut, channel)) = in_flight.pop_front() else { break };
            while let Some(item) = channel.recv() {
                out.send(item);
            }
            let _ = runtime.join(&fut);
        }
    } else {
        let mut in_flight: VecDeque<Future<()>> = VecDeque::new();
        loop {
            while in_flight.len() < window {
                let Some((thunk, _size)) = iter.next() else { break };
                let child_group = child_groups[group_index % child_groups.len()].clone();
                group_index += 1;
                let fut = spawn_group(runtime, tree, expand, thunk, child_group, out.clone());
                in_flight.push_back(fut);
            }
            let Some(fut) = in_flight.pop_front() else { break };
            let _ = runtime.join(&fut);
        }
    }
}

fn spawn_group<L, N>(
    runtime: &Runtime,
    tree: &ParallelTree<N>,
    expand: &Arc<ExpandFn<L, N>>,
    thunk: Box<dyn FnOnce() -> Vec<N> + Send + 'static>,
    group: Group,
    channel: Arc<LeafChannel<L>>,
) -> Future<()>
where
    L: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    let runtime2 = runtime.clone();
    let tree2 = tree.clone();
    let expand2 = expand.clone();
    let group2 = group.clone();
    runtime.fork_in(group, move || {
        for node in thunk() {
            stream_node_into(&runtime2, &tree2, &expand2, node, &group2, &channel);
        }
        channel.close();
        Ok(())
    })
}

/// The lazy leaf sequence `compute_tree` returns. Pulling an item may run
/// (or unblock) scheduler work; error outcomes from a failed node
/// expansion are yielded in place of the leaf that node would have
/// contributed.
pub struct TreeLeaves<L> {
    channel: Arc<LeafChannel<L>>,
    driver: Option<Future<()>>,
    runtime: Runtime,
}

impl<L: Clone + Send + 'static> Iterator for TreeLeaves<L> {
    type Item = Outcome<L>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.channel.recv() {
            return Some(item);
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = self.runtime.join(&driver) {
                return Some(Err(e));
            }
        }
        None
    }
}

/// `compute_tree(root, expand) -> lazy_seq<leaf>`. `expand` must be
/// `Clone`-free in the type signature but is wrapped once in an `Arc` here
/// so every recursive dispatch point shares the same boxed closure.
pub fn compute_tree<L, N>(
    runtime: &Runtime,
    tree: &ParallelTree<N>,
    root: N,
    expand: impl Fn(N) -> Outcome<Vec<NodeOutcome<L, N>>> + Send + Sync + 'static,
) -> TreeLeaves<L>
where
    L: Clone + Send + 'static,
    N: Clone + Send + 'static,
{
    let expand: Arc<ExpandFn<L, N>> = Arc::new(expand);
    let root_group = runtime.new_group(Some(&runtime.root_group()));
    let channel = Arc::new(LeafChannel::new(tree.node_limit));
    let driver = spawn_group(
        runtime,
        tree,
        &expand,
        Box::new(move || vec![root]),
        root_group,
        channel.clone(),
    );
    TreeLeaves {
        channel,
        driver: Some(driver),
        runtime: runtime.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_expand(max_depth: u32, branching: u32) -> impl Fn(u32) -> Outcome<Vec<NodeOutcome<u32, u32>>> + Send + Sync + 'static {
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

    #[test]
    fn empty_root_yields_empty_sequence() {
        let rt = Runtime::builder().set_host_threads(2).build();
        let tree = ParallelTree::new();
        let leaves: Vec<_> = compute_tree(&rt, &tree, 0u32, mk_expand(0, 2)).collect();
        assert!(leaves.is_empty());
        rt.shutdown();
    }

    #[test]
    fn small_tree_yields_expected_leaf_count() {
        let rt = Runtime::builder().set_host_threads(4).build();
        let tree = ParallelTree::new().set_order_matters(true).set_node_limit(4);
        let leaves: Vec<_> = compute_tree(&rt, &tree, 3u32, mk_expand(3, 2)).collect();
        // each level contributes 2 leaves per live node; 1 + 2 + 4 nodes
        // across depths 0..3 => (1+2+4)*2 = 14 leaves.
        assert_eq!(leaves.len(), 14);
        assert!(leaves.iter().all(|l| l.is_ok()));
        rt.shutdown();
    }

    #[test]
    fn unordered_mode_yields_same_multiset() {
        let rt = Runtime::builder().set_host_threads(4).build();
        let ordered = ParallelTree::new().set_order_matters(true);
        let unordered = ParallelTree::new().set_order_matters(false);
        let mut a: Vec<u32> = compute_tree(&rt, &ordered, 3u32, mk_expand(3, 2))
            .map(|r| r.unwrap())
            .collect();
        let mut b: Vec<u32> = compute_tree(&rt, &unordered, 3u32, mk_expand(3, 2))
            .map(|r| r.unwrap())
            .collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        rt.shutdown();
    }

    #[test]
    fn failing_expansion_surfaces_as_error_leaf() {
        let rt = Runtime::builder().set_host_threads(2).build();
        let tree = ParallelTree::new();
        let expand = |n: u32| -> Outcome<Vec<NodeOutcome<u32, u32>>> {
            if n == 0 {
                Err(PartaskError::from_user(crate::error::StringError::new("boom")))
            } else {
                Ok(vec![NodeOutcome::Node(0)])
            }
        };
        let leaves: Vec<_> = compute_tree(&rt, &tree, 1u32, expand).collect();
        assert!(leaves.iter().any(|l| l.is_err()));
        rt.shutdown();
    }
}
