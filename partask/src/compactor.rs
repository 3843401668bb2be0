//!
//! Compactor
//!
//! Converts a producer of small thunks into a lazy sequence of grouped
//! thunks sized to amortize per-task scheduling overhead. A static
//! compactor always groups `size` thunks; a dynamic compactor times each
//! group it produces and adjusts the next group's size toward a target
//! duration.
//!

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleConfig {
    pub up: u32,
    pub down: u32,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        ScaleConfig { up: 2, down: 2 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrimeConfig {
    pub limit: usize,
    pub freeze: bool,
}

impl Default for PrimeConfig {
    fn default() -> Self {
        PrimeConfig { limit: 15, freeze: false }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Static { size: usize },
    Dynamic { target: Duration, scale: ScaleConfig, prime: Option<PrimeConfig> },
}

/// The shared dynamic-mode estimate: the (time, size) of the most recently
/// *accepted* representative group, plus the quarter-band around its
/// average used by the drift check. `total_time`/`count` name the fields
/// of the 5-tuple from §3; here `count` is that representative group's
/// size, not a running sum (see the `set_estimated_number` open question
/// in DESIGN.md).
#[derive(Debug, Clone, Copy)]
struct EstimateTuple {
    total_time: Duration,
    count: u64,
    lo_avg: Duration,
    hi_avg: Duration,
    stamp: u64,
}

impl EstimateTuple {
    fn from_observation(total_time: Duration, count: u64, stamp: u64) -> Self {
        let avg = if count == 0 {
            Duration::ZERO
        } else {
            total_time / count as u32
        };
        EstimateTuple {
            total_time,
            count,
            lo_avg: avg.mul_f64(0.75),
            hi_avg: avg.mul_f64(1.25),
            stamp,
        }
    }
}

/// A compactor value. Setters return an updated copy (§3 "immutable by
/// replacement"); the running dynamic-mode estimate is the one piece of
/// state that really is shared mutable data, held behind a `try_lock`
/// (§9 "install it as one atomic record swap" — the safe-Rust analogue is
/// a mutex whose lock attempts never block the caller).
#[derive(Clone)]
pub struct Compactor {
    mode: Mode,
    fold_direction: FoldDirection,
    estimate: Arc<Mutex<EstimateTuple>>,
    stamp_alloc: Arc<AtomicU64>,
}

impl Compactor {
    pub fn new_static(size: usize) -> Self {
        Compactor {
            mode: Mode::Static { size: size.max(1) },
            fold_direction: FoldDirection::Left,
            estimate: Arc::new(Mutex::new(EstimateTuple::from_observation(Duration::ZERO, 1, 0))),
            stamp_alloc: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn new_dynamic(target: Duration) -> Self {
        Compactor {
            mode: Mode::Dynamic {
                target,
                scale: ScaleConfig::default(),
                prime: Some(PrimeConfig::default()),
            },
            fold_direction: FoldDirection::Left,
            estimate: Arc::new(Mutex::new(EstimateTuple::from_observation(target, 1, 0))),
            stamp_alloc: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_size(mut self, size: usize) -> Self {
        self.mode = Mode::Static { size: size.max(1) };
        self
    }

    pub fn set_time(mut self, target: Duration) -> Self {
        let (scale, prime) = match self.mode {
            Mode::Dynamic { scale, prime, .. } => (scale, prime),
            Mode::Static { .. } => (ScaleConfig::default(), Some(PrimeConfig::default())),
        };
        self.mode = Mode::Dynamic { target, scale, prime };
        self
    }

    /// Bootstraps the dynamic estimate from a believed thunk count: per the
    /// resolved open question, this records `target / estimate` into the
    /// `total_time` slot while `count` stays `estimate`, so the very first
    /// suggestion comes out to exactly `estimate`.
    pub fn set_estimated_number(self, estimate: usize) -> Self {
        if let Mode::Dynamic { target, .. } = self.mode {
            let estimate = estimate.max(1) as u64;
            let avg = target / estimate as u32;
            *self.estimate.lock().unwrap() = EstimateTuple::from_observation(avg, estimate, 0);
        }
        self
    }

    pub fn set_fold_direction(mut self, direction: FoldDirection) -> Self {
        self.fold_direction = direction;
        self
    }

    pub fn prime(mut self, limit: Option<usize>, freeze: bool) -> Self {
        if let Mode::Dynamic { ref mut prime, .. } = self.mode {
            *prime = Some(PrimeConfig {
                limit: limit.unwrap_or_default().max(1),
                freeze,
            });
        }
        self
    }

    pub fn do_not_prime(mut self) -> Self {
        if let Mode::Dynamic { ref mut prime, .. } = self.mode {
            *prime = None;
        }
        self
    }

    pub fn set_scaling(mut self, up: u32, down: u32) -> Self {
        if let Mode::Dynamic { ref mut scale, .. } = self.mode {
            *scale = ScaleConfig { up: up.max(1), down: down.max(1) };
        }
        self
    }

    fn next_stamp(&self) -> u64 {
        self.stamp_alloc.fetch_add(1, Ordering::Relaxed)
    }

    fn suggested_size(&self) -> usize {
        match self.mode {
            Mode::Static { size } => size,
            Mode::Dynamic { target, ref scale, .. } => {
                let est = *self.estimate.lock().unwrap();
                suggested_size_from(target, est, scale)
            }
        }
    }

    /// Attempt to record `(time, n)` as the new representative observation,
    /// subject to the stamp-staleness and improvement/drift rules of §4.5.
    /// A failed `try_lock` is itself the "swallowed concurrent update
    /// exception" from §9 — the tuple already installed is left untouched,
    /// and the next group corrects course.
    fn update_estimate(&self, target: Duration, stamp: u64, time: Duration, n: u64, prime_relaxed: bool) {
        let Ok(mut guard) = self.estimate.try_lock() else {
            return;
        };
        if stamp < guard.stamp {
            return; // stale
        }
        let t = target;
        let improves = |t: Duration, time: Duration, recorded: Duration| -> bool {
            let gap_new = abs_diff(t, time);
            let gap_old = abs_diff(t, recorded);
            gap_new < gap_old && abs_diff(time, recorded) > recorded / 10
        };
        let avg = if n == 0 { Duration::ZERO } else { time / n as u32 };
        let in_drift_band = avg < guard.lo_avg || avg > guard.hi_avg;
        let prime_accepts = prime_relaxed
            && (time < Duration::from_millis(5) || (n != guard.count && time == guard.total_time));

        if improves(t, time, guard.total_time) || in_drift_band || prime_accepts {
            *guard = EstimateTuple::from_observation(time, n, stamp);
        }
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// §4.5 "Suggested size", with `(T, n)` read as the representative group's
/// (time, size): scale `n` toward `target` by the configured factor, or by
/// direct ratio if a single scale step would overshoot; floor at 1.
fn suggested_size_from(target: Duration, est: EstimateTuple, scale: &ScaleConfig) -> usize {
    let t = target;
    let big_t = est.total_time;
    let n = est.count.max(1);
    let ratio_size = |t: Duration, n: u64, big_t: Duration| -> usize {
        if big_t.is_zero() {
            return n as usize;
        }
        let ratio = t.as_secs_f64() * n as f64 / big_t.as_secs_f64();
        ratio.ceil().max(1.0) as usize
    };

    let suggested = if big_t > t {
        if big_t / scale.down >= t {
            (n / scale.down as u64).max(1) as usize
        } else {
            ratio_size(t, n, big_t)
        }
    } else if big_t * scale.up <= t {
        (n * scale.up as u64) as usize
    } else {
        ratio_size(t, n, big_t)
    };
    suggested.max(1)
}

type Step<R> = Box<dyn FnOnce(R) -> R + Send + 'static>;
type Identity<R> = Arc<dyn Fn() -> R + Send + Sync + 'static>;

fn apply_fold<R>(identity: R, steps: Vec<Step<R>>, direction: FoldDirection) -> R {
    match direction {
        FoldDirection::Left => steps.into_iter().fold(identity, |acc, step| step(acc)),
        FoldDirection::Right => steps.into_iter().rev().fold(identity, |acc, step| step(acc)),
    }
}

/// The lazy sequence `compact` produces: each pull decides this group's
/// size, drains that many steps from the producer, and yields a thunk that
/// (when invoked) folds them and, in dynamic mode, times itself and tries
/// to update the shared estimate.
pub struct CompactIter<S, R, P> {
    compactor: Compactor,
    producer: P,
    seed: Option<S>,
    identity: Identity<R>,
    primed_count: usize,
    last_two_sizes: (Option<usize>, Option<usize>),
    stabilized_size: Option<usize>,
    exhausted: bool,
}

impl<S, R, P> CompactIter<S, R, P>
where
    S: Send + 'static,
    R: Send + 'static,
    P: FnMut(S) -> Option<(Step<R>, S)> + Send + 'static,
{
    fn priming_active(&self) -> bool {
        match self.compactor.mode {
            Mode::Dynamic { prime: Some(cfg), .. } => {
                self.stabilized_size.is_none() && self.primed_count < cfg.limit
            }
            _ => false,
        }
    }

    fn current_size(&self) -> usize {
        self.stabilized_size.unwrap_or_else(|| self.compactor.suggested_size())
    }

    fn note_size_for_stabilization(&mut self, size: usize) {
        if let Mode::Dynamic { prime: Some(cfg), .. } = self.compactor.mode {
            self.last_two_sizes = (self.last_two_sizes.1, Some(size));
            if self.last_two_sizes == (Some(size), Some(size)) {
                self.primed_count = cfg.limit; // stop priming regardless of limit
                if cfg.freeze {
                    self.stabilized_size = Some(size);
                }
            }
        }
    }
}

impl<S, R, P> Iterator for CompactIter<S, R, P>
where
    S: Send + 'static,
    R: Send + 'static,
    P: FnMut(S) -> Option<(Step<R>, S)> + Send + 'static,
{
    type Item = (Box<dyn FnOnce() -> R + Send + 'static>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let size = self.current_size();
        let mut seed = self.seed.take()?;
        let mut steps: Vec<Step<R>> = Vec::with_capacity(size.min(1024));
        while steps.len() < size {
            match (self.producer)(seed) {
                Some((step, next_seed)) => {
                    steps.push(step);
                    seed = next_seed;
                }
                None => break,
            }
        }
        self.seed = Some(seed);

        if steps.is_empty() {
            self.exhausted = true;
            return None;
        }

        let n = steps.len();
        self.note_size_for_stabilization(n);

        let compactor = self.compactor.clone();
        let identity = self.identity.clone();
        let direction = compactor.fold_direction;
        let stamp = compactor.next_stamp();
        let target = match compactor.mode {
            Mode::Dynamic { target, .. } => Some(target),
            Mode::Static { .. } => None,
        };
        let is_static = target.is_none();
        let priming = self.priming_active();

        let run = move || {
            let started = if is_static { None } else { Some(Instant::now()) };
            let result = apply_fold(identity(), steps, direction);
            if let (Some(started), Some(target)) = (started, target) {
                let elapsed = started.elapsed();
                compactor.update_estimate(target, stamp, elapsed, n as u64, priming);
            }
            result
        };

        if priming {
            self.primed_count += 1;
            let result = run();
            Some((Box::new(move || result), n))
        } else {
            Some((Box::new(run), n))
        }
    }
}

impl Compactor {
    /// `compact(producer, producer_seed, fn_identity) -> lazy_seq<(thunk, size)>`.
    pub fn compact<S, R, P, I>(&self, producer: P, seed: S, identity: I) -> CompactIter<S, R, P>
    where
        S: Send + 'static,
        R: Send + 'static,
        P: FnMut(S) -> Option<(Step<R>, S)> + Send + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        CompactIter {
            compactor: self.clone(),
            producer,
            seed: Some(seed),
            identity: Arc::new(identity),
            primed_count: 0,
            last_two_sizes: (None, None),
            stabilized_size: None,
            exhausted: false,
        }
    }

    /// Compacts a `Vec<T>`, folding each element into an accumulator `R`.
    pub fn compact_with_list<T, R, F, I>(
        &self,
        items: Vec<T>,
        step: F,
        identity: I,
    ) -> CompactIter<std::collections::VecDeque<T>, R, impl FnMut(std::collections::VecDeque<T>) -> Option<(Step<R>, std::collections::VecDeque<T>)> + Send + 'static>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(R, T) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        let producer = move |mut seed: std::collections::VecDeque<T>| {
            let item = seed.pop_front()?;
            let step = step.clone();
            let thunk: Step<R> = Box::new(move |acc| step(acc, item));
            Some((thunk, seed))
        };
        self.compact(producer, items.into_iter().collect(), identity)
    }

    /// Compacts an arbitrary `Send` iterator the same way as
    /// `compact_with_list`, without collecting it up front.
    pub fn compact_with_seq<T, R, F, I>(
        &self,
        items: impl Iterator<Item = T> + Send + 'static,
        step: F,
        identity: I,
    ) -> CompactIter<Box<dyn Iterator<Item = T> + Send>, R, impl FnMut(Box<dyn Iterator<Item = T> + Send>) -> Option<(Step<R>, Box<dyn Iterator<Item = T> + Send>)> + Send + 'static>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(R, T) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        let producer = move |mut seed: Box<dyn Iterator<Item = T> + Send>| {
            let item = seed.next()?;
            let step = step.clone();
            let thunk: Step<R> = Box::new(move |acc| step(acc, item));
            Some((thunk, seed))
        };
        let boxed: Box<dyn Iterator<Item = T> + Send> = Box::new(items);
        self.compact(producer, boxed, identity)
    }

    /// `compact_map_list`: maps each element through `map` before folding
    /// it into the accumulator — the "conv → value" flavor from §4.5.
    pub fn compact_map_list<T, U, R, M, F, I>(
        &self,
        items: Vec<T>,
        map: M,
        combine: F,
        identity: I,
    ) -> CompactIter<std::collections::VecDeque<T>, R, impl FnMut(std::collections::VecDeque<T>) -> Option<(Step<R>, std::collections::VecDeque<T>)> + Send + 'static>
    where
        T: Send + 'static,
        U: Send + 'static,
        R: Send + 'static,
        M: Fn(T) -> U + Send + Sync + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        let combine = Arc::new(combine);
        let producer = move |mut seed: std::collections::VecDeque<T>| {
            let item = seed.pop_front()?;
            let map = map.clone();
            let combine = combine.clone();
            let thunk: Step<R> = Box::new(move |acc| combine(acc, map(item)));
            Some((thunk, seed))
        };
        self.compact(producer, items.into_iter().collect(), identity)
    }

    /// `compact_map_seq`: the iterator-sourced counterpart of
    /// `compact_map_list`.
    pub fn compact_map_seq<T, U, R, M, F, I>(
        &self,
        items: impl Iterator<Item = T> + Send + 'static,
        map: M,
        combine: F,
        identity: I,
    ) -> CompactIter<Box<dyn Iterator<Item = T> + Send>, R, impl FnMut(Box<dyn Iterator<Item = T> + Send>) -> Option<(Step<R>, Box<dyn Iterator<Item = T> + Send>)> + Send + 'static>
    where
        T: Send + 'static,
        U: Send + 'static,
        R: Send + 'static,
        M: Fn(T) -> U + Send + Sync + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        let combine = Arc::new(combine);
        let producer = move |mut seed: Box<dyn Iterator<Item = T> + Send>| {
            let item = seed.next()?;
            let map = map.clone();
            let combine = combine.clone();
            let thunk: Step<R> = Box::new(move |acc| combine(acc, map(item)));
            Some((thunk, seed))
        };
        let boxed: Box<dyn Iterator<Item = T> + Send> = Box::new(items);
        self.compact(producer, boxed, identity)
    }

    /// `compact_maps_list`: the flat-map flavor — `map` produces a `Vec<U>`
    /// per element, and every `U` it yields is folded into the accumulator.
    pub fn compact_maps_list<T, U, R, M, F, I>(
        &self,
        items: Vec<T>,
        map: M,
        combine: F,
        identity: I,
    ) -> CompactIter<std::collections::VecDeque<T>, R, impl FnMut(std::collections::VecDeque<T>) -> Option<(Step<R>, std::collections::VecDeque<T>)> + Send + 'static>
    where
        T: Send + 'static,
        U: Send + 'static,
        R: Send + 'static,
        M: Fn(T) -> Vec<U> + Send + Sync + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        let combine = Arc::new(combine);
        let producer = move |mut seed: std::collections::VecDeque<T>| {
            let item = seed.pop_front()?;
            let map = map.clone();
            let combine = combine.clone();
            let thunk: Step<R> = Box::new(move |acc| {
                map(item).into_iter().fold(acc, |a, u| combine(a, u))
            });
            Some((thunk, seed))
        };
        self.compact(producer, items.into_iter().collect(), identity)
    }

    /// `compact_maps_seq`: the iterator-sourced counterpart of
    /// `compact_maps_list`.
    pub fn compact_maps_seq<T, U, R, M, F, I>(
        &self,
        items: impl Iterator<Item = T> + Send + 'static,
        map: M,
        combine: F,
        identity: I,
    ) -> CompactIter<Box<dyn Iterator<Item = T> + Send>, R, impl FnMut(Box<dyn Iterator<Item = T> + Send>) -> Option<(Step<R>, Box<dyn Iterator<Item = T> + Send>)> + Send + 'static>
    where
        T: Send + 'static,
        U: Send + 'static,
        R: Send + 'static,
        M: Fn(T) -> Vec<U> + Send + Sync + 'static,
        F: Fn(R, U) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        let combine = Arc::new(combine);
        let producer = move |mut seed: Box<dyn Iterator<Item = T> + Send>| {
            let item = seed.next()?;
            let map = map.clone();
            let combine = combine.clone();
            let thunk: Step<R> = Box::new(move |acc| {
                map(item).into_iter().fold(acc, |a, u| combine(a, u))
            });
            Some((thunk, seed))
        };
        let boxed: Box<dyn Iterator<Item = T> + Send> = Box::new(items);
        self.compact(producer, boxed, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_compactor_groups_fixed_size() {
        let compactor = Compactor::new_static(5);
        let items: Vec<i32> = std::iter::repeat(1).take(100).collect();
        let groups: Vec<_> = compactor
            .compact_with_list(items, |acc, x| acc + x, || 0i32)
            .collect();
        assert_eq!(groups.len(), 20);
        let mut total = 0;
        for (thunk, size) in groups {
            assert_eq!(size, 5);
            total += thunk();
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn static_compactor_tail_group_is_short() {
        let compactor = Compactor::new_static(7);
        let items: Vec<i32> = std::iter::repeat(1).take(20).collect();
        let groups: Vec<_> = compactor
            .compact_with_list(items, |acc, x| acc + x, || 0i32)
            .collect();
        // ceil(20/7) = 3 groups, tail = 20 mod 7 = 6
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.last().unwrap().1, 6);
    }

    #[test]
    fn dynamic_compactor_every_suggestion_is_at_least_one() {
        let compactor = Compactor::new_dynamic(Duration::from_millis(10))
            .set_estimated_number(10)
            .prime(Some(3), false);
        let items: Vec<i32> = std::iter::repeat(1).take(100).collect();
        let groups: Vec<_> = compactor
            .compact_with_list(items, |acc, x| acc + x, || 0i32)
            .collect();
        assert!(!groups.is_empty());
        let mut total = 0;
        for (thunk, size) in groups {
            assert!(size >= 1);
            total += thunk();
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn empty_producer_yields_empty_sequence() {
        let compactor = Compactor::new_static(5);
        let groups: Vec<_> = compactor
            .compact_with_list(Vec::<i32>::new(), |acc, x| acc + x, || 0i32)
            .collect();
        assert!(groups.is_empty());
    }

    #[test]
    fn fold_right_reverses_application_order() {
        let compactor = Compactor::new_static(3).set_fold_direction(FoldDirection::Right);
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let groups: Vec<_> = compactor
            .compact_with_list(items, |acc: String, x| acc + &x, || String::new())
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!((groups.into_iter().next().unwrap().0)(), "cba");
    }
}
