//! Worker fan-out: split `[0, n)` into contiguous chunks and run one worker per
//! chunk, returning only once every worker has finished.
//!
//! Workers never share a slot, but nothing stops a closure from racing on state
//! it captured itself; that part is on the caller. Results are not collected:
//! workers write straight into memory the caller can see (usually the disjoint
//! slices produced by [`distribute`]).
//!
//! A panic in any worker is re-raised on the calling thread after the join.

use std::ops::Range;

use tracing::trace;

/// Split `[0, n)` into `workers` contiguous ranges of `n / workers` items.
/// The last range absorbs the remainder.
///
/// # Panics
///
/// Panics if `workers` is zero.
#[must_use]
pub fn partition(n: usize, workers: usize) -> Vec<Range<usize>> {
    assert!(workers > 0, "fan-out needs at least one worker");

    let chunk = n / workers;
    (0..workers)
        .map(|w| {
            let start = w * chunk;
            let end = if w + 1 == workers { n } else { start + chunk };
            start..end
        })
        .collect()
}

/// Run `f(worker, range)` for every non-empty chunk of `[0, n)`.
///
/// # Panics
///
/// Panics if `workers` is zero, or re-raises a worker panic.
pub fn run<F>(n: usize, workers: usize, f: F)
where
    F: Fn(usize, Range<usize>) + Sync,
{
    let ranges = partition(n, workers);
    trace!(n, workers, "fan-out over range");

    let f = &f;
    rayon::scope(|scope| {
        for (worker, range) in ranges.into_iter().enumerate() {
            if range.is_empty() {
                continue;
            }
            scope.spawn(move |_| f(worker, range));
        }
    });
}

/// Run `f(worker, part)` once per pre-split payload, one worker each.
pub fn run_parts<P, F>(parts: Vec<P>, f: F)
where
    P: Send,
    F: Fn(usize, P) + Sync,
{
    trace!(workers = parts.len(), "fan-out over parts");

    let f = &f;
    rayon::scope(|scope| {
        for (worker, part) in parts.into_iter().enumerate() {
            scope.spawn(move |_| f(worker, part));
        }
    });
}

/// A borrowed run of items that can be cut in two without copying.
pub trait Splittable: Sized {
    fn item_count(&self) -> usize;

    #[must_use]
    fn split(self, mid: usize) -> (Self, Self);
}

impl<T> Splittable for &[T] {
    fn item_count(&self) -> usize {
        self.len()
    }

    fn split(self, mid: usize) -> (Self, Self) {
        self.split_at(mid)
    }
}

impl<T> Splittable for &mut [T] {
    fn item_count(&self) -> usize {
        self.len()
    }

    fn split(self, mid: usize) -> (Self, Self) {
        self.split_at_mut(mid)
    }
}

/// Two equally long runs cut at the same point, e.g. values and their owners.
impl<A: Splittable, B: Splittable> Splittable for (A, B) {
    fn item_count(&self) -> usize {
        debug_assert_eq!(self.0.item_count(), self.1.item_count());
        self.0.item_count()
    }

    fn split(self, mid: usize) -> (Self, Self) {
        let (a_lo, a_hi) = self.0.split(mid);
        let (b_lo, b_hi) = self.1.split(mid);
        ((a_lo, b_lo), (a_hi, b_hi))
    }
}

/// Hand out ascending `(base index, run)` segments covering `[0, n)` to the
/// chunks of [`partition`]`(n, workers)`, cutting segments at chunk borders.
///
/// Worker `w` receives exactly the items whose index falls in chunk `w`.
///
/// # Panics
///
/// Panics if `workers` is zero or the segments cover more than `n` items.
#[must_use]
pub fn distribute<S, I>(n: usize, workers: usize, segments: I) -> Vec<Vec<(usize, S)>>
where
    S: Splittable,
    I: IntoIterator<Item = (usize, S)>,
{
    let ranges = partition(n, workers);
    let mut parts: Vec<Vec<(usize, S)>> = (0..workers).map(|_| Vec::new()).collect();
    let mut worker = 0;

    for (mut start, mut run) in segments {
        while run.item_count() > 0 {
            while ranges[worker].end <= start {
                worker += 1;
                assert!(worker < workers, "segment index {start} beyond fan-out range {n}");
            }

            let take = run.item_count().min(ranges[worker].end - start);
            let (head, tail) = run.split(take);
            parts[worker].push((start, head));
            start += take;
            run = tail;
        }
    }

    parts
}
