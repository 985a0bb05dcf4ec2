//! Paged dense array.
//!
//! Values live in fixed-capacity pages of [`PAGE_SIZE`] slots. Growing the
//! array appends a page instead of reallocating and copying everything stored
//! so far, and every page is a contiguous slice that can be handed to a worker
//! on its own.
//!
//! Layout invariant: every page before the one holding the tail is full, so
//! index `i` lives at `pages[i >> PAGE_SHIFT][i & PAGE_MASK]`. At most one empty
//! page is kept past the tail to avoid churn when the length oscillates across
//! a page border.

use std::fmt;

use crate::fanout;

/// log2 of the page capacity.
pub const PAGE_SHIFT: u32 = 10;
/// Slots per page, shared by [`PagedVec`] and [`PagedMap`](crate::PagedMap).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the slot within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Growable, gap-free value store split into fixed-capacity pages.
pub struct PagedVec<T> {
    pages: Vec<Vec<T>>,
    len: usize,
}

impl<T> Default for PagedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PagedVec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated pages, including a spare empty one.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Append a value and return a reference to it at its new tail index.
    pub fn push(&mut self, value: T) -> &mut T {
        let page = self.len >> PAGE_SHIFT;

        if page == self.pages.len() {
            if self.pages.len() == self.pages.capacity() {
                // Directory doubles; only page headers move, never values.
                self.pages.reserve_exact(self.pages.capacity().max(1));
            }
            self.pages.push(Vec::with_capacity(PAGE_SIZE));
        }

        let slots = &mut self.pages[page];
        debug_assert!(slots.len() < PAGE_SIZE);
        slots.push(value);
        self.len += 1;

        let last = slots.len() - 1;
        &mut slots[last]
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> &T {
        self.check(index);
        &self.pages[index >> PAGE_SHIFT][index & PAGE_MASK]
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        self.check(index);
        &mut self.pages[index >> PAGE_SHIFT][index & PAGE_MASK]
    }

    #[must_use]
    pub fn try_get(&self, index: usize) -> Option<&T> {
        (index < self.len).then(|| &self.pages[index >> PAGE_SHIFT][index & PAGE_MASK])
    }

    /// Overwrite the value at `index`, returning the previous one.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: T) -> T {
        std::mem::replace(self.get_mut(index), value)
    }

    /// Exchange the values at two indices in place.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    pub fn swap(&mut self, a: usize, b: usize) {
        self.check(a);
        self.check(b);

        let (page_a, slot_a) = (a >> PAGE_SHIFT, a & PAGE_MASK);
        let (page_b, slot_b) = (b >> PAGE_SHIFT, b & PAGE_MASK);

        if page_a == page_b {
            self.pages[page_a].swap(slot_a, slot_b);
            return;
        }

        let (lo, hi, slot_lo, slot_hi) = if page_a < page_b {
            (page_a, page_b, slot_a, slot_b)
        } else {
            (page_b, page_a, slot_b, slot_a)
        };
        let (head, tail) = self.pages.split_at_mut(hi);
        std::mem::swap(&mut head[lo][slot_lo], &mut tail[0][slot_hi]);
    }

    /// Shrink the logical length by one and return the tail value.
    ///
    /// Callers removing an element from the middle must have swapped it into
    /// the tail first.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        self.len -= 1;
        let value = self.pages[self.len >> PAGE_SHIFT].pop();
        debug_assert!(value.is_some());

        let needed = self.len.div_ceil(PAGE_SIZE);
        if self.pages.len() > needed + 1 {
            self.pages.truncate(needed + 1);
        }

        value
    }

    /// Remove the value at `index` in O(1) by moving the tail into its slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn swap_remove(&mut self, index: usize) -> T {
        self.check(index);
        let last = self.len - 1;
        if index != last {
            self.swap(index, last);
        }
        self.pop().expect("non-empty after bounds check")
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.len = 0;
    }

    /// Visit `(index, &value)` from the last index down to zero.
    ///
    /// Walking backwards means that removing the visited element (which only
    /// ever pulls from the tail) never moves an element that has not been
    /// visited yet.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.pages.iter().enumerate().rev().flat_map(|(page, slots)| {
            slots
                .iter()
                .enumerate()
                .rev()
                .map(move |(slot, value)| ((page << PAGE_SHIFT) | slot, value))
        })
    }

    /// Mutable counterpart of [`iter`](Self::iter), same reverse order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.pages.iter_mut().enumerate().rev().flat_map(|(page, slots)| {
            slots
                .iter_mut()
                .enumerate()
                .rev()
                .map(move |(slot, value)| ((page << PAGE_SHIFT) | slot, value))
        })
    }

    /// Non-empty pages in ascending order as `(base index, slice)`.
    pub fn segments(&self) -> impl Iterator<Item = (usize, &[T])> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(page, slots)| (page << PAGE_SHIFT, slots.as_slice()))
    }

    /// Mutable counterpart of [`segments`](Self::segments).
    pub fn segments_mut(&mut self) -> impl Iterator<Item = (usize, &mut [T])> + '_ {
        self.pages
            .iter_mut()
            .enumerate()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(page, slots)| (page << PAGE_SHIFT, slots.as_mut_slice()))
    }

    /// Visit every index exactly once from `workers` concurrent workers.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each<F>(&self, workers: usize, f: F)
    where
        T: Sync,
        F: Fn(usize, &T) + Sync,
    {
        let parts = fanout::distribute(self.len, workers, self.segments());
        fanout::run_parts(parts, |_, segments| {
            for (start, slice) in segments {
                for (offset, value) in slice.iter().enumerate() {
                    f(start + offset, value);
                }
            }
        });
    }

    /// Mutable counterpart of [`par_for_each`](Self::par_for_each).
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each_mut<F>(&mut self, workers: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync,
    {
        let len = self.len;
        let parts = fanout::distribute(len, workers, self.segments_mut());
        fanout::run_parts(parts, |_, segments| {
            for (start, slice) in segments {
                for (offset, value) in slice.iter_mut().enumerate() {
                    f(start + offset, value);
                }
            }
        });
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.len,
            "index {index} out of range for paged vec of length {}",
            self.len
        );
    }
}

impl<T: Clone> PagedVec<T> {
    /// Copy of the value at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get_value(&self, index: usize) -> T {
        self.get(index).clone()
    }

    /// Visit copies of every value, same reverse order as [`iter`](Self::iter).
    pub fn for_each_value<F: FnMut(usize, T)>(&self, mut f: F) {
        for (index, value) in self.iter() {
            f(index, value.clone());
        }
    }

    /// Append every value, in dense order, to `buf`.
    pub fn copy_into(&self, buf: &mut Vec<T>) {
        buf.reserve(self.len);
        for (_, slots) in self.segments() {
            buf.extend_from_slice(slots);
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        self.copy_into(&mut out);
        out
    }
}

impl<T> FromIterator<T> for PagedVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut out = Self::new();
        out.extend(iter);
        out
    }
}

impl<T: fmt::Debug> fmt::Debug for PagedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedVec")
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .finish()
    }
}
