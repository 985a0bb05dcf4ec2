//! Paged sparse map: `u32` key to value without hashing.
//!
//! A key splits into `(page, slot) = (key >> PAGE_SHIFT, key & PAGE_MASK)`.
//! Pages are allocated on first write, so a map keyed by entity ids only pays
//! for the id ranges that are actually in use.

use std::fmt;

use crate::paged_vec::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

type Page<V> = Box<[Option<V>]>;

/// Integer-keyed associative store with O(1) access.
pub struct PagedMap<V> {
    pages: Vec<Option<Page<V>>>,
    len: usize,
}

impl<V> Default for PagedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PagedMap<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
        }
    }

    /// Number of occupied slots across all pages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.is_some()).count()
    }

    #[must_use]
    pub fn get(&self, key: u32) -> Option<&V> {
        let (page, slot) = split(key);
        self.pages.get(page)?.as_ref()?[slot].as_ref()
    }

    #[must_use]
    pub fn get_mut(&mut self, key: u32) -> Option<&mut V> {
        let (page, slot) = split(key);
        self.pages.get_mut(page)?.as_mut()?[slot].as_mut()
    }

    #[must_use]
    pub fn contains(&self, key: u32) -> bool {
        self.get(key).is_some()
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub fn insert(&mut self, key: u32, value: V) -> Option<V> {
        let (page, slot) = split(key);

        if page >= self.pages.len() {
            let wanted = (self.pages.len() * 2).max(page + 1);
            self.pages.resize_with(wanted, || None);
        }

        let slots = self.pages[page].get_or_insert_with(|| {
            std::iter::repeat_with(|| None).take(PAGE_SIZE).collect()
        });

        let old = slots[slot].replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Remove `key`, returning its value. Unallocated pages report `None`.
    pub fn remove(&mut self, key: u32) -> Option<V> {
        let (page, slot) = split(key);
        let old = self.pages.get_mut(page)?.as_mut()?[slot].take();
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// Drop every page.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.len = 0;
    }

    /// Occupied entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(page, slots)| Some((page, slots.as_ref()?)))
            .flat_map(|(page, slots)| {
                slots.iter().enumerate().filter_map(move |(slot, value)| {
                    let key = ((page << PAGE_SHIFT) | slot) as u32;
                    value.as_ref().map(|value| (key, value))
                })
            })
    }
}

const fn split(key: u32) -> (usize, usize) {
    let key = key as usize;
    (key >> PAGE_SHIFT, key & PAGE_MASK)
}

impl<V: fmt::Debug> fmt::Debug for PagedMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
