//! Fixed-capacity free-list pools (spec.md §4.2).
//!
//! Every socket owns one [`Pool<Packet>`] and one [`Pool<BufferSlot>`],
//! sized at creation time and never resized. Acquisition and release are
//! both O(1): the free list is a singly-linked list threaded through the
//! backing `Vec` using indices rather than pointers, so the pool stays
//! relocatable (see spec.md §9, "Refcounted packet graph").

/// A pool slot is either occupied (holding a `T`) or free, in which case
/// it instead holds the index of the next free slot (or `None` if it was
/// the tail of the free list).
enum Slot<T> {
    Occupied(T),
    Free(Option<u32>),
}

/// A fixed-capacity slab with an intrusive free list.
///
/// Indices are stable for the lifetime of the value they point to: an
/// acquired index is never reused until it has been released.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    in_use: usize,
}

impl<T> Pool<T> {
    /// Build a pool of exactly `capacity` slots, all free, by repeatedly
    /// calling `make`. `make` receives the slot's index in case the
    /// element needs to know its own home (packets and buffer views
    /// don't; this is here for symmetry with pools that do).
    pub fn new(capacity: usize, mut make: impl FnMut(u32) -> T) -> Pool<T> {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            // Every slot starts "occupied" by a freshly made value, then
            // is immediately released below so the free list links up in
            // index order (0 acquired first).
            slots.push(Slot::Occupied(make(i as u32)));
        }
        let mut pool = Pool {
            slots,
            free_head: None,
            in_use: 0,
        };
        for i in (0..capacity as u32).rev() {
            pool.release_index(i);
        }
        pool
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn free_len(&self) -> usize {
        self.capacity() - self.in_use
    }

    /// Pop the head of the free list and return its index, or `None` if
    /// the pool is exhausted. The spec treats exhaustion as a programmer
    /// error (spec.md §7, "Pool exhaustion"); this API surfaces it as an
    /// `Option` so the caller can choose to assert or to degrade to a
    /// retriable error, per the spec's Open Question (b).
    pub fn acquire(&mut self) -> Option<u32> {
        let idx = self.free_head?;
        self.free_head = match &self.slots[idx as usize] {
            Slot::Free(next) => *next,
            Slot::Occupied(_) => unreachable!("free list pointed at an occupied slot"),
        };
        self.in_use += 1;
        Some(idx)
    }

    /// Release `idx` back to the free list. `idx` must currently be in
    /// use; releasing an already-free index corrupts the free list.
    pub fn release_index(&mut self, idx: u32) {
        self.slots[idx as usize] = Slot::Free(self.free_head);
        self.free_head = Some(idx);
        self.in_use = self.in_use.saturating_sub(1);
    }

    pub fn get(&self, idx: u32) -> &T {
        match &self.slots[idx as usize] {
            Slot::Occupied(v) => v,
            Slot::Free(_) => panic!("access to a free pool slot"),
        }
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        match &mut self.slots[idx as usize] {
            Slot::Occupied(v) => v,
            Slot::Free(_) => panic!("access to a free pool slot"),
        }
    }

    /// Overwrite the value at `idx` in place. Used when a slot is
    /// acquired and the caller wants to stamp fresh contents into it
    /// rather than mutate field-by-field.
    pub fn put(&mut self, idx: u32, value: T) {
        self.slots[idx as usize] = Slot::Occupied(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_is_o1_and_conserves_capacity() {
        let mut pool: Pool<u32> = Pool::new(4, |i| i);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_len(), 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.free_len() + pool.in_use(), pool.capacity());

        pool.release_index(a);
        assert_eq!(pool.free_len() + pool.in_use(), pool.capacity());

        let c = pool.acquire().unwrap();
        // The just-released slot is handed back out first (LIFO free list).
        assert_eq!(c, a);

        pool.release_index(b);
        pool.release_index(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool: Pool<()> = Pool::new(2, |_| ());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }
}
