//! Circular double-ended buffer with selectable growth policy.
//!
//! The buffer keeps its bookkeeping as plain `u32` fields and is
//! `#[repr(C)]`, so a buffer over inline array storage can live inside a
//! shared-memory segment: an all-zero buffer is valid, empty, and uses the
//! [`GrowthPolicy::Fixed`] policy.
//!
//! # Ends
//!
//! ```text
//!   tail (oldest)                          head (newest)
//!     │                                      │
//!     ▼                                      ▼
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!   │ e0 │ e1 │ e2 │ e3 │ e4 │ e5 │ e6 │ e7 │   logical order
//!   └────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! `push_head` + `take_tail` is FIFO, `push_head` + `take_head` is LIFO.
//! Iteration and indexed access go from tail to head.
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::queue::{GrowthPolicy, RingBuffer};
//!
//! let mut ring = RingBuffer::new(2, GrowthPolicy::Grow);
//! ring.push_head(1);
//! ring.push_head(2);
//! ring.push_head(3); // capacity doubles to 4
//! assert_eq!(ring.take_tail(), Some(1));
//! assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
//! ```

use std::fmt;
use std::marker::PhantomData;

/// What a push does when the buffer is full.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Refuse the push.
    #[default]
    Fixed = 0,
    /// Double the capacity. Storage that cannot grow behaves as `Fixed`.
    Grow = 1,
    /// Evict the element at the opposite end to make room.
    Overwrite = 2,
}

/// Backing storage of a [`RingBuffer`].
///
/// The storage length is the buffer capacity.
pub trait RingStorage<T> {
    /// View the whole storage.
    fn as_slice(&self) -> &[T];

    /// Mutable view of the whole storage.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Extend the storage to `new_capacity` slots.
    ///
    /// Returns `false` if this storage has a fixed size.
    fn grow(&mut self, _new_capacity: usize) -> bool {
        false
    }
}

impl<T: Copy + Default> RingStorage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }

    fn grow(&mut self, new_capacity: usize) -> bool {
        self.resize(new_capacity, T::default());
        true
    }
}

impl<T, const N: usize> RingStorage<T> for [T; N] {
    fn as_slice(&self) -> &[T] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

#[derive(Clone, Copy)]
enum End {
    Head,
    Tail,
}

/// Circular buffer over storage `S`.
#[repr(C)]
pub struct RingBuffer<T, S = Vec<T>> {
    /// Physical index of the tail (oldest) element.
    tail: u32,
    /// Number of live elements.
    len: u32,
    policy: GrowthPolicy,
    storage: S,
    _marker: PhantomData<T>,
}

impl<T: Copy + Default> RingBuffer<T, Vec<T>> {
    /// Create a heap-backed buffer.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Initial number of slots.
    /// * `policy` - Behavior when full.
    pub fn new(capacity: usize, policy: GrowthPolicy) -> Self {
        Self::with_storage(vec![T::default(); capacity], policy)
    }
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, [T; N]> {
    /// Create a buffer over inline storage of `N` slots.
    pub fn inline(policy: GrowthPolicy) -> Self {
        Self::with_storage([T::default(); N], policy)
    }
}

impl<T: Copy + Default, S: RingStorage<T>> RingBuffer<T, S> {
    /// Create a buffer over caller-provided storage.
    ///
    /// Existing storage contents are ignored; the buffer starts empty.
    pub fn with_storage(storage: S, policy: GrowthPolicy) -> Self {
        Self {
            tail: 0,
            len: 0,
            policy,
            storage,
            _marker: PhantomData,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.as_slice().len()
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether there are no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every slot is in use.
    #[inline]
    pub fn is_at_capacity(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Current growth policy.
    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Change the growth policy.
    pub fn set_policy(&mut self, policy: GrowthPolicy) {
        self.policy = policy;
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        (self.tail as usize + logical) % self.capacity()
    }

    /// Insert at the head (newest end).
    ///
    /// Returns the slot the element was copied into, or `None` if the
    /// buffer is full and the policy does not allow making room.
    pub fn push_head(&mut self, value: T) -> Option<&mut T> {
        if !self.make_room(End::Head) {
            return None;
        }
        let idx = self.physical(self.len());
        self.len += 1;
        let slot = &mut self.storage.as_mut_slice()[idx];
        *slot = value;
        Some(slot)
    }

    /// Insert at the tail (oldest end).
    ///
    /// Returns the slot the element was copied into, or `None` if the
    /// buffer is full and the policy does not allow making room.
    pub fn push_tail(&mut self, value: T) -> Option<&mut T> {
        if !self.make_room(End::Tail) {
            return None;
        }
        let cap = self.capacity();
        self.tail = ((self.tail as usize + cap - 1) % cap) as u32;
        self.len += 1;
        let slot = &mut self.storage.as_mut_slice()[self.tail as usize];
        *slot = value;
        Some(slot)
    }

    /// Remove and return the head (newest) element.
    pub fn take_head(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let idx = self.physical(self.len() - 1);
        self.len -= 1;
        Some(std::mem::take(&mut self.storage.as_mut_slice()[idx]))
    }

    /// Remove and return the tail (oldest) element.
    pub fn take_tail(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let idx = self.tail as usize;
        self.tail = ((idx + 1) % self.capacity()) as u32;
        self.len -= 1;
        Some(std::mem::take(&mut self.storage.as_mut_slice()[idx]))
    }

    /// The head (newest) element.
    pub fn peek_head(&self) -> Option<&T> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    /// Mutable access to the head (newest) element.
    pub fn peek_head_mut(&mut self) -> Option<&mut T> {
        let last = self.len().checked_sub(1)?;
        self.get_mut(last)
    }

    /// The tail (oldest) element.
    pub fn peek_tail(&self) -> Option<&T> {
        self.get(0)
    }

    /// Mutable access to the tail (oldest) element.
    pub fn peek_tail_mut(&mut self) -> Option<&mut T> {
        self.get_mut(0)
    }

    /// Element `index` positions from the tail.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        Some(&self.storage.as_slice()[self.physical(index)])
    }

    /// Mutable element `index` positions from the tail.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len() {
            return None;
        }
        let idx = self.physical(index);
        Some(&mut self.storage.as_mut_slice()[idx])
    }

    /// The live elements as two slices, tail to head.
    pub fn as_slices(&self) -> (&[T], &[T]) {
        let slice = self.storage.as_slice();
        let (tail, len) = (self.tail as usize, self.len());
        if tail + len <= slice.len() {
            (&slice[tail..tail + len], &[])
        } else {
            let wrapped = tail + len - slice.len();
            (&slice[tail..], &slice[..wrapped])
        }
    }

    /// Mutable variant of [`as_slices`](Self::as_slices).
    pub fn as_mut_slices(&mut self) -> (&mut [T], &mut [T]) {
        let (tail, len) = (self.tail as usize, self.len());
        let slice = self.storage.as_mut_slice();
        let cap = slice.len();
        if tail + len <= cap {
            (&mut slice[tail..tail + len], &mut [])
        } else {
            let wrapped = tail + len - cap;
            let (front, back) = slice.split_at_mut(tail);
            (back, &mut front[..wrapped])
        }
    }

    /// Iterate from tail to head.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        let (a, b) = self.as_slices();
        a.iter().chain(b.iter())
    }

    /// Mutably iterate from tail to head.
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        let (a, b) = self.as_mut_slices();
        a.iter_mut().chain(b.iter_mut())
    }

    /// Rotate the storage so the elements are contiguous from index 0.
    pub fn make_contiguous(&mut self) -> &mut [T] {
        let tail = self.tail as usize;
        let len = self.len();
        let slice = self.storage.as_mut_slice();
        if !slice.is_empty() {
            slice.rotate_left(tail);
        }
        self.tail = 0;
        &mut slice[..len]
    }

    /// Keep only the elements for which `keep` returns true, preserving order.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) {
        let len = self.len();
        let slice = self.make_contiguous();
        let mut write = 0;
        for read in 0..len {
            if keep(&slice[read]) {
                slice[write] = slice[read];
                write += 1;
            }
        }
        for slot in &mut slice[write..] {
            *slot = T::default();
        }
        self.len = write as u32;
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        for slot in self.storage.as_mut_slice() {
            *slot = T::default();
        }
        self.tail = 0;
        self.len = 0;
    }

    fn make_room(&mut self, end: End) -> bool {
        if !self.is_at_capacity() {
            return true;
        }
        match self.policy {
            GrowthPolicy::Fixed => false,
            GrowthPolicy::Grow => {
                let new_capacity = (self.capacity() * 2).max(1);
                self.make_contiguous();
                self.storage.grow(new_capacity)
            }
            GrowthPolicy::Overwrite => {
                if self.capacity() == 0 {
                    return false;
                }
                match end {
                    End::Head => self.take_tail(),
                    End::Tail => self.take_head(),
                };
                true
            }
        }
    }
}

impl<T: Copy + Default + fmt::Debug, S: RingStorage<T>> fmt::Debug for RingBuffer<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("policy", &self.policy)
            .field("elements", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}
