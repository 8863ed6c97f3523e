//! Statically allocated buffers
//!
//! Buffers in this module are statically allocated. The size of the buffer must be known at
//! compile time.

use core::fmt::{Debug, Display, Formatter};
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};

fn uninit_array<T, const SIZE: usize>() -> [MaybeUninit<T>; SIZE] {
    core::array::from_fn(|_| MaybeUninit::uninit())
}

/// A linear buffer
///
/// This is a vector with a fixed capacity of `SIZE`. Items can only be added to the end of the
/// buffer.
pub struct LinearBuffer<const SIZE: usize, T> {
    buffer: [MaybeUninit<T>; SIZE],
    count: usize,
}

impl<T, const SIZE: usize> LinearBuffer<SIZE, T> {
    pub fn new() -> Self {
        let buffer = uninit_array();

        let count = 0;

        Self { buffer, count }
    }

    /// Try to push an item to the end of the buffer
    pub fn try_push(&mut self, t: T) -> Result<(), LinearBufferError> {
        if self.is_full() {
            return Err(LinearBufferError::BufferFull);
        }

        self.buffer[self.count].write(t);

        self.count += 1;

        Ok(())
    }

    /// Shorten the buffer to `len` items
    ///
    /// Nothing is done if `len` is not less than the current length.
    pub fn truncate(&mut self, len: usize) {
        while self.count > len {
            self.count -= 1;

            // SAFETY: the element at the old `count - 1` was initialized
            unsafe { self.buffer[self.count].assume_init_drop() }
        }
    }

    /// Remove every item within the buffer
    pub fn clear(&mut self) {
        self.truncate(0)
    }

    /// Get the length
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == SIZE
    }
}

impl<T: Copy, const SIZE: usize> LinearBuffer<SIZE, T> {
    /// Create a buffer by copying the items of a slice
    ///
    /// An error is returned if the slice is larger than `SIZE`.
    pub fn try_from_slice(slice: &[T]) -> Result<Self, LinearBufferError> {
        let mut buffer = Self::new();

        buffer.try_extend_from_slice(slice)?;

        Ok(buffer)
    }

    /// Copy the items of `slice` to the end of the buffer
    ///
    /// The buffer is unchanged if there is not enough room for the entire slice.
    pub fn try_extend_from_slice(&mut self, slice: &[T]) -> Result<(), LinearBufferError> {
        if SIZE - self.count < slice.len() {
            return Err(LinearBufferError::InsufficientCapacity);
        }

        for (spot, item) in self.buffer[self.count..].iter_mut().zip(slice) {
            spot.write(*item);
        }

        self.count += slice.len();

        Ok(())
    }
}

impl<T, const SIZE: usize> Default for LinearBuffer<SIZE, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, const SIZE: usize> Clone for LinearBuffer<SIZE, T> {
    fn clone(&self) -> Self {
        let mut clone = Self::new();

        for v in self.iter() {
            clone.buffer[clone.count].write(v.clone());
            clone.count += 1;
        }

        clone
    }
}

impl<T, const SIZE: usize> Deref for LinearBuffer<SIZE, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the first `count` elements are initialized
        unsafe { core::slice::from_raw_parts(self.buffer.as_ptr().cast::<T>(), self.count) }
    }
}

impl<T, const SIZE: usize> DerefMut for LinearBuffer<SIZE, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the first `count` elements are initialized
        unsafe { core::slice::from_raw_parts_mut(self.buffer.as_mut_ptr().cast::<T>(), self.count) }
    }
}

impl<T: PartialEq, const SIZE: usize> PartialEq for LinearBuffer<SIZE, T> {
    fn eq(&self, other: &Self) -> bool {
        self.deref() == other.deref()
    }
}

impl<T: Eq, const SIZE: usize> Eq for LinearBuffer<SIZE, T> {}

impl<T: Debug, const SIZE: usize> Debug for LinearBuffer<SIZE, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("LinearBuffer")?;
        Debug::fmt(self.deref(), f)
    }
}

impl<T, const SIZE: usize> Drop for LinearBuffer<SIZE, T> {
    fn drop(&mut self) {
        self.clear()
    }
}

/// Error from a `LinearBuffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearBufferError {
    BufferFull,
    InsufficientCapacity,
}

impl Display for LinearBufferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            LinearBufferError::BufferFull => f.write_str("linear buffer full"),
            LinearBufferError::InsufficientCapacity => f.write_str("the capacity is too small"),
        }
    }
}

/// A first in first out queue
///
/// The underlying implementation of a `QueueBuffer` is a circular buffer.
pub struct QueueBuffer<T, const SIZE: usize> {
    buffer: [MaybeUninit<T>; SIZE],
    start: usize,
    count: usize,
}

impl<T, const SIZE: usize> QueueBuffer<T, SIZE> {
    pub fn new() -> Self {
        let buffer = uninit_array();

        Self {
            buffer,
            start: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn position(&self, offset: usize) -> usize {
        (self.start + offset) % SIZE
    }

    /// Push an item to the back of the queue
    pub fn try_push(&mut self, t: T) -> Result<(), QueueBufferError> {
        if self.is_full() {
            return Err(QueueBufferError::BufferFull);
        }

        let next = self.position(self.count);

        self.buffer[next].write(t);

        self.count += 1;

        Ok(())
    }

    /// Remove the item at the front of the queue
    pub fn try_remove(&mut self) -> Result<T, QueueBufferError> {
        if self.is_empty() {
            return Err(QueueBufferError::BufferEmpty);
        }

        // SAFETY: the front element is initialized and is no longer tracked after the read
        let front = unsafe { self.buffer[self.start].assume_init_read() };

        self.start = self.position(1);

        self.count -= 1;

        Ok(front)
    }

    /// Peek at the item at the front of the queue
    pub fn front(&self) -> Option<&T> {
        // SAFETY: the front element is initialized when the queue is not empty
        (!self.is_empty()).then(|| unsafe { self.buffer[self.start].assume_init_ref() })
    }

    /// Iterate over the items from front to back
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        // SAFETY: the `count` elements following `start` are initialized
        (0..self.count).map(move |offset| unsafe { self.buffer[self.position(offset)].assume_init_ref() })
    }

    /// Keep only the items for which `f` returns true
    ///
    /// The kept items stay in the same order.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&T) -> bool,
    {
        for _ in 0..self.count {
            if let Ok(item) = self.try_remove() {
                if f(&item) {
                    // the slot freed by the removal is reused
                    self.try_push(item).ok();
                }
            }
        }
    }

    /// Drop every item within the queue
    pub fn empty(&mut self) {
        while self.try_remove().is_ok() {}
    }
}

impl<T, const SIZE: usize> Default for QueueBuffer<T, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug, const SIZE: usize> Debug for QueueBuffer<T, SIZE> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("QueueBuffer")?;
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, const SIZE: usize> Drop for QueueBuffer<T, SIZE> {
    fn drop(&mut self) {
        self.empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBufferError {
    BufferFull,
    BufferEmpty,
}

impl Display for QueueBufferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            QueueBufferError::BufferFull => f.write_str("buffer is full"),
            QueueBufferError::BufferEmpty => f.write_str("buffer is empty"),
        }
    }
}
