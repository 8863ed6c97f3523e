//! The connection pool
//!
//! Connections are kept within a fixed array of slots. The indexes of the free slots are kept in a
//! queue, so a slot is allocated from the front of the queue and returned to the back of it. This
//! gives the longest possible time before the handle of a closed connection is given out again.

use crate::connection::{Connection, ConnectionHandle};
use crate::LlError;
use bo_tie_core::buffer::stack::QueueBuffer;

#[derive(Debug)]
struct Entry {
    /// Outstanding references to the connection (a pending radio completion)
    refs: u8,
    connection: Connection,
}

/// A fixed capacity pool of connections
///
/// Every slot is either active (it holds a connection) or free (its index is within the free
/// queue).
#[derive(Debug)]
pub struct ConnectionPool<const N: usize> {
    slots: [Option<Entry>; N],
    free: QueueBuffer<usize, N>,
}

impl<const N: usize> ConnectionPool<N> {
    pub fn new() -> Self {
        let mut free = QueueBuffer::new();

        for slot in 0..N {
            free.try_push(slot).ok();
        }

        ConnectionPool {
            slots: core::array::from_fn(|_| None),
            free,
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn active_count(&self) -> usize {
        N - self.free.len()
    }

    /// Allocate a slot for a new connection
    ///
    /// `build` is given the handle of the allocated slot and returns the connection kept within it.
    ///
    /// # Error
    /// `LlError::OutOfSlots` is returned when every slot is in use.
    pub(crate) fn allocate<F>(&mut self, build: F) -> Result<ConnectionHandle, LlError>
    where
        F: FnOnce(ConnectionHandle) -> Connection,
    {
        let slot = self.free.try_remove().map_err(|_| LlError::OutOfSlots)?;

        if self.slots[slot].is_some() {
            log::error!("(LL) free slot {} holds a connection", slot);

            panic!("connection pool free list is corrupted");
        }

        let handle = ConnectionHandle::from_slot(slot);

        self.slots[slot] = Some(Entry {
            refs: 0,
            connection: build(handle),
        });

        log::debug!("(LL) allocated connection {}", handle);

        Ok(handle)
    }

    fn entry(&self, handle: ConnectionHandle) -> Option<&Entry> {
        self.slots.get(handle.slot()?)?.as_ref()
    }

    fn entry_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Entry> {
        self.slots.get_mut(handle.slot()?)?.as_mut()
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.entry(handle).map(|entry| &entry.connection)
    }

    pub(crate) fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.entry_mut(handle).map(|entry| &mut entry.connection)
    }

    pub(crate) fn by_slot(&self, slot: usize) -> Option<&Connection> {
        self.slots.get(slot)?.as_ref().map(|entry| &entry.connection)
    }

    pub(crate) fn by_slot_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot)?.as_mut().map(|entry| &mut entry.connection)
    }

    /// Check if a handle belongs to an active connection
    pub fn is_active(&self, handle: ConnectionHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// Iterate over the active connections
    pub fn iter(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.slots.iter().flatten().map(|entry| &entry.connection)
    }

    /// Add a reference to a connection that must be dropped before the connection is released
    pub(crate) fn hold(&mut self, handle: ConnectionHandle) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.refs += 1;
        }
    }

    pub(crate) fn unhold(&mut self, handle: ConnectionHandle) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Release the slot of a connection
    ///
    /// The connection is returned and the slot is put at the back of the free queue.
    ///
    /// # Panic
    /// Releasing a handle that is not active, or a connection that still has a reference to it,
    /// is an invariant violation of the link layer.
    pub(crate) fn release(&mut self, handle: ConnectionHandle) -> Connection {
        let slot = handle.slot().filter(|slot| *slot < N);

        match slot.and_then(|slot| self.slots[slot].take().map(|entry| (slot, entry))) {
            Some((slot, entry)) if entry.refs == 0 => {
                self.free.try_push(slot).ok();

                log::debug!("(LL) released connection {}", handle);

                entry.connection
            }
            Some((_, entry)) => {
                log::error!("(LL) release of connection {} with {} references", handle, entry.refs);

                panic!("connection released while referenced");
            }
            None => {
                log::error!("(LL) release of inactive connection {}", handle);

                panic!("release of a connection that is not active");
            }
        }
    }
}

impl<const N: usize> Default for ConnectionPool<N> {
    fn default() -> Self {
        Self::new()
    }
}
