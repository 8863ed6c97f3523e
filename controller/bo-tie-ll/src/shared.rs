//! Interrupt safe sharing of the link layer
//!
//! The radio completion and the timer of the link layer are delivered from interrupt handlers
//! while the host API is called from the main context. Everything touching the link layer must do
//! so with interrupts masked, which is what a [`Shared`] does through a `critical-section`.
//!
//! ```
//! # use bo_tie_ll::shared::Shared;
//! static COUNTER: Shared<u32> = Shared::new(0);
//!
//! COUNTER.with(|counter| *counter += 1);
//!
//! assert_eq!(1, COUNTER.with(|counter| *counter));
//! ```

use core::cell::RefCell;
use critical_section::Mutex;

/// A value only accessible within a critical section
pub struct Shared<T>(Mutex<RefCell<T>>);

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Shared(Mutex::new(RefCell::new(value)))
    }

    /// Run `f` with interrupts masked
    ///
    /// # Panic
    /// Calling `with` on the same `Shared` from within `f` panics.
    pub fn with<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&mut T) -> O,
    {
        critical_section::with(|cs| f(&mut self.0.borrow_ref_mut(cs)))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_is_visible() {
        let shared = Shared::new([0u8; 4]);

        shared.with(|array| array[2] = 7);

        assert_eq!([0, 0, 7, 0], shared.into_inner());
    }
}
