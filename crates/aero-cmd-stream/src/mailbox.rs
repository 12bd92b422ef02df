use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Multi-producer mailbox emptied in one go by the channel loop.
///
/// Posted tasks and outgoing client messages both pass through one of these, so anything
/// posted from inside a callback is seen on the next `take_all`.
#[derive(Debug)]
pub struct Mailbox<T> {
    slots: Mutex<VecDeque<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn post(&self, item: T) {
        self.slots().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Everything posted so far, oldest first.
    pub fn take_all(&self) -> Vec<T> {
        let taken = std::mem::take(&mut *self.slots());
        taken.into()
    }
}
