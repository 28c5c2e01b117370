use std::sync::{Condvar, Mutex, PoisonError};

use crate::error::ApiError;
use crate::lock;

/// Shared slot for one in-flight request. The owner completes it once; every
/// waiter blocks until then and receives a clone of the same outcome.
pub struct Flight<T> {
    outcome: Mutex<Option<std::result::Result<T, ApiError>>>,
    ready: Condvar,
}

impl<T: Clone> Default for Flight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Flight<T> {
    pub fn new() -> Self {
        Flight {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn complete(&self, outcome: std::result::Result<T, ApiError>) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }

    pub fn wait(&self) -> std::result::Result<T, ApiError> {
        let mut slot = lock(&self.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
