use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod timer;

#[cfg(test)]
pub mod test_helpers;

// No user code runs while an internal lock is held, so poisoning carries no broken invariant.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
