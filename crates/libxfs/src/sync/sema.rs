use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A binary semaphore.
#[derive(Debug)]
pub struct Sema {
    /// Is the semaphore available?
    available: Mutex<bool>,
    cond: Condvar,
}

impl Default for Sema {
    fn default() -> Self {
        Self::new()
    }
}

impl Sema {
    pub const fn new() -> Self {
        Self {
            available: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn available(&self) -> MutexGuard<'_, bool> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the semaphore, sleeping until it is available.
    pub fn p(&self) {
        let mut available = self.available();
        while !*available {
            available = self
                .cond
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available = false;
    }

    /// Takes the semaphore if it is available.
    pub fn cp(&self) -> bool {
        let mut available = self.available();
        if !*available {
            return false;
        }
        *available = false;
        true
    }

    /// Gives the semaphore back.
    ///
    /// # Panics
    ///
    /// Panics if the semaphore was not taken.
    pub fn v(&self) {
        let mut available = self.available();
        assert!(!*available, "releasing untaken semaphore");
        *available = true;
        self.cond.notify_one();
    }

    /// Returns `true` if the semaphore is currently taken.
    pub fn is_taken(&self) -> bool {
        !*self.available()
    }
}
