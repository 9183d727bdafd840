use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A multi-reader lock with explicit acquire and release.
///
/// Unlike [`std::sync::RwLock`] there is no guard: a lock taken by one call
/// is released by a later, independent call, which is what the inode lock
/// flag protocol needs.
#[derive(Debug, Default)]
pub struct MrLock {
    state: Mutex<MrState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct MrState {
    /// Number of shared holders.
    readers: u32,
    /// Is the lock held exclusively?
    writer: bool,
}

impl MrLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(MrState {
                readers: 0,
                writer: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock in shared mode, blocking while a writer holds it.
    pub fn acquire_shared(&self) {
        let mut state = self.state();
        while state.writer {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.readers += 1;
    }

    /// Acquires the lock in exclusive mode.
    pub fn acquire_excl(&self) {
        let mut state = self.state();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.writer = true;
    }

    /// Attempts to acquire the lock in shared mode without blocking.
    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.state();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Attempts to acquire the lock in exclusive mode without blocking.
    pub fn try_acquire_excl(&self) -> bool {
        let mut state = self.state();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    /// Releases a shared hold.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held shared.
    pub fn release_shared(&self) {
        let mut state = self.state();
        assert!(state.readers > 0, "releasing unheld shared lock");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Releases an exclusive hold.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held exclusively.
    pub fn release_excl(&self) {
        let mut state = self.state();
        assert!(state.writer, "releasing unheld exclusive lock");
        state.writer = false;
        self.cond.notify_all();
    }

    /// Converts an exclusive hold into a shared one without dropping the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held exclusively.
    pub fn demote(&self) {
        let mut state = self.state();
        assert!(state.writer, "demoting unheld exclusive lock");
        state.writer = false;
        state.readers += 1;
        self.cond.notify_all();
    }

    /// Returns `true` if the lock is held exclusively by someone.
    pub fn is_excl_locked(&self) -> bool {
        self.state().writer
    }

    /// Returns `true` if the lock is held in any mode by someone.
    pub fn is_locked(&self) -> bool {
        let state = self.state();
        state.writer || state.readers > 0
    }
}
