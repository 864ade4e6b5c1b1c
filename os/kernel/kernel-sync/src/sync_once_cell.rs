use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A write-once slot for boot-initialized singletons.
///
/// Unlike a lazily initialized cell, the value is installed explicitly by the
/// boot path with [`SyncOnceCell::set`]; readers before that see `None`.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` once a value has been installed.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the write completed.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Install `value`. Hands it back if the cell was already set.
    ///
    /// # Errors
    /// Returns `Err(value)` if another value was installed first.
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }

        // SAFETY: WRITING grants exclusive access to the slot.
        let slot = unsafe { &mut *self.value.get() };
        let stored: *const T = slot.write(value);
        self.state.store(READY, Ordering::Release);
        // SAFETY: just initialized and never moved or dropped afterwards.
        Ok(unsafe { &*stored })
    }

    /// Install the value produced by `init` unless one is present, then return it.
    ///
    /// A concurrent initializer wins; this call then waits for it.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }
        match self.set(init()) {
            Ok(v) => v,
            Err(_) => {
                while self.state.load(Ordering::Acquire) != READY {
                    spin_loop();
                }
                // SAFETY: READY
                unsafe { (*self.value.get()).assume_init_ref() }
            }
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means the slot holds an initialized value.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
