//! Process-wide access to the environment block.
//!
//! The spawn paths hand the live `environ` array straight to `posix_spawn` /
//! `execve` when a request inherits the environment. [`lock`] serializes
//! those reads against mutations made through [`set_var`] and
//! [`remove_var`]. Mutations made directly through `std::env` do not take
//! this lock; callers that mutate the environment concurrently with a spawn
//! must go through this module.

use std::ffi::{CStr, OsStr};
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::c_char;

static ENVIRON_LOCK: Mutex<()> = Mutex::new(());

#[cfg(not(target_vendor = "apple"))]
unsafe extern "C" {
    static mut environ: *const *const c_char;
}

#[cfg(target_vendor = "apple")]
fn raw_environ() -> *const *const c_char {
    // SAFETY: _NSGetEnviron always returns a valid pointer to the environ slot.
    unsafe { (*libc::_NSGetEnviron()).cast_const().cast() }
}

#[cfg(not(target_vendor = "apple"))]
fn raw_environ() -> *const *const c_char {
    // SAFETY: reads the pointer value; no reference to the static is created.
    unsafe { environ }
}

/// Scoped hold on the environment lock.
///
/// Do not call [`crate::spawn`] while holding a guard on the same thread;
/// the lock is not reentrant.
pub struct EnvironGuard {
    _lock: MutexGuard<'static, ()>,
}

/// Acquire the process-wide environment lock.
pub fn lock() -> EnvironGuard {
    EnvironGuard {
        _lock: ENVIRON_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
    }
}

impl EnvironGuard {
    /// The live, NULL-terminated `KEY=VALUE` array of the calling process.
    ///
    /// This is a view, not a snapshot: it stays valid only while the guard is
    /// held and nobody mutates the environment behind the lock's back.
    pub fn as_ptr(&self) -> *const *const c_char {
        raw_environ()
    }

    /// Iterate the live `KEY=VALUE` entries.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            cursor: raw_environ(),
            _guard: PhantomData,
        }
    }
}

impl std::fmt::Debug for EnvironGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironGuard").finish()
    }
}

/// Iterator over the entries of a locked environment block.
pub struct Entries<'a> {
    cursor: *const *const c_char,
    _guard: PhantomData<&'a EnvironGuard>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a CStr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        // SAFETY: cursor walks a NULL-terminated array owned by libc that the
        // held lock keeps stable.
        let entry = unsafe { *self.cursor };
        if entry.is_null() {
            return None;
        }
        // SAFETY: still inside the array; the terminator has not been reached.
        self.cursor = unsafe { self.cursor.add(1) };
        // SAFETY: every non-NULL environ entry is a NUL-terminated string.
        Some(unsafe { CStr::from_ptr(entry) })
    }
}

/// Set an environment variable while holding the environment lock.
///
/// # Safety
///
/// Same contract as [`std::env::set_var`]: no other thread may read the
/// environment through libc (`getenv`, etc.) without the lock while this runs.
pub unsafe fn set_var<K: AsRef<OsStr>, V: AsRef<OsStr>>(key: K, value: V) {
    let _guard = lock();
    // SAFETY: forwarded to the caller.
    unsafe { std::env::set_var(key, value) };
}

/// Remove an environment variable while holding the environment lock.
///
/// # Safety
///
/// Same contract as [`std::env::remove_var`].
pub unsafe fn remove_var<K: AsRef<OsStr>>(key: K) {
    let _guard = lock();
    // SAFETY: forwarded to the caller.
    unsafe { std::env::remove_var(key) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_reflect_set_and_remove() {
        let key = "PROCSPAWN_ENVIRON_TEST_KEY";
        unsafe { set_var(key, "value-1") };
        {
            let guard = lock();
            let found = guard
                .entries()
                .any(|e| e.to_bytes() == b"PROCSPAWN_ENVIRON_TEST_KEY=value-1");
            assert!(found, "entry missing from live environ");
        }

        unsafe { remove_var(key) };
        let guard = lock();
        assert!(
            !guard
                .entries()
                .any(|e| e.to_bytes().starts_with(b"PROCSPAWN_ENVIRON_TEST_KEY="))
        );
    }

    #[test]
    fn as_ptr_is_never_null() {
        let guard = lock();
        assert!(!guard.as_ptr().is_null());
    }
}
