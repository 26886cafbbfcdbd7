//! Reentrant read/write lock that guards the provider state.
//!
//! Every access to provider state happens inside a scope: a [`ReadScope`] for shared access or a
//! [`WriteScope`] for exclusive access. The scope guards are the only way to reach the guarded
//! value, so "access without a scope" cannot be expressed at all.
//!
//! Reentrancy is tracked in a [`ThreadScopes`] value owned by the thread that opens the scopes.
//! A thread may re-enter a read scope it already holds without blocking, and may re-enter a write
//! scope through the held [`WriteScope`]. Mixing read and write scopes on the same lock from the
//! same thread is a programming error and panics.

use std::any::type_name;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RawRwLock;
use parking_lot::lock_api::{RawRwLock as _, RawRwLockTimed as _};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScopeKind {
    Read,
    Write,
}

#[derive(Debug)]
struct HeldScope {
    lock_id: u64,
    kind: ScopeKind,
    depth: u32,
}

/// The provider lock scopes held by one thread.
///
/// Create one per thread (typically on the stack of the thread's entry point) and pass it by
/// reference to [`ProviderLock::read()`] and [`ProviderLock::write()`]. It is neither `Send` nor
/// `Sync`, so the bookkeeping can never be shared between threads.
#[derive(Default)]
pub struct ThreadScopes {
    held: RefCell<Vec<HeldScope>>,

    _single_threaded: PhantomData<*const ()>,
}

impl ThreadScopes {
    /// Creates an empty scope record for the current thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nesting depth of the read scope this thread holds on `lock`, or 0 if it holds none.
    #[must_use]
    pub fn read_depth<T>(&self, lock: &ProviderLock<T>) -> u32 {
        self.depth(lock.id, ScopeKind::Read)
    }

    /// Nesting depth of the write scope this thread holds on `lock`, or 0 if it holds none.
    #[must_use]
    pub fn write_depth<T>(&self, lock: &ProviderLock<T>) -> u32 {
        self.depth(lock.id, ScopeKind::Write)
    }

    fn depth(&self, lock_id: u64, kind: ScopeKind) -> u32 {
        self.held
            .borrow()
            .iter()
            .find(|scope| scope.lock_id == lock_id && scope.kind == kind)
            .map_or(0, |scope| scope.depth)
    }

    fn held_kind(&self, lock_id: u64) -> Option<ScopeKind> {
        self.held
            .borrow()
            .iter()
            .find(|scope| scope.lock_id == lock_id)
            .map(|scope| scope.kind)
    }

    /// Records entry into a scope. Returns `true` if this is the outermost scope of its kind,
    /// in which case the caller must acquire the OS lock.
    fn enter(&self, lock_id: u64, kind: ScopeKind) -> bool {
        let mut held = self.held.borrow_mut();

        if let Some(scope) = held.iter_mut().find(|scope| scope.lock_id == lock_id) {
            assert!(
                scope.kind == kind,
                "cannot enter a {kind:?} scope while holding a {:?} scope on the same provider lock",
                scope.kind
            );

            scope.depth = scope
                .depth
                .checked_add(1)
                .expect("provider lock scope nesting depth overflowed u32");

            return false;
        }

        held.push(HeldScope {
            lock_id,
            kind,
            depth: 1,
        });

        true
    }

    /// Records exit from a scope. Returns `true` if this was the outermost scope of its kind,
    /// in which case the caller must release the OS lock.
    fn exit(&self, lock_id: u64, kind: ScopeKind) -> bool {
        let mut held = self.held.borrow_mut();

        let position = held
            .iter()
            .position(|scope| scope.lock_id == lock_id && scope.kind == kind)
            .unwrap_or_else(|| panic!("exiting a {kind:?} scope that this thread never entered"));

        let scope = held
            .get_mut(position)
            .expect("position was found by the search above");

        scope.depth = scope
            .depth
            .checked_sub(1)
            .expect("held scopes are removed when their depth reaches zero");

        if scope.depth == 0 {
            held.swap_remove(position);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for ThreadScopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("held", &self.held.borrow())
            .finish()
    }
}

/// A read/write lock with per-thread reentrant scopes.
///
/// Shared scopes from different threads run concurrently. A write scope excludes all readers and
/// all other writers. A thread that already holds a read scope may open more read scopes without
/// blocking, even if a writer is waiting. A thread holding a read scope can never upgrade to a
/// write scope; trying to do so panics instead of deadlocking.
///
/// # Example
///
/// ```
/// use alloc_trace::{ProviderLock, ThreadScopes};
///
/// let lock = ProviderLock::new(0_u64);
/// let scopes = ThreadScopes::new();
///
/// {
///     let mut value = lock.write(&scopes);
///     *value += 5;
/// }
///
/// let outer = lock.read(&scopes);
/// let inner = lock.read(&scopes);
/// assert_eq!(*outer + *inner, 10);
/// ```
pub struct ProviderLock<T> {
    id: u64,
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// SAFETY: Moving the lock moves the guarded value, which is fine whenever T is Send.
unsafe impl<T: Send> Send for ProviderLock<T> {}
// SAFETY: Shared scopes hand out &T to many threads at once (requiring Sync) and write scopes
// hand out &mut T to one thread at a time (requiring Send).
unsafe impl<T: Send + Sync> Sync for ProviderLock<T> {}

impl<T> ProviderLock<T> {
    /// Creates a new unlocked lock guarding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            // Relaxed is enough, we only need uniqueness.
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            raw: RawRwLock::INIT,
            data: UnsafeCell::new(value),
        }
    }

    /// Opens a read scope, blocking while another thread holds the write scope.
    ///
    /// If the current thread already holds a read scope on this lock, the new scope is nested
    /// inside it and this call never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the current thread holds the write scope on this lock.
    pub fn read<'a>(&'a self, scopes: &'a ThreadScopes) -> ReadScope<'a, T> {
        if scopes.enter(self.id, ScopeKind::Read) {
            self.raw.lock_shared();
        }

        ReadScope { lock: self, scopes }
    }

    /// Opens a read scope, giving up if another thread holds the write scope for longer than
    /// `timeout`.
    ///
    /// Nested read scopes never wait, as with [`read()`][Self::read].
    ///
    /// # Panics
    ///
    /// Panics if the current thread holds the write scope on this lock.
    #[cfg_attr(test, mutants::skip)] // The timeout length is not observable without flaky timing.
    pub fn try_read_for<'a>(
        &'a self,
        scopes: &'a ThreadScopes,
        timeout: Duration,
    ) -> Option<ReadScope<'a, T>> {
        if scopes.enter(self.id, ScopeKind::Read) && !self.raw.try_lock_shared_for(timeout) {
            scopes.exit(self.id, ScopeKind::Read);
            return None;
        }

        Some(ReadScope { lock: self, scopes })
    }

    /// Opens the write scope, blocking until all other scopes are closed.
    ///
    /// To re-enter a write scope the thread already holds, use [`WriteScope::reenter()`].
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds any scope on this lock. Holding a read scope
    /// means this would be a lock upgrade, which is not supported. Holding the write scope means
    /// the caller must re-enter through the held guard instead.
    pub fn write<'a>(&'a self, scopes: &'a ThreadScopes) -> WriteScope<'a, T> {
        self.assert_no_scope_held(scopes);

        scopes.enter(self.id, ScopeKind::Write);
        self.raw.lock_exclusive();

        WriteScope { lock: self, scopes }
    }

    /// Opens the write scope if no other thread holds a scope, without blocking.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`write()`][Self::write].
    pub fn try_write<'a>(&'a self, scopes: &'a ThreadScopes) -> Option<WriteScope<'a, T>> {
        self.assert_no_scope_held(scopes);

        if !self.raw.try_lock_exclusive() {
            return None;
        }

        scopes.enter(self.id, ScopeKind::Write);

        Some(WriteScope { lock: self, scopes })
    }

    /// Exclusive access without any scope, possible because `&mut self` proves no scope exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the guarded value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn assert_no_scope_held(&self, scopes: &ThreadScopes) {
        match scopes.held_kind(self.id) {
            None => {}
            Some(ScopeKind::Read) => {
                panic!("cannot open a write scope while holding a read scope (lock upgrade)")
            }
            Some(ScopeKind::Write) => panic!(
                "write scope is already held by this thread; re-enter it through the held WriteScope"
            ),
        }
    }
}

impl<T> fmt::Debug for ProviderLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Shared access to the value guarded by a [`ProviderLock`].
///
/// Dropping the outermost read scope of a thread releases the OS lock.
pub struct ReadScope<'a, T> {
    lock: &'a ProviderLock<T>,
    scopes: &'a ThreadScopes,
}

impl<'a, T> ReadScope<'a, T> {
    /// Opens a nested read scope. Never blocks.
    #[must_use]
    pub fn reenter(&self) -> ReadScope<'a, T> {
        let outermost = self.scopes.enter(self.lock.id, ScopeKind::Read);
        debug_assert!(!outermost, "a held read scope implies an existing record");

        ReadScope {
            lock: self.lock,
            scopes: self.scopes,
        }
    }
}

impl<T> Deref for ReadScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: This thread holds the lock in shared mode, so no &mut T exists anywhere.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadScope<'_, T> {
    fn drop(&mut self) {
        if self.scopes.exit(self.lock.id, ScopeKind::Read) {
            // SAFETY: The outermost read scope of this thread acquired the lock in shared mode.
            unsafe {
                self.lock.raw.unlock_shared();
            }
        }
    }
}

impl<T> fmt::Debug for ReadScope<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the value guarded by a [`ProviderLock`].
pub struct WriteScope<'a, T> {
    lock: &'a ProviderLock<T>,
    scopes: &'a ThreadScopes,
}

impl<T> WriteScope<'_, T> {
    /// Opens a nested write scope. Never blocks.
    ///
    /// The nested scope borrows this one, so only one of them can be used at a time.
    #[must_use]
    pub fn reenter(&mut self) -> WriteScope<'_, T> {
        let outermost = self.scopes.enter(self.lock.id, ScopeKind::Write);
        debug_assert!(!outermost, "a held write scope implies an existing record");

        WriteScope {
            lock: self.lock,
            scopes: self.scopes,
        }
    }
}

impl<T> Deref for WriteScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: This thread holds the lock exclusively and nested write scopes borrow their
        // parent, so this is the only live path to the value.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: See `deref()`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteScope<'_, T> {
    fn drop(&mut self) {
        if self.scopes.exit(self.lock.id, ScopeKind::Write) {
            // SAFETY: The outermost write scope of this thread acquired the lock exclusively.
            unsafe {
                self.lock.raw.unlock_exclusive();
            }
        }
    }
}

impl<T> fmt::Debug for WriteScope<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
