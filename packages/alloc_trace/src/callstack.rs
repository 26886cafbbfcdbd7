use std::fmt::Debug;

use foldhash::{HashMap, HashMapExt};

use crate::CallstackHandle;

/// Turns an allocation owner into a callstack handle.
///
/// This is the seam to whatever symbolication facility the host tool has. Queries call it at
/// most once per distinct owner, and never again for an allocation whose callstack is already
/// resolved, so implementations do not need their own memoization.
#[cfg_attr(test, mockall::automock)]
pub trait CallstackResolver: Debug + Send + Sync {
    /// Resolves the callstack of the code identified by `owner`.
    fn resolve(&self, owner: u64) -> CallstackHandle;
}

/// A resolver for sessions without callstack information.
///
/// Resolves every owner to [`CallstackHandle::UNKNOWN`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallstacks;

impl CallstackResolver for NoCallstacks {
    fn resolve(&self, _owner: u64) -> CallstackHandle {
        CallstackHandle::UNKNOWN
    }
}

/// Per-query memo in front of a resolver.
#[derive(Debug)]
pub(crate) struct CallstackCache<'a> {
    resolver: &'a dyn CallstackResolver,
    resolved: HashMap<u64, CallstackHandle>,
}

impl<'a> CallstackCache<'a> {
    pub(crate) fn new(resolver: &'a dyn CallstackResolver) -> Self {
        Self {
            resolver,
            resolved: HashMap::new(),
        }
    }

    pub(crate) fn resolve(&mut self, owner: u64) -> CallstackHandle {
        *self
            .resolved
            .entry(owner)
            .or_insert_with(|| self.resolver.resolve(owner))
    }
}
