//! Reference-counted ownership of native device handles.
//!
//! Every device object (context, queue, kernel, buffer, event) is an opaque
//! identifier whose lifetime the runtime tracks with its own reference count.
//! [`NativeResource`] binds a retain/release pair to a resource kind at the type
//! level, and two owners build on it:
//!
//! - [`RcHandle`] is the shared variant. `Clone` retains, `Drop` releases, and
//!   [`RcHandle::take`] moves the identifier out while leaving a null handle
//!   behind. Used for long-lived capabilities shared between owners.
//! - [`Owned`] is move-only. It releases exactly once on drop and cannot be
//!   cloned, which makes double release of per-iteration buffers and events
//!   unrepresentable.

use std::fmt;
use std::marker::PhantomData;

use tracing::warn;

use crate::error::DeviceError;

/// A kind of native object with runtime-managed reference counting.
///
/// Implementors are zero-sized marker types; `Raw` is the identifier the
/// runtime hands out and `NULL` its empty value. Neither function is ever
/// called with `NULL`.
pub trait NativeResource: 'static {
    type Raw: Copy + Eq + fmt::Debug + Send + Sync;

    /// The empty identifier.
    const NULL: Self::Raw;

    /// Short name used in log messages (e.g. `"context"`).
    const KIND: &'static str;

    /// Increment the runtime reference count of `raw`.
    fn retain(raw: Self::Raw) -> Result<(), DeviceError>;

    /// Decrement the runtime reference count of `raw`.
    fn release(raw: Self::Raw) -> Result<(), DeviceError>;
}

/// Shared owner of a native identifier.
///
/// Holds exactly one runtime reference while non-null. A null handle never
/// calls into the runtime.
pub struct RcHandle<K: NativeResource> {
    raw: K::Raw,
    _kind: PhantomData<fn() -> K>,
}

impl<K: NativeResource> RcHandle<K> {
    /// An empty handle.
    pub fn null() -> Self {
        Self { raw: K::NULL, _kind: PhantomData }
    }

    /// Take shared ownership of `raw`, retaining it if non-null.
    pub fn retained(raw: K::Raw) -> Result<Self, DeviceError> {
        if raw != K::NULL {
            K::retain(raw)?;
        }
        Ok(Self { raw, _kind: PhantomData })
    }

    /// Take ownership of `raw` without retaining it.
    ///
    /// For identifiers that already carry a reference owned by the caller,
    /// typically the implicit first reference returned by a create call.
    pub fn adopt(raw: K::Raw) -> Self {
        Self { raw, _kind: PhantomData }
    }

    /// Release the current identifier (if any) and take shared ownership of
    /// `raw`, retaining it.
    ///
    /// `raw` is retained before the old identifier is released, so assigning a
    /// handle its own identifier is safe. On retain failure the handle is left
    /// unchanged.
    pub fn assign(&mut self, raw: K::Raw) -> Result<(), DeviceError> {
        if raw != K::NULL {
            K::retain(raw)?;
        }
        self.reset();
        self.raw = raw;
        Ok(())
    }

    /// Release the held identifier, if any, and become null.
    pub fn reset(&mut self) {
        let raw = std::mem::replace(&mut self.raw, K::NULL);
        if raw != K::NULL {
            release_logged::<K>(raw);
        }
    }

    /// Move the identifier out, leaving `self` null. The reference count is not
    /// touched.
    pub fn take(&mut self) -> Self {
        Self::adopt(std::mem::replace(&mut self.raw, K::NULL))
    }

    /// Give up ownership without releasing. The caller becomes responsible for
    /// the reference this handle held.
    pub fn into_raw(mut self) -> K::Raw {
        std::mem::replace(&mut self.raw, K::NULL)
    }

    /// The held identifier, or `None` when null.
    pub fn get(&self) -> Option<K::Raw> {
        (self.raw != K::NULL).then_some(self.raw)
    }

    /// The held identifier.
    ///
    /// Callers must check [`is_null`](Self::is_null) first; using a null handle
    /// is a contract violation.
    pub fn raw(&self) -> K::Raw {
        debug_assert!(self.raw != K::NULL, "access to null {} handle", K::KIND);
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.raw == K::NULL
    }

    /// Another owner of the same identifier, retaining it.
    ///
    /// Unlike `clone`, a refused retain is returned to the caller.
    pub fn try_clone(&self) -> Result<Self, DeviceError> {
        Self::retained(self.raw)
    }
}

impl<K: NativeResource> Default for RcHandle<K> {
    fn default() -> Self {
        Self::null()
    }
}

impl<K: NativeResource> Clone for RcHandle<K> {
    /// Retains the identifier. If the runtime refuses the retain the clone is
    /// null rather than an owner without a reference; use
    /// [`try_clone`](RcHandle::try_clone) to see the failure.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(kind = K::KIND, raw = ?self.raw, error = %e, "retain failed while cloning handle");
                Self::null()
            }
        }
    }
}

impl<K: NativeResource> Drop for RcHandle<K> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<K: NativeResource> fmt::Debug for RcHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcHandle").field("kind", &K::KIND).field("raw", &self.raw).finish()
    }
}

/// Exclusive owner of a native identifier created for a single scope.
///
/// Not `Clone`. Dropping it releases the identifier exactly once.
pub struct Owned<K: NativeResource> {
    raw: K::Raw,
    _kind: PhantomData<fn() -> K>,
}

impl<K: NativeResource> Owned<K> {
    /// Take ownership of a freshly created identifier (one reference, not
    /// retained again).
    ///
    /// `raw` must not be null.
    pub fn from_created(raw: K::Raw) -> Self {
        debug_assert!(raw != K::NULL, "created {} is null", K::KIND);
        Self { raw, _kind: PhantomData }
    }

    pub fn raw(&self) -> K::Raw {
        self.raw
    }

    /// Give up ownership without releasing.
    pub fn into_raw(mut self) -> K::Raw {
        std::mem::replace(&mut self.raw, K::NULL)
    }
}

impl<K: NativeResource> Drop for Owned<K> {
    fn drop(&mut self) {
        if self.raw != K::NULL {
            release_logged::<K>(self.raw);
        }
    }
}

impl<K: NativeResource> fmt::Debug for Owned<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned").field("kind", &K::KIND).field("raw", &self.raw).finish()
    }
}

fn release_logged<K: NativeResource>(raw: K::Raw) {
    if let Err(e) = K::release(raw) {
        warn!(kind = K::KIND, raw = ?raw, error = %e, "release failed");
    }
}
