use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{Affiliation, FinalizerId, RefError, Runtime, Value};

struct WeakRefInner {
    runtime: Runtime,
    /// Cleared exactly once by the tracking observer when the target dies.
    /// There is no resurrection.
    target: Arc<Mutex<Option<Value>>>,
    indirect: bool,
}

/// A handle to an object that does not keep it alive.
///
/// The handle learns about destruction through a tracking observer chained
/// onto the target. For an emittable target that observer runs at the
/// destruction instant and the handle is always exact. For a plain target
/// destruction is only observed inside a collection pass, so the handle is
/// `indirect` and [`WeakRef::object`] forces a pass before answering. If
/// retrieval is frequent, prefer building references for emittables.
///
/// Clones share one tracking state. Building a reference for an identity
/// that already has one returns the existing instance; there is no benefit
/// to duplicates, so the runtime caches the reference on the object itself
/// for as long as the object lives.
///
/// Once the runtime has shut down, destruction notifications no longer
/// arrive and every reference reports its target destroyed, reachable or
/// not.
#[derive(Clone)]
pub struct WeakRef {
    inner: Arc<WeakRefInner>,
}

impl WeakRef {
    /// Build (or reuse) the weak reference for a value.
    ///
    /// Fails for nil and for immediates: they are never allocated, so they
    /// can never be destroyed in the sense this handle tracks. Also fails
    /// for an identity the runtime has already destroyed.
    pub fn new(runtime: &Runtime, value: Value) -> Result<WeakRef, RefError> {
        let Some(id) = value.as_object() else {
            return Err(RefError::InvalidTarget(value.type_name()));
        };
        if let Some(existing) = runtime.cached_weak(id) {
            return Ok(existing);
        }

        let target = Arc::new(Mutex::new(Some(value)));
        let affiliation = {
            let target = Arc::clone(&target);
            runtime.attach_tracker(id, move || {
                *target.lock() = None;
            })?
        };

        let weak = WeakRef {
            inner: Arc::new(WeakRefInner {
                runtime: runtime.clone(),
                target,
                indirect: affiliation == Affiliation::Indirect,
            }),
        };
        runtime.cache_weak(id, weak.clone());
        Ok(weak)
    }

    /// The referenced object, or `None` once it has been destroyed.
    ///
    /// Never fails: a destroyed target degrades to `None`, permanently.
    pub fn object(&self) -> Option<Value> {
        if !self.inner.runtime.alive() {
            // finalizers are no longer executed, so no notification can be
            // trusted; assume the target is gone
            return None;
        }
        self.update();
        *self.inner.target.lock()
    }

    /// Bring the tracking state up to date. A no-op for direct references;
    /// an indirect reference has to force a collection pass, since its
    /// observer only runs inside one.
    pub fn update(&self) {
        if self.inner.indirect {
            self.inner.runtime.collect();
        }
    }

    /// Whether destruction of the target is only observable through a
    /// collection pass. Fixed at construction.
    #[inline]
    pub fn indirect(&self) -> bool {
        self.inner.indirect
    }

    /// Identity equality: do the two handles share one tracking state?
    #[inline]
    pub fn ptr_eq(a: &WeakRef, b: &WeakRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Chain a queued finalizer onto the referenced object.
    ///
    /// A shortcut for resolving the object and registering through the
    /// runtime. Fails if the target is already destroyed: silently skipping
    /// a requested mutation would mislead the caller.
    pub fn define_finalizer<F>(&self, finalizer: F) -> Result<FinalizerId, RefError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let Some(Value::Object(id)) = self.object() else {
            return Err(RefError::DeadObject);
        };
        self.inner.runtime.define_finalizer(id, finalizer)
    }

    /// Remove a queued finalizer from the referenced object.
    ///
    /// Fails with [`RefError::DeadObject`] once the target is destroyed and
    /// with [`RefError::UnknownFinalizer`] for an id that is not registered.
    pub fn undefine_finalizer(&self, fid: FinalizerId) -> Result<(), RefError> {
        let Some(Value::Object(id)) = self.object() else {
            return Err(RefError::DeadObject);
        };
        self.inner.runtime.undefine_finalizer(id, fid)
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("target", &*self.inner.target.lock())
            .field("indirect", &self.inner.indirect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk_counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, bump)
    }

    #[test]
    fn same_identity_reuses_the_cached_reference() {
        let rt = Runtime::new();
        let obj = rt.alloc();

        let r1 = WeakRef::new(&rt, obj.value()).unwrap();
        let r2 = WeakRef::new(&rt, obj.value()).unwrap();
        assert!(WeakRef::ptr_eq(&r1, &r2));
    }

    #[test]
    fn distinct_identities_get_distinct_references() {
        let rt = Runtime::new();
        let a = rt.alloc();
        let b = rt.alloc();

        let ra = WeakRef::new(&rt, a.value()).unwrap();
        let rb = WeakRef::new(&rt, b.value()).unwrap();
        assert!(!WeakRef::ptr_eq(&ra, &rb));
    }

    #[test]
    fn unretained_references_survive_collection() {
        let rt = Runtime::new();
        let obj = rt.alloc();

        // don't hold the reference; the slot cache keeps it alive and a
        // pass over the still-rooted object must not disturb it
        WeakRef::new(&rt, obj.value()).unwrap();
        rt.collect();

        let r = WeakRef::new(&rt, obj.value()).unwrap();
        assert_eq!(r.object(), Some(obj.value()));
    }

    #[test]
    fn immediates_are_rejected() {
        let rt = Runtime::new();
        assert_eq!(
            WeakRef::new(&rt, Value::Nil).unwrap_err(),
            RefError::InvalidTarget("nil")
        );
        assert_eq!(
            WeakRef::new(&rt, Value::Bool(true)).unwrap_err(),
            RefError::InvalidTarget("boolean")
        );
        assert_eq!(
            WeakRef::new(&rt, Value::Fixnum(2)).unwrap_err(),
            RefError::InvalidTarget("fixnum")
        );
    }

    #[test]
    fn classification_follows_the_target() {
        let rt = Runtime::new();
        let plain = rt.alloc();
        let emittable = rt.alloc_emittable();

        assert!(WeakRef::new(&rt, plain.value()).unwrap().indirect());
        assert!(!WeakRef::new(&rt, emittable.value()).unwrap().indirect());
    }

    #[test]
    fn rooted_target_resolves_to_its_value() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        rt.collect();
        rt.collect();
        assert_eq!(r.object(), Some(obj.value()));
    }

    #[test]
    fn indirect_reference_notices_destruction_by_itself() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        drop(obj);
        // no explicit pass: object() forces one for indirect references
        assert_eq!(r.object(), None);
        assert_eq!(r.object(), None, "destruction is permanent");
    }

    #[test]
    fn direct_reference_notices_destruction_without_a_pass() {
        let rt = Runtime::new();
        let obj = rt.alloc_emittable();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        assert_eq!(r.object(), Some(obj.value()));
        drop(obj);
        assert_eq!(r.object(), None);
    }

    #[test]
    fn update_refreshes_an_indirect_reference() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        drop(obj);
        r.update();
        assert_eq!(*r.inner.target.lock(), None);
    }

    #[test]
    fn shutdown_blinds_every_reference() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let emittable = rt.alloc_emittable();
        let r = WeakRef::new(&rt, obj.value()).unwrap();
        let re = WeakRef::new(&rt, emittable.value()).unwrap();

        rt.shutdown();
        assert_eq!(r.object(), None);
        assert_eq!(re.object(), None);
    }

    #[test]
    fn defined_finalizers_run_once_after_destruction() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        let (count, bump) = mk_counter();
        r.define_finalizer(bump).unwrap();

        drop(obj);
        rt.collect();
        rt.process();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        rt.process();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undefined_finalizer_does_not_run() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        let (count1, bump1) = mk_counter();
        let (count2, bump2) = mk_counter();
        let first = r.define_finalizer(bump1).unwrap();
        r.define_finalizer(bump2).unwrap();
        r.undefine_finalizer(first).unwrap();

        drop(obj);
        rt.collect();
        rt.process();
        assert_eq!(count1.load(Ordering::SeqCst), 0);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dead_object_mutation_is_always_rejected() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();
        let fid = r.define_finalizer(|| ()).unwrap();

        drop(obj);
        rt.collect();

        // rejected every time, not just the first
        assert_eq!(r.define_finalizer(|| ()), Err(RefError::DeadObject));
        assert_eq!(r.define_finalizer(|| ()), Err(RefError::DeadObject));
        assert_eq!(r.undefine_finalizer(fid), Err(RefError::DeadObject));
        assert_eq!(r.undefine_finalizer(fid), Err(RefError::DeadObject));
    }

    #[test]
    fn unknown_finalizer_removal_is_rejected() {
        let rt = Runtime::new();
        let obj = rt.alloc();
        let r = WeakRef::new(&rt, obj.value()).unwrap();

        let fid = r.define_finalizer(|| ()).unwrap();
        r.undefine_finalizer(fid).unwrap();
        assert_eq!(r.undefine_finalizer(fid), Err(RefError::UnknownFinalizer));
    }
}
