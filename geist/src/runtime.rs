use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{ObjectId, RefError, Value, WeakRef};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Which notification class an object supports for destruction observers.
///
/// Direct observers run the instant the object is destroyed. Indirect
/// observers only run as a side effect of a collection pass noticing the
/// object is unreachable, so their view can be stale between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Direct,
    Indirect,
}

/// Handle for one registered finalizer, used to remove exactly that one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizerId(pub u64);

/// Summary of a single collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub destroyed: usize,
    pub finalizers_enqueued: usize,
}

struct ObjectSlot {
    roots: usize,
    emittable: bool,
    /// Synchronous observers, run at the destruction instant.
    trackers: Vec<Callback>,
    /// Queued observers, dispatched by the next processing pass.
    finalizers: Vec<(FinalizerId, Callback)>,
    /// Interned weak reference for this identity, held until destruction.
    weak: Option<WeakRef>,
}

struct RuntimeShared {
    alive: AtomicBool,
    object_gen: AtomicU64,
    finalizer_gen: AtomicU64,
    objects: Mutex<HashMap<ObjectId, ObjectSlot>>,
    /// Finalizers of destroyed objects, awaiting a processing pass.
    pending: Mutex<Vec<Callback>>,
}

/// The host side of the reference layer: an object registry with chained
/// destruction observers, plus the collection and liveness machinery the
/// references consult.
///
/// An object is reachable exactly while at least one [`Rooted`] for it is
/// alive; the host collector's marking machinery has no counterpart here.
/// Handles are cheap clones of one shared state.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

/// RAII strong root for one object.
///
/// Cloning adds a root. Dropping the last root of an emittable object
/// destroys it on the spot; a plain object merely becomes unreachable and
/// is destroyed by the next collection pass.
pub struct Rooted {
    runtime: Runtime,
    value: Value,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                alive: AtomicBool::new(true),
                object_gen: AtomicU64::new(0),
                finalizer_gen: AtomicU64::new(0),
                objects: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Allocate a plain object. Destruction observers on it are indirect.
    pub fn alloc(&self) -> Rooted {
        self.alloc_slot(false)
    }

    /// Allocate an object that supports synchronous destruction
    /// notification. References to it never need a forced pass.
    pub fn alloc_emittable(&self) -> Rooted {
        self.alloc_slot(true)
    }

    fn alloc_slot(&self, emittable: bool) -> Rooted {
        let id =
            ObjectId(self.shared.object_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let slot = ObjectSlot {
            roots: 1,
            emittable,
            trackers: Vec::new(),
            finalizers: Vec::new(),
            weak: None,
        };
        self.shared.objects.lock().insert(id, slot);
        Rooted {
            runtime: self.clone(),
            value: Value::Object(id),
        }
    }

    /// Chain a synchronous destruction observer onto an object and report
    /// the notification class the object supports. Observers registered
    /// here are independent: attaching one never disturbs another.
    pub(crate) fn attach_tracker<F>(
        &self,
        id: ObjectId,
        tracker: F,
    ) -> Result<Affiliation, RefError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut objects = self.shared.objects.lock();
        let slot = objects
            .get_mut(&id)
            .ok_or(RefError::InvalidTarget("destroyed object"))?;
        slot.trackers.push(Arc::new(tracker));
        Ok(if slot.emittable {
            Affiliation::Direct
        } else {
            Affiliation::Indirect
        })
    }

    /// Chain a queued finalizer onto an object. It runs during the first
    /// processing pass after the object is destroyed.
    pub fn define_finalizer<F>(
        &self,
        id: ObjectId,
        finalizer: F,
    ) -> Result<FinalizerId, RefError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut objects = self.shared.objects.lock();
        let slot = objects.get_mut(&id).ok_or(RefError::DeadObject)?;
        let fid = FinalizerId(
            self.shared.finalizer_gen.fetch_add(1, Ordering::Relaxed) + 1,
        );
        slot.finalizers.push((fid, Arc::new(finalizer)));
        Ok(fid)
    }

    /// Remove one queued finalizer. The rest of the chain is untouched.
    pub fn undefine_finalizer(
        &self,
        id: ObjectId,
        fid: FinalizerId,
    ) -> Result<(), RefError> {
        let mut objects = self.shared.objects.lock();
        let slot = objects.get_mut(&id).ok_or(RefError::DeadObject)?;
        let before = slot.finalizers.len();
        slot.finalizers.retain(|(candidate, _)| *candidate != fid);
        if slot.finalizers.len() == before {
            return Err(RefError::UnknownFinalizer);
        }
        Ok(())
    }

    /// Run a full collection pass: every unreachable object is destroyed
    /// before this returns. Trackers run inside the pass; queued
    /// finalizers become pending and run at the next [`Runtime::process`].
    pub fn collect(&self) -> CollectStats {
        let dead: Vec<ObjectId> = {
            let objects = self.shared.objects.lock();
            objects
                .iter()
                .filter(|(_, slot)| slot.roots == 0)
                .map(|(&id, _)| id)
                .collect()
        };

        let mut stats = CollectStats::default();
        for id in dead {
            if let Some(enqueued) = self.destroy(id) {
                stats.destroyed += 1;
                stats.finalizers_enqueued += enqueued;
            }
        }
        if stats.destroyed > 0 {
            debug!(
                "collection pass destroyed {} objects, queued {} finalizers",
                stats.destroyed, stats.finalizers_enqueued
            );
        }
        stats
    }

    /// Drain the pending finalizers of already-destroyed objects. Each runs
    /// exactly once. Returns how many ran. Does not collect.
    pub fn process(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<Callback> = {
                let mut pending = self.shared.pending.lock();
                if pending.is_empty() {
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for finalizer in batch {
                finalizer();
                ran += 1;
            }
        }
        ran
    }

    /// The liveness flag. True from construction until [`Runtime::shutdown`].
    #[inline]
    pub fn alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Begin runtime teardown. The liveness flag drops exactly once and
    /// finalizer dispatch is disabled: pending work is discarded and later
    /// destructions run no observers. Weak references treat every target
    /// as destroyed from here on.
    pub fn shutdown(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            debug!("runtime shutting down, finalizer dispatch disabled");
            self.shared.pending.lock().clear();
            self.shared.objects.lock().clear();
        }
    }

    pub(crate) fn cached_weak(&self, id: ObjectId) -> Option<WeakRef> {
        self.shared
            .objects
            .lock()
            .get(&id)
            .and_then(|slot| slot.weak.clone())
    }

    pub(crate) fn cache_weak(&self, id: ObjectId, weak: WeakRef) {
        if let Some(slot) = self.shared.objects.lock().get_mut(&id) {
            slot.weak = Some(weak);
        }
    }

    fn release_root(&self, id: ObjectId) {
        let destroy_now = {
            let mut objects = self.shared.objects.lock();
            let Some(slot) = objects.get_mut(&id) else {
                return;
            };
            slot.roots = slot.roots.saturating_sub(1);
            slot.roots == 0 && slot.emittable
        };
        if destroy_now {
            self.destroy(id);
        }
    }

    /// Tear down one object: run its trackers on the spot, queue its
    /// finalizers for the next processing pass. Returns the number of
    /// finalizers queued, or `None` if the object was not destroyed.
    fn destroy(&self, id: ObjectId) -> Option<usize> {
        let slot = {
            let mut objects = self.shared.objects.lock();
            match objects.get(&id) {
                Some(slot) if slot.roots == 0 => objects.remove(&id),
                _ => None,
            }
        }?;

        if !self.alive() {
            // teardown is underway, observers must not run anymore
            return Some(0);
        }

        trace!("destroying object {:?}", id);
        // no registry lock is held from here, observers may re-enter
        for tracker in &slot.trackers {
            tracker();
        }
        let enqueued = slot.finalizers.len();
        if enqueued > 0 {
            let mut pending = self.shared.pending.lock();
            pending.extend(slot.finalizers.into_iter().map(|(_, f)| f));
        }
        Some(enqueued)
    }
}

impl Rooted {
    /// The rooted value. Always `Value::Object`.
    #[inline]
    pub fn value(&self) -> Value {
        self.value
    }
}

impl Clone for Rooted {
    fn clone(&self) -> Self {
        if let Some(id) = self.value.as_object() {
            let mut objects = self.runtime.shared.objects.lock();
            if let Some(slot) = objects.get_mut(&id) {
                slot.roots += 1;
            }
        }
        Self {
            runtime: self.runtime.clone(),
            value: self.value,
        }
    }
}

impl Drop for Rooted {
    fn drop(&mut self) {
        if let Some(id) = self.value.as_object() {
            self.runtime.release_root(id);
        }
    }
}
