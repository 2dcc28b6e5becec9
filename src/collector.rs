//! Mark-and-sweep garbage collection.
//!
//! Every heap instance lives in a slot of the collector's arena, paired
//! with the [`Class`] handler that knows how to trace and dispose it.
//! Collection is a full cycle: stamp-based marking from the roots the
//! caller supplies (context stacks, global tables) plus all locked slots,
//! then a sweep that disposes every unmarked slot. Tracing is the sole
//! correctness mechanism; tokens carry no reference counts, so reference
//! cycles are reclaimed like anything else.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::class::Class;
use crate::item::Item;

/// Objects per chunk. Chunks never reallocate, so slot addresses are
/// stable for the lifetime of the arena.
const CHUNK_CAPACITY: usize = 256;

/// Default net-allocation threshold before a cycle is suggested.
const DEFAULT_THRESHOLD: usize = 128;

// ============================================================================
// Slot - storage for one heap instance
// ============================================================================

struct Slot {
    /// Linear index (chunk * CHUNK_CAPACITY + offset); doubles as identity.
    index: usize,

    /// Handler class, present while the slot is live.
    class: RefCell<Option<Rc<dyn Class>>>,

    /// Opaque payload, present while the slot is live.
    data: RefCell<Option<Box<dyn Any>>>,

    /// Generation stamp of the last cycle that marked this slot.
    mark: Cell<u32>,

    /// Generation the slot must survive to: newborns are stamped into the
    /// next cycle so whatever just allocated them can root them first.
    birth: Cell<u32>,

    /// Pin count. A locked slot survives every cycle regardless of
    /// reachability.
    locks: Cell<u32>,

    /// Whether the slot currently holds an instance.
    live: Cell<bool>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            class: RefCell::new(None),
            data: RefCell::new(None),
            mark: Cell::new(0),
            birth: Cell::new(0),
            locks: Cell::new(0),
            live: Cell::new(false),
        }
    }
}

// ============================================================================
// GcToken - copyable handle to a slot
// ============================================================================

/// Handle to a collector-managed instance.
///
/// Tokens are plain handles: cloning one does not keep the instance alive.
/// An instance survives collection only while it is reachable from a root
/// or pinned through [`GcLock`].
pub struct GcToken {
    index: usize,
    ptr: NonNull<Slot>,
    arena: Weak<RefCell<Arena>>,
}

impl Clone for GcToken {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            ptr: self.ptr,
            arena: self.arena.clone(),
        }
    }
}

impl GcToken {
    /// Slot index; unique among live instances of one collector.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity: same slot of the same collector.
    pub fn same(&self, other: &GcToken) -> bool {
        self.index == other.index && Weak::ptr_eq(&self.arena, &other.arena)
    }

    /// Whether the slot still holds a live instance.
    pub fn is_alive(&self) -> bool {
        if self.arena.upgrade().is_none() {
            return false;
        }
        // Safety: arena alive implies chunk storage (and this slot) is alive.
        unsafe { self.ptr.as_ref() }.live.get()
    }

    /// Borrow the payload, downcast to its concrete type.
    ///
    /// Returns `None` if the collector is gone, the instance was
    /// reclaimed, or the payload has a different type.
    pub fn data<T: 'static>(&self) -> Option<Ref<'_, T>> {
        self.arena.upgrade()?;
        // Safety: arena alive implies the slot is alive.
        let slot = unsafe { self.ptr.as_ref() };
        Ref::filter_map(slot.data.borrow(), |d| {
            d.as_deref()?.downcast_ref::<T>()
        })
        .ok()
    }

    /// Mutably borrow the payload, downcast to its concrete type.
    pub fn data_mut<T: 'static>(&self) -> Option<RefMut<'_, T>> {
        self.arena.upgrade()?;
        // Safety: arena alive implies the slot is alive.
        let slot = unsafe { self.ptr.as_ref() };
        RefMut::filter_map(slot.data.borrow_mut(), |d| {
            d.as_deref_mut()?.downcast_mut::<T>()
        })
        .ok()
    }
}

impl std::fmt::Debug for GcToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcToken").field("index", &self.index).finish()
    }
}

// ============================================================================
// GcLock - explicit pin
// ============================================================================

/// Pin handle returned by [`Collector::lock`].
///
/// A locked instance survives any later collection even if nothing on a
/// stack references it. This is the mechanism for native code holding a raw
/// reference across operations that might collect. Locks are released
/// explicitly through [`Collector::unlock`]; dropping the handle does NOT
/// release the pin. That is a documented responsibility of the caller.
#[derive(Debug)]
pub struct GcLock {
    token: GcToken,
}

impl GcLock {
    /// The pinned instance.
    pub fn token(&self) -> &GcToken {
        &self.token
    }
}

// ============================================================================
// Marker - mark-phase cursor handed to Class::gc_mark
// ============================================================================

/// Mark-phase cursor. Class handlers forward every item their payload
/// references to [`Marker::mark`]; the collector drains the worklist
/// iteratively, so arbitrarily deep object graphs never recurse natively.
pub struct Marker<'a> {
    generation: u32,
    worklist: &'a mut Vec<(Rc<dyn Class>, NonNull<Slot>)>,
    marked: usize,
}

impl Marker<'_> {
    /// Mark one item. Scalars are ignored; instances are stamped with the
    /// current generation and queued for tracing unless already stamped
    /// this cycle. The stamp check is what makes reference cycles safe.
    pub fn mark(&mut self, item: &Item) {
        match item {
            Item::Instance(inst) => {
                // Safety: tokens handed to the marker come from this arena,
                // whose chunks are alive for the duration of the cycle.
                let slot = unsafe { inst.token.ptr.as_ref() };
                if !slot.live.get() || slot.mark.get() == self.generation {
                    return;
                }
                slot.mark.set(self.generation);
                self.marked += 1;
                self.worklist.push((inst.class.clone(), inst.token.ptr));
            }
            Item::Method(m) => {
                self.mark(&m.receiver);
            }
            // Scalars and plain functions hold no heap references.
            _ => {}
        }
    }
}

// ============================================================================
// Arena - the slot store
// ============================================================================

struct Arena {
    /// Chunks of slots. Inner vecs never reallocate, keeping addresses
    /// stable.
    chunks: Vec<Vec<Slot>>,

    /// Reclaimed slots available for reuse.
    free_list: Vec<NonNull<Slot>>,

    /// Persistent mark worklist, reused between cycles to avoid
    /// reallocating it every collection.
    worklist: Vec<(Rc<dyn Class>, NonNull<Slot>)>,

    /// Completed-cycle counter; the stamp for the current mark phase.
    generation: u32,

    /// Allocations minus reclamations since the last cycle.
    net_allocs: isize,

    /// Net-allocation count that suggests a cycle (0 disables).
    threshold: isize,
}

impl Arena {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free_list: Vec::new(),
            worklist: Vec::new(),
            generation: 0,
            net_allocs: 0,
            threshold: DEFAULT_THRESHOLD as isize,
        }
    }

    fn alloc_slot(&mut self) -> NonNull<Slot> {
        if let Some(ptr) = self.free_list.pop() {
            return ptr;
        }

        let need_new_chunk = self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() >= CHUNK_CAPACITY);
        if need_new_chunk {
            self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
        }

        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let index = chunk_idx * CHUNK_CAPACITY + chunk.len();
        chunk.push(Slot::new(index));
        NonNull::from(&chunk[index % CHUNK_CAPACITY])
    }

    fn live_slots(&self) -> impl Iterator<Item = &Slot> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .filter(|slot| slot.live.get())
    }
}

// ============================================================================
// Collector - the public face
// ============================================================================

/// Statistics about the collector's arena.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GcStats {
    /// Total slots ever created (live + reusable).
    pub total_slots: usize,
    /// Slots currently holding instances.
    pub live: usize,
    /// Slots on the free list.
    pub free: usize,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CycleStats {
    /// Instances marked reachable.
    pub marked: usize,
    /// Instances disposed and reclaimed.
    pub swept: usize,
}

/// The tracing collector. Owns every heap instance the runtime allocates.
pub struct Collector {
    inner: Rc<RefCell<Arena>>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Arena::new())),
        }
    }

    /// Register a new instance. The newborn is stamped into the next
    /// generation, so it survives at least one full cycle even before any
    /// root references it.
    pub fn allocate(&self, class: Rc<dyn Class>, data: Box<dyn Any>) -> GcToken {
        let mut arena = self.inner.borrow_mut();
        let ptr = arena.alloc_slot();
        let next_generation = arena.generation + 1;
        arena.net_allocs += 1;
        drop(arena);

        // Safety: chunk storage is stable and alive while the arena is.
        let slot = unsafe { ptr.as_ref() };
        *slot.class.borrow_mut() = Some(class);
        *slot.data.borrow_mut() = Some(data);
        slot.mark.set(0);
        slot.birth.set(next_generation);
        slot.locks.set(0);
        slot.live.set(true);

        GcToken {
            index: slot.index,
            ptr,
            arena: Rc::downgrade(&self.inner),
        }
    }

    /// Pin an instance so it survives later collections regardless of
    /// reachability. Scalar items have nothing to pin and return `None`.
    pub fn lock(&self, item: &Item) -> Option<GcLock> {
        let inst = item.as_instance()?;
        // Safety: the token's slot is alive while the arena is.
        let slot = unsafe { inst.token.ptr.as_ref() };
        if !slot.live.get() {
            return None;
        }
        slot.locks.set(slot.locks.get() + 1);
        Some(GcLock {
            token: inst.token.clone(),
        })
    }

    /// Release a pin taken with [`Collector::lock`].
    pub fn unlock(&self, lock: GcLock) {
        // Safety: the token's slot is alive while the arena is.
        let slot = unsafe { lock.token.ptr.as_ref() };
        let locks = slot.locks.get();
        if locks > 0 {
            slot.locks.set(locks - 1);
        }
    }

    /// Whether enough net allocation happened since the last cycle to
    /// suggest one. The runtime polls this at step boundaries, where every
    /// stack is in a consistent state.
    pub fn should_collect(&self) -> bool {
        let arena = self.inner.borrow();
        arena.threshold > 0 && arena.net_allocs >= arena.threshold
    }

    /// Set the net-allocation threshold (0 disables automatic cycles).
    pub fn set_threshold(&self, threshold: usize) {
        self.inner.borrow_mut().threshold = threshold as isize;
    }

    /// Run one full mark-and-sweep cycle.
    ///
    /// Roots are the items supplied by the caller (context stacks and
    /// global tables) plus every locked slot. Returns how much was marked
    /// and swept.
    pub fn collect<'a>(&self, roots: impl IntoIterator<Item = &'a Item>) -> CycleStats {
        let mut arena = self.inner.borrow_mut();
        arena.generation += 1;
        let generation = arena.generation;

        // Take the persistent worklist to sidestep the split borrow; its
        // capacity is preserved across cycles.
        let mut worklist = std::mem::take(&mut arena.worklist);
        worklist.clear();

        let mut marker = Marker {
            generation,
            worklist: &mut worklist,
            marked: 0,
        };

        for item in roots {
            marker.mark(item);
        }

        // Locked slots are roots too.
        for slot in arena.live_slots() {
            if slot.locks.get() > 0 && slot.mark.get() != generation {
                slot.mark.set(generation);
                marker.marked += 1;
                marker.worklist.push((
                    slot.class
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| unreachable_class()),
                    NonNull::from(slot),
                ));
            }
        }

        // Trace iteratively until the worklist drains.
        while let Some((class, ptr)) = marker.worklist.pop() {
            // Safety: queued pointers come from live slots of this arena.
            let slot = unsafe { ptr.as_ref() };
            let data = slot.data.borrow();
            if let Some(d) = data.as_deref() {
                class.gc_mark(d, &mut marker);
            }
        }
        let marked = marker.marked;

        // Sweep: reclaim every live, unlocked slot that neither the mark
        // phase reached nor the newborn grace protects.
        let mut disposal: Vec<(Rc<dyn Class>, Box<dyn Any>)> = Vec::new();
        let mut freed: Vec<NonNull<Slot>> = Vec::new();
        for slot in arena.live_slots() {
            if slot.locks.get() > 0 {
                continue;
            }
            if slot.mark.get() == generation || slot.birth.get() == generation {
                continue;
            }
            let class = slot.class.borrow_mut().take();
            let data = slot.data.borrow_mut().take();
            slot.live.set(false);
            if let (Some(class), Some(data)) = (class, data) {
                disposal.push((class, data));
            }
            freed.push(NonNull::from(slot));
        }
        let swept = freed.len();
        arena.net_allocs = 0;
        arena.free_list.extend(freed);
        arena.worklist = worklist;
        drop(arena);

        // Dispose outside the arena borrow: payloads may hold tokens whose
        // drops must not observe a locked arena.
        for (class, data) in disposal {
            class.dispose(data);
        }

        debug!(generation, marked, swept, "collection cycle");
        CycleStats { marked, swept }
    }

    /// Arena statistics.
    pub fn stats(&self) -> GcStats {
        let arena = self.inner.borrow();
        let total_slots: usize = arena.chunks.iter().map(|c| c.len()).sum();
        let free = arena.free_list.len();
        GcStats {
            total_slots,
            live: total_slots - free,
            free,
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Collector {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Placeholder handler for the impossible live-slot-without-class state.
fn unreachable_class() -> Rc<dyn Class> {
    struct Hollow;
    impl Class for Hollow {
        fn name(&self) -> &'static str {
            "hollow"
        }
    }
    debug_assert!(false, "live slot without a class");
    Rc::new(Hollow)
}

// ============================================================================
// Tests
// ============================================================================
