//! The abstract schedulable unit.
//!
//! A [`Work`] header sits at offset 0 of every schedulable allocation and
//! carries the three things the engine needs to coordinate it: the
//! graph-unique id, an intrusive reference count, and the packed `next`
//! word. The pointer bits of `next` link the work into the graph's intake
//! queue (null when unqueued); the LSB is the exclusion flag that serialises
//! evaluation and downstream-list mutation.

use crate::{
    graph::{Graph, WorkState},
    sync::{fence, AtomicUsize, Ordering},
    types::WorkId,
};
use core::{fmt, ptr::NonNull};

/// The exclusion-flag bit packed into the LSB of a work's `next` word.
///
/// Work allocations are word-aligned, so the bit is never part of a real
/// queue pointer.
pub(crate) const LOCK: usize = 1;

/// Type-erased entry points of a concrete work allocation.
#[derive(Debug)]
pub(crate) struct VTable {
    /// Run the work. `work` is the header embedded at offset 0 of the
    /// allocation.
    pub(crate) eval: unsafe fn(NonNull<Work>, &mut WorkState<'_>),
    /// Deallocate the containing allocation once the refcount reaches zero.
    pub(crate) drop: unsafe fn(NonNull<Work>),
}

static SENTINEL_VTABLE: VTable = VTable {
    eval: sentinel_eval,
    drop: sentinel_drop,
};

unsafe fn sentinel_eval(_: NonNull<Work>, _: &mut WorkState<'_>) {
    unreachable!("the intake-queue sentinel is never evaluated");
}

unsafe fn sentinel_drop(_: NonNull<Work>) {
    unreachable!("the intake-queue sentinel is never refcounted to zero");
}

/// Header shared by everything the evaluation loop can run.
pub(crate) struct Work {
    /// Unique within the creating graph; drives heap ordering.
    pub(crate) id: WorkId,
    refcount: AtomicUsize,
    /// Intrusive queue link. The pointer bits aim at the next queued work
    /// (or the graph sentinel); the LSB is the exclusion flag. The flag
    /// refers to the work containing this word, not the work pointed to.
    next: AtomicUsize,
    pub(crate) vtable: &'static VTable,
}

impl Work {
    /// A header with one outstanding reference, owned by the caller.
    pub(crate) fn new(id: WorkId, vtable: &'static VTable) -> Self {
        Self {
            id,
            refcount: AtomicUsize::new(1),
            next: AtomicUsize::new(0),
            vtable,
        }
    }

    /// The fixed queue tail. Never evaluated; the refcount only keeps the
    /// drop entry point from ever running.
    pub(crate) fn sentinel() -> Self {
        Self::new(0, &SENTINEL_VTABLE)
    }

    /// Take one reference.
    pub(crate) fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, deallocating through the vtable when the count
    /// hits zero.
    ///
    /// # Safety
    /// The caller must own one reference and must not touch `work` afterwards.
    pub(crate) unsafe fn decref(work: NonNull<Work>) {
        let shared = unsafe { work.as_ref() };
        if shared.refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let drop_fn = shared.vtable.drop;
            unsafe { drop_fn(work) };
        }
    }

    /// The pointer bits of the `next` word: the next work on the intake
    /// queue, or null if this work is not queued.
    pub(crate) fn next_ptr(&self) -> *const Work {
        (self.next.load(Ordering::Acquire) & !LOCK) as *const Work
    }

    /// Try to acquire the exclusion flag. Not re-entrant.
    ///
    /// Returns `true` iff the flag was acquired; never blocks.
    pub(crate) fn trylock(&self) -> bool {
        self.next.fetch_or(LOCK, Ordering::Acquire) & LOCK == 0
    }

    /// As [`trylock`](Self::trylock), but also clears the pointer bits,
    /// removing this work from the intake queue in the same atomic step
    /// (regardless of whether the flag was acquired).
    pub(crate) fn trylock_and_dequeue(&self) -> bool {
        self.next.swap(LOCK, Ordering::Acquire) & LOCK == 0
    }

    /// Release the exclusion flag, keeping the queue link intact.
    ///
    /// Only call while holding the flag.
    pub(crate) fn release(&self) {
        self.next.fetch_and(!LOCK, Ordering::Release);
    }

    /// Reset the queue link. Graph teardown only: requires that no pass is
    /// in flight.
    pub(crate) fn clear_next(&self) {
        self.next.store(0, Ordering::Release);
    }

    /// Idempotent insertion into `graph`'s intake queue.
    ///
    /// Never fails; spin-retries on contention. The already-queued
    /// short-circuit runs only on the first loop iteration: after a failed
    /// head CAS our pointer bits are non-null by construction, and a
    /// concurrent drain-and-requeue must not be mistaken for "already
    /// queued".
    pub(crate) fn schedule(&self, graph: &Graph) {
        // The queue's reference; keeps the work alive while linked.
        self.incref();

        let mut first_attempt = true;
        loop {
            let current = self.next.load(Ordering::Acquire);
            if first_attempt && current & !LOCK != 0 {
                // Already linked into the queue; the pending pass will read
                // the freshly stored inputs anyway.
                // SAFETY: the queue itself holds a reference, so this release
                // cannot be the last one.
                unsafe { Work::decref(NonNull::from(self)) };
                return;
            }

            // Aim our link at the current head, preserving the flag bit.
            let head = graph.queue_head();
            if self
                .next
                .compare_exchange_weak(
                    current,
                    head | (current & LOCK),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            if graph.cas_queue_head(head, self as *const Work as usize) {
                log::trace!("work {} scheduled", self.id);
                return;
            }

            // The head moved after we linked to it; retry with the
            // short-circuit disabled.
            first_attempt = false;
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Owning, refcounted handle to a work.
///
/// Held by [`Input`](crate::input::Input)s so that a slot pointer into a
/// node stays valid for as long as any input aimed at it exists.
#[derive(Debug)]
pub(crate) struct WorkHandle(NonNull<Work>);

impl WorkHandle {
    /// Take a new reference on `work`.
    ///
    /// # Safety
    /// `work` must point at a live work header.
    pub(crate) unsafe fn new(work: NonNull<Work>) -> Self {
        unsafe { work.as_ref() }.incref();
        Self(work)
    }

    pub(crate) fn raw(&self) -> NonNull<Work> {
        self.0
    }

    pub(crate) fn schedule(&self, graph: &Graph) {
        // SAFETY: this handle owns a reference.
        unsafe { self.0.as_ref() }.schedule(graph);
    }
}

impl Clone for WorkHandle {
    fn clone(&self) -> Self {
        // SAFETY: this handle owns a reference, so the header is live.
        unsafe { Self::new(self.0) }
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        // SAFETY: this handle owns exactly one reference.
        unsafe { Work::decref(self.0) };
    }
}

// SAFETY: the handle is an owning reference to a `Send + Sync` allocation;
// the raw pointer is only an ownership artefact.
unsafe impl Send for WorkHandle {}
unsafe impl Sync for WorkHandle {}
