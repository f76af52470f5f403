//! Graph-wide state and the evaluation loop.
//!
//! A [`Graph`] owns the work-id counter and the head of the intake queue: a
//! lock-free, LIFO-on-insert, drain-all-on-pop intrusive list of works
//! awaiting the next pass. [`Graph::evaluate`] swaps the whole list out
//! atomically, orders it by id in a min-heap, and runs each work once,
//! re-admitting anything triggered mid-pass either into the same heap (if
//! topological order can still be honoured) or back onto the queue for the
//! next pass.

use crate::{
    sync::{yield_now, AtomicBool, AtomicU32, AtomicUsize, Ordering},
    types::WorkId,
    work::Work,
};
use core::{cmp, fmt, ptr::NonNull};
use derive_more::Display;
use std::collections::BinaryHeap;

/// Statistics for a single evaluation pass.
///
/// Zeroed at pass start, filled in by [`Graph::evaluate`].
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq)]
#[display(
    "queued: {queued}, worked: {worked}, duplicates: {duplicates}, \
     pushed_graph: {pushed_graph}, pushed_heap: {pushed_heap}"
)]
pub struct Stats {
    /// Work items drained from the intake queue at pass start.
    pub queued: u32,
    /// Work items that went through `eval`.
    pub worked: u32,
    /// Heap entries merged because they named a work already popped this
    /// pass (the work depended on more than one triggered upstream).
    pub duplicates: u32,
    /// Dependencies pushed back onto the graph's intake queue, to be
    /// evaluated next pass.
    pub pushed_graph: u32,
    /// Dependencies admitted to this pass's heap, to be evaluated in
    /// topological order later in the same pass.
    pub pushed_heap: u32,
}

/// Heap entry owning one reference to its work. Ordering is reversed so
/// `BinaryHeap` pops the minimum id first.
struct Queued(NonNull<Work>);

impl Queued {
    fn id(&self) -> WorkId {
        // SAFETY: every heap entry owns a reference to its work.
        unsafe { self.0.as_ref() }.id
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other.id().cmp(&self.id())
    }
}

/// Per-pass state: the id-ordered heap of admitted works and the cursor the
/// admission rule compares against.
pub(crate) struct WorkState<'graph> {
    heap: BinaryHeap<Queued>,
    graph: &'graph Graph,
    /// Id of the work currently being evaluated.
    current_id: WorkId,
    stats: Stats,
}

impl WorkState<'_> {
    /// Admit `work`, triggered from within an `eval`, either to this pass's
    /// heap or to the graph's intake queue for the next pass.
    ///
    /// The comparison is `<=`, not `<`: a work that bounced off its own
    /// exclusion flag has `id == current_id` and must go back on the graph
    /// queue, and the same rule routes self-loops there, which is what lets
    /// cyclic graphs converge across successive passes.
    pub(crate) fn add_to_queue(&mut self, work: NonNull<Work>) {
        // SAFETY: the caller holds a reference (an input's work handle, or
        // the work itself mid-eval).
        let shared = unsafe { work.as_ref() };
        if shared.id <= self.current_id {
            shared.schedule(self.graph);
            self.stats.pushed_graph += 1;
        } else {
            // The heap entry gets its own reference, released after the work
            // is popped and evaluated.
            shared.incref();
            self.heap.push(Queued(work));
            self.stats.pushed_heap += 1;
        }
    }
}

/// The calculation-graph-wide state.
///
/// The only way to make nodes (see [`Graph::node`](crate::node)) and the
/// owner of the intake queue. All methods take `&self`; any number of
/// producer threads may schedule work while any number of evaluator threads
/// run passes.
#[must_use]
pub struct Graph {
    /// Source of work ids; the next id to hand out.
    ids: AtomicU32,
    /// Head of the intake queue, as a packed `*const Work`.
    head: AtomicUsize,
    /// The fixed tail of the intake queue, id 0. Boxed so the `Graph` value
    /// itself may move while queued works point at the sentinel.
    sentinel: Box<Work>,
}

impl Graph {
    /// A fresh graph: id counter at 1, empty intake queue.
    pub fn new() -> Self {
        let sentinel = Box::new(Work::sentinel());
        let head = AtomicUsize::new(&*sentinel as *const Work as usize);
        Self {
            ids: AtomicU32::new(1),
            head,
            sentinel,
        }
    }

    pub(crate) fn next_id(&self) -> WorkId {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn sentinel_addr(&self) -> usize {
        &*self.sentinel as *const Work as usize
    }

    pub(crate) fn queue_head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn cas_queue_head(&self, expected: usize, new: usize) -> bool {
        self.head
            .compare_exchange_weak(expected, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Run one evaluation pass: drain the intake queue and evaluate the
    /// drained works, and everything they trigger downstream, in increasing
    /// id order.
    ///
    /// Returns `true` iff any work was performed. `stats`, when given, is
    /// zeroed first and receives this pass's counters.
    pub fn evaluate(&self, mut stats: Option<&mut Stats>) -> bool {
        if let Some(stats) = stats.as_deref_mut() {
            *stats = Stats::default();
        }

        let sentinel = self.sentinel_addr();
        let head = self.head.swap(sentinel, Ordering::AcqRel);
        if head == sentinel {
            return false;
        }

        let mut state = WorkState {
            heap: BinaryHeap::new(),
            graph: self,
            current_id: 0,
            stats: Stats::default(),
        };

        // Drain the snapshot into the heap before evaluating anything: eval
        // resets next pointers, so the walk must complete first.
        let mut cursor = head;
        while cursor != sentinel {
            // SAFETY: every link in the drained snapshot carries the
            // reference taken by `schedule`; the reference now belongs to
            // the heap entry.
            let work = unsafe { &*(cursor as *const Work) };
            let next = work.next_ptr() as usize;
            state.heap.push(Queued(NonNull::from(work)));
            state.stats.queued += 1;
            cursor = next;
        }

        while let Some(Queued(work)) = state.heap.pop() {
            // SAFETY: the popped entry owns a reference.
            let id = unsafe { work.as_ref() }.id;

            // Merge duplicate admissions; the work only needs to run once.
            while state.heap.peek().is_some_and(|entry| entry.id() == id) {
                if let Some(Queued(duplicate)) = state.heap.pop() {
                    // SAFETY: each entry owns its own reference.
                    unsafe { Work::decref(duplicate) };
                    state.stats.duplicates += 1;
                }
            }

            state.current_id = id;
            let eval = unsafe { work.as_ref() }.vtable.eval;
            // SAFETY: `work` is the header of a live allocation constructed
            // with this vtable.
            unsafe { eval(work, &mut state) };
            state.stats.worked += 1;

            // The work is now off both the queue and the heap.
            // SAFETY: releases the reference the heap entry owned.
            unsafe { Work::decref(work) };
        }

        log::trace!("pass finished: {}", state.stats);
        if let Some(stats) = stats {
            *stats = state.stats;
        }
        true
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph").finish_non_exhaustive()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // Release the queue's references so works still pending at teardown
        // are reclaimed instead of leaked. No pass can be in flight: callers
        // cannot hold `&self` across the drop.
        let sentinel = self.sentinel_addr();
        let mut cursor = self.head.swap(sentinel, Ordering::AcqRel);
        while cursor != sentinel {
            // SAFETY: each link carries the reference taken by `schedule`.
            let work = unsafe { NonNull::new_unchecked(cursor as *mut Work) };
            let shared = unsafe { work.as_ref() };
            cursor = shared.next_ptr() as usize;
            shared.clear_next();
            unsafe { Work::decref(work) };
        }
    }
}

/// Repeatedly evaluate `graph`'s intake queue until `stop` is set.
///
/// Evaluates in a busy loop, yielding only when a pass finds no work, so
/// producers never pay for waking a sleeping evaluator. Cancellation is
/// cooperative: the loop exits the next time it sees the queue empty after
/// `stop` becomes `true`; an in-flight pass always runs to completion.
pub fn evaluate_repeatedly(graph: &Graph, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        while graph.evaluate(None) {}
        yield_now();
    }
}
