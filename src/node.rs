//! Nodes: concrete work items binding a pure function to a fixed arity of
//! typed input slots, plus the propagation policies deciding when a freshly
//! computed result fires downstream.
//!
//! The arity machinery ([`Inputs`], [`HasInput`], [`NodeFn`], [`Upstreams`])
//! mirrors, per tuple size, what the function signature fixes at compile
//! time: one [`Value`] slot per argument, one upstream connectable per slot,
//! and a statically typed call through the slots. Dispatch is entirely
//! static; the evaluation loop reaches a node through the type-erased entry
//! points recorded in its embedded work header.

use crate::{
    graph::{Graph, WorkState},
    input::{connect, Connectable, Input},
    sync::yield_now,
    types::WorkId,
    value::{Datum, Value},
    work::{VTable, Work, WorkHandle},
};
use core::{cell::UnsafeCell, fmt, ops::Deref, ptr::NonNull};
use derive_more::Debug;

/// Interior mutability for the downstream list, which has no lock of its
/// own: the owning work's exclusion flag decides who may touch the contents.
/// Because the flag serialises all access, the cell can promise `Sync`
/// whenever the list itself is.
struct FlagCell<T> {
    list: UnsafeCell<T>,
}

unsafe impl<T: Sync> Sync for FlagCell<T> {}

impl<T> FlagCell<T> {
    fn new(list: T) -> Self {
        Self {
            list: UnsafeCell::new(list),
        }
    }

    /// Raw access; the caller must hold the owning work's exclusion flag.
    fn get(&self) -> *mut T {
        self.list.get()
    }
}

/// Per-node predicate deciding whether a freshly computed result is stored
/// into downstream inputs and their nodes scheduled.
pub trait Propagation<R: Datum>: Send + Sync + 'static {
    /// `true` iff `latest` should propagate downstream.
    fn propagate(&self, latest: &R) -> bool;
}

/// Always recalculate downstream dependents.
#[derive(Debug, Default, Clone, Copy)]
pub struct Always;

impl<R: Datum> Propagation<R> for Always {
    fn propagate(&self, _latest: &R) -> bool {
        true
    }
}

/// Recalculate downstream dependents only when the node's output changes.
///
/// Holds the last result in a [`Value`] cell and swaps it on every
/// evaluation, so an error value (or any repeated value) propagates exactly
/// once until it changes again. Runs only while the owning node's exclusion
/// flag is held, so it needs no thread-safety against itself.
#[derive(Default)]
pub struct OnChange<R: Datum> {
    last: Value<R>,
}

impl<R: Datum + PartialEq> Propagation<R> for OnChange<R> {
    fn propagate(&self, latest: &R) -> bool {
        self.last.exchange(latest.clone()) != *latest
    }
}

/// A tuple of argument types accepted by a node function.
///
/// Implemented for tuples of [`Datum`] up to arity 8.
pub trait Inputs: 'static {
    /// The matching tuple of value slots embedded in the node.
    type Slots: Default + Send + Sync;
}

/// Access to the `N`-th argument of an [`Inputs`] tuple.
pub trait HasInput<const N: usize>: Inputs {
    /// The `N`-th argument type.
    type At: Datum;

    fn slot(slots: &Self::Slots) -> &Value<Self::At>;
}

/// A function evaluable over a tuple of input slots.
///
/// Blanket-implemented for `Fn` closures and function pointers whose
/// arguments are [`Datum`], up to arity 8.
pub trait NodeFn<A: Inputs>: Send + Sync + 'static {
    /// The result type, and thus the type downstream inputs must accept.
    type Output: Datum;

    /// Read every slot once and apply the function.
    ///
    /// The reads are independent; they do not form a consistent snapshot
    /// across slots.
    fn call(&self, slots: &A::Slots) -> Self::Output;
}

/// The tuple of upstream connectables supplied at node construction: one
/// `Option<&dyn Connectable<_>>` per argument, in order.
pub trait Upstreams<'a> {
    /// Argument types of the node being wired.
    type Args: Inputs;

    fn connect_to<F, R, P>(self, node: &Node<F, Self::Args, P>)
    where
        F: NodeFn<Self::Args, Output = R>,
        R: Datum,
        P: Propagation<R>;
}

/// A work item that evaluates a function on its current input values and
/// propagates the result to connected downstream inputs.
///
/// Constructed through [`Graph::node`]; reached by user code only via
/// [`NodeRef`].
#[must_use]
#[derive(Debug)]
#[repr(C)]
pub struct Node<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    /// Must stay the first field: the intake queue and the evaluation loop
    /// address nodes through the embedded work header.
    work: Work,
    #[debug(skip)]
    func: F,
    #[debug(skip)]
    slots: A::Slots,
    /// Downstream inputs fed by this node's results.
    #[debug(skip)]
    dependents: FlagCell<Vec<Input<F::Output>>>,
    #[debug(skip)]
    policy: P,
}

/// Releases a work's exclusion flag on every exit path, including unwinds
/// out of the node function.
struct Unlock<'a>(&'a Work);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl<F, A, P> Node<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    /// The node's graph-unique id.
    pub fn id(&self) -> WorkId {
        self.work.id
    }

    /// An input aimed at the `N`-th argument slot of this node's function.
    ///
    /// The input carries a refcounted handle to this node, so writing
    /// through it with [`Input::append`] both stores the value and schedules
    /// this node for re-evaluation.
    pub fn input<const N: usize>(&self) -> Input<<A as HasInput<N>>::At>
    where
        A: HasInput<N>,
    {
        let slot = NonNull::from(A::slot(&self.slots));
        // SAFETY: `&self` proves the node is live; the handle takes its own
        // reference on the embedded header.
        let owner = unsafe { WorkHandle::new(NonNull::from(&self.work)) };
        Input::from_slot(slot, owner)
    }

    fn eval(&self, state: &mut WorkState<'_>) {
        if !self.work.trylock_and_dequeue() {
            // Another thread is evaluating this node right now. Re-admit
            // ourselves so the trigger is not lost; the admission rule sends
            // an id equal to the cursor back to the graph queue.
            state.add_to_queue(NonNull::from(&self.work));
            return;
        }
        let _unlock = Unlock(&self.work);

        // The inputs may keep changing while we are locked: each slot read
        // observes its most recent store independently, possibly newer than
        // the value that triggered this evaluation. Node functions are
        // expected to be idempotent with respect to in-flight updates.
        let result = self.func.call(&self.slots);

        if self.policy.propagate(&result) {
            // SAFETY: the exclusion flag is held, so the list is ours.
            let dependents = unsafe { &*self.dependents.get() };
            for dependent in dependents {
                dependent.store(result.clone());
                if let Some(work) = dependent.owner() {
                    state.add_to_queue(work);
                }
            }
        }
    }
}

/// Feeding a node's results to an input: append to the downstream list under
/// the exclusion flag, spinning against a concurrent evaluation.
impl<F, A, P> Connectable<F::Output> for Node<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    fn connect(&self, input: Input<F::Output>) {
        while !self.work.trylock() {
            yield_now();
        }
        // SAFETY: the exclusion flag is held.
        unsafe { (*self.dependents.get()).push(input) };
        self.work.release();
        log::trace!("node {} gained a dependent", self.work.id);
    }

    fn disconnect(&self, input: &Input<F::Output>) {
        while !self.work.trylock() {
            yield_now();
        }
        // SAFETY: the exclusion flag is held.
        let dependents = unsafe { &mut *self.dependents.get() };
        if let Some(found) = dependents.iter().position(|existing| existing == input) {
            dependents.remove(found);
        }
        self.work.release();
    }
}

fn vtable<F, A, P>() -> &'static VTable
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    &VTable {
        eval: eval_raw::<F, A, P>,
        drop: drop_raw::<F, A, P>,
    }
}

/// # Safety
/// `work` must be the header embedded in a live `Node<F, A, P>` allocation.
unsafe fn eval_raw<F, A, P>(work: NonNull<Work>, state: &mut WorkState<'_>)
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    // SAFETY: the header sits at offset 0 of the node (`repr(C)`).
    unsafe { work.cast::<Node<F, A, P>>().as_ref() }.eval(state);
}

/// # Safety
/// As [`eval_raw`], and the work's refcount must have reached zero.
unsafe fn drop_raw<F, A, P>(work: NonNull<Work>)
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    // SAFETY: the allocation was produced by `Box::leak` in `Graph::node`
    // and nothing references it any more.
    drop(unsafe { Box::from_raw(work.cast::<Node<F, A, P>>().as_ptr()) });
}

/// Cloneable, refcounted handle to a [`Node`].
///
/// Dereferences to the node itself. Dropping the last handle (and every
/// input that references the node, and any queue entry) reclaims the node;
/// a deliberately constructed connection cycle keeps its nodes alive until
/// disconnected.
#[must_use]
pub struct NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    node: NonNull<Node<F, A, P>>,
}

impl<F, A, P> NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    /// Wire this node's result as an upstream for another node's argument.
    pub fn upstream(&self) -> Option<&dyn Connectable<F::Output>> {
        Some(&**self)
    }
}

impl<F, A, P> Deref for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    type Target = Node<F, A, P>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: this handle owns a reference, so the node is live.
        unsafe { self.node.as_ref() }
    }
}

impl<F, A, P> Clone for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    fn clone(&self) -> Self {
        self.work.incref();
        Self { node: self.node }
    }
}

impl<F, A, P> Drop for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    fn drop(&mut self) {
        // SAFETY: this handle owns one reference; the header sits at
        // offset 0 of the node (`repr(C)`).
        unsafe { Work::decref(self.node.cast::<Work>()) };
    }
}

impl<F, A, P> fmt::Debug for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&**self).finish()
    }
}

// SAFETY: a `NodeRef` is an owning reference to a heap allocation whose
// contents are `Send + Sync` by the bounds below; the raw pointer is only an
// ownership artefact.
unsafe impl<F, A, P> Send for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
}
unsafe impl<F, A, P> Sync for NodeRef<F, A, P>
where
    A: Inputs,
    F: NodeFn<A>,
    P: Propagation<F::Output>,
{
}

impl Graph {
    /// Construct a node from a propagation policy, a function, and one
    /// upstream connectable per argument.
    ///
    /// Upstreams are wired first (a [`Constant`](crate::input::Constant)
    /// stores its value into the matching slot right away), then the node is
    /// scheduled for its first evaluation, so the function must tolerate
    /// default-constructed values for arguments whose upstream has not
    /// produced anything yet.
    pub fn node<'u, U, F, P>(&self, policy: P, func: F, upstreams: U) -> NodeRef<F, U::Args, P>
    where
        U: Upstreams<'u>,
        F: NodeFn<U::Args>,
        P: Propagation<F::Output>,
    {
        let id = self.next_id();
        let node = Box::new(Node {
            work: Work::new(id, vtable::<F, U::Args, P>()),
            func,
            slots: Default::default(),
            dependents: FlagCell::new(Vec::new()),
            policy,
        });
        // The initial reference becomes the returned handle.
        let node = NodeRef {
            node: NonNull::from(Box::leak(node)),
        };
        upstreams.connect_to(&*node);
        node.work.schedule(self);
        log::debug!("node {id} created and scheduled");
        node
    }
}

macro_rules! impl_arity {
    ($($arg:ident $idx:tt),+) => {
        impl<$($arg: Datum),+> Inputs for ($($arg,)+) {
            type Slots = ($(Value<$arg>,)+);
        }

        impl<Func, Ret, $($arg: Datum),+> NodeFn<($($arg,)+)> for Func
        where
            Func: Fn($($arg),+) -> Ret + Send + Sync + 'static,
            Ret: Datum,
        {
            type Output = Ret;

            fn call(&self, slots: &($(Value<$arg>,)+)) -> Ret {
                self($(slots.$idx.read()),+)
            }
        }

        impl<'a, $($arg: Datum),+> Upstreams<'a>
            for ($(Option<&'a dyn Connectable<$arg>>,)+)
        {
            type Args = ($($arg,)+);

            fn connect_to<Func, Ret, Pol>(self, node: &Node<Func, Self::Args, Pol>)
            where
                Func: NodeFn<Self::Args, Output = Ret>,
                Ret: Datum,
                Pol: Propagation<Ret>,
            {
                $(connect(self.$idx, node.input::<$idx>());)+
            }
        }

        impl_arity!(@nth ($($arg)+) $($arg $idx),+);
    };
    (@nth $all:tt $($arg:ident $idx:tt),+) => {
        $(impl_arity!(@one $all $arg $idx);)+
    };
    (@one ($($all:ident)+) $arg:ident $idx:tt) => {
        impl<$($all: Datum),+> HasInput<$idx> for ($($all,)+) {
            type At = $arg;

            fn slot(slots: &Self::Slots) -> &Value<$arg> {
                &slots.$idx
            }
        }
    };
}

impl_arity!(A0 0);
impl_arity!(A0 0, A1 1);
impl_arity!(A0 0, A1 1, A2 2);
impl_arity!(A0 0, A1 1, A2 2, A3 3);
impl_arity!(A0 0, A1 1, A2 2, A3 3, A4 4);
impl_arity!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_arity!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_arity!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);
