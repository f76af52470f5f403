//! The external connection surface: inputs, constants, and the connectable
//! contract that wires upstream results to downstream argument slots.

use crate::{
    graph::Graph,
    value::{Datum, Value},
    work::{Work, WorkHandle},
};
use core::ptr::NonNull;
use std::sync::Arc;

/// Something you can connect an [`Input`] to: a node (by its result type) or
/// a [`Constant`].
pub trait Connectable<T: Datum> {
    /// Connect `input` so it receives this object's values.
    ///
    /// Thread-safe; may be called any number of times on one object.
    fn connect(&self, input: Input<T>);

    /// Disconnect `input` from this object.
    ///
    /// Thread-safe; has no effect if `input` was not connected.
    fn disconnect(&self, input: &Input<T>);
}

/// The "leave this argument unconnected" marker for node construction.
pub fn unconnected<T: Datum>() -> Option<&'static dyn Connectable<T>> {
    None
}

/// Connect `from` to `to`, if there is an upstream to connect to.
///
/// Supports declaring some of a node's arguments as unconnected at
/// construction time.
pub fn connect<T: Datum>(to: Option<&dyn Connectable<T>>, from: Input<T>) {
    if let Some(to) = to {
        to.connect(from);
    }
}

enum Target<T: Datum> {
    /// A slot embedded in a node. The handle keeps the node, and therefore
    /// the slot, alive for as long as this input exists.
    Slot {
        value: NonNull<Value<T>>,
        owner: WorkHandle,
    },
    /// A caller-owned sink; writes never schedule anything.
    Sink { value: Arc<Value<T>> },
}

impl<T: Datum> Clone for Target<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Slot { value, owner } => Self::Slot {
                value: *value,
                owner: owner.clone(),
            },
            Self::Sink { value } => Self::Sink {
                value: value.clone(),
            },
        }
    }
}

/// A typed input to the graph.
///
/// Obtained from a node via [`input`](crate::node::Node::input), in which
/// case it carries a refcounted handle to the owning node so that writing
/// through it also schedules a recalculation; or built over a caller-owned
/// [`Value`] via [`Input::sink`], in which case writes land in the value and
/// nothing is scheduled. Cloneable; equality is the targeted cell, not the
/// current contents.
#[derive(Clone)]
pub struct Input<T: Datum> {
    target: Target<T>,
}

impl<T: Datum> Input<T> {
    /// An input with no work handle, aimed at a caller-owned sink value.
    ///
    /// Connect it downstream of a node to observe every propagated result
    /// with [`Value::read`].
    pub fn sink(value: Arc<Value<T>>) -> Self {
        Self {
            target: Target::Sink { value },
        }
    }

    pub(crate) fn from_slot(value: NonNull<Value<T>>, owner: WorkHandle) -> Self {
        Self {
            target: Target::Slot { value, owner },
        }
    }

    /// Write `value` and, if this input belongs to a node, schedule that
    /// node on `graph`'s intake queue for re-evaluation.
    pub fn append(&self, graph: &Graph, value: T) {
        self.store(value);
        if let Target::Slot { owner, .. } = &self.target {
            owner.schedule(graph);
        }
    }

    /// Write `value` without scheduling anything.
    pub fn store(&self, value: T) {
        self.value().store(value);
    }

    fn value(&self) -> &Value<T> {
        match &self.target {
            // SAFETY: the slot lives inside the owning node, which the work
            // handle keeps alive.
            Target::Slot { value, .. } => unsafe { value.as_ref() },
            Target::Sink { value } => value,
        }
    }

    pub(crate) fn owner(&self) -> Option<NonNull<Work>> {
        match &self.target {
            Target::Slot { owner, .. } => Some(owner.raw()),
            Target::Sink { .. } => None,
        }
    }

    fn value_addr(&self) -> *const Value<T> {
        match &self.target {
            Target::Slot { value, .. } => value.as_ptr() as *const Value<T>,
            Target::Sink { value } => Arc::as_ptr(value),
        }
    }
}

/// Identity semantics: two inputs are equal iff they target the same value
/// cell, regardless of the current contents.
impl<T: Datum> PartialEq for Input<T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.value_addr(), other.value_addr())
    }
}

impl<T: Datum> Eq for Input<T> {}

impl<T: Datum> From<Arc<Value<T>>> for Input<T> {
    fn from(value: Arc<Value<T>>) -> Self {
        Self::sink(value)
    }
}

// SAFETY: the slot pointer stays valid while the owning work handle is held,
// and `Value<T>` is `Sync` for `T: Datum`.
unsafe impl<T: Datum> Send for Input<T> {}
unsafe impl<T: Datum> Sync for Input<T> {}

/// A connectable that passes a fixed value on to any input connected to it.
///
/// The value is stored into the input immediately at `connect` time, outside
/// any evaluation pass; no ongoing relationship is established. Constants
/// are never scheduled and never evaluated.
#[derive(Debug, Clone)]
pub struct Constant<T: Datum> {
    value: T,
}

impl<T: Datum> Constant<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    /// Wire this constant as an upstream for node construction.
    pub fn upstream(&self) -> Option<&dyn Connectable<T>> {
        Some(self)
    }
}

impl<T: Datum> Connectable<T> for Constant<T> {
    fn connect(&self, input: Input<T>) {
        input.store(self.value.clone());
    }

    fn disconnect(&self, _input: &Input<T>) {}
}
