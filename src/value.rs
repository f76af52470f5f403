use core::fmt;
use core::mem;
use parking_lot::RwLock;

/// Values that can flow through the graph.
///
/// `Default` supplies the value a slot reports before anything was stored
/// into it, which is also what a node function sees when it runs ahead of
/// its upstream dependencies. Blanket-implemented; never implement by hand.
pub trait Datum: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Datum for T {}

/// A single-cell store for the latest value written to a node argument.
///
/// Embedded in a [`Node`](crate::node::Node) for each argument of its
/// function, and usable standalone (behind an `Arc`) as a read-only sink for
/// a node's results. Writers replace the whole cell; readers clone it. Both
/// happen under a short internal reader-writer lock, which also keeps
/// reference counts exact when the stored value is itself a shared handle
/// such as an `Arc`.
pub struct Value<T> {
    cell: RwLock<T>,
}

impl<T: Datum> Value<T> {
    /// A cell seeded with `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            cell: RwLock::new(initial),
        }
    }

    /// Atomically write the latest value into the cell.
    ///
    /// Used by upstream dependencies to pass on new values for the containing
    /// node to pick up on its next evaluation.
    pub fn store(&self, value: T) {
        *self.cell.write() = value;
    }

    /// The last stored value, or `T::default()` if nothing was stored yet.
    pub fn read(&self) -> T {
        self.cell.read().clone()
    }

    /// Atomically replace the stored value, returning the previous one.
    ///
    /// Used by the [`OnChange`](crate::node::OnChange) propagation policy.
    pub fn exchange(&self, value: T) -> T {
        mem::replace(&mut *self.cell.write(), value)
    }
}

impl<T: Datum> Default for Value<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Datum + fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&*self.cell.read()).finish()
    }
}
