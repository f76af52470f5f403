//! Push-driven dataflow evaluation engine.
//!
//! This crate provides a directed graph of computation nodes into which
//! producer threads push values, and one or more evaluator threads propagate
//! recalculations downstream in topological order. It:
//! - Accumulates externally-triggered work on a lock-free intake queue and
//!   drains it in atomic per-pass snapshots.
//! - Orders each pass by node id in a min-heap, so a node runs after every
//!   already-scheduled upstream dependent within the same pass.
//! - Serialises each node's evaluation behind a per-node exclusion flag,
//!   coalescing concurrent triggers into a single recomputation.
//! - Applies a per-node propagation policy ([`Always`](node::Always) or
//!   [`OnChange`](node::OnChange)) to decide whether a freshly computed
//!   result fires downstream.
//!
//! Key modules:
//! - `value`: the single-cell stores that carry data between nodes.
//! - `input`: the connection surface — typed inputs, constants, and the
//!   [`Connectable`](input::Connectable) contract.
//! - `node`: concrete work items binding a function to typed input slots,
//!   and the propagation policies.
//! - `graph`: the intake queue, the evaluation pass, per-pass
//!   [`Stats`](graph::Stats), and the background-evaluator helper.
//!
//! Quick start:
//!
//! ```
//! use flowgraph::{
//!     graph::Graph,
//!     input::{unconnected, Connectable, Input},
//!     node::Always,
//!     value::Value,
//! };
//! use std::sync::Arc;
//!
//! let graph = Graph::new();
//! let sum = graph.node(
//!     Always,
//!     |a: i32, b: i32| a + b,
//!     (unconnected::<i32>(), unconnected::<i32>()),
//! );
//! let sink = Arc::new(Value::default());
//! sum.connect(Input::sink(sink.clone()));
//!
//! sum.input::<0>().append(&graph, 1);
//! sum.input::<1>().append(&graph, 2);
//! while graph.evaluate(None) {}
//! assert_eq!(sink.read(), 3);
//! ```
//!
//! Values written while a node is being evaluated are not lost: the node is
//! re-admitted and recomputed with the latest inputs, though intermediate
//! values may be coalesced away. Node functions should therefore be
//! idempotent and tolerate default-constructed arguments, as a node is
//! scheduled once at construction, possibly ahead of its upstreams.

/// Graph-wide state: the lock-free intake queue, the evaluation pass and its
/// statistics, and the cooperative background evaluator.
pub mod graph;
/// The external connection surface: typed inputs, constants, and the
/// connectable contract.
pub mod input;
/// Concrete computation nodes, their construction, and the propagation
/// policies.
pub mod node;
mod sync;
/// Core type aliases used across the crate.
pub mod types;
/// The typed single-cell stores that mediate data transfer between nodes.
pub mod value;
mod work;
