#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

//! Randomised checks of the per-pass accounting and ordering invariants
//! over identity chains of varying length.

use flowgraph::{
    graph::{Graph, Stats},
    input::{unconnected, Connectable, Input},
    node::Always,
    value::Value,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::sync::Arc;

/// Every heap pop is either evaluated or merged as a duplicate, and every
/// entry got there by being drained or admitted mid-pass.
fn assert_accounting(stats: &Stats) -> Result<(), TestCaseError> {
    prop_assert_eq!(
        stats.worked + stats.duplicates,
        stats.queued + stats.pushed_heap
    );
    Ok(())
}

proptest! {
    #[test]
    fn identity_chain_invariants(
        len in 1usize..6,
        writes in proptest::collection::vec(any::<i32>(), 1..8),
    ) {
        let g = Graph::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut head = None;
        let mut prev: Option<flowgraph::node::NodeRef<_, (i32,), Always>> = None;
        for position in 0..len {
            let order = order.clone();
            let record = move |a: i32| {
                order.lock().push(position);
                a
            };
            let node = match &prev {
                None => g.node(Always, record, (unconnected::<i32>(),)),
                Some(upstream) => g.node(Always, record, (upstream.upstream(),)),
            };
            if position == 0 {
                head = Some(node.clone());
            }
            prev = Some(node);
        }
        let head = head.expect("chain is never empty");
        let tail = prev.expect("chain is never empty");
        let sink = Arc::new(Value::default());
        tail.connect(Input::sink(sink.clone()));

        // Construction pass: every node was scheduled once, and each
        // non-head node is additionally admitted by its upstream.
        let mut stats = Stats::default();
        prop_assert!(g.evaluate(Some(&mut stats)));
        prop_assert_eq!(stats.queued, len as u32);
        prop_assert_eq!(stats.worked, len as u32);
        prop_assert_eq!(stats.pushed_heap, len as u32 - 1);
        prop_assert_eq!(stats.duplicates, len as u32 - 1);
        assert_accounting(&stats)?;
        order.lock().clear();

        for &write in &writes {
            head.input::<0>().append(&g, write);
            prop_assert!(g.evaluate(Some(&mut stats)));

            // Conservation of intake: only the head was appended to.
            prop_assert_eq!(stats.queued, 1);
            prop_assert_eq!(stats.worked, len as u32);
            prop_assert_eq!(stats.pushed_heap, len as u32 - 1);
            prop_assert_eq!(stats.pushed_graph, 0);
            assert_accounting(&stats)?;

            // Topological order within the pass: upstream positions run
            // strictly before downstream ones.
            {
                let mut order = order.lock();
                prop_assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
                order.clear();
            }

            // The chain settles in a single pass.
            prop_assert_eq!(sink.read(), write);
            prop_assert!(!g.evaluate(Some(&mut stats)));
            prop_assert_eq!(stats.queued, 0);
            prop_assert_eq!(stats.worked, 0);
        }
    }
}
