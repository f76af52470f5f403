/// Unique identifier of a work item.
///
/// Uniqueness is per [`Graph`](crate::graph::Graph): ids are handed out by
/// the graph that created the work, strictly increasing from 1. Id 0 is
/// reserved for the intake-queue sentinel.
pub type WorkId = u32;
