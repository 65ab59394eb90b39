//! Narrow capability contracts for external drivers.
//!
//! The scheduler that ticks the engine stages lives outside this crate;
//! it only needs these two seams.

/// A pollable engine stage. `update` performs at most one unit of work
/// and returns whether anything changed, which is the signal the outer
/// scheduler uses to decide whether to keep looping.
pub trait Task {
    fn update(&self) -> bool;

    /// Pending items on the stage's ingest queue.
    fn size(&self) -> usize;
}

/// A background service with an explicit shutdown handshake.
pub trait Service {
    fn close(&self);
    fn is_closed(&self) -> bool;
}
