//! `RepartError`: unified error type for the repartitioning pipeline.
//!
//! Every detected anomaly is fatal for the current partitioning round; there
//! is no recoverable/fatal split. Errors carry the process rank and the
//! offending global id or component index so a failing round can be diagnosed
//! from a single log line.

use thiserror::Error;

use crate::migrate::EntityKind;

/// Unified error type for mesh-repart operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepartError {
    /// The distributed graph is asymmetric: summed across all ranks, the
    /// node-side edge count must equal the element-side edge count.
    #[error(
        "graph edge count mismatch: {node_side} edges from the node side vs \
         {elem_side} from the element side (summed over all ranks)"
    )]
    EdgeCountMismatch { node_side: u64, elem_side: u64 },

    /// Object assembly produced more entries than the announced object count.
    #[error("rank {rank}: object list overflowed the announced count of {expected}")]
    ObjectCountOverflow { rank: usize, expected: usize },

    /// An entity of the wrong kind showed up inside a kind-filtered
    /// migration pass (e.g. a node id carrying a payload in the element pass).
    #[error("rank {rank}: global id {gid} crossed the kind boundary of the {kind:?} pass")]
    KindBoundary { rank: usize, gid: u64, kind: EntityKind },

    /// A component index on the wire does not exist in the local mesh.
    #[error("rank {rank}: component index {component} out of range (mesh has {count})")]
    ComponentOutOfRange {
        rank: usize,
        component: usize,
        count: usize,
    },

    /// A queried global id has no corresponding local entity. Implies a
    /// prior consistency error; never silently corrected.
    #[error("rank {rank}: no local entity for global id {gid}")]
    LookupFailed { rank: usize, gid: u64 },

    /// Non-success status from the partitioning oracle. No retry.
    #[error("partitioning oracle failed: {0}")]
    OracleFailure(String),

    /// A wire buffer ended before the announced payload did.
    #[error("truncated wire buffer: need {need} more bytes, {have} left")]
    WireTruncated { need: usize, have: usize },

    /// An entity's packed bytes disagree with its precomputed size.
    #[error("rank {rank}: packed {wrote} bytes for global id {gid}, sizing said {expected}")]
    PackSizeMismatch {
        rank: usize,
        gid: u64,
        expected: usize,
        wrote: usize,
    },

    /// Connectivity tables are in the wrong numbering for the requested
    /// operation.
    #[error("connectivity holds {found} node numbers, operation expects {expected}")]
    WrongNumbering {
        expected: &'static str,
        found: &'static str,
    },

    /// The driver was asked to run a transition from the wrong state.
    #[error("partition driver in state {actual}, transition requires {expected}")]
    DriverState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RepartError>;
