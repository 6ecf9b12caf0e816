//! # mesh-repart
//!
//! mesh-repart rebalances a distributed unstructured mesh at runtime. Each
//! process holds one slice of the mesh ([`mesh::MeshPartition`]); a
//! repartitioning round builds the bipartite node/element graph, asks a
//! partitioning oracle where every vertex should live, and migrates elements,
//! nodes, and finally ghost nodes until each rank can resolve all of its
//! element connectivity locally again.
//!
//! ## Layout
//! - [`mesh`] — the per-rank mesh slice: parallel node tables, element
//!   connectivity, local/global numbering state
//! - [`graph`] — the process-local graph slice and the range-hash ownership
//!   functions
//! - [`oracle`] — partitioning oracle and migration-callback traits, the
//!   built-in block oracle, and the framed migration transport
//! - [`migrate`] — kind-filtered entity packing and ghost request inversion
//! - [`ghost`] — ghost set derivation and connectivity renumbering
//! - [`driver`] — the state machine running one round end to end
//! - [`comm`] — minimal message-passing façade with an in-process backend
//!
//! ## Determinism
//! Every exchange walks peers in ascending rank order and every set is
//! ordered, so a round is reproducible across runs given the same input
//! mesh and oracle.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! mesh-repart = "0.1"
//! ```
//!
//! A round on one rank:
//!
//! ```no_run
//! use mesh_repart::prelude::*;
//!
//! # fn demo(mesh: MeshPartition) -> Result<MeshPartition> {
//! let mut driver = PartitionDriver::new(LocalComm::serial(), BlockOracle, OracleConfig::default());
//! driver.initialize(mesh)?;
//! if driver.partition_graph()? {
//!     driver.show_changes()?;
//! }
//! driver.into_mesh()
//! # }
//! ```

pub mod comm;
pub mod driver;
pub mod error;
pub mod ghost;
pub mod graph;
pub mod mesh;
pub mod migrate;
pub mod oracle;
pub mod wire;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::comm::{Communicator, LocalComm};
    pub use crate::driver::PartitionDriver;
    pub use crate::error::{RepartError, Result};
    pub use crate::mesh::{ElemBlock, MeshPartition, NodeBlock, Numbering};
    pub use crate::migrate::EntityKind;
    pub use crate::oracle::{Assignment, BlockOracle, Oracle, OracleConfig};
}
