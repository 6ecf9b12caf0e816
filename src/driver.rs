//! Round driver: one full repartitioning of a distributed mesh.
//!
//! [`PartitionDriver`] owns the mesh for the duration of a round and walks a
//! fixed state machine; every transition is collective, so all ranks must
//! drive their instances in lockstep. There is no rollback — a failed round
//! leaves the mesh partially migrated and the driver stuck in the state that
//! failed.
//!
//! The round order is load-bearing: connectivity switches to global numbers
//! before anything moves, elements move before nodes (the ghost set is
//! derived from post-element, pre-node state), and stale ghosts are dropped
//! before fresh ones are fetched.

use std::collections::BTreeSet;

use itertools::Itertools;
use log::info;

use crate::comm::Communicator;
use crate::error::{RepartError, Result};
use crate::ghost::{
    get_ghost_nodes_to_import, give_elems_global_node_numbers, give_elems_local_node_numbers,
    rm_ghost_nodes,
};
use crate::graph::build_graph;
use crate::mesh::MeshPartition;
use crate::migrate::{EntityMigrator, invert_ghost_requests};
use crate::oracle::{Assignment, Oracle, OracleConfig, migrate};

const TAG_ELEMS: u16 = 1;
const TAG_NODES: u16 = 2;
const TAG_GHOSTS: u16 = 3;

/// Progress of the current round. Purely forward; reaching `Renumbered`
/// (or deciding nothing moves) ends the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Empty,
    Init,
    GraphBuilt,
    Partitioned,
    ElementsMigrated,
    GhostsIdentified,
    NodesMigrated,
    GhostsMigrated,
    Renumbered,
}

impl DriverState {
    fn name(self) -> &'static str {
        match self {
            DriverState::Empty => "empty",
            DriverState::Init => "initialized",
            DriverState::GraphBuilt => "graph-built",
            DriverState::Partitioned => "partitioned",
            DriverState::ElementsMigrated => "elements-migrated",
            DriverState::GhostsIdentified => "ghosts-identified",
            DriverState::NodesMigrated => "nodes-migrated",
            DriverState::GhostsMigrated => "ghosts-migrated",
            DriverState::Renumbered => "renumbered",
        }
    }
}

/// Drives repartitioning rounds over one rank's mesh slice.
pub struct PartitionDriver<C: Communicator, O: Oracle> {
    comm: C,
    oracle: O,
    config: OracleConfig,
    mesh: Option<MeshPartition>,
    ghost_set: BTreeSet<u64>,
    last_assignment: Option<Assignment>,
    state: DriverState,
}

impl<C: Communicator, O: Oracle> PartitionDriver<C, O> {
    pub fn new(comm: C, oracle: O, config: OracleConfig) -> Self {
        Self {
            comm,
            oracle,
            config,
            mesh: None,
            ghost_set: BTreeSet::new(),
            last_assignment: None,
            state: DriverState::Empty,
        }
    }

    /// Hand the driver this rank's mesh slice. Connectivity must be in
    /// local numbering.
    pub fn initialize(&mut self, mesh: MeshPartition) -> Result<()> {
        self.expect_state(&[DriverState::Empty], "initialize")?;
        self.mesh = Some(mesh);
        self.state = DriverState::Init;
        Ok(())
    }

    /// Run one full repartitioning round. Returns whether anything moved;
    /// when the oracle reports no movement the mesh is left untouched.
    pub fn partition_graph(&mut self) -> Result<bool> {
        self.expect_state(
            &[DriverState::Init, DriverState::Renumbered],
            "partition_graph",
        )?;
        let rank = self.comm.rank();
        // field-level split: the mesh, the ghost set and the communicator
        // are borrowed independently below
        let mesh = match self.mesh.as_mut() {
            Some(m) => m,
            None => {
                return Err(RepartError::DriverState {
                    expected: "initialized",
                    actual: DriverState::Empty.name(),
                });
            }
        };

        let graph = build_graph(mesh, &self.comm)?;
        self.state = DriverState::GraphBuilt;

        let assignment = self.oracle.partition(&graph, &self.comm, &self.config)?;
        self.state = DriverState::Partitioned;
        info!(
            "rank {rank}: oracle assigned {} exports, {} imports",
            assignment.exports.len(),
            assignment.imports.len()
        );

        if !assignment.changed {
            info!("rank {rank}: partition already balanced, nothing to migrate");
            self.last_assignment = Some(assignment);
            self.state = DriverState::Renumbered;
            return Ok(false);
        }

        give_elems_global_node_numbers(mesh, rank)?;

        self.ghost_set.clear();
        let mut elem_pass = EntityMigrator::elements(mesh, rank, &mut self.ghost_set);
        migrate(&assignment, &mut elem_pass, &self.comm, TAG_ELEMS)?;
        self.state = DriverState::GhostsIdentified;
        info!(
            "rank {rank}: elements migrated, {} ghost nodes identified",
            self.ghost_set.len()
        );

        let mut node_pass = EntityMigrator::nodes(mesh, rank);
        migrate(&assignment, &mut node_pass, &self.comm, TAG_NODES)?;
        self.state = DriverState::NodesMigrated;

        let dropped = rm_ghost_nodes(mesh);
        let wanted = get_ghost_nodes_to_import(mesh, &self.ghost_set)?;
        info!(
            "rank {rank}: dropped {dropped} stale ghosts, fetching {}",
            wanted.len()
        );

        let ghost_assignment = invert_ghost_requests(mesh, &wanted, &self.comm)?;
        let mut ghost_pass = EntityMigrator::ghost_nodes(mesh, rank);
        migrate(&ghost_assignment, &mut ghost_pass, &self.comm, TAG_GHOSTS)?;
        self.state = DriverState::GhostsMigrated;

        give_elems_local_node_numbers(mesh, rank)?;
        self.state = DriverState::Renumbered;
        info!(
            "rank {rank}: round complete, {} nodes ({} ghost) and {} elements local",
            mesh.node_blocks.iter().map(|b| b.len()).sum::<usize>(),
            mesh.node_blocks
                .iter()
                .map(|b| b.is_ghost.iter().filter(|&&g| g).count())
                .sum::<usize>(),
            mesh.nb_local_elems()
        );

        self.last_assignment = Some(assignment);
        Ok(true)
    }

    /// Log the last oracle verdict, one line per direction.
    pub fn show_changes(&self) -> Result<()> {
        let assignment = self
            .last_assignment
            .as_ref()
            .ok_or(RepartError::DriverState {
                expected: DriverState::Partitioned.name(),
                actual: self.state.name(),
            })?;
        let rank = self.comm.rank();
        if assignment.exports.is_empty() && assignment.imports.is_empty() {
            info!("rank {rank}: no changes");
            return Ok(());
        }
        let exports = assignment
            .exports
            .iter()
            .map(|r| format!("{}->{}", r.gid, r.peer))
            .join(", ");
        let imports = assignment
            .imports
            .iter()
            .map(|r| format!("{}<-{}", r.gid, r.peer))
            .join(", ");
        info!("rank {rank}: exports [{exports}]");
        info!("rank {rank}: imports [{imports}]");
        Ok(())
    }

    /// Take the mesh back out once the round has settled.
    pub fn into_mesh(self) -> Result<MeshPartition> {
        if self.state != DriverState::Renumbered {
            return Err(RepartError::DriverState {
                expected: DriverState::Renumbered.name(),
                actual: self.state.name(),
            });
        }
        match self.mesh {
            Some(mesh) => Ok(mesh),
            None => Err(RepartError::DriverState {
                expected: "initialized",
                actual: DriverState::Empty.name(),
            }),
        }
    }

    fn expect_state(&self, allowed: &[DriverState], op: &str) -> Result<()> {
        if !allowed.contains(&self.state) {
            log::warn!("{op} called in state {}", self.state.name());
            return Err(RepartError::DriverState {
                expected: allowed[0].name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::mesh::{ElemBlock, NodeBlock};
    use crate::oracle::BlockOracle;

    fn serial_canonical_mesh() -> MeshPartition {
        // 4 nodes, one quad; everything already where the block layout
        // wants it on a single rank
        let mut mesh = MeshPartition::new(2, 4, 1);
        let mut nodes = NodeBlock::new(2);
        nodes.push_node(&[0.0, 0.0], false, 0, &[0]);
        nodes.push_node(&[1.0, 0.0], false, 1, &[0]);
        nodes.push_node(&[1.0, 1.0], false, 2, &[0]);
        nodes.push_node(&[0.0, 1.0], false, 3, &[0]);
        mesh.node_blocks.push(nodes);
        let mut elems = ElemBlock::new(4);
        elems.push_elem(&[0, 1, 2, 3], 0);
        mesh.elem_blocks.push(elems);
        mesh
    }

    #[test]
    fn round_requires_initialization() {
        let mut driver =
            PartitionDriver::new(LocalComm::serial(), BlockOracle, OracleConfig::default());
        assert!(matches!(
            driver.partition_graph(),
            Err(RepartError::DriverState { .. })
        ));
        assert!(matches!(
            driver.show_changes(),
            Err(RepartError::DriverState { .. })
        ));
    }

    #[test]
    fn balanced_round_is_a_noop() {
        let mut driver =
            PartitionDriver::new(LocalComm::serial(), BlockOracle, OracleConfig::default());
        driver.initialize(serial_canonical_mesh()).unwrap();
        assert!(!driver.partition_graph().unwrap());
        driver.show_changes().unwrap();
        let mesh = driver.into_mesh().unwrap();
        assert_eq!(mesh.nb_owned_nodes(), 4);
        assert_eq!(mesh.nb_local_elems(), 1);
        assert_eq!(mesh.elem_blocks[0].connectivity.row(0), &[0, 1, 2, 3]);
    }

    #[test]
    fn double_initialize_is_rejected() {
        let mut driver =
            PartitionDriver::new(LocalComm::serial(), BlockOracle, OracleConfig::default());
        driver.initialize(serial_canonical_mesh()).unwrap();
        assert!(matches!(
            driver.initialize(serial_canonical_mesh()),
            Err(RepartError::DriverState { .. })
        ));
    }

    #[test]
    fn mesh_is_held_until_the_round_settles() {
        let mut driver =
            PartitionDriver::new(LocalComm::serial(), BlockOracle, OracleConfig::default());
        driver.initialize(serial_canonical_mesh()).unwrap();
        assert!(matches!(
            driver.into_mesh(),
            Err(RepartError::DriverState { .. })
        ));
    }
}
