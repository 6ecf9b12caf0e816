//! Build the process-local slice of the global node/element graph.
//!
//! Graph vertices are the locally-owned (non-ghost) nodes plus all local
//! elements. Global ids are process-independent: nodes occupy
//! `[0, nb_global_nodes)` and elements
//! `[nb_global_nodes, nb_global_nodes + nb_global_elems)`. Edges run both
//! ways — node→referencing elements (from the node→element table) and
//! element→its nodes (from connectivity) — and the two directions must agree
//! in total count across all ranks, which is checked collectively here.
//!
//! Neighbor ownership is *derived*, not stored: a contiguous range hash over
//! the respective id range maps any global id to the rank that canonically
//! holds it.

use log::debug;

use crate::comm::Communicator;
use crate::error::{RepartError, Result};
use crate::mesh::{LocalEntityRef, MeshPartition, Numbering};

/// CSR slice of the distributed graph contributed by one rank.
#[derive(Debug, Clone, Default)]
pub struct LocalGraph {
    /// Global id per local vertex, nodes first, then elements.
    pub vertex_gids: Vec<u64>,
    /// `(component, row)` locator per local vertex; stale after migration.
    pub vertex_refs: Vec<LocalEntityRef>,
    /// CSR row offsets into `adjncy`/`adj_owner` (`len == vertices + 1`).
    pub xadj: Vec<usize>,
    /// Neighbor global ids.
    pub adjncy: Vec<u64>,
    /// Rank owning each neighbor.
    pub adj_owner: Vec<u32>,
    /// Total vertex count of the global graph (nodes + elements).
    pub nb_global_vertices: u64,
    /// First global id of the element range.
    pub elem_start: u64,
}

impl LocalGraph {
    pub fn vertex_count(&self) -> usize {
        self.vertex_gids.len()
    }

    pub fn neighbors(&self, v: usize) -> (&[u64], &[u32]) {
        let range = self.xadj[v]..self.xadj[v + 1];
        (&self.adjncy[range.clone()], &self.adj_owner[range])
    }
}

/// Rank canonically holding global node id `gid`.
pub fn node_owner(gid: u64, nb_global_nodes: u64, nprocs: usize) -> u32 {
    range_owner(gid, nb_global_nodes, nprocs)
}

/// Rank canonically holding global element id `gid` (already rebased to the
/// element range start).
pub fn elem_owner(elem_idx: u64, nb_global_elems: u64, nprocs: usize) -> u32 {
    range_owner(elem_idx, nb_global_elems, nprocs)
}

fn range_owner(idx: u64, total: u64, nprocs: usize) -> u32 {
    let np = nprocs as u64;
    if total == 0 || np == 0 {
        return 0;
    }
    let part_size = total.div_ceil(np);
    (idx / part_size).min(np - 1) as u32
}

/// Assemble this rank's graph slice and run the collective symmetry check.
///
/// Requires [`Numbering::Local`] connectivity: element neighbors are resolved
/// through the flattened local node index. A rank holding no nodes and no
/// elements contributes an empty, non-failing slice.
pub fn build_graph<C: Communicator>(mesh: &MeshPartition, comm: &C) -> Result<LocalGraph> {
    mesh.expect_numbering(Numbering::Local)?;

    let elem_start = mesh.elem_start();
    let expected = mesh.nb_owned_nodes() + mesh.nb_local_elems();
    let nprocs = comm.size();

    let mut graph = LocalGraph {
        nb_global_vertices: mesh.nb_global_nodes() + mesh.nb_global_elems(),
        elem_start,
        xadj: vec![0],
        ..Default::default()
    };

    // node vertices: ghosts are excluded so every node is counted on
    // exactly one rank
    let mut edges_from_nodes: u64 = 0;
    for (b, block) in mesh.node_blocks.iter().enumerate() {
        for row in 0..block.len() {
            if block.is_ghost[row] {
                continue;
            }
            graph.vertex_gids.push(block.global_ids[row]);
            graph.vertex_refs.push(LocalEntityRef {
                component: b as u32,
                row: row as u32,
            });
            for &glb_elem in block.node_to_elems.row(row) {
                graph.adjncy.push(elem_start + glb_elem);
                graph
                    .adj_owner
                    .push(elem_owner(glb_elem, mesh.nb_global_elems(), nprocs));
                edges_from_nodes += 1;
            }
            graph.xadj.push(graph.adjncy.len());
        }
    }

    // element vertices: emitted once each, unconditionally
    let mut edges_from_elems: u64 = 0;
    for (b, block) in mesh.elem_blocks.iter().enumerate() {
        let component = mesh.elem_component(b);
        for row in 0..block.len() {
            graph.vertex_gids.push(elem_start + block.global_ids[row]);
            graph.vertex_refs.push(LocalEntityRef {
                component,
                row: row as u32,
            });
            for &local_node in block.connectivity.row(row) {
                let gid = mesh
                    .global_node_id(local_node)
                    .ok_or(RepartError::LookupFailed {
                        rank: comm.rank(),
                        gid: local_node,
                    })?;
                graph.adjncy.push(gid);
                graph
                    .adj_owner
                    .push(node_owner(gid, mesh.nb_global_nodes(), nprocs));
                edges_from_elems += 1;
            }
            graph.xadj.push(graph.adjncy.len());
        }
    }

    if graph.vertex_gids.len() > expected {
        return Err(RepartError::ObjectCountOverflow {
            rank: comm.rank(),
            expected,
        });
    }

    // collective symmetry check: for every node→element edge somewhere in
    // the distributed mesh there must be the matching element→node edge
    let total_from_nodes = comm.all_reduce_sum(edges_from_nodes);
    let total_from_elems = comm.all_reduce_sum(edges_from_elems);
    if total_from_nodes != total_from_elems {
        return Err(RepartError::EdgeCountMismatch {
            node_side: total_from_nodes,
            elem_side: total_from_elems,
        });
    }

    debug!(
        "rank {}: graph slice with {} vertices, {} node-side and {} element-side edges",
        comm.rank(),
        graph.vertex_count(),
        edges_from_nodes,
        edges_from_elems
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::mesh::{ElemBlock, NodeBlock};

    /// Two quads side by side: 6 nodes, 2 elements, all on one rank.
    ///
    ///   3 --- 4 --- 5
    ///   | e0  | e1  |
    ///   0 --- 1 --- 2
    fn two_quad_mesh() -> MeshPartition {
        let mut mesh = MeshPartition::new(2, 6, 2);
        let mut nodes = NodeBlock::new(2);
        let coords = [
            [0.0, 0.0],
            [1.0, 0.0],
            [2.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [2.0, 1.0],
        ];
        let refs: [&[u64]; 6] = [&[0], &[0, 1], &[1], &[0], &[0, 1], &[1]];
        for (gid, (xy, elems)) in coords.iter().zip(refs).enumerate() {
            nodes.push_node(xy, false, gid as u64, elems);
        }
        let mut elems = ElemBlock::new(4);
        elems.push_elem(&[0, 1, 4, 3], 0);
        elems.push_elem(&[1, 2, 5, 4], 1);
        mesh.node_blocks.push(nodes);
        mesh.elem_blocks.push(elems);
        mesh
    }

    #[test]
    fn vertex_and_edge_layout() {
        let mesh = two_quad_mesh();
        let comm = LocalComm::serial();
        let graph = build_graph(&mesh, &comm).unwrap();

        assert_eq!(graph.vertex_count(), 8);
        assert_eq!(graph.elem_start, 6);
        // node 1 is referenced by both elements
        let (nbrs, owners) = graph.neighbors(1);
        assert_eq!(nbrs, &[6, 7]);
        assert_eq!(owners, &[0, 0]);
        // element 0 lists its four nodes by global id
        let (nbrs, _) = graph.neighbors(6);
        assert_eq!(nbrs, &[0, 1, 4, 3]);
    }

    #[test]
    fn ghost_nodes_are_not_vertices() {
        let mut mesh = two_quad_mesh();
        mesh.node_blocks[0].is_ghost[2] = true;
        mesh.node_blocks[0].is_ghost[5] = true;
        let comm = LocalComm::serial();
        // edge totals now disagree: ghost node edges vanish from the node
        // side while element connectivity still references them
        let err = build_graph(&mesh, &comm).unwrap_err();
        assert!(matches!(err, RepartError::EdgeCountMismatch { .. }));
    }

    #[test]
    fn empty_contribution_is_non_failing() {
        let mesh = MeshPartition::new(2, 0, 0);
        let comm = LocalComm::serial();
        let graph = build_graph(&mesh, &comm).unwrap();
        assert_eq!(graph.vertex_count(), 0);
        assert_eq!(graph.xadj, vec![0]);
    }

    #[test]
    fn range_owner_boundaries() {
        // 25 nodes over 3 ranks: ceil(25/3) = 9 per part
        assert_eq!(node_owner(0, 25, 3), 0);
        assert_eq!(node_owner(8, 25, 3), 0);
        assert_eq!(node_owner(9, 25, 3), 1);
        assert_eq!(node_owner(17, 25, 3), 1);
        assert_eq!(node_owner(18, 25, 3), 2);
        assert_eq!(node_owner(24, 25, 3), 2);
        // uneven division: ceil(25/24) = 2 per part, so the tail ranks hold
        // no ids at all and gid 24 lands mid-range
        assert_eq!(node_owner(24, 25, 24), 12);
        // the highest id of an uneven split still reaches the last rank
        assert_eq!(node_owner(9, 10, 4), 3);
        assert_eq!(node_owner(6, 7, 3), 2);
    }
}
