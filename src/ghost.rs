//! Ghost-node bookkeeping and connectivity renumbering.
//!
//! A ghost node is a node row a rank keeps (or fetches) only because local
//! element connectivity references it while another rank owns it. The ghost
//! set for a round is derived right after element migration by
//! [`update_ghost_set`] and consumed after node migration, when
//! [`rm_ghost_nodes`] drops the stale copies and
//! [`get_ghost_nodes_to_import`] names the fresh ones to fetch.
//!
//! Connectivity renumbering brackets the whole exchange: global numbers
//! before anything moves, back to flattened local rows once every referenced
//! node is present again.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use log::debug;

use crate::error::{RepartError, Result};
use crate::mesh::{MeshPartition, Numbering};
use crate::oracle::Assignment;

/// Recompute the ghost set after element migration.
///
/// Four passes over post-element, pre-node state:
///
/// 1. every node id referenced by now-local connectivity enters the set;
/// 2. every currently owned node toggles (a referenced owned node leaves,
///    an unreferenced owned node enters as a candidate);
/// 3. every node export toggles the same way, since a node leaving this rank
///    flips between "will be remote" and "no longer referenced here";
/// 4. every node import leaves the set — it arrives owned, not ghost.
///
/// What remains is exactly the ids this rank must hold as ghosts once node
/// migration settles.
pub fn update_ghost_set(
    mesh: &MeshPartition,
    ghost_set: &mut BTreeSet<u64>,
    assignment: &Assignment,
) -> Result<()> {
    mesh.expect_numbering(Numbering::Global)?;
    let elem_start = mesh.elem_start();

    for block in &mesh.elem_blocks {
        for row in 0..block.len() {
            for &gid in block.connectivity.row(row) {
                ghost_set.insert(gid);
            }
        }
    }

    for block in &mesh.node_blocks {
        for row in 0..block.len() {
            if !block.is_ghost[row] {
                toggle(ghost_set, block.global_ids[row]);
            }
        }
    }

    for rec in &assignment.exports {
        if rec.gid < elem_start {
            toggle(ghost_set, rec.gid);
        }
    }

    for rec in &assignment.imports {
        if rec.gid < elem_start {
            ghost_set.remove(&rec.gid);
        }
    }

    debug!("ghost set settled at {} nodes", ghost_set.len());
    Ok(())
}

fn toggle(set: &mut BTreeSet<u64>, gid: u64) {
    if !set.remove(&gid) {
        set.insert(gid);
    }
}

/// Drop every ghost node row, keeping the four node tables in lockstep.
/// Returns the number of rows removed.
pub fn rm_ghost_nodes(mesh: &mut MeshPartition) -> usize {
    let mut removed = 0;
    for block in &mut mesh.node_blocks {
        let ghosts: Vec<usize> = (0..block.len()).filter(|&r| block.is_ghost[r]).collect();
        removed += ghosts.len();
        let mut buf = block.removal_buffer();
        for row in ghosts {
            buf.rm_row(row);
        }
        buf.flush();
    }
    removed
}

/// From the settled ghost set, the ids this rank actually has to fetch:
/// anything in the set not already held as an owned node row.
pub fn get_ghost_nodes_to_import(
    mesh: &MeshPartition,
    ghost_set: &BTreeSet<u64>,
) -> Result<BTreeSet<u64>> {
    mesh.expect_numbering(Numbering::Global)?;
    let mut owned = BTreeSet::new();
    for block in &mesh.node_blocks {
        for row in 0..block.len() {
            if !block.is_ghost[row] {
                owned.insert(block.global_ids[row]);
            }
        }
    }
    Ok(ghost_set.difference(&owned).copied().collect())
}

/// Rewrite element connectivity from flattened local rows to global node
/// ids. Must run before any entity moves; local rows are rank-private.
pub fn give_elems_global_node_numbers(mesh: &mut MeshPartition, rank: usize) -> Result<()> {
    mesh.expect_numbering(Numbering::Local)?;

    let mut flat_to_gid = Vec::new();
    for block in &mesh.node_blocks {
        flat_to_gid.extend_from_slice(&block.global_ids);
    }

    for block in &mut mesh.elem_blocks {
        for row in 0..block.len() {
            for entry in block.connectivity.row_mut(row) {
                *entry = *flat_to_gid
                    .get(*entry as usize)
                    .ok_or(RepartError::LookupFailed { rank, gid: *entry })?;
            }
        }
    }
    mesh.set_numbering(Numbering::Global);
    Ok(())
}

/// Rewrite element connectivity from global node ids back to flattened local
/// rows. Every referenced node (owned or ghost) must be present locally;
/// a miss means ghost reconciliation failed and is fatal.
pub fn give_elems_local_node_numbers(mesh: &mut MeshPartition, rank: usize) -> Result<()> {
    mesh.expect_numbering(Numbering::Global)?;

    let mut gid_to_flat: HashMap<u64, u64> = HashMap::new();
    let mut flat = 0u64;
    for block in &mesh.node_blocks {
        for row in 0..block.len() {
            gid_to_flat.insert(block.global_ids[row], flat);
            flat += 1;
        }
    }

    for block in &mut mesh.elem_blocks {
        for row in 0..block.len() {
            for entry in block.connectivity.row_mut(row) {
                *entry = *gid_to_flat
                    .get(entry)
                    .ok_or(RepartError::LookupFailed { rank, gid: *entry })?;
            }
        }
    }
    mesh.set_numbering(Numbering::Local);
    Ok(())
}
