//! Kind-filtered entity packing for the migration engine.
//!
//! One oracle assignment covers node and element vertices alike, and the
//! pipeline replays it once per entity kind. [`EntityMigrator`] is the
//! callback set for a single pass: entities outside the pass kind size to
//! zero bytes and travel as empty frames, so the same export/import lists
//! can drive the element pass, the node pass, and the ghost-node pass
//! without being split up front.
//!
//! Payload layouts (all little-endian, sizes fixed by the local mesh):
//!
//! * node: `component:u64, coords:[f64;dim], count:u64, elem_gids:[u64;count]`
//! * element: `component:u64, node_gids:[u64;nodes_per_elem]`
//!
//! Element connectivity must be in [`Numbering::Global`] before elements
//! move; local rows would be meaningless on the destination rank.
//!
//! [`Numbering::Global`]: crate::mesh::Numbering::Global

use std::collections::BTreeSet;

use hashbrown::HashMap;
use log::debug;

use crate::comm::Communicator;
use crate::error::{RepartError, Result};
use crate::ghost::update_ghost_set;
use crate::mesh::{LocalEntityRef, MeshPartition};
use crate::oracle::{Assignment, MigrationCallbacks, MigrationRecord};
use crate::wire::{WireReader, WireRecord, WireWriter, decode_records, encode_records};

const TAG_WANT: u16 = 20;
const TAG_FOUND: u16 = 21;

/// Entity kind selecting which global ids a migration pass moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Owned node rows; the source keeps the row but marks it ghost.
    Node,
    /// Node rows copied to a rank that needs them for connectivity only.
    GhostNode,
    /// Element rows; the source drops the row once packing is done.
    Element,
}

/// Migration callbacks bound to one mesh partition and one pass kind.
pub struct EntityMigrator<'a> {
    mesh: &'a mut MeshPartition,
    kind: EntityKind,
    rank: usize,
    ghost_set: Option<&'a mut BTreeSet<u64>>,
    // element removals are deferred so local refs in the assignment stay
    // valid throughout the packing loop
    pending_elem_removals: Vec<(usize, usize)>,
}

impl<'a> EntityMigrator<'a> {
    /// Pass moving owned nodes to their new ranks.
    pub fn nodes(mesh: &'a mut MeshPartition, rank: usize) -> Self {
        Self::with_kind(mesh, EntityKind::Node, rank, None)
    }

    /// Pass copying ghost nodes to the ranks that requested them.
    pub fn ghost_nodes(mesh: &'a mut MeshPartition, rank: usize) -> Self {
        Self::with_kind(mesh, EntityKind::GhostNode, rank, None)
    }

    /// Pass moving elements; updates `ghost_set` once all elements landed.
    pub fn elements(
        mesh: &'a mut MeshPartition,
        rank: usize,
        ghost_set: &'a mut BTreeSet<u64>,
    ) -> Self {
        Self::with_kind(mesh, EntityKind::Element, rank, Some(ghost_set))
    }

    fn with_kind(
        mesh: &'a mut MeshPartition,
        kind: EntityKind,
        rank: usize,
        ghost_set: Option<&'a mut BTreeSet<u64>>,
    ) -> Self {
        Self {
            mesh,
            kind,
            rank,
            ghost_set,
            pending_elem_removals: Vec::new(),
        }
    }

    fn is_pass_kind(&self, gid: u64) -> bool {
        let is_elem = gid >= self.mesh.elem_start();
        matches!(self.kind, EntityKind::Element) == is_elem
    }

    fn node_block(&self, component: u32) -> Result<usize> {
        let b = component as usize;
        if b >= self.mesh.node_blocks.len() {
            return Err(RepartError::ComponentOutOfRange {
                rank: self.rank,
                component: b,
                count: self.mesh.component_count(),
            });
        }
        Ok(b)
    }

    fn elem_block(&self, component: u32) -> Result<usize> {
        match self.mesh.elem_block_of_component(component as usize) {
            Some(b) if b < self.mesh.elem_blocks.len() => Ok(b),
            _ => Err(RepartError::ComponentOutOfRange {
                rank: self.rank,
                component: component as usize,
                count: self.mesh.component_count(),
            }),
        }
    }
}

impl MigrationCallbacks for EntityMigrator<'_> {
    fn entity_size(&self, rec: &MigrationRecord) -> Result<usize> {
        if !self.is_pass_kind(rec.gid) {
            return Ok(0);
        }
        match self.kind {
            EntityKind::Node | EntityKind::GhostNode => {
                let b = self.node_block(rec.local.component)?;
                let n_elems = self.mesh.node_blocks[b]
                    .node_to_elems
                    .row_len(rec.local.row as usize);
                Ok(8 + self.mesh.dim() * 8 + 8 + n_elems * 8)
            }
            EntityKind::Element => {
                let b = self.elem_block(rec.local.component)?;
                Ok(8 + self.mesh.elem_blocks[b].connectivity.width() * 8)
            }
        }
    }

    fn pack(&mut self, rec: &MigrationRecord, out: &mut WireWriter) -> Result<()> {
        let row = rec.local.row as usize;
        match self.kind {
            EntityKind::Node | EntityKind::GhostNode => {
                let b = self.node_block(rec.local.component)?;
                let block = &mut self.mesh.node_blocks[b];
                out.put_u64(rec.local.component as u64);
                for &x in block.coords.row(row) {
                    out.put_f64(x);
                }
                let elems = block.node_to_elems.row(row);
                out.put_u64(elems.len() as u64);
                for &e in elems {
                    out.put_u64(e);
                }
                // an exported node degrades to a ghost on the source rank;
                // a ghost-node export is a copy and leaves the source alone
                if self.kind == EntityKind::Node {
                    block.is_ghost[row] = true;
                }
            }
            EntityKind::Element => {
                let b = self.elem_block(rec.local.component)?;
                let block = &self.mesh.elem_blocks[b];
                out.put_u64(rec.local.component as u64);
                for &gid in block.connectivity.row(row) {
                    out.put_u64(gid);
                }
                self.pending_elem_removals.push((b, row));
            }
        }
        Ok(())
    }

    fn apply_exports(&mut self) -> Result<()> {
        if self.pending_elem_removals.is_empty() {
            return Ok(());
        }
        debug!(
            "rank {}: dropping {} exported element rows",
            self.rank,
            self.pending_elem_removals.len()
        );
        for b in 0..self.mesh.elem_blocks.len() {
            let rows: Vec<usize> = self
                .pending_elem_removals
                .iter()
                .filter(|&&(blk, _)| blk == b)
                .map(|&(_, row)| row)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let block = &mut self.mesh.elem_blocks[b];
            let mut conn = block.connectivity.buffer();
            for &row in &rows {
                conn.rm_row(row);
            }
            conn.flush();
            let mut keep = vec![true; block.global_ids.len()];
            for &row in &rows {
                keep[row] = false;
            }
            let mut i = 0;
            block.global_ids.retain(|_| {
                i += 1;
                keep[i - 1]
            });
        }
        self.pending_elem_removals.clear();
        Ok(())
    }

    fn unpack(&mut self, gid: u64, payload: &[u8]) -> Result<()> {
        if !self.is_pass_kind(gid) {
            // non-empty payload for a wrong-range id means the sender and
            // receiver disagree about the pass; empty frames never get here
            return Err(RepartError::KindBoundary {
                rank: self.rank,
                gid,
                kind: self.kind,
            });
        }
        let mut rd = WireReader::new(payload);
        let component = rd.u64()? as u32;
        match self.kind {
            EntityKind::Node | EntityKind::GhostNode => {
                let b = self.node_block(component)?;
                let dim = self.mesh.dim();
                let mut coords = Vec::with_capacity(dim);
                for _ in 0..dim {
                    coords.push(rd.f64()?);
                }
                let count = rd.u64()? as usize;
                let mut elems = Vec::with_capacity(count);
                for _ in 0..count {
                    elems.push(rd.u64()?);
                }
                let ghost = self.kind == EntityKind::GhostNode;
                self.mesh.node_blocks[b].push_node(&coords, ghost, gid, &elems);
            }
            EntityKind::Element => {
                let b = self.elem_block(component)?;
                let elem_start = self.mesh.elem_start();
                let width = self.mesh.elem_blocks[b].connectivity.width();
                let mut nodes = Vec::with_capacity(width);
                for _ in 0..width {
                    nodes.push(rd.u64()?);
                }
                self.mesh.elem_blocks[b].push_elem(&nodes, gid - elem_start);
            }
        }
        Ok(())
    }

    fn post_migrate(&mut self, assignment: &Assignment) -> Result<()> {
        if let Some(ghost_set) = self.ghost_set.as_deref_mut() {
            update_ghost_set(self.mesh, ghost_set, assignment)?;
        }
        Ok(())
    }
}

/// Resolve ghost-node requests against current owners.
///
/// Two synchronous all-pairs rounds: every rank first broadcasts the global
/// node ids it needs as ghosts, then every owner answers each request with
/// the subset it holds as owned (non-ghost) rows. The returned assignment
/// feeds the ghost-node migration pass; exports carry the owner's local
/// locators, imports the requester's view of where each copy comes from.
///
/// A request no rank can satisfy is a hard error: it means ownership and the
/// ghost bookkeeping disagree.
pub fn invert_ghost_requests<C: Communicator>(
    mesh: &MeshPartition,
    wanted: &BTreeSet<u64>,
    comm: &C,
) -> Result<Assignment> {
    let me = comm.rank();
    let nprocs = comm.size();

    let mut want_msg = WireWriter::with_capacity(8 + wanted.len() * 8);
    want_msg.put_u64(wanted.len() as u64);
    for &gid in wanted {
        want_msg.put_u64(gid);
    }
    let want_msg = want_msg.into_bytes();
    for peer in 0..nprocs {
        if peer != me {
            comm.send(peer, TAG_WANT, &want_msg);
        }
    }

    // owned rows by global id, rebuilt per round: rows shift with every
    // migration pass
    let mut owned: HashMap<u64, LocalEntityRef> = HashMap::new();
    for (b, block) in mesh.node_blocks.iter().enumerate() {
        for row in 0..block.len() {
            if !block.is_ghost[row] {
                owned.insert(
                    block.global_ids[row],
                    LocalEntityRef {
                        component: b as u32,
                        row: row as u32,
                    },
                );
            }
        }
    }

    let mut exports = Vec::new();
    for peer in 0..nprocs {
        if peer == me {
            continue;
        }
        let buf = comm.recv(peer, TAG_WANT);
        let mut rd = WireReader::new(&buf);
        let count = rd.u64()? as usize;
        let mut found = Vec::new();
        for _ in 0..count {
            let gid = rd.u64()?;
            if let Some(&local) = owned.get(&gid) {
                found.push(WireRecord::new(gid, local.component, local.row, peer as u32));
                exports.push(MigrationRecord {
                    gid,
                    local,
                    peer: peer as u32,
                    part: peer as u32,
                });
            }
        }
        comm.send(peer, TAG_FOUND, &encode_records(&found));
    }

    let mut imports = Vec::new();
    for peer in 0..nprocs {
        if peer == me {
            continue;
        }
        for rec in decode_records(&comm.recv(peer, TAG_FOUND))? {
            let (gid, component, row, part) = rec.decode();
            debug_assert_eq!(part, me as u32);
            imports.push(MigrationRecord {
                gid,
                local: LocalEntityRef { component, row },
                peer: peer as u32,
                part,
            });
        }
    }

    let satisfied: BTreeSet<u64> = imports.iter().map(|r| r.gid).collect();
    if let Some(&missing) = wanted.difference(&satisfied).next() {
        return Err(RepartError::LookupFailed {
            rank: me,
            gid: missing,
        });
    }
    debug!(
        "rank {me}: ghost inversion resolved {} requests, serving {} copies",
        imports.len(),
        exports.len()
    );

    let changed = comm.all_reduce_sum((exports.len() + imports.len()) as u64) > 0;
    Ok(Assignment {
        changed,
        imports,
        exports,
    })
}
