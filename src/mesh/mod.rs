//! Process-local slice of a distributed unstructured mesh.
//!
//! A [`MeshPartition`] owns, per region, one node block and any number of
//! element blocks. A node block keeps four parallel per-row tables:
//! coordinates, ghost flag, global node id, and the list of global element
//! ids referencing the node. The four tables must stay in lockstep at all
//! times; every structural change goes through [`NodeBlockBuffer`], which
//! applies one removal decision to all four tables at once.
//!
//! Components are enumerated in a fixed order: all node blocks first, then
//! all element blocks. A [`LocalEntityRef`] is a `(component, row)` pair in
//! that enumeration and is invalidated by any migration.

pub mod dyn_table;
pub mod table;

use serde::{Deserialize, Serialize};

use crate::error::{RepartError, Result};
use dyn_table::DynTable;
use table::Table;

/// Which numbers the element connectivity tables currently hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering {
    /// Entries are partition-local node rows (block offsets + row index).
    Local,
    /// Entries are global node ids, safe for cross-process transport.
    Global,
}

impl Numbering {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Numbering::Local => "local",
            Numbering::Global => "global",
        }
    }
}

/// `(component, row)` locator within the local mesh.
///
/// Component indices enumerate node blocks first, element blocks second.
/// Only valid until the next migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalEntityRef {
    pub component: u32,
    pub row: u32,
}

/// One region's node storage: four parallel per-row tables.
#[derive(Debug, Clone, Default)]
pub struct NodeBlock {
    /// Row width = spatial dimension.
    pub coords: Table<f64>,
    /// True for nodes held only to complete local element connectivity.
    pub is_ghost: Vec<bool>,
    /// Global node id per row.
    pub global_ids: Vec<u64>,
    /// Global element ids referencing each node.
    pub node_to_elems: DynTable<u64>,
}

impl NodeBlock {
    pub fn new(dim: usize) -> Self {
        Self {
            coords: Table::new(dim),
            is_ghost: Vec::new(),
            global_ids: Vec::new(),
            node_to_elems: DynTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Append one node row to all four tables.
    pub fn push_node(&mut self, coords: &[f64], ghost: bool, gid: u64, elems: &[u64]) {
        self.coords.push_row(coords);
        self.is_ghost.push(ghost);
        self.global_ids.push(gid);
        self.node_to_elems.push_row(elems);
    }

    /// Lockstep removal buffer over the four parallel tables.
    pub fn removal_buffer(&mut self) -> NodeBlockBuffer<'_> {
        NodeBlockBuffer {
            block: self,
            removed: Vec::new(),
        }
    }

    /// The four tables must always have the same number of rows.
    pub fn in_lockstep(&self) -> bool {
        let n = self.coords.len();
        self.is_ghost.len() == n && self.global_ids.len() == n && self.node_to_elems.len() == n
    }
}

/// Queues per-row removals and applies them to all four node tables in one
/// pass. Removing from any single table on its own would desynchronize the
/// block; this buffer is the only removal path.
pub struct NodeBlockBuffer<'a> {
    block: &'a mut NodeBlock,
    removed: Vec<usize>,
}

impl<'a> NodeBlockBuffer<'a> {
    pub fn rm_row(&mut self, i: usize) {
        self.removed.push(i);
    }

    pub fn flush(self) {
        if self.removed.is_empty() {
            return;
        }
        let mut coords = self.block.coords.buffer();
        for &i in &self.removed {
            coords.rm_row(i);
        }
        coords.flush();
        let mut elems = self.block.node_to_elems.buffer();
        for &i in &self.removed {
            elems.rm_row(i);
        }
        elems.flush();
        let mut keep = vec![true; self.block.is_ghost.len()];
        for &i in &self.removed {
            keep[i] = false;
        }
        let mut i = 0;
        self.block.is_ghost.retain(|_| {
            i += 1;
            keep[i - 1]
        });
        let mut i = 0;
        self.block.global_ids.retain(|_| {
            i += 1;
            keep[i - 1]
        });
    }
}

/// One region's element storage.
#[derive(Debug, Clone, Default)]
pub struct ElemBlock {
    /// Row width = nodes per element; entries are local rows or global node
    /// ids depending on the mesh's [`Numbering`].
    pub connectivity: Table<u64>,
    /// Global element id per row.
    pub global_ids: Vec<u64>,
}

impl ElemBlock {
    pub fn new(nodes_per_elem: usize) -> Self {
        Self {
            connectivity: Table::new(nodes_per_elem),
            global_ids: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connectivity.len()
    }

    pub fn push_elem(&mut self, nodes: &[u64], gid: u64) {
        self.connectivity.push_row(nodes);
        self.global_ids.push(gid);
    }
}

/// The process-local mesh slice mutated by a partitioning round.
#[derive(Debug, Clone)]
pub struct MeshPartition {
    dim: usize,
    nb_global_nodes: u64,
    nb_global_elems: u64,
    pub node_blocks: Vec<NodeBlock>,
    pub elem_blocks: Vec<ElemBlock>,
    numbering: Numbering,
}

impl MeshPartition {
    pub fn new(dim: usize, nb_global_nodes: u64, nb_global_elems: u64) -> Self {
        Self {
            dim,
            nb_global_nodes,
            nb_global_elems,
            node_blocks: Vec::new(),
            elem_blocks: Vec::new(),
            numbering: Numbering::Local,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total node count across the whole distributed mesh.
    pub fn nb_global_nodes(&self) -> u64 {
        self.nb_global_nodes
    }

    /// Total element count across the whole distributed mesh.
    pub fn nb_global_elems(&self) -> u64 {
        self.nb_global_elems
    }

    /// First global id of the element range; node ids live below it.
    pub fn elem_start(&self) -> u64 {
        self.nb_global_nodes
    }

    pub fn numbering(&self) -> Numbering {
        self.numbering
    }

    pub(crate) fn set_numbering(&mut self, n: Numbering) {
        self.numbering = n;
    }

    pub(crate) fn expect_numbering(&self, expected: Numbering) -> Result<()> {
        if self.numbering != expected {
            return Err(RepartError::WrongNumbering {
                expected: expected.name(),
                found: self.numbering.name(),
            });
        }
        Ok(())
    }

    /// Components in traversal order: node blocks, then element blocks.
    pub fn component_count(&self) -> usize {
        self.node_blocks.len() + self.elem_blocks.len()
    }

    /// Component index of element block `b`.
    pub fn elem_component(&self, b: usize) -> u32 {
        (self.node_blocks.len() + b) as u32
    }

    /// Inverse of [`Self::elem_component`]; `None` for node components.
    pub fn elem_block_of_component(&self, component: usize) -> Option<usize> {
        component.checked_sub(self.node_blocks.len())
    }

    /// Locally-owned (non-ghost) node count.
    pub fn nb_owned_nodes(&self) -> usize {
        self.node_blocks
            .iter()
            .map(|b| b.is_ghost.iter().filter(|&&g| !g).count())
            .sum()
    }

    pub fn nb_local_elems(&self) -> usize {
        self.elem_blocks.iter().map(|b| b.len()).sum()
    }

    /// Flattened local node index of `(block, row)`: rows of all node blocks
    /// concatenated in block order. This is the numbering element
    /// connectivity uses in [`Numbering::Local`] state.
    pub fn flat_node_index(&self, block: usize, row: usize) -> u64 {
        let offset: usize = self.node_blocks[..block].iter().map(|b| b.len()).sum();
        (offset + row) as u64
    }

    /// Resolve a flattened local node index back to `(block, row)`.
    pub fn node_of_flat_index(&self, flat: u64) -> Option<(usize, usize)> {
        let mut rest = flat as usize;
        for (b, block) in self.node_blocks.iter().enumerate() {
            if rest < block.len() {
                return Some((b, rest));
            }
            rest -= block.len();
        }
        None
    }

    /// Global node id of a flattened local node index.
    pub fn global_node_id(&self, flat: u64) -> Option<u64> {
        self.node_of_flat_index(flat)
            .map(|(b, r)| self.node_blocks[b].global_ids[r])
    }

    /// All four node tables in lockstep, in every block.
    pub fn tables_in_lockstep(&self) -> bool {
        self.node_blocks.iter().all(|b| b.in_lockstep())
    }
}
