//! Partitioning oracle adapter.
//!
//! The oracle is the combinatorial load balancer deciding which graph
//! vertices move where. It sees the local graph slice through the
//! [`GraphProvider`] capability trait and drives entity movement through the
//! [`MigrationCallbacks`] trait — one typed interface each instead of raw
//! callback registration with context pointers.
//!
//! [`migrate`] is the adapter's transport half: it turns an
//! [`Assignment`] plus a callback set into framed per-destination byte
//! messages over the communicator, preserving the assignment's entry order
//! exactly (byte offsets are derived from the sizing step, so reordering
//! would corrupt every message).
//!
//! [`BlockOracle`] is the built-in reference oracle: it assigns every vertex
//! to the rank given by the contiguous range hash over its id range. External
//! partitioners plug in behind the same [`Oracle`] trait.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::{RepartError, Result};
use crate::graph::{LocalGraph, elem_owner, node_owner};
use crate::mesh::LocalEntityRef;
use crate::wire::{WireEntityHdr, WireReader, WireRecord, WireWriter, decode_records, encode_records};

const TAG_ASSIGN: u16 = 10;

/// Load-balancing method requested from the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LbMethod {
    /// Balance over the node/element graph.
    #[default]
    Graph,
}

/// Graph symmetrization mode handed to the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symmetrize {
    /// Edges are already emitted symmetrically by the graph builder.
    #[default]
    None,
    /// Ask the oracle to symmetrize via the transpose.
    Transpose,
}

/// Typed oracle parameters (the key-value `Set_Param` surface of classic
/// partitioning libraries, as a struct).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Target part count; `None` means one part per rank.
    pub n_parts: Option<u32>,
    pub method: LbMethod,
    pub symmetrize: Symmetrize,
}

/// Read access to one rank's graph slice, as the oracle queries it:
/// object count, object list, per-object edge count, per-object edge list.
pub trait GraphProvider {
    fn object_count(&self) -> usize;
    fn object_gids(&self) -> &[u64];
    fn object_refs(&self) -> &[LocalEntityRef];
    fn edge_count(&self, obj: usize) -> usize;
    /// Neighbor global ids and their owning ranks, parallel slices.
    fn edges(&self, obj: usize) -> (&[u64], &[u32]);
    /// Total vertex count of the global graph (nodes + elements).
    fn global_vertex_count(&self) -> u64;
    /// First global id of the element range.
    fn elem_start(&self) -> u64;
}

impl GraphProvider for LocalGraph {
    fn object_count(&self) -> usize {
        self.vertex_count()
    }
    fn object_gids(&self) -> &[u64] {
        &self.vertex_gids
    }
    fn object_refs(&self) -> &[LocalEntityRef] {
        &self.vertex_refs
    }
    fn edge_count(&self, obj: usize) -> usize {
        self.xadj[obj + 1] - self.xadj[obj]
    }
    fn edges(&self, obj: usize) -> (&[u64], &[u32]) {
        self.neighbors(obj)
    }
    fn global_vertex_count(&self) -> u64 {
        self.nb_global_vertices
    }
    fn elem_start(&self) -> u64 {
        self.elem_start
    }
}

/// One entity movement decided by the oracle.
///
/// For exports, `local` locates the entity on this rank and `peer` is the
/// destination; for imports, `local` is the *source* rank's locator (kept
/// for diagnostics only) and `peer` is the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub gid: u64,
    pub local: LocalEntityRef,
    pub peer: u32,
    pub part: u32,
}

/// The oracle's verdict for one rank: what leaves, what arrives.
///
/// Consumed by kind-filtered migration passes in the exact order given;
/// local refs go stale after the first structural change, so an assignment
/// must never survive into the next round.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// True somewhere in the group: at least one vertex changes rank.
    pub changed: bool,
    pub imports: Vec<MigrationRecord>,
    pub exports: Vec<MigrationRecord>,
}

/// A combinatorial partitioner. Non-success is fatal for the round — there
/// is no partial or degraded partitioning result.
pub trait Oracle {
    fn partition<P: GraphProvider, C: Communicator>(
        &self,
        graph: &P,
        comm: &C,
        cfg: &OracleConfig,
    ) -> Result<Assignment>;
}

/// Migration hooks bound to one kind-filtered pass of the migration engine.
///
/// `entity_size` must return the exact byte size `pack` will write (zero for
/// entities outside the pass kind, which then travel as empty frames).
pub trait MigrationCallbacks {
    fn entity_size(&self, rec: &MigrationRecord) -> Result<usize>;
    fn pack(&mut self, rec: &MigrationRecord, out: &mut WireWriter) -> Result<()>;
    /// Apply deferred source-side effects (element row removal) after all
    /// packing is done and before anything is received.
    fn apply_exports(&mut self) -> Result<()>;
    fn unpack(&mut self, gid: u64, payload: &[u8]) -> Result<()>;
    fn post_migrate(&mut self, assignment: &Assignment) -> Result<()>;
}

/// Reference oracle: contiguous range assignment per id range.
///
/// Every node goes to `node_owner(gid)`, every element to
/// `elem_owner(gid - elem_start)` — the same hash the graph builder uses for
/// neighbor ownership, so a round converges to the canonical layout and a
/// second round reports `changed == false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockOracle;

impl Oracle for BlockOracle {
    fn partition<P: GraphProvider, C: Communicator>(
        &self,
        graph: &P,
        comm: &C,
        cfg: &OracleConfig,
    ) -> Result<Assignment> {
        let nprocs = comm.size();
        let n_parts = cfg.n_parts.unwrap_or(nprocs as u32);
        if n_parts as usize != nprocs {
            return Err(RepartError::OracleFailure(format!(
                "block oracle maps parts to ranks one-to-one; asked for {n_parts} parts on {nprocs} ranks"
            )));
        }

        let elem_start = graph.elem_start();
        let nb_nodes = elem_start;
        let nb_elems = graph.global_vertex_count() - elem_start;
        let me = comm.rank() as u32;

        let local_edges: usize = (0..graph.object_count()).map(|i| graph.edge_count(i)).sum();
        debug!(
            "rank {}: block oracle over {} objects, {} local edges",
            comm.rank(),
            graph.object_count(),
            local_edges
        );

        let mut exports = Vec::new();
        let mut outgoing: BTreeMap<u32, Vec<WireRecord>> = BTreeMap::new();
        for (&gid, &local) in graph.object_gids().iter().zip(graph.object_refs()) {
            let target = if gid < elem_start {
                node_owner(gid, nb_nodes, nprocs)
            } else {
                elem_owner(gid - elem_start, nb_elems, nprocs)
            };
            if target != me {
                exports.push(MigrationRecord {
                    gid,
                    local,
                    peer: target,
                    part: target,
                });
                outgoing
                    .entry(target)
                    .or_default()
                    .push(WireRecord::new(gid, local.component, local.row, target));
            }
        }

        // tell every destination what is coming; every rank must hear from
        // every other rank, empty lists included
        for peer in 0..nprocs {
            if peer != me as usize {
                let records = outgoing.get(&(peer as u32)).map(Vec::as_slice).unwrap_or(&[]);
                comm.send(peer, TAG_ASSIGN, &encode_records(records));
            }
        }
        let mut imports = Vec::new();
        for peer in 0..nprocs {
            if peer == me as usize {
                continue;
            }
            for rec in decode_records(&comm.recv(peer, TAG_ASSIGN))? {
                let (gid, component, row, part) = rec.decode();
                imports.push(MigrationRecord {
                    gid,
                    local: LocalEntityRef { component, row },
                    peer: peer as u32,
                    part,
                });
            }
        }

        let changed = comm.all_reduce_sum(exports.len() as u64) > 0;
        Ok(Assignment {
            changed,
            imports,
            exports,
        })
    }
}

/// Transport half of the adapter: run one kind-filtered migration pass.
///
/// Packs exports per destination at cooperatively computed offsets, sends
/// one framed message per destination, receives one from every import
/// source, unpacks in arrival-frame order, then fires the post-migrate hook.
/// Entered and left through a group barrier.
pub fn migrate<M: MigrationCallbacks, C: Communicator>(
    assignment: &Assignment,
    callbacks: &mut M,
    comm: &C,
    tag: u16,
) -> Result<()> {
    comm.barrier();

    let mut by_peer: BTreeMap<u32, Vec<&MigrationRecord>> = BTreeMap::new();
    for rec in &assignment.exports {
        by_peer.entry(rec.peer).or_default().push(rec);
    }

    let mut messages: Vec<(u32, Vec<u8>)> = Vec::with_capacity(by_peer.len());
    for (&peer, records) in &by_peer {
        let mut headers = Vec::with_capacity(records.len());
        let mut payload = WireWriter::new();
        for rec in records {
            let size = callbacks.entity_size(rec)?;
            let before = payload.len();
            if size > 0 {
                callbacks.pack(rec, &mut payload)?;
            }
            let wrote = payload.len() - before;
            if wrote != size {
                return Err(RepartError::PackSizeMismatch {
                    rank: comm.rank(),
                    gid: rec.gid,
                    expected: size,
                    wrote,
                });
            }
            headers.push(WireEntityHdr::new(rec.gid, size));
        }
        let payload = payload.into_bytes();
        let mut msg =
            Vec::with_capacity(8 + headers.len() * std::mem::size_of::<WireEntityHdr>() + payload.len());
        msg.extend_from_slice(&(headers.len() as u64).to_le_bytes());
        msg.extend_from_slice(bytemuck::cast_slice(&headers));
        msg.extend_from_slice(&payload);
        messages.push((peer, msg));
    }

    callbacks.apply_exports()?;

    for (peer, msg) in messages {
        comm.send(peer as usize, tag, &msg);
    }

    let sources: BTreeSet<u32> = assignment.imports.iter().map(|r| r.peer).collect();
    for src in sources {
        let buf = comm.recv(src as usize, tag);
        let mut rd = WireReader::new(&buf);
        let count = rd.u64()? as usize;
        // frame count comes off the wire; the header size product must not
        // wrap before the bounds check
        let hdr_bytes = count
            .checked_mul(std::mem::size_of::<WireEntityHdr>())
            .ok_or(RepartError::WireTruncated {
                need: usize::MAX,
                have: rd.remaining(),
            })?;
        if rd.remaining() < hdr_bytes {
            return Err(RepartError::WireTruncated {
                need: hdr_bytes,
                have: rd.remaining(),
            });
        }
        let mut headers = vec![WireEntityHdr::new(0, 0); count];
        bytemuck::cast_slice_mut::<WireEntityHdr, u8>(&mut headers)
            .copy_from_slice(&buf[8..8 + hdr_bytes]);
        let mut offset = 8 + hdr_bytes;
        for hdr in &headers {
            let size = hdr.size();
            if size > 0 {
                let end = offset + size;
                if end > buf.len() {
                    return Err(RepartError::WireTruncated {
                        need: size,
                        have: buf.len() - offset,
                    });
                }
                callbacks.unpack(hdr.gid(), &buf[offset..end])?;
                offset = end;
            }
        }
    }

    callbacks.post_migrate(assignment)?;
    comm.barrier();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::graph::LocalGraph;

    fn single_rank_graph(gids: &[u64], elem_start: u64, total: u64) -> LocalGraph {
        LocalGraph {
            vertex_gids: gids.to_vec(),
            vertex_refs: gids
                .iter()
                .enumerate()
                .map(|(i, _)| LocalEntityRef {
                    component: 0,
                    row: i as u32,
                })
                .collect(),
            xadj: vec![0; gids.len() + 1],
            nb_global_vertices: total,
            elem_start,
            ..Default::default()
        }
    }

    #[test]
    fn canonical_layout_yields_no_movement() {
        let comm = LocalComm::serial();
        let graph = single_rank_graph(&[0, 1, 2, 3, 4, 5], 4, 6);
        let a = BlockOracle
            .partition(&graph, &comm, &OracleConfig::default())
            .unwrap();
        assert!(!a.changed);
        assert!(a.exports.is_empty() && a.imports.is_empty());
    }

    #[test]
    fn part_count_must_match_rank_count() {
        let comm = LocalComm::serial();
        let graph = single_rank_graph(&[0], 1, 1);
        let cfg = OracleConfig {
            n_parts: Some(4),
            ..Default::default()
        };
        assert!(matches!(
            BlockOracle.partition(&graph, &comm, &cfg),
            Err(RepartError::OracleFailure(_))
        ));
    }

    #[test]
    fn two_ranks_exchange_block_assignment() {
        // 4 nodes, no elements; rank 0 starts with all of them, the block
        // layout wants 2-3 on rank 1
        let handles: Vec<_> = LocalComm::group(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let gids: &[u64] = if comm.rank() == 0 { &[0, 1, 2, 3] } else { &[] };
                    let graph = single_rank_graph(gids, 4, 4);
                    BlockOracle
                        .partition(&graph, &comm, &OracleConfig::default())
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<Assignment> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results[0].changed && results[1].changed);
        let exported: Vec<u64> = results[0].exports.iter().map(|r| r.gid).collect();
        assert_eq!(exported, vec![2, 3]);
        let imported: Vec<u64> = results[1].imports.iter().map(|r| r.gid).collect();
        assert_eq!(imported, vec![2, 3]);
        assert!(results[1].exports.is_empty());
    }

    struct NullCallbacks;

    impl MigrationCallbacks for NullCallbacks {
        fn entity_size(&self, _: &MigrationRecord) -> Result<usize> {
            Ok(0)
        }
        fn pack(&mut self, _: &MigrationRecord, _: &mut WireWriter) -> Result<()> {
            Ok(())
        }
        fn apply_exports(&mut self) -> Result<()> {
            Ok(())
        }
        fn unpack(&mut self, _: u64, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn post_migrate(&mut self, _: &Assignment) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn corrupt_frame_count_is_rejected() {
        // a frame count whose header size overflows usize must fail the
        // bounds check instead of wrapping past it
        let comm = LocalComm::serial();
        let mut msg = u64::MAX.to_le_bytes().to_vec();
        msg.extend_from_slice(&[0u8; 8]);
        comm.send(0, 9, &msg);

        let assignment = Assignment {
            changed: true,
            imports: vec![MigrationRecord {
                gid: 0,
                local: LocalEntityRef { component: 0, row: 0 },
                peer: 0,
                part: 0,
            }],
            exports: vec![],
        };
        let err = migrate(&assignment, &mut NullCallbacks, &comm, 9).unwrap_err();
        assert!(matches!(err, RepartError::WireTruncated { .. }));
    }

    #[test]
    fn oracle_config_serde_roundtrip() {
        let cfg = OracleConfig {
            n_parts: Some(3),
            method: LbMethod::Graph,
            symmetrize: Symmetrize::None,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: OracleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_parts, Some(3));
        assert_eq!(back.method, cfg.method);
    }
}
