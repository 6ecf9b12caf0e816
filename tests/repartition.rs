//! End-to-end repartitioning rounds over an in-process rank group.

use std::collections::{BTreeSet, HashMap};
use std::thread;

use mesh_repart::prelude::*;

/// Corner node gids of quad `e` in a 5x5 node grid (16 elements).
fn quad(e: u64) -> [u64; 4] {
    let (r, c) = (e / 4, e % 4);
    let n = 5 * r + c;
    [n, n + 1, n + 6, n + 5]
}

fn coords(gid: u64) -> [f64; 2] {
    [(gid % 5) as f64, (gid / 5) as f64]
}

fn node_elems(gid: u64) -> Vec<u64> {
    (0..16).filter(|&e| quad(e).contains(&gid)).collect()
}

/// One rank's initial slice of the grid: a deliberately unbalanced
/// distribution the block layout will want to shift.
fn rank_mesh(rank: usize) -> MeshPartition {
    let owned: Vec<u64> = match rank {
        0 => (0..8).collect(),
        1 => (8..16).collect(),
        _ => (16..25).collect(),
    };
    let elems: Vec<u64> = match rank {
        0 => (0..5).collect(),
        1 => (5..10).collect(),
        _ => (10..16).collect(),
    };
    let owned_set: BTreeSet<u64> = owned.iter().copied().collect();
    let needed: BTreeSet<u64> = elems.iter().flat_map(|&e| quad(e)).collect();

    let mut mesh = MeshPartition::new(2, 25, 16);
    let mut nodes = NodeBlock::new(2);
    let mut flat: HashMap<u64, u64> = HashMap::new();
    for &gid in &owned {
        flat.insert(gid, flat.len() as u64);
        nodes.push_node(&coords(gid), false, gid, &node_elems(gid));
    }
    for &gid in needed.difference(&owned_set) {
        flat.insert(gid, flat.len() as u64);
        nodes.push_node(&coords(gid), true, gid, &node_elems(gid));
    }
    mesh.node_blocks.push(nodes);

    let mut block = ElemBlock::new(4);
    for &e in &elems {
        let local: Vec<u64> = quad(e).iter().map(|g| flat[g]).collect();
        block.push_elem(&local, e);
    }
    mesh.elem_blocks.push(block);
    mesh
}

#[test]
fn five_by_five_grid_rebalances_across_three_ranks() {
    let handles: Vec<_> = LocalComm::group(3)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.rank();
                let mut driver = PartitionDriver::new(comm, BlockOracle, OracleConfig::default());
                driver.initialize(rank_mesh(rank)).unwrap();
                assert!(driver.partition_graph().unwrap());
                driver.show_changes().unwrap();
                // the settled layout is a fixed point: a second round moves
                // nothing
                assert!(!driver.partition_graph().unwrap());
                driver.into_mesh().unwrap()
            })
        })
        .collect();
    let meshes: Vec<MeshPartition> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let expected_owned = [0u64..9, 9..18, 18..25];
    let expected_ghosts: [&[u64]; 3] = [&[9, 10, 11, 12], &[7, 8, 18, 19], &[15, 16, 17]];
    let expected_elems = [0u64..6, 6..12, 12..16];

    for (rank, mesh) in meshes.iter().enumerate() {
        assert_eq!(mesh.numbering(), Numbering::Local);
        assert!(mesh.tables_in_lockstep());

        let block = &mesh.node_blocks[0];
        let owned: BTreeSet<u64> = (0..block.len())
            .filter(|&r| !block.is_ghost[r])
            .map(|r| block.global_ids[r])
            .collect();
        assert_eq!(owned, expected_owned[rank].clone().collect(), "rank {rank}");
        let ghosts: BTreeSet<u64> = (0..block.len())
            .filter(|&r| block.is_ghost[r])
            .map(|r| block.global_ids[r])
            .collect();
        assert_eq!(
            ghosts,
            expected_ghosts[rank].iter().copied().collect(),
            "rank {rank}"
        );

        let elems: BTreeSet<u64> = mesh.elem_blocks[0].global_ids.iter().copied().collect();
        assert_eq!(elems, expected_elems[rank].clone().collect(), "rank {rank}");

        // every element resolves to its true corner nodes through the local
        // numbering
        for row in 0..mesh.elem_blocks[0].len() {
            let e = mesh.elem_blocks[0].global_ids[row];
            let resolved: Vec<u64> = mesh.elem_blocks[0]
                .connectivity
                .row(row)
                .iter()
                .map(|&f| mesh.global_node_id(f).unwrap())
                .collect();
            assert_eq!(resolved, quad(e).to_vec(), "rank {rank} element {e}");
        }

        // node payloads survived both moves and ghost copies
        for r in 0..block.len() {
            let gid = block.global_ids[r];
            assert_eq!(block.coords.row(r), &coords(gid)[..]);
            assert_eq!(block.node_to_elems.row(r), &node_elems(gid)[..]);
        }
    }

    // ownership is a partition of the global id spaces
    let mut all_nodes = BTreeSet::new();
    let mut all_elems = BTreeSet::new();
    for mesh in &meshes {
        let block = &mesh.node_blocks[0];
        for r in 0..block.len() {
            if !block.is_ghost[r] {
                assert!(all_nodes.insert(block.global_ids[r]), "node owned twice");
            }
        }
        for &e in &mesh.elem_blocks[0].global_ids {
            assert!(all_elems.insert(e), "element held twice");
        }
    }
    assert_eq!(all_nodes, (0..25).collect());
    assert_eq!(all_elems, (0..16).collect());
}

#[test]
fn migration_into_an_initially_empty_rank() {
    // rank 0 starts with the whole mesh (4 nodes, one quad), rank 1 with
    // nothing; the block layout pushes nodes 2-3 over
    let handles: Vec<_> = LocalComm::group(2)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.rank();
                let mut mesh = MeshPartition::new(2, 4, 1);
                let mut nodes = NodeBlock::new(2);
                let mut elems = ElemBlock::new(4);
                if rank == 0 {
                    for gid in 0u64..4 {
                        nodes.push_node(&[gid as f64, 0.0], false, gid, &[0]);
                    }
                    elems.push_elem(&[0, 1, 2, 3], 0);
                }
                mesh.node_blocks.push(nodes);
                mesh.elem_blocks.push(elems);

                let mut driver = PartitionDriver::new(comm, BlockOracle, OracleConfig::default());
                driver.initialize(mesh).unwrap();
                assert!(driver.partition_graph().unwrap());
                driver.into_mesh().unwrap()
            })
        })
        .collect();
    let meshes: Vec<MeshPartition> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let b0 = &meshes[0].node_blocks[0];
    let owned0: Vec<u64> = (0..b0.len())
        .filter(|&r| !b0.is_ghost[r])
        .map(|r| b0.global_ids[r])
        .collect();
    let ghosts0: Vec<u64> = (0..b0.len())
        .filter(|&r| b0.is_ghost[r])
        .map(|r| b0.global_ids[r])
        .collect();
    assert_eq!(owned0, vec![0, 1]);
    assert_eq!(ghosts0, vec![2, 3]);
    assert_eq!(meshes[0].nb_local_elems(), 1);

    let b1 = &meshes[1].node_blocks[0];
    let owned1: Vec<u64> = (0..b1.len())
        .filter(|&r| !b1.is_ghost[r])
        .map(|r| b1.global_ids[r])
        .collect();
    assert_eq!(owned1, vec![2, 3]);
    // no local elements, so no ghosts either
    assert!((0..b1.len()).all(|r| !b1.is_ghost[r]));
    assert_eq!(meshes[1].nb_local_elems(), 0);
}
