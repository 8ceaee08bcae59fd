//! Forced rebuild: reconstruct every reference count from the block map.
//!
//! Used when the recovery journal cannot be trusted. The block map is
//! taken as authoritative; invalid or unreadable leaves read as unmapped,
//! and every reachable mapping contributes one reference.

use crate::errors::VdoResult;
use crate::physical::PhysicalLayer;
use crate::recovery::walk_tree;
use crate::slab_depot::SlabDepot;
use crate::types::Pbn;

/// Tallies produced by a rebuild.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildResult {
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

/// Zero the depot's counters and repopulate them from the tree.
pub fn rebuild_ref_counts<L: PhysicalLayer>(
    layer: &L,
    depot: &mut SlabDepot,
    nonce: u64,
    root_origin: Pbn,
    root_count: u64,
) -> VdoResult<RebuildResult> {
    depot.reset_for_rebuild();

    let mut result = RebuildResult::default();
    let mut skipped = 0u64;
    walk_tree(layer, nonce, root_origin, root_count, |_, _, mapping, is_tree| {
        if is_tree {
            if depot.rebuild_reference(layer, mapping.pbn, true).is_ok() {
                result.block_map_data_blocks += 1;
            } else {
                skipped += 1;
            }
        } else {
            result.logical_blocks_used += 1;
            if depot.rebuild_reference(layer, mapping.pbn, false).is_err() {
                skipped += 1;
            }
        }
    })?;
    if skipped > 0 {
        log::warn!("rebuild skipped {} mappings outside the data region", skipped);
    }

    let _ = depot.drain(layer)?;
    layer.flush()?;
    log::info!(
        "rebuild complete: {} logical blocks, {} tree pages",
        result.logical_blocks_used,
        result.block_map_data_blocks
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_map::page;
    use crate::physical::RamLayer;
    use crate::slab_depot::{SlabDepot, SlabGeometry};
    use crate::slab_depot::summary::SlabSummary;
    use crate::types::Mapping;

    const NONCE: u64 = 0x4242;

    #[test]
    fn refcounts_match_tree_exactly() {
        let layer = RamLayer::new(2048);
        let geometry = SlabGeometry::compute(256, 8).unwrap();
        let summary = SlabSummary::new(40, 4);
        let mut depot =
            SlabDepot::new(NONCE, 1024, 4, geometry, 1, summary, true).unwrap();

        // A tree with one leaf (inside the data region, as a real tree
        // page would be) and three data mappings, two sharing a block.
        let leaf_pbn = 1024;
        let shared = 1030;
        let unique = 1031;
        let mut interior = page::new_page(NONCE, 80);
        page::set_entry(&mut interior[..], 0, &Mapping::uncompressed(leaf_pbn)).unwrap();
        layer.write_block(80, &interior[..]).unwrap();
        let mut leaf = page::new_page(NONCE, leaf_pbn);
        page::set_entry(&mut leaf[..], 0, &Mapping::uncompressed(shared)).unwrap();
        page::set_entry(&mut leaf[..], 1, &Mapping::uncompressed(shared)).unwrap();
        page::set_entry(&mut leaf[..], 2, &Mapping::uncompressed(unique)).unwrap();
        layer.write_block(leaf_pbn, &leaf[..]).unwrap();

        let result = rebuild_ref_counts(&layer, &mut depot, NONCE, 80, 1).unwrap();
        assert_eq!(result.logical_blocks_used, 3);
        assert_eq!(result.block_map_data_blocks, 1);
        assert_eq!(depot.reference_count(shared).unwrap(), 2);
        assert_eq!(depot.reference_count(unique).unwrap(), 1);
        assert_eq!(
            depot.reference_count(leaf_pbn).unwrap(),
            crate::constants::MAXIMUM_REFERENCE_COUNT
        );
        // Everything else stays empty.
        assert_eq!(depot.reference_count(1025).unwrap(), 0);
    }

    #[test]
    fn corrupt_leaf_reads_as_unmapped() {
        let layer = RamLayer::new(2048);
        let geometry = SlabGeometry::compute(256, 8).unwrap();
        let summary = SlabSummary::new(40, 4);
        let mut depot =
            SlabDepot::new(NONCE, 1024, 4, geometry, 1, summary, true).unwrap();

        let mut interior = page::new_page(NONCE, 80);
        page::set_entry(&mut interior[..], 0, &Mapping::uncompressed(1024)).unwrap();
        layer.write_block(80, &interior[..]).unwrap();
        // Leaf 1024 contains garbage, not a valid page.
        let garbage = [0xa5u8; crate::constants::BLOCK_SIZE];
        layer.write_block(1024, &garbage).unwrap();

        let result = rebuild_ref_counts(&layer, &mut depot, NONCE, 80, 1).unwrap();
        assert_eq!(result.logical_blocks_used, 0);
        // The tree page itself is still referenced.
        assert_eq!(result.block_map_data_blocks, 1);
    }
}
