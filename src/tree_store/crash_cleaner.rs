use crate::tree_store::gen_safe_pointer::{self, NO_NODE};
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::PagedFile;
use crate::tree_store::tree_logic::Root;
use crate::tree_store::tree_node::{self, NodeType, TreeNode};
use crate::{Error, Result};

/// Zeroes every pointer slot written at a crash generation in the nodes reachable from `root`.
///
/// A session that never reached its checkpoint may have flushed pointer writes tagged with a
/// generation between the stable and the current unstable one. Readers already skip such slots,
/// but once a later checkpoint moves stable past that generation they would look valid. Returns
/// the number of slots cleaned.
pub(crate) fn clean_crash_generations(
    file: &PagedFile,
    node: &dyn TreeNode,
    root: Root,
    generation: Generation,
) -> Result<u64> {
    let mut cleaned = 0;
    let mut level = vec![root.id];
    let mut depth = 0;
    while !level.is_empty() {
        let mut next_level = vec![];
        for id in level {
            let mut cursor = file.write_cursor();
            cursor.next(id)?;
            if !tree_node::is_node(&mut cursor) {
                return Err(Error::Corrupted(format!(
                    "page {} reachable from the root is not a tree node",
                    id
                )));
            }
            let key_count = tree_node::key_count(&mut cursor);
            let node_type = tree_node::tree_node_type(&mut cursor);
            let mut offsets = vec![
                tree_node::BYTE_POS_RIGHT_SIBLING,
                tree_node::BYTE_POS_LEFT_SIBLING,
                tree_node::BYTE_POS_SUCCESSOR,
            ];
            if node_type == Some(NodeType::Internal) {
                if !node.reasonable_key_count(key_count, NodeType::Internal) {
                    return Err(Error::Corrupted(format!(
                        "internal node {} has unreasonable key count {}",
                        id, key_count
                    )));
                }
                offsets.extend((0..=key_count).map(|pos| node.child_offset(pos)));
            }
            for offset in offsets {
                cleaned += gen_safe_pointer::clean_crash_slots(
                    &mut cursor,
                    offset,
                    generation.stable(),
                    generation.unstable(),
                ) as u64;
            }
            if node_type == Some(NodeType::Internal) {
                for pos in 0..=key_count {
                    let child = node.child_at(&mut cursor, pos, generation)?.pointer;
                    if child != NO_NODE {
                        next_level.push(child);
                    }
                }
            }
            if cursor.check_and_clear_bounds_flag() {
                return Err(Error::Corrupted(format!("node {} is malformed", id)));
            }
        }
        level = next_level;
        depth += 1;
        if depth > 64 {
            return Err(Error::Corrupted("tree is implausibly deep".to_string()));
        }
    }
    Ok(cleaned)
}
