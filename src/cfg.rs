//! Control flow graph queries over the program arena
//!
//! Edges are stored once per program as dense adjacency lists indexed by [`BlockId`].
//! Edge lists keep duplicates (a switch with two cases jumping to the same block
//! contributes two edges), which is what the unique-predecessor and unique-successor
//! queries rely on.

use std::collections::HashSet;

use crate::ir::{Block, BlockId, Instruction, Program};

/// Predecessor and successor edges for every block in the program
#[derive(Debug, Clone, Default)]
pub struct BlockEdges {
    predecessors: Vec<Vec<BlockId>>,
    successors: Vec<Vec<BlockId>>,
}

impl BlockEdges {
    /// Build the edge lists from block terminators
    pub(crate) fn build(blocks: &[Block], insts: &[Instruction]) -> Self {
        let mut predecessors = vec![Vec::new(); blocks.len()];
        let mut successors = vec![Vec::new(); blocks.len()];

        for block in blocks {
            let Some(last) = block.insts.last() else {
                continue;
            };
            let term = &insts[last.0 as usize].kind;
            if !term.is_terminator() {
                continue;
            }
            for succ in term.successors() {
                if (succ.0 as usize) < blocks.len() {
                    successors[block.id.0 as usize].push(succ);
                    predecessors[succ.0 as usize].push(block.id);
                }
            }
        }

        Self {
            predecessors,
            successors,
        }
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.predecessors
            .get(block.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.successors
            .get(block.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Program {
    /// The predecessor if every incoming edge comes from the same block
    pub fn unique_predecessor(&self, block: BlockId) -> Option<BlockId> {
        unique(self.predecessors(block))
    }

    /// The successor if every outgoing edge goes to the same block
    pub fn unique_successor(&self, block: BlockId) -> Option<BlockId> {
        unique(self.successors(block))
    }

    /// Follow unique predecessors from `block`, latest block first
    ///
    /// The result starts with `block` itself and is meant to be wrapped in a
    /// backwards path slice.
    pub fn linear_unique_path_backwards(&self, block: BlockId) -> Vec<BlockId> {
        let mut path = vec![block];
        let mut visited = HashSet::from([block]);
        let mut current = block;
        while let Some(pred) = self.unique_predecessor(current) {
            if !visited.insert(pred) {
                break;
            }
            path.push(pred);
            current = pred;
        }
        path
    }

    /// Follow unique successors from `block` in execution order
    pub fn linear_unique_path_forwards(&self, block: BlockId) -> Vec<BlockId> {
        let mut path = vec![block];
        let mut visited = HashSet::from([block]);
        let mut current = block;
        while let Some(succ) = self.unique_successor(current) {
            if !visited.insert(succ) {
                break;
            }
            path.push(succ);
            current = succ;
        }
        path
    }

    /// Prepend the unique-predecessor chain of the path's first block
    ///
    /// The returned path is in execution order. The chain stops before it would wrap
    /// around to a block it already contains.
    pub fn extend_with_unique_predecessors(&self, path: &[BlockId]) -> Vec<BlockId> {
        let Some(&first) = path.first() else {
            return Vec::new();
        };
        let mut preds = self.linear_unique_path_backwards(first);
        preds.remove(0);
        preds.reverse();
        preds.extend_from_slice(path);
        preds
    }
}

fn unique(edges: &[BlockId]) -> Option<BlockId> {
    let (&first, rest) = edges.split_first()?;
    rest.iter().all(|b| *b == first).then_some(first)
}
