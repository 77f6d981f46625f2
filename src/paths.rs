//! Forward path enumeration from a sanity check to the function's exits
//!
//! The walk follows unique-successor chains without forking. At a genuine fork it
//! explores every successor, but once a path has forked, a later fork is only followed
//! if it shares a successor with the first one; unrelated nested conditionals are cut
//! off. Paths end at a return, at an unreachable, or when they touch a boundary block
//! claimed by another check.

use std::collections::HashSet;

use crate::checks::CheckId;
use crate::ir::{BlockId, InstKind, Program};

/// Ordered blocks of one path and the check that triggered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub blocks: Vec<BlockId>,
    pub reason: Option<CheckId>,
}

impl Path {
    pub fn new(reason: Option<CheckId>) -> Self {
        Self {
            blocks: Vec::new(),
            reason,
        }
    }

    pub fn with_blocks(blocks: Vec<BlockId>, reason: Option<CheckId>) -> Self {
        Self { blocks, reason }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<BlockId> {
        self.blocks.last().copied()
    }
}

pub struct PathEnumerator<'a> {
    program: &'a Program,
    boundary: &'a HashSet<BlockId>,
}

impl<'a> PathEnumerator<'a> {
    pub fn new(program: &'a Program, boundary: &'a HashSet<BlockId>) -> Self {
        Self { program, boundary }
    }

    /// Enumerate paths from `start`, continuing the blocks already in `seed`
    ///
    /// The first returned path is the seed itself extended by the walk; every fork adds
    /// a copy of the prefix up to that point.
    pub fn collect(&self, start: BlockId, seed: Path) -> Vec<Path> {
        let mut paths = vec![seed];
        self.walk(start, &mut paths, 0, HashSet::new(), None);
        paths
    }

    fn walk(
        &self,
        block: BlockId,
        paths: &mut Vec<Path>,
        current: usize,
        mut visited: HashSet<BlockId>,
        mut first_fork: Option<BlockId>,
    ) {
        let mut block = block;
        loop {
            if !visited.insert(block) {
                return;
            }
            paths[current].blocks.push(block);

            if paths[current].len() > 1 && self.boundary.contains(&block) {
                return;
            }
            if matches!(
                self.program.terminator_kind(block),
                Some(InstKind::Return { .. } | InstKind::Unreachable) | None
            ) {
                return;
            }

            match self.program.unique_successor(block) {
                Some(next) => block = next,
                None => break,
            }
        }

        let successors = self.program.successors(block);
        if successors.is_empty() {
            return;
        }
        match first_fork {
            None => first_fork = Some(block),
            Some(fork) => {
                let fork_successors = self.program.successors(fork);
                if !successors.iter().any(|s| fork_successors.contains(s)) {
                    return;
                }
            }
        }

        let last = successors.len() - 1;
        for (i, &succ) in successors.iter().enumerate() {
            if i == last {
                self.walk(succ, paths, current, visited, first_fork);
                return;
            }
            let fork = paths[current].clone();
            paths.push(fork);
            let index = paths.len() - 1;
            self.walk(succ, paths, index, visited.clone(), first_fork);
        }
    }
}
