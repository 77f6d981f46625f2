//! Path-sensitive value resolution
//!
//! Given a value and one concrete execution path through a function, find the most
//! specific value it can be attributed to without leaving that path:
//! - constants, arguments, calls, stack slots and address computations are terminal
//! - loads follow the nearest aliasing store on the path
//! - casts and freezes are transparent
//! - selects, comparisons and phis are decided by what the path itself proves
//!
//! A failed resolution is `None` and means "unknown". It is never evidence that a value
//! is or is not an error value.

use std::collections::{BTreeSet, HashSet};

use tracing::trace;

use crate::callgraph::AliasOracle;
use crate::ir::{BlockId, ConstInt, InstId, InstKind, Predicate, Program, Value};

/// A linear sequence of blocks along one execution path
///
/// The underlying slice is stored latest-first when `backwards` is set, which is the
/// natural order of a walk up the unique-predecessor chain. Every accessor works in
/// execution order regardless.
#[derive(Debug, Clone, Copy)]
pub struct PathSlice<'a> {
    blocks: &'a [BlockId],
    backwards: bool,
}

impl<'a> PathSlice<'a> {
    pub fn forward(blocks: &'a [BlockId]) -> Self {
        Self {
            blocks,
            backwards: false,
        }
    }

    pub fn backward(blocks: &'a [BlockId]) -> Self {
        Self {
            blocks,
            backwards: true,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block at an execution-order index
    pub fn get(&self, index: usize) -> BlockId {
        if self.backwards {
            self.blocks[self.blocks.len() - 1 - index]
        } else {
            self.blocks[index]
        }
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// Execution-order index of the last occurrence of `block`
    pub fn rposition(&self, block: BlockId) -> Option<usize> {
        (0..self.len()).rev().find(|&i| self.get(i) == block)
    }
}

/// Resolver bound to one path
///
/// The seen set guards phi and sibling-comparison recursion. It lives as long as the
/// resolver, so queries that must share it reuse one resolver.
pub struct PathResolver<'a> {
    program: &'a Program,
    alias: &'a dyn AliasOracle,
    path: PathSlice<'a>,
    seen: HashSet<Value>,
}

impl<'a> PathResolver<'a> {
    pub fn new(program: &'a Program, alias: &'a dyn AliasOracle, path: PathSlice<'a>) -> Self {
        Self {
            program,
            alias,
            path,
            seen: HashSet::new(),
        }
    }

    /// Resolve `value` along the path
    ///
    /// Searches for stores and sibling branches start at the instruction defining the
    /// value being resolved.
    pub fn resolve(&mut self, value: Value) -> Option<Value> {
        let Value::Inst(id) = value else {
            return Some(value);
        };
        let program = self.program;
        match program.kind(id) {
            InstKind::Call { .. } | InstKind::Alloca | InstKind::Gep { .. } => Some(value),
            InstKind::Load { ptr } => self.resolve_load(id, *ptr),
            InstKind::ExtractValue { .. } => Some(value),
            InstKind::Cast { value: inner, .. } | InstKind::Freeze { value: inner } => {
                self.resolve(*inner)
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => match self.resolve(*cond).and_then(|c| c.as_const()) {
                Some(c) if !c.is_zero() => self.resolve(*if_true),
                Some(_) => self.resolve(*if_false),
                None => Some(value),
            },
            InstKind::Cmp { pred, lhs, rhs } => Some(self.resolve_cmp(id, *pred, *lhs, *rhs)),
            InstKind::Phi { incoming } => self.resolve_phi(id, incoming),
            _ => {
                trace!(inst = %id, "unsupported value in path resolution");
                None
            }
        }
    }

    /// Scan backwards from `origin` along the path
    ///
    /// The origin's own block is scanned first, then each earlier path block from its
    /// last instruction up. Stops at the first instruction for which `visit` returns
    /// `Some`.
    fn search_back<R>(&self, origin: InstId, mut visit: impl FnMut(InstId) -> Option<R>) -> Option<R> {
        let program = self.program;
        let block = program.block_of(origin);
        let insts = &program.block(block).insts;
        for &inst in insts[..program.position(origin)].iter().rev() {
            if let Some(found) = visit(inst) {
                return Some(found);
            }
        }

        let start = self.path.rposition(block)?;
        for index in (0..start).rev() {
            for &inst in program.block(self.path.get(index)).insts.iter().rev() {
                if let Some(found) = visit(inst) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn resolve_load(&mut self, load: InstId, ptr: Value) -> Option<Value> {
        let program = self.program;
        let mut aliases: HashSet<Value> = HashSet::from([ptr]);

        match program.kind_of(ptr) {
            Some(InstKind::Load { ptr: inner }) => {
                let inner = *inner;
                self.search_back(load, |candidate| {
                    if let InstKind::Load { ptr: p } = program.kind(candidate)
                        && *p == inner
                    {
                        aliases.insert(Value::Inst(candidate));
                    }
                    None::<()>
                });
            }
            Some(InstKind::Gep { .. }) => {
                let (base, offset) = program.strip_constant_offsets(ptr);
                let alias = self.alias;
                self.search_back(load, |candidate| {
                    if matches!(program.kind(candidate), InstKind::Gep { .. }) {
                        let candidate_value = Value::Inst(candidate);
                        let (candidate_base, candidate_offset) =
                            program.strip_constant_offsets(candidate_value);
                        if candidate_offset == offset
                            && candidate_base != base
                            && alias.may_alias(program, base, candidate_base)
                        {
                            aliases.insert(candidate_value);
                        }
                    }
                    None::<()>
                });
            }
            _ => {}
        }

        let store = self.search_back(load, |candidate| match program.kind(candidate) {
            InstKind::Store { ptr: p, value } if aliases.contains(p) => Some(*value),
            _ => None,
        });
        if let Some(stored) = store {
            return self.resolve(stored);
        }

        match program.kind_of(ptr) {
            Some(InstKind::Load { .. }) => self.resolve(ptr),
            Some(InstKind::Gep { .. }) => Some(ptr),
            _ => None,
        }
    }

    fn resolve_cmp(&mut self, cmp: InstId, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        let program = self.program;
        let this = Value::Inst(cmp);
        let Some(comparand) = self.resolve(lhs) else {
            return this;
        };
        let Some(cmp_rhs) = self.resolve(rhs) else {
            return this;
        };
        let Some(cmp_index) = self.path.rposition(program.block_of(cmp)) else {
            return this;
        };

        for index in (0..cmp_index).rev() {
            let block = self.path.get(index);
            let next = self.path.get(index + 1);
            let Some(term) = program.terminator(block) else {
                continue;
            };
            match program.kind(term) {
                InstKind::Branch { cond, if_true, .. } => {
                    let Some(InstKind::Cmp {
                        pred: other_pred,
                        lhs: other_lhs,
                        rhs: other_rhs,
                    }) = program.kind_of(*cond)
                    else {
                        continue;
                    };
                    if *cond == this {
                        continue;
                    }
                    // Loop-carried comparisons would otherwise recurse forever
                    if !self.seen.insert(*other_lhs) {
                        continue;
                    }
                    let (other_pred, other_lhs, other_rhs, if_true) =
                        (*other_pred, *other_lhs, *other_rhs, *if_true);
                    if self.resolve(other_lhs) != Some(comparand) {
                        continue;
                    }
                    if self.resolve(other_rhs) != Some(cmp_rhs) {
                        continue;
                    }
                    let truth = if if_true == next {
                        other_pred
                    } else {
                        other_pred.inverse()
                    };
                    if truth.implies_true(pred) {
                        return Value::Const(ConstInt::bool(true));
                    } else if truth.implies_false(pred) {
                        return Value::Const(ConstInt::bool(false));
                    }
                }
                InstKind::Switch { cond, cases, .. } => {
                    if self.resolve(*cond) != Some(comparand) {
                        continue;
                    }
                    let Some(rhs_const) = cmp_rhs.as_const() else {
                        continue;
                    };
                    if let Some((case, _)) = cases.iter().find(|(_, target)| *target == next) {
                        return Value::Const(ConstInt::bool(pred.evaluate(*case, rhs_const)));
                    }
                }
                _ => {}
            }
        }
        this
    }

    fn resolve_phi(&mut self, phi: InstId, incoming: &[(BlockId, Value)]) -> Option<Value> {
        let this = Value::Inst(phi);
        if !self.seen.insert(this) {
            return None;
        }
        let own_block = self.program.block_of(phi);

        // Closest incoming block, scanning back from the end of the path
        let mut best: Option<(usize, Value)> = None;
        for (from, value) in incoming {
            if *from == own_block {
                continue;
            }
            if let Some(index) = self.path.rposition(*from) {
                let distance = self.path.len() - 1 - index;
                if best.is_none_or(|(d, _)| distance < d) {
                    best = Some((distance, *value));
                }
            }
        }
        // Off-path incoming values are genuinely path dependent
        let (_, value) = best?;
        self.resolve(value)
    }
}

/// Constant right-hand side of a comparison as a 32-bit value
///
/// Null pointers compare as zero.
pub fn compute_rhs(value: Value) -> Option<i32> {
    match value {
        Value::Const(c) => Some(c.as_i32()),
        Value::Null => Some(0),
        _ => None,
    }
}

/// Calls a value may originate from, looking through casts, phis, freezes and selects
pub fn collect_calls(program: &Program, value: Value, result: &mut BTreeSet<InstId>) {
    let mut visited = HashSet::new();
    collect_calls_inner(program, value, &mut visited, result);
}

fn collect_calls_inner(
    program: &Program,
    value: Value,
    visited: &mut HashSet<InstId>,
    result: &mut BTreeSet<InstId>,
) {
    let Value::Inst(id) = value else {
        return;
    };
    match program.kind(id) {
        InstKind::Call { .. } => {
            result.insert(id);
        }
        _ if !visited.insert(id) => {}
        InstKind::Cast { value, .. } | InstKind::Freeze { value } => {
            collect_calls_inner(program, *value, visited, result)
        }
        InstKind::Phi { incoming } => {
            for (_, value) in incoming {
                collect_calls_inner(program, *value, visited, result);
            }
        }
        InstKind::Select {
            if_true, if_false, ..
        } => {
            collect_calls_inner(program, *if_true, visited, result);
            collect_calls_inner(program, *if_false, visited, result);
        }
        _ => {}
    }
}

/// Resolve a value along a forward path with a fresh seen set
pub fn resolve_along_path(
    program: &Program,
    alias: &dyn AliasOracle,
    value: Option<Value>,
    path: &[BlockId],
) -> Option<Value> {
    let value = value?;
    PathResolver::new(program, alias, PathSlice::forward(path)).resolve(value)
}

#[cfg(test)]
mod tests;
