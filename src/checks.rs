//! Sanity-check extraction
//!
//! A sanity check is a branch or switch whose condition tests the result of a call.
//! [`SanityChecks`] scans one block and yields an [`AbstractCondition`] per check it
//! recognises:
//! - conditional branches and zero/sign extensions of comparisons yield one `Comparison`
//! - a switch yields one `Comparison` (`value == case`) per case and a `Fallback` for
//!   the default edge
//!
//! The checked operand is resolved along the unique-predecessor chain leading to the
//! block, so `x = f(); if (x < 0)` and `if (f() < 0)` produce the same check.

use std::collections::VecDeque;

use tracing::trace;

use crate::callgraph::AliasOracle;
use crate::ir::{BlockId, CastKind, FuncId, InstId, InstKind, Predicate, Program, Value};
use crate::resolve::{PathResolver, PathSlice};

/// A checked value with the aggregate slot it was extracted from
///
/// `slot` is 0 unless the checked value is one field of an aggregate return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckedValue {
    pub value: Value,
    pub slot: u32,
}

/// Stable handle of a condition in the per-function check table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckId {
    pub func: FuncId,
    pub index: u32,
}

/// Condition under which control reaches one side of a sanity check
#[derive(Debug, Clone, PartialEq)]
pub enum AbstractCondition {
    /// `lhs pred rhs` decides the branch at `origin`
    ///
    /// `origin` is the comparison instruction for branches and the switch itself for
    /// switch cases. `from_branch` is false for extended comparisons that only feed
    /// arithmetic.
    Comparison {
        lhs: CheckedValue,
        pred: Predicate,
        rhs: Value,
        origin: InstId,
        from_branch: bool,
    },
    /// The default edge of the switch at `origin`
    Fallback { lhs: CheckedValue, origin: InstId },
}

impl AbstractCondition {
    pub fn lhs(&self) -> CheckedValue {
        match self {
            AbstractCondition::Comparison { lhs, .. } | AbstractCondition::Fallback { lhs, .. } => {
                *lhs
            }
        }
    }

    pub fn origin(&self) -> InstId {
        match self {
            AbstractCondition::Comparison { origin, .. }
            | AbstractCondition::Fallback { origin, .. } => *origin,
        }
    }

    pub fn is_from_branch(&self) -> bool {
        match self {
            AbstractCondition::Comparison { from_branch, .. } => *from_branch,
            AbstractCondition::Fallback { .. } => true,
        }
    }

    /// Block holding the condition's origin instruction
    pub fn block(&self, program: &Program) -> BlockId {
        program.block_of(self.origin())
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self, AbstractCondition::Comparison { .. })
    }
}

/// Iterator over the sanity checks of one block
pub struct SanityChecks<'a> {
    program: &'a Program,
    alias: &'a dyn AliasOracle,
    block: BlockId,
    cursor: usize,
    pending: VecDeque<AbstractCondition>,
    done: bool,
}

impl<'a> SanityChecks<'a> {
    pub fn new(program: &'a Program, alias: &'a dyn AliasOracle, block: BlockId) -> Self {
        let mut checks = Self {
            program,
            alias,
            block,
            cursor: 0,
            pending: VecDeque::new(),
            done: false,
        };
        if let Some(term) = program.terminator(block)
            && let InstKind::Switch { cond, cases, .. } = program.kind(term)
        {
            checks.done = true;
            if let Some(lhs) = cond.as_inst()
                && let Some(value) = checks.handle_lhs(lhs)
                && !program.is_cmp(value.value)
            {
                for (case, _) in cases {
                    checks.pending.push_back(AbstractCondition::Comparison {
                        lhs: value,
                        pred: Predicate::Eq,
                        rhs: Value::Const(*case),
                        origin: term,
                        from_branch: true,
                    });
                }
                checks
                    .pending
                    .push_back(AbstractCondition::Fallback { lhs: value, origin: term });
            }
        }
        checks
    }

    /// Resolve a comparison operand to a call result or a nested comparison
    fn handle_lhs(&self, lhs: InstId) -> Option<CheckedValue> {
        let mut blocks = self.program.linear_unique_path_backwards(self.block);
        if let Some(found) = self.handle_on_path(lhs, &blocks) {
            return Some(found);
        }

        // Triangle: the earliest block joins a diamond whose arms are linked directly
        let first = *blocks.last()?;
        let preds = self.program.predecessors(first);
        if preds.len() != 2 {
            return None;
        }
        let (p0, p1) = (preds[0], preds[1]);
        let arm = if self.program.unique_predecessor(p0) == Some(p1) {
            p0
        } else if self.program.unique_predecessor(p1) == Some(p0) {
            p1
        } else {
            return None;
        };
        // Walk through the arm and on up the chain above the diamond
        for block in self.program.linear_unique_path_backwards(arm) {
            if blocks.contains(&block) {
                break;
            }
            blocks.push(block);
        }
        self.handle_on_path(lhs, &blocks)
    }

    fn handle_on_path(&self, lhs: InstId, blocks: &[BlockId]) -> Option<CheckedValue> {
        let program = self.program;
        let path = PathSlice::backward(blocks);
        // Another check may have cut the operand off this path
        if !path.contains(program.block_of(lhs)) {
            return None;
        }

        let mut resolved = PathResolver::new(program, self.alias, path).resolve(Value::Inst(lhs))?;
        let mut slot = 0;
        if let Some(InstKind::ExtractValue { aggregate, index }) = program.kind_of(resolved) {
            slot = *index;
            resolved = PathResolver::new(program, self.alias, path).resolve(*aggregate)?;
        }

        if program.is_call(resolved) || program.is_cmp(resolved) {
            Some(CheckedValue {
                value: resolved,
                slot,
            })
        } else {
            trace!(lhs = %lhs, block = %self.block, "check operand does not resolve to a call");
            None
        }
    }

    /// Conditions contributed by one instruction
    ///
    /// Returns `None` when scanning of the block must stop.
    fn conditions_for(&self, inst: InstId) -> Option<Vec<AbstractCondition>> {
        let program = self.program;
        let (cmp, from_branch) = match program.kind(inst) {
            InstKind::Cast {
                kind: CastKind::ZExt | CastKind::SExt,
                value,
            } => (*value, false),
            InstKind::Branch { cond, .. } => (*cond, true),
            _ => return Some(Vec::new()),
        };
        let Some(InstKind::Cmp { pred, lhs, rhs }) = program.kind_of(cmp) else {
            return Some(Vec::new());
        };
        let Some(lhs_inst) = lhs.as_inst() else {
            return Some(Vec::new());
        };
        let Some(value) = self.handle_lhs(lhs_inst) else {
            return Some(Vec::new());
        };
        let origin = cmp.as_inst()?;

        let Some(InstKind::Cmp {
            pred: nested_pred,
            lhs: nested_lhs,
            rhs: nested_rhs,
        }) = program.kind_of(value.value)
        else {
            return Some(vec![AbstractCondition::Comparison {
                lhs: value,
                pred: *pred,
                rhs: *rhs,
                origin,
                from_branch,
            }]);
        };

        // `(x <nested> 0) ==/!= c`, as produced by `!f()` and friends
        if !nested_rhs.as_const().is_some_and(|c| c.is_zero()) {
            return None;
        }
        let nested = self.handle_lhs(nested_lhs.as_inst()?)?;
        let pred = match pred {
            Predicate::Eq => nested_pred.inverse(),
            Predicate::Ne => *nested_pred,
            _ => return None,
        };
        Some(vec![AbstractCondition::Comparison {
            lhs: nested,
            pred,
            rhs: *nested_rhs,
            origin,
            from_branch,
        }])
    }
}

impl Iterator for SanityChecks<'_> {
    type Item = AbstractCondition;

    fn next(&mut self) -> Option<AbstractCondition> {
        loop {
            if let Some(condition) = self.pending.pop_front() {
                return Some(condition);
            }
            if self.done {
                return None;
            }
            let insts = &self.program.block(self.block).insts;
            let Some(&inst) = insts.get(self.cursor) else {
                self.done = true;
                continue;
            };
            self.cursor += 1;
            match self.conditions_for(inst) {
                Some(found) => self.pending.extend(found),
                None => self.done = true,
            }
        }
    }
}

/// All sanity checks of a function, minus checks on intrinsic calls
pub fn identify_sanity_checks(
    program: &Program,
    alias: &dyn AliasOracle,
    func: FuncId,
) -> Vec<AbstractCondition> {
    program
        .function(func)
        .blocks
        .iter()
        .flat_map(|&block| SanityChecks::new(program, alias, block))
        .filter(|condition| {
            condition
                .lhs()
                .value
                .as_inst()
                .is_none_or(|inst| !program.is_intrinsic_call(inst))
        })
        .collect()
}
