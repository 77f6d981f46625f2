//! Path summaries and the similarity matcher
//!
//! A path is abstracted into the sequence of operations that matter for error
//! handling: calls, returns, conditional branches, stores, switches and unreachables.
//! Two paths that leave the same check through different successors are compared by
//! the longest common subsequence of their operations. When one summary is a
//! subsequence of the other, the shorter one is a strong error-handling candidate.

use std::collections::HashMap;

use tracing::trace;

use crate::callgraph::{AliasOracle, CallGraph};
use crate::ir::{BlockId, Callee, InstId, InstKind, Predicate, Program, Value};
use crate::paths::Path;
use crate::resolve::resolve_along_path;

/// Ratio at or above which two summaries count as a match
pub const MATCH_RATIO: f32 = 0.999;

/// One abstract operation of a path summary
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Call with a resolved callee set
    Call { call: InstId },
    /// Conditional branch testing `value` with `pred`
    CondBr {
        pred: Predicate,
        value: Option<Value>,
        branch: InstId,
    },
    /// Store to `ptr`
    Store { ptr: Option<Value>, store: InstId },
    Return {
        unresolved: Option<Value>,
        resolved: Option<Value>,
    },
    Switch,
    Unreachable,
}

impl Operation {
    pub fn is_cond_br(&self) -> bool {
        matches!(self, Operation::CondBr { .. })
    }

    /// Re-resolve operands along a concrete path
    fn resolve_along(&mut self, program: &Program, alias: &dyn AliasOracle, blocks: &[BlockId]) {
        match self {
            Operation::Store { ptr, .. } => {
                *ptr = resolve_along_path(program, alias, *ptr, blocks);
            }
            Operation::Return {
                unresolved,
                resolved,
            } => {
                *resolved = resolve_along_path(program, alias, *unresolved, blocks);
            }
            Operation::CondBr { value, branch, .. } => {
                *value = resolve_along_path(program, alias, *value, blocks)
                    .or(Some(Value::Inst(*branch)));
            }
            Operation::Call { .. } | Operation::Switch | Operation::Unreachable => {}
        }
    }
}

/// Operations of one path, excluding the block holding the check
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub ops: Vec<Operation>,
    /// Second block of the summarized path, the candidate error-handling block
    pub entry: Option<BlockId>,
}

impl Summary {
    pub fn cond_br_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_cond_br()).count()
    }

    pub fn resolve_path_sensitive_values(
        &mut self,
        program: &Program,
        alias: &dyn AliasOracle,
        blocks: &[BlockId],
    ) {
        for op in &mut self.ops {
            op.resolve_along(program, alias, blocks);
        }
    }
}

/// Builds summaries, memoizing per-block operation lists
pub struct Summarizer<'a> {
    program: &'a Program,
    callgraph: &'a CallGraph,
    cache: HashMap<BlockId, Vec<Operation>>,
}

impl<'a> Summarizer<'a> {
    pub fn new(program: &'a Program, callgraph: &'a CallGraph) -> Self {
        Self {
            program,
            callgraph,
            cache: HashMap::new(),
        }
    }

    /// Summary of every block of `path` after the first
    pub fn summarize(&mut self, path: &Path) -> Summary {
        let mut summary = Summary {
            ops: Vec::new(),
            entry: path.blocks.get(1).copied(),
        };
        let (program, callgraph) = (self.program, self.callgraph);
        for &block in path.blocks.iter().skip(1) {
            let ops = self
                .cache
                .entry(block)
                .or_insert_with(|| summarize_block(program, callgraph, block));
            summary.ops.extend(ops.iter().cloned());
        }
        summary
    }
}

/// Abstract operations of a single block, unresolved
pub fn summarize_block(program: &Program, callgraph: &CallGraph, block: BlockId) -> Vec<Operation> {
    let mut ops = Vec::new();
    for &inst in &program.block(block).insts {
        match program.kind(inst) {
            InstKind::Call { callee, .. } => {
                if matches!(callee, Callee::InlineAsm) || program.is_intrinsic_call(inst) {
                    continue;
                }
                // The call is the subject of a check, not part of the handling
                if feeds_branch_condition(program, inst) {
                    continue;
                }
                if callgraph.callees(inst).is_none() {
                    trace!(call = %inst, "call without resolved callees left out of summary");
                    continue;
                }
                ops.push(Operation::Call { call: inst });
            }
            InstKind::Return { value } => ops.push(Operation::Return {
                unresolved: *value,
                resolved: None,
            }),
            InstKind::Branch { cond, .. } => {
                let (pred, value) = match program.kind_of(*cond) {
                    Some(InstKind::Cmp { pred, lhs, .. }) => (*pred, *lhs),
                    _ => (Predicate::Eq, *cond),
                };
                ops.push(Operation::CondBr {
                    pred,
                    value: Some(value),
                    branch: inst,
                });
            }
            InstKind::Store { ptr, .. } => ops.push(Operation::Store {
                ptr: Some(*ptr),
                store: inst,
            }),
            InstKind::Switch { .. } => ops.push(Operation::Switch),
            InstKind::Unreachable => ops.push(Operation::Unreachable),
            _ => {}
        }
    }
    ops
}

fn feeds_branch_condition(program: &Program, call: InstId) -> bool {
    program.users(call).iter().any(|&user| {
        matches!(program.kind(user), InstKind::Cmp { .. })
            && program
                .users(user)
                .iter()
                .any(|&u| matches!(program.kind(u), InstKind::Branch { .. }))
    })
}

/// Semantic equality of operations
pub struct OpMatcher<'a> {
    program: &'a Program,
    callgraph: &'a CallGraph,
    alias: &'a dyn AliasOracle,
}

impl<'a> OpMatcher<'a> {
    pub fn new(program: &'a Program, callgraph: &'a CallGraph, alias: &'a dyn AliasOracle) -> Self {
        Self {
            program,
            callgraph,
            alias,
        }
    }

    pub fn equivalent(&self, a: &Operation, b: &Operation) -> bool {
        match (a, b) {
            (Operation::Call { call: a }, Operation::Call { call: b }) => {
                self.callgraph.callees(*a) == self.callgraph.callees(*b)
            }
            (
                Operation::CondBr {
                    pred: pa,
                    value: Some(va),
                    ..
                },
                Operation::CondBr {
                    pred: pb,
                    value: Some(vb),
                    ..
                },
            ) if pa == pb => self.cond_values_equivalent(*va, *vb),
            (
                Operation::Return {
                    unresolved: ua,
                    resolved: ra,
                },
                Operation::Return {
                    unresolved: ub,
                    resolved: rb,
                },
            ) => match (ra, rb) {
                (None, None) => ua == ub,
                (Some(ra), Some(rb)) => {
                    let (call_a, call_b) = (self.program.is_call(*ra), self.program.is_call(*rb));
                    if call_a && call_b {
                        ua == ub
                    } else if (call_a && rb.as_const().is_some())
                        || (call_b && ra.as_const().is_some())
                    {
                        // Early-return style: `return rc` against `return -1`
                        true
                    } else {
                        ra == rb
                    }
                }
                _ => false,
            },
            (
                Operation::Store {
                    ptr: Some(pa),
                    store: sa,
                },
                Operation::Store {
                    ptr: Some(pb),
                    store: sb,
                },
            ) => match pa {
                Value::Inst(_) | Value::Arg { .. } => {
                    self.alias.may_alias(self.program, *pa, *pb)
                        || self.inlined_equivalent(*sa, *sb)
                }
                _ => pa == pb,
            },
            (Operation::Switch, Operation::Switch)
            | (Operation::Unreachable, Operation::Unreachable) => true,
            _ => false,
        }
    }

    fn cond_values_equivalent(&self, a: Value, b: Value) -> bool {
        let is_gep = |v: Value| matches!(self.program.kind_of(v), Some(InstKind::Gep { .. }));
        // GEP operands resolve independently of the path
        if is_gep(a) && is_gep(b) {
            return false;
        }
        if a == b {
            return true;
        }
        if self.program.is_call(a) && self.program.is_call(b) {
            let (ta, tb) = (
                self.callgraph.callees_of_value(a),
                self.callgraph.callees_of_value(b),
            );
            if let (Some(ta), Some(tb)) = (ta, tb) {
                return ta == tb;
            }
        }
        false
    }

    /// Both instructions come from inlined code with real source lines
    fn inlined_equivalent(&self, a: InstId, b: InstId) -> bool {
        let (Some(la), Some(lb)) = (&self.program.inst(a).loc, &self.program.inst(b).loc) else {
            return false;
        };
        la.inlined_at.is_some() && lb.inlined_at.is_some() && la.line != 0 && lb.line != 0
    }
}

/// Length of the longest common subsequence under a custom equality
///
/// Keeps two rolling rows sized by the shorter sequence.
pub fn longest_common_subsequence<T>(
    a: &[T],
    b: &[T],
    mut eq: impl FnMut(&T, &T) -> bool,
) -> usize {
    let (long, short) = if a.len() < b.len() { (b, a) } else { (a, b) };
    let mut previous = vec![0usize; short.len() + 1];
    let mut current = vec![0usize; short.len() + 1];
    for x in long {
        for (j, y) in short.iter().enumerate() {
            current[j + 1] = if eq(x, y) {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut current, &mut previous);
    }
    previous[short.len()]
}

/// LCS length and its ratio to the shorter sequence's length
pub fn lcs_ratio<T>(a: &[T], b: &[T], eq: impl FnMut(&T, &T) -> bool) -> (usize, f32) {
    let lcs = longest_common_subsequence(a, b, eq);
    let shortest = a.len().min(b.len());
    if shortest == 0 {
        return (lcs, 0.0);
    }
    (lcs, lcs as f32 / shortest as f32)
}
