//! Propagating learned intervals to callers
//!
//! A caller that checks an erroring call and then returns a constant on the error side
//! is itself returning an error. Both propagations below run a single-threaded stack
//! worklist; a function that gains an interval pushes its callers.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, trace};

use super::{call_of, error_successor};
use crate::callgraph::{AliasOracle, CallGraph};
use crate::checks::AbstractCondition;
use crate::context::{AnalysisContext, ErrorIntervals};
use crate::error::AnalysisError;
use crate::interval::Interval;
use crate::ir::{BlockId, FuncId, InstId, InstKind, Predicate, Program};
use crate::paths::{Path, PathEnumerator};
use crate::resolve::{compute_rhs, resolve_along_path};

/// Whether the true side of `call pred rhs` is the error side
///
/// `None` when the callees have no known interval or only an empty one.
pub fn determine_error_branch(
    intervals: &ErrorIntervals,
    callgraph: &CallGraph,
    pred: Predicate,
    slot: u32,
    rhs: i32,
    call: InstId,
) -> Option<bool> {
    let known = intervals.callee_intersection(callgraph, call, slot)?;
    if known.is_empty() {
        return None;
    }
    let taken = Interval::full().apply_predicate(pred, rhs);
    Some(!taken.intersection(&known).is_empty())
}

/// The constant returned by `ret` along `path`, as a singleton
pub fn interval_at_return(
    program: &Program,
    alias: &dyn AliasOracle,
    path: &[BlockId],
    ret: InstId,
) -> Option<Interval> {
    let InstKind::Return { value } = program.kind(ret) else {
        return None;
    };
    let resolved = resolve_along_path(program, alias, *value, path)?;
    compute_rhs(resolved).map(Interval::singleton)
}

fn callers_of<'c>(
    ctx: &'c AnalysisContext<'_>,
    func: FuncId,
) -> impl Iterator<Item = FuncId> + 'c {
    ctx.callgraph
        .callers(func)
        .map(|call| ctx.program.function_of(call))
}

/// Return instruction ending `path`, if any
fn final_return(program: &Program, path: &[BlockId]) -> Option<InstId> {
    let last = *path.last()?;
    let ret = program.terminator(last)?;
    matches!(program.kind(ret), InstKind::Return { .. }).then_some(ret)
}

/// Learn intervals for callers that return a constant after an erroring check
///
/// Returns the number of functions that gained an interval.
pub(super) fn propagate_checked_errors(ctx: &AnalysisContext<'_>) -> Result<usize, AnalysisError> {
    let program = ctx.program;
    let mut stack: Vec<FuncId> = {
        let tables = ctx.tables()?;
        tables
            .intervals
            .iter()
            .filter(|(_, interval)| !interval.is_empty())
            .flat_map(|((func, _), _)| callers_of(ctx, func).collect::<Vec<_>>())
            .collect()
    };
    let mut seen = HashSet::new();
    let mut gained = 0;

    while let Some(func) = stack.pop() {
        if !seen.insert(func) {
            continue;
        }
        let function = program.function(func);
        if function.ret.is_void()
            || !ctx.is_analysed(func)
            || program.returns_single_constant(func)
        {
            continue;
        }

        let mut tables = ctx.tables()?;
        if tables.intervals.contains((func, 0)) {
            continue;
        }

        let boundary: HashSet<BlockId> = ctx
            .checks_of(func)
            .iter()
            .map(|condition| condition.block(program))
            .collect();
        let mut found = ErrorIntervals::new();
        for condition in ctx.checks_of(func) {
            let AbstractCondition::Comparison { lhs, pred, rhs, .. } = condition else {
                continue;
            };
            let Some(call) = call_of(program, lhs.value) else {
                continue;
            };
            let Some(rhs) = compute_rhs(*rhs) else {
                continue;
            };
            let decision = determine_error_branch(
                &tables.intervals,
                ctx.callgraph,
                *pred,
                lhs.slot,
                rhs,
                call,
            );
            if decision != Some(true) {
                continue;
            }
            let block = condition.block(program);
            let Some(InstKind::Branch {
                if_true, if_false, ..
            }) = program.terminator_kind(block)
            else {
                continue;
            };

            let mut local_boundary = boundary.clone();
            local_boundary.insert(*if_false);
            let paths = PathEnumerator::new(program, &local_boundary)
                .collect(*if_true, Path::with_blocks(vec![block], None));
            for path in paths {
                let Some(ret) = final_return(program, &path.blocks) else {
                    continue;
                };
                let extended = program.extend_with_unique_predecessors(&path.blocks);
                if let Some(interval) = interval_at_return(program, ctx.alias, &extended, ret) {
                    trace!(function = %function.name, %interval, "error return on checked path");
                    found.interval_for((func, 0), true).union_in_place(&interval);
                }
            }
        }

        if found.is_empty() {
            continue;
        }
        debug!(
            function = %function.name,
            interval = ?found.get((func, 0)),
            "propagated from checks"
        );
        tables.intervals.merge_union(found);
        drop(tables);
        gained += 1;
        stack.extend(callers_of(ctx, func));
    }
    Ok(gained)
}

/// Learn intervals for callers of error handlers from what they return after the call
///
/// Returns the number of functions that gained an interval.
pub(super) fn learn_errors_from_error_blocks_for_self(
    ctx: &AnalysisContext<'_>,
    handlers: &BTreeSet<FuncId>,
) -> Result<usize, AnalysisError> {
    let program = ctx.program;
    let mut stack: Vec<FuncId> = handlers
        .iter()
        .flat_map(|&handler| callers_of(ctx, handler))
        .collect();
    let mut seen = HashSet::new();
    let mut gained = 0;

    while let Some(func) = stack.pop() {
        if !seen.insert(func) {
            continue;
        }
        let function = program.function(func);
        if function.ret.is_void()
            || !ctx.is_analysed(func)
            || program.returns_single_constant(func)
        {
            continue;
        }

        let mut found = ErrorIntervals::new();
        for &block in &function.blocks {
            let Some(succ) = error_successor(program, ctx.callgraph, handlers, block) else {
                continue;
            };
            let mut path = vec![block];
            path.extend(program.linear_unique_path_forwards(succ));
            let Some(ret) = final_return(program, &path) else {
                continue;
            };
            let extended = program.extend_with_unique_predecessors(&path);
            if let Some(interval) = interval_at_return(program, ctx.alias, &extended, ret) {
                found.interval_for((func, 0), true).union_in_place(&interval);
            }
        }

        if found.is_empty() {
            continue;
        }
        debug!(
            function = %function.name,
            interval = ?found.get((func, 0)),
            "learned from error handlers"
        );
        ctx.tables()?.intervals.merge_union(found);
        gained += 1;
        stack.extend(callers_of(ctx, func));
    }
    Ok(gained)
}
