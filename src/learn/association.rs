//! Error handler association and stage 1 learning
//!
//! A function called almost exclusively on error paths (a logging or cleanup helper)
//! marks the side of a check it appears on as the error side. Checks stage 0 could not
//! match are resolved this way.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{
    FunctionEvidence, HandlerCounts, MIN_HANDLER_SUPPORT, SafetyCheckData,
    process_safety_check_mapping,
};
use crate::callgraph::CallGraph;
use crate::checks::CheckId;
use crate::context::AnalysisContext;
use crate::error::AnalysisError;
use crate::ir::{BlockId, FuncId, InstKind, Program};

/// Functions whose calls sit on error paths often enough to count as handlers
///
/// Functions with a learned interval of their own are never handlers.
pub(super) fn associate(
    ctx: &AnalysisContext<'_>,
    counts: &BTreeMap<FuncId, HandlerCounts>,
) -> Result<BTreeSet<FuncId>, AnalysisError> {
    let tables = ctx.tables()?;
    let threshold = ctx.config.association_confidence;
    let handlers = counts
        .iter()
        .filter(|(func, _)| tables.intervals.get((**func, 0)).is_none())
        .filter(|(func, counts)| {
            let qualifies =
                counts.in_error >= MIN_HANDLER_SUPPORT && counts.fraction() >= threshold;
            if qualifies {
                debug!(
                    handler = %ctx.program.function(**func).name,
                    in_error = counts.in_error,
                    fraction = counts.fraction(),
                    "associated error handler"
                );
            }
            qualifies
        })
        .map(|(func, _)| *func)
        .collect();
    Ok(handlers)
}

/// The successor of `block` whose straight-line continuation calls the most handlers
///
/// Ties and successors without handler calls give `None`.
pub fn error_successor(
    program: &Program,
    callgraph: &CallGraph,
    handlers: &BTreeSet<FuncId>,
    block: BlockId,
) -> Option<BlockId> {
    let mut successors = program.successors(block).to_vec();
    successors.sort_unstable();
    successors.dedup();

    let mut best: Option<(BlockId, usize)> = None;
    let mut tied = false;
    for succ in successors {
        let count = program
            .linear_unique_path_forwards(succ)
            .into_iter()
            .flat_map(|b| program.block(b).insts.iter().copied())
            .filter(|&inst| matches!(program.kind(inst), InstKind::Call { .. }))
            .filter(|&inst| {
                callgraph
                    .callees(inst)
                    .is_some_and(|callees| callees.iter().any(|c| handlers.contains(c)))
            })
            .count();
        match best {
            Some((_, top)) if count < top => {}
            Some((_, top)) if count == top => tied = true,
            _ => {
                best = Some((succ, count));
                tied = false;
            }
        }
    }

    match best {
        Some((succ, count)) if count > 0 && !tied => Some(succ),
        _ => None,
    }
}

/// Stage 1: decide the error side of unmatched checks from handler calls
pub(super) fn match_with_handlers(
    ctx: &AnalysisContext<'_>,
    func: FuncId,
    handlers: &BTreeSet<FuncId>,
    already_matched: &BTreeSet<CheckId>,
) -> FunctionEvidence {
    let mut evidence = FunctionEvidence::default();
    if handlers.is_empty() {
        return evidence;
    }
    let program = ctx.program;
    for (id, condition) in ctx.checks_with_ids(func) {
        if !condition.is_comparison() || already_matched.contains(&id) {
            continue;
        }
        let block = condition.block(program);
        if let Some(succ) = error_successor(program, ctx.callgraph, handlers, block) {
            evidence
                .matched
                .insert(id, SafetyCheckData::from_error_block(succ));
        }
    }
    if !evidence.matched.is_empty() {
        debug!(
            function = %program.function(func).name,
            matched = evidence.matched.len(),
            "stage 1 matching"
        );
    }
    process_safety_check_mapping(ctx, &evidence.matched, &mut evidence.histograms);
    evidence
}
