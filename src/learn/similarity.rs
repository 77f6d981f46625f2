//! Stage 0: error sides from sibling path similarity
//!
//! Error handling code tends to repeat itself within a function: every failing call
//! logs something and returns the same error value. Paths leaving different checks are
//! summarized and compared pairwise; when two summaries match, each check's path is a
//! likely error path and its first block becomes the check's error block.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, trace};

use super::{FunctionEvidence, HandlerCounts, SafetyCheckData, process_safety_check_mapping};
use crate::checks::{AbstractCondition, CheckId};
use crate::context::AnalysisContext;
use crate::ir::{BlockId, FuncId, InstKind, Program};
use crate::paths::{Path, PathEnumerator};
use crate::summary::{MATCH_RATIO, OpMatcher, Summarizer, Summary, lcs_ratio};

/// Match the error paths of one function and gather its evidence
pub(super) fn match_function(ctx: &AnalysisContext<'_>, func: FuncId) -> FunctionEvidence {
    let program = ctx.program;
    let mut evidence = FunctionEvidence::default();

    let checks: Vec<(CheckId, &AbstractCondition)> = ctx
        .checks_with_ids(func)
        .filter(|(_, condition)| condition.is_from_branch())
        .collect();
    if checks.is_empty() {
        return evidence;
    }

    let boundary: HashSet<BlockId> = checks
        .iter()
        .filter(|(_, condition)| condition.is_comparison())
        .map(|(_, condition)| condition.block(program))
        .collect();
    let enumerator = PathEnumerator::new(program, &boundary);

    let mut paths = Vec::new();
    for &(id, condition) in &checks {
        paths.extend(paths_from_check(program, &enumerator, id, condition));
    }
    paths.retain(|path| path.len() > 1);

    let mut summarizer = Summarizer::new(program, ctx.callgraph);
    let mut summarized: Vec<(Path, Summary)> = Vec::with_capacity(paths.len());
    for path in paths {
        let mut summary = summarizer.summarize(&path);
        if summary.ops.is_empty() {
            continue;
        }
        let extended = program.extend_with_unique_predecessors(&path.blocks);
        summary.resolve_path_sensitive_values(program, ctx.alias, &extended);
        summarized.push((path, summary));
    }
    trace!(function = %program.function(func).name, paths = summarized.len(), "summarized check paths");

    let matcher = OpMatcher::new(program, ctx.callgraph, ctx.alias);
    let mut error_paths: BTreeMap<CheckId, usize> = BTreeMap::new();
    for i in 0..summarized.len() {
        for j in i + 1..summarized.len() {
            let (path_i, summary_i) = &summarized[i];
            let (path_j, summary_j) = &summarized[j];
            if path_i.reason == path_j.reason {
                continue;
            }
            let (lcs, ratio) = lcs_ratio(&summary_i.ops, &summary_j.ops, |a, b| {
                matcher.equivalent(a, b)
            });
            if ratio < MATCH_RATIO {
                continue;
            }
            let sum = (summary_i.cond_br_count() + summary_j.cond_br_count()) as u16;
            for index in [i, j] {
                let (path, summary) = &summarized[index];
                let Some(reason) = path.reason else {
                    continue;
                };
                if !ctx.condition(reason).is_some_and(AbstractCondition::is_comparison) {
                    continue;
                }
                let candidate = SafetyCheckData {
                    error_block: summary.entry,
                    lcs: lcs as u16,
                    len: path.blocks.len() as u16,
                    sum,
                };
                if SafetyCheckData::should_replace(evidence.matched.get(&reason), &candidate) {
                    evidence.matched.insert(reason, candidate);
                    error_paths.insert(reason, index);
                }
            }
        }
    }

    count_handler_calls(
        ctx,
        func,
        &summarized,
        &evidence.matched,
        &error_paths,
        &mut evidence.handler_counts,
    );
    process_safety_check_mapping(ctx, &evidence.matched, &mut evidence.histograms);

    debug!(
        function = %program.function(func).name,
        checks = checks.len(),
        matched = evidence.matched.len(),
        "stage 0 matching"
    );
    evidence
}

/// Paths leaving one check on the side it describes
fn paths_from_check(
    program: &Program,
    enumerator: &PathEnumerator<'_>,
    id: CheckId,
    condition: &AbstractCondition,
) -> Vec<Path> {
    let block = condition.block(program);
    match (condition, program.kind(condition.origin())) {
        (AbstractCondition::Comparison { rhs, .. }, InstKind::Switch { cases, .. }) => {
            let Some(case) = rhs.as_const() else {
                return Vec::new();
            };
            let Some(&(_, target)) = cases.iter().find(|(value, _)| value.value == case.value)
            else {
                return Vec::new();
            };
            enumerator.collect(target, Path::with_blocks(vec![block], Some(id)))
        }
        (AbstractCondition::Fallback { .. }, InstKind::Switch { default, .. }) => {
            enumerator.collect(*default, Path::with_blocks(vec![block], Some(id)))
        }
        (AbstractCondition::Comparison { .. }, _) => enumerator.collect(block, Path::new(Some(id))),
        (AbstractCondition::Fallback { .. }, _) => Vec::new(),
    }
}

/// Count calls made on inspected paths, split by whether they sit on an error path
fn count_handler_calls(
    ctx: &AnalysisContext<'_>,
    func: FuncId,
    summarized: &[(Path, Summary)],
    matched: &BTreeMap<CheckId, SafetyCheckData>,
    error_paths: &BTreeMap<CheckId, usize>,
    counts: &mut BTreeMap<FuncId, HandlerCounts>,
) {
    let program = ctx.program;
    let inspected: BTreeSet<BlockId> = summarized
        .iter()
        .filter(|(path, _)| path.reason.is_some_and(|reason| matched.contains_key(&reason)))
        .flat_map(|(path, _)| path.blocks.iter().skip(1).copied())
        .collect();
    let in_error: BTreeSet<BlockId> = error_paths
        .values()
        .flat_map(|&index| summarized[index].0.blocks.iter().skip(1).copied())
        .collect();

    for &block in &program.function(func).blocks {
        if !inspected.contains(&block) {
            continue;
        }
        let on_error_path = in_error.contains(&block);
        for &inst in &program.block(block).insts {
            if !matches!(program.kind(inst), InstKind::Call { .. }) {
                continue;
            }
            let Some(callees) = ctx.callgraph.callees(inst) else {
                continue;
            };
            for &callee in callees {
                if program.function(callee).attrs.intrinsic {
                    continue;
                }
                let entry = counts.entry(callee).or_default();
                if on_error_path {
                    entry.in_error += 1;
                } else {
                    entry.not_in_error += 1;
                }
            }
        }
    }
}
