//! Error interval learning
//!
//! Learning runs in stages over the checks extracted for every analysed function:
//! - stage 0 matches sibling error paths by similarity and records which side of each
//!   check handles the error ([`similarity`])
//! - association picks out functions that are mostly called on error paths, the error
//!   handlers ([`association`])
//! - stage 1 uses the handlers to decide the error side of the checks stage 0 left open
//! - histograms of observed intervals are refined, pooled and thresholded into the
//!   shared table ([`store`])
//! - learned intervals are propagated to callers that return them ([`propagate`])
//!
//! Stages 0 and 1 run per module on worker threads. Each function is analysed without
//! holding any lock; its evidence is merged into [`LearnState`] under one lock.

mod association;
mod propagate;
mod similarity;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::checks::{AbstractCondition, CheckId, CheckedValue};
use crate::context::{AnalysisContext, SlotKey};
use crate::error::AnalysisError;
use crate::interval::Interval;
use crate::ir::{BlockId, FuncId, InstId, InstKind, ModuleId, Program, Value};
use crate::resolve::compute_rhs;

pub use association::error_successor;
pub use propagate::{determine_error_branch, interval_at_return};

/// Observed intervals of one return slot with their counts
pub type Histogram = BTreeMap<Interval, u32>;

/// Observed intervals per function return slot
pub type Histograms = BTreeMap<SlotKey, Histogram>;

/// Fewest in-error calls for a function to be considered an error handler
pub const MIN_HANDLER_SUPPORT: u32 = 10;

/// Best similarity match recorded for a check
///
/// Matches with fewer conditional branches win; among those, a longer common
/// subsequence or a shorter path wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyCheckData {
    /// First block of the path taken when the check sees an error
    pub error_block: Option<BlockId>,
    pub lcs: u16,
    pub len: u16,
    pub sum: u16,
}

impl SafetyCheckData {
    /// Record for a check whose error side was chosen without a similarity match
    pub fn from_error_block(error_block: BlockId) -> Self {
        Self {
            error_block: Some(error_block),
            lcs: 0,
            len: 0,
            sum: 0,
        }
    }

    /// Whether `candidate` should replace `current` (or an absent record)
    pub fn should_replace(current: Option<&SafetyCheckData>, candidate: &SafetyCheckData) -> bool {
        let (lcs, len, sum) = current.map_or((0, u16::MAX, u16::MAX), |c| (c.lcs, c.len, c.sum));
        sum > candidate.sum
            || (lcs < candidate.lcs && sum >= candidate.sum)
            || (lcs <= candidate.lcs && len >= candidate.len && sum >= candidate.sum)
    }
}

/// How often calls to a function sit on error paths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCounts {
    pub in_error: u32,
    pub not_in_error: u32,
}

impl HandlerCounts {
    pub fn fraction(&self) -> f64 {
        let total = self.in_error + self.not_in_error;
        if total == 0 {
            0.0
        } else {
            self.in_error as f64 / total as f64
        }
    }
}

/// Evidence gathered from a single function, merged under one lock
#[derive(Debug, Default)]
struct FunctionEvidence {
    matched: BTreeMap<CheckId, SafetyCheckData>,
    handler_counts: BTreeMap<FuncId, HandlerCounts>,
    histograms: Histograms,
}

/// Learning tables shared by the stage workers
#[derive(Debug, Default)]
pub struct LearnState {
    pub matched: BTreeMap<CheckId, SafetyCheckData>,
    pub histograms: Histograms,
    pub handler_counts: BTreeMap<FuncId, HandlerCounts>,
}

impl LearnState {
    fn merge(&mut self, evidence: FunctionEvidence) {
        self.matched.extend(evidence.matched);
        for (func, counts) in evidence.handler_counts {
            let entry = self.handler_counts.entry(func).or_default();
            entry.in_error += counts.in_error;
            entry.not_in_error += counts.not_in_error;
        }
        merge_histograms(&mut self.histograms, evidence.histograms);
    }
}

fn merge_histograms(into: &mut Histograms, from: Histograms) {
    for (key, histogram) in from {
        let target = into.entry(key).or_default();
        for (interval, count) in histogram {
            *target.entry(interval).or_insert(0) += count;
        }
    }
}

/// What a learning run produced, for logging and tests
#[derive(Debug, Clone, Default)]
pub struct LearnReport {
    pub matched_checks: usize,
    pub handlers: BTreeSet<FuncId>,
    pub histograms: Histograms,
}

pub struct Learner<'c, 'a> {
    ctx: &'c AnalysisContext<'a>,
    state: Mutex<LearnState>,
}

impl<'c, 'a> Learner<'c, 'a> {
    pub fn new(ctx: &'c AnalysisContext<'a>) -> Self {
        Self {
            ctx,
            state: Mutex::new(LearnState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, LearnState>, AnalysisError> {
        self.state.lock().map_err(|_| AnalysisError::LockPoisoned)
    }

    /// Run every learning stage, filling the context's interval and confidence tables
    pub fn run(self) -> Result<LearnReport, AnalysisError> {
        let ctx = self.ctx;

        info!("learning stage 0: matching similar error paths");
        ctx.for_each_module(|module| {
            for func in self.analysed_in(module) {
                let evidence = similarity::match_function(ctx, func);
                self.state()?.merge(evidence);
            }
            Ok(())
        })?;

        let handlers = {
            let state = self.state()?;
            info!(matched = state.matched.len(), "stage 0 complete");
            association::associate(ctx, &state.handler_counts)?
        };
        info!(handlers = handlers.len(), "associated error handlers");

        info!("learning stage 1: error sides from handlers");
        ctx.for_each_module(|module| {
            for func in self.analysed_in(module) {
                let matched: BTreeSet<CheckId> = self
                    .state()?
                    .matched
                    .range(CheckId { func, index: 0 }..=CheckId { func, index: u32::MAX })
                    .map(|(id, _)| *id)
                    .collect();
                let evidence = association::match_with_handlers(ctx, func, &handlers, &matched);
                self.state()?.merge(evidence);
            }
            Ok(())
        })?;

        let state = self
            .state
            .into_inner()
            .map_err(|_| AnalysisError::LockPoisoned)?;

        let stored = store::store_data(ctx, state.histograms.clone())?;
        info!(slots = stored, "stored learned intervals");

        let from_handlers = propagate::learn_errors_from_error_blocks_for_self(ctx, &handlers)?;
        let from_checks = propagate::propagate_checked_errors(ctx)?;
        info!(from_handlers, from_checks, "propagated error intervals to callers");

        Ok(LearnReport {
            matched_checks: state.matched.len(),
            handlers,
            histograms: state.histograms,
        })
    }

    fn analysed_in(&self, module: ModuleId) -> Vec<FuncId> {
        self.ctx
            .program
            .module(module)
            .functions
            .iter()
            .copied()
            .filter(|&func| self.ctx.is_analysed(func))
            .collect()
    }
}

/// Turn matched checks of one function into histogram observations
///
/// Each checked call collects the union of the intervals its matched checks imply for
/// the error side. The predicate is inverted when the error side is the false branch.
/// Calls resolved only coarsely contribute nothing.
fn process_safety_check_mapping(
    ctx: &AnalysisContext<'_>,
    matched: &BTreeMap<CheckId, SafetyCheckData>,
    histograms: &mut Histograms,
) {
    let program = ctx.program;
    let mut mapping: BTreeMap<CheckedValue, Interval> = BTreeMap::new();
    for (&id, data) in matched {
        let Some(condition) = ctx.condition(id) else {
            continue;
        };
        let Some((lhs, interval)) = error_interval(program, condition, data) else {
            continue;
        };
        mapping
            .entry(lhs)
            .or_insert_with(Interval::empty)
            .union_in_place(&interval);
    }

    for (lhs, interval) in mapping {
        let Some(call) = lhs.value.as_inst() else {
            continue;
        };
        if ctx.callgraph.is_coarse_only(call) {
            debug!(%call, "skipping coarsely resolved call");
            continue;
        }
        let Some(callees) = ctx.callgraph.callees(call) else {
            continue;
        };
        for &callee in callees {
            *histograms
                .entry((callee, lhs.slot))
                .or_default()
                .entry(interval.clone())
                .or_insert(0) += 1;
        }
    }
}

/// Interval the checked call holds on the error side of `condition`
///
/// Checks against a value that is not a known constant say nothing and yield `None`.
fn error_interval(
    program: &Program,
    condition: &AbstractCondition,
    data: &SafetyCheckData,
) -> Option<(CheckedValue, Interval)> {
    let AbstractCondition::Comparison {
        lhs,
        pred,
        rhs,
        from_branch: true,
        ..
    } = condition
    else {
        return None;
    };
    call_of(program, lhs.value)?;

    let mut pred = *pred;
    if let Some(InstKind::Branch { if_false, .. }) =
        program.terminator_kind(condition.block(program))
        && data.error_block == Some(*if_false)
    {
        pred = pred.inverse();
    }

    let rhs = compute_rhs(*rhs)?;
    Some((*lhs, Interval::full().apply_predicate(pred, rhs)))
}

/// The call instruction behind a value
pub(crate) fn call_of(program: &Program, value: Value) -> Option<InstId> {
    value.as_inst().filter(|&inst| program.is_call(Value::Inst(inst)))
}

#[cfg(test)]
mod tests;
