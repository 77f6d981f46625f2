//! Violation finding
//!
//! Runs after learning, against the shared interval table:
//! - missing checks, with a fixpoint that also learns intervals for functions that
//!   return an erroring call unchecked
//! - incorrect checks, whose condition covers neither the error interval nor its inverse
//! - truncation of error values to widths that cannot represent them
//! - signedness disagreeing with the convention of a return type name
//!
//! Missing and incorrect candidates are tallied per callee and scored in [`report`].

mod report;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, trace};

pub use report::{
    CountPair, SiteKey, SiteReport, Sites, SourceLocation, ViolationKind, ViolationRecord,
    WILSON_Z, wilson_lower,
};

use crate::checks::{AbstractCondition, CheckedValue};
use crate::context::{AnalysisContext, ErrorIntervals, SlotKey};
use crate::error::AnalysisError;
use crate::interval::Interval;
use crate::ir::{CastKind, DebugLoc, FuncId, InstId, InstKind, Program, Value};
use crate::learn::{call_of, determine_error_branch};
use crate::paths::{Path, PathEnumerator};
use crate::resolve::{collect_calls, compute_rhs, resolve_along_path};
use report::Scorer;

/// Candidates and tallies gathered by the missing and incorrect stages
#[derive(Debug, Default)]
struct FinderState {
    missing_counts: BTreeMap<FuncId, CountPair>,
    incorrect_counts: BTreeMap<FuncId, CountPair>,
    missing_sites: Sites,
    incorrect_sites: Sites,
    /// Calls already counted as missing
    visited: HashSet<InstId>,
    /// Inlined locations already counted as missing
    visited_inlined: HashSet<DebugLoc>,
}

/// Incorrect-check evidence of one function, merged under one lock
#[derive(Debug, Default)]
struct IncorrectEvidence {
    counts: BTreeMap<FuncId, CountPair>,
    sites: Vec<(SiteKey, SiteReport)>,
}

/// Interval learned by return-rule propagation, pending arbitration
struct Proposal {
    interval: Interval,
    learned_from: BTreeSet<FuncId>,
}

/// Work carried between rounds of the missing-check fixpoint
#[derive(Default)]
struct Round {
    output: ErrorIntervals,
    next: BTreeSet<FuncId>,
    replace: BTreeMap<SlotKey, Interval>,
}

pub struct ViolationFinder<'c, 'a> {
    ctx: &'c AnalysisContext<'a>,
    state: Mutex<FinderState>,
}

impl<'c, 'a> ViolationFinder<'c, 'a> {
    pub fn new(ctx: &'c AnalysisContext<'a>) -> Self {
        Self {
            ctx,
            state: Mutex::new(FinderState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, FinderState>, AnalysisError> {
        self.state.lock().map_err(|_| AnalysisError::LockPoisoned)
    }

    /// Run every detector and score the results
    pub fn run(self) -> Result<Vec<ViolationRecord>, AnalysisError> {
        let ctx = self.ctx;

        info!("finding missing checks");
        self.find_missing_checks()?;

        info!("finding incorrect checks");
        ctx.for_each_module(|module| {
            for &func in &ctx.program.module(module).functions {
                if !ctx.is_analysed(func) {
                    continue;
                }
                let evidence = {
                    let tables = ctx.tables()?;
                    determine_incorrect_checks(ctx, &tables.intervals, func)
                };
                let mut state = self.state()?;
                for (callee, pair) in evidence.counts {
                    let entry = state.incorrect_counts.entry(callee).or_default();
                    entry.incorrect += pair.incorrect;
                    entry.total += pair.total;
                }
                for (site, report) in evidence.sites {
                    state.incorrect_sites.entry(site).or_default().push(report);
                }
            }
            Ok(())
        })?;

        let state = self
            .state
            .into_inner()
            .map_err(|_| AnalysisError::LockPoisoned)?;
        let tables = ctx.tables()?;
        let scorer = Scorer {
            program: ctx.program,
            callgraph: ctx.callgraph,
            intervals: &tables.intervals,
        };

        let mut records = scorer.score(
            ViolationKind::Missing,
            &state.missing_sites,
            &state.missing_counts,
            ctx.config.missing_check_threshold,
        );
        records.extend(scorer.score(
            ViolationKind::Incorrect,
            &state.incorrect_sites,
            &state.incorrect_counts,
            ctx.config.incorrect_check_threshold,
        ));
        records.extend(find_truncations(ctx, &tables.intervals, &tables.confidence));
        records.extend(find_signedness_bugs(ctx, &tables.intervals, &tables.confidence));

        info!(violations = records.len(), "violation finding complete");
        Ok(records)
    }

    /// Missing checks and return rules, iterated until no function learns anything new
    fn find_missing_checks(&self) -> Result<(), AnalysisError> {
        let ctx = self.ctx;
        let mut handled: HashSet<(FuncId, FuncId)> = HashSet::new();
        let mut pending: BTreeSet<FuncId> = ctx.analysed_functions().collect();
        let mut rounds = 0;

        loop {
            rounds += 1;
            let mut round = Round::default();
            {
                let mut tables = ctx.tables()?;
                let mut state = self.state()?;
                let input = tables.intervals.clone();
                for &func in &pending {
                    if !ctx.is_analysed(func) {
                        continue;
                    }
                    self.determine_missing_checks_and_propagation_rules(
                        func,
                        &input,
                        &mut tables.confidence,
                        &mut round,
                        &mut handled,
                        &mut state,
                    );
                }
                for (key, interval) in std::mem::take(&mut round.replace) {
                    tables.intervals.replace(key, interval);
                }
                let learned = round.output.len();
                tables.intervals.merge_union(std::mem::take(&mut round.output));
                debug!(round = rounds, learned, next = round.next.len(), "missing-check round");
                if learned == 0 || round.next.is_empty() {
                    break;
                }
            }
            pending = round.next;
        }
        Ok(())
    }

    fn determine_missing_checks_and_propagation_rules(
        &self,
        func: FuncId,
        input: &ErrorIntervals,
        confidence: &mut BTreeMap<SlotKey, f64>,
        round: &mut Round,
        handled: &mut HashSet<(FuncId, FuncId)>,
        state: &mut FinderState,
    ) {
        let ctx = self.ctx;
        let program = ctx.program;
        let function = program.function(func);

        let mut candidates: BTreeSet<InstId> = program
            .calls_in(func)
            .filter(|&call| {
                ctx.callgraph.callees(call).is_some_and(|callees| {
                    callees.iter().any(|&callee| {
                        input
                            .get((callee, 0))
                            .is_some_and(|interval| !interval.is_empty())
                    })
                })
            })
            .collect();

        if !function.ret.is_void() && !candidates.is_empty() {
            let proposal = self.returned_error_values(input, &mut candidates);
            if !proposal.interval.is_empty() && !proposal.interval.is_full() {
                let key = (func, 0);
                match input.get(key) {
                    Some(_) => {
                        if let Some(avg) = arbitrate(confidence, key, &proposal.learned_from) {
                            confidence.insert(key, avg);
                            round.replace.entry(key).or_insert(proposal.interval);
                        }
                    }
                    None => round.output.insert(key, proposal.interval),
                }
                for call in ctx.callgraph.callers(func) {
                    let caller = program.function_of(call);
                    if handled.insert((caller, func)) {
                        round.next.insert(caller);
                    }
                }
            }
        }

        for condition in ctx.checks_of(func) {
            if let Some(inst) = condition.lhs().value.as_inst() {
                candidates.remove(&inst);
            }
        }
        if candidates.is_empty() {
            return;
        }

        let consumed = consumed_calls(program, func);
        for call in candidates {
            if program.type_of(Value::Inst(call)).is_ptr() {
                continue;
            }
            if !state.visited.insert(call) {
                continue;
            }
            if let Some(loc) = &program.inst(call).loc
                && loc.inlined_at.is_some()
                && !state.visited_inlined.insert(loc.clone())
            {
                continue;
            }
            let Some(callees) = ctx.callgraph.callees(call) else {
                continue;
            };
            let unchecked = !consumed.contains(&call);
            for &callee in callees {
                state
                    .missing_counts
                    .entry(callee)
                    .or_default()
                    .record(unchecked);
            }
            if unchecked {
                trace!(function = %function.name, %call, "unchecked error value");
                state
                    .missing_sites
                    .entry(SiteKey::of(program, call))
                    .or_default()
                    .push(SiteReport {
                        call,
                        checked: None,
                    });
            }
        }
    }

    /// Error values returned from erroring calls that are not checked locally
    ///
    /// Returned calls are removed from `candidates`: returning an error passes the duty
    /// to check it on to the callers.
    fn returned_error_values(
        &self,
        input: &ErrorIntervals,
        candidates: &mut BTreeSet<InstId>,
    ) -> Proposal {
        let ctx = self.ctx;
        let program = ctx.program;

        let mut roots = BTreeSet::new();
        for &call in candidates.iter() {
            let mut root = program.block_of(call);
            let mut seen = HashSet::from([root]);
            while let Some(previous) = program.unique_predecessor(root)
                && program.successors(previous).len() == 1
                && seen.insert(previous)
            {
                root = previous;
            }
            roots.insert(root);
        }

        let no_boundary = HashSet::new();
        let enumerator = PathEnumerator::new(program, &no_boundary);
        let mut proposal = Proposal {
            interval: Interval::empty(),
            learned_from: BTreeSet::new(),
        };
        for root in roots {
            for path in enumerator.collect(root, Path::new(None)) {
                let Some(last) = path.last() else {
                    continue;
                };
                let Some(InstKind::Return { value: Some(value) }) = program.terminator_kind(last)
                else {
                    continue;
                };
                let Some(resolved) = resolve_along_path(program, ctx.alias, Some(*value), &path.blocks)
                else {
                    if let Some(inst) = value.as_inst() {
                        candidates.remove(&inst);
                    }
                    continue;
                };
                if let Some(inst) = resolved.as_inst() {
                    candidates.remove(&inst);
                }

                match program.kind_of(resolved) {
                    Some(InstKind::Cmp { pred, lhs, rhs }) => {
                        let Some(call) = resolve_along_path(program, ctx.alias, Some(*lhs), &path.blocks)
                            .and_then(|checked| call_of(program, checked))
                        else {
                            continue;
                        };
                        let Some(rhs) = compute_rhs(*rhs) else {
                            continue;
                        };
                        let Some(error_when_true) =
                            determine_error_branch(input, ctx.callgraph, *pred, 0, rhs, call)
                        else {
                            continue;
                        };
                        let returned = if !error_when_true {
                            0
                        } else if sign_extended(program, resolved) {
                            -1
                        } else {
                            1
                        };
                        proposal.interval.union_in_place(&Interval::singleton(returned));
                        if let Some(callees) = ctx.callgraph.callees(call) {
                            proposal.learned_from.extend(callees.iter().copied());
                        }
                    }
                    Some(InstKind::Call { .. }) => {
                        let Some(call) = resolved.as_inst() else {
                            continue;
                        };
                        let mut intersected = Interval::full();
                        for &callee in ctx.callgraph.callees(call).into_iter().flatten() {
                            if let Some(interval) = input.get((callee, 0))
                                && !interval.is_empty()
                            {
                                intersected.intersect_in_place(interval);
                                proposal.learned_from.insert(callee);
                            }
                        }
                        proposal.interval.union_in_place(&intersected);
                    }
                    _ => {}
                }
            }
        }
        proposal
    }
}

/// New confidence for `key` when the proposed interval should replace its current one
///
/// The proposal wins when its sources are on average more confident than the current
/// entry. An entry without recorded confidence is replaced when more than one source
/// backs the proposal.
fn arbitrate(
    confidence: &BTreeMap<SlotKey, f64>,
    key: SlotKey,
    learned_from: &BTreeSet<FuncId>,
) -> Option<f64> {
    let average = if learned_from.is_empty() {
        0.0
    } else {
        let sum: f64 = learned_from
            .iter()
            .map(|&source| confidence.get(&(source, 0)).copied().unwrap_or(0.0))
            .sum();
        sum / learned_from.len() as f64
    };
    let replace = match confidence.get(&key) {
        Some(&current) => current < average,
        None => learned_from.len() > 1,
    };
    replace.then_some(average)
}

fn sign_extended(program: &Program, value: Value) -> bool {
    value.as_inst().is_some_and(|inst| {
        program.users(inst).iter().any(|&user| {
            matches!(
                program.kind(user),
                InstKind::Cast {
                    kind: CastKind::SExt,
                    ..
                }
            )
        })
    })
}

/// Calls that reach a comparison, a conditional branch or a return
fn consumed_calls(program: &Program, func: FuncId) -> BTreeSet<InstId> {
    let mut result = BTreeSet::new();
    for inst in program.insts_in(func) {
        match program.kind(inst) {
            InstKind::Cmp { lhs, .. } => collect_calls(program, *lhs, &mut result),
            InstKind::Branch { cond, .. } => collect_calls(program, *cond, &mut result),
            InstKind::Return { value: Some(value) } => collect_calls(program, *value, &mut result),
            _ => {}
        }
    }
    result
}

/// Check each checked call against the intervals its conditions imply
///
/// The error side of a check is not known here, so a check is correct when every
/// callee's interval fits either the condition or its inverse.
fn determine_incorrect_checks(
    ctx: &AnalysisContext<'_>,
    intervals: &ErrorIntervals,
    func: FuncId,
) -> IncorrectEvidence {
    let program = ctx.program;
    let mut implied: BTreeMap<CheckedValue, (Interval, Interval)> = BTreeMap::new();
    for condition in ctx.checks_of(func) {
        let AbstractCondition::Comparison { lhs, pred, rhs, .. } = condition else {
            continue;
        };
        let Some(rhs) = compute_rhs(*rhs) else {
            continue;
        };
        let entry = implied
            .entry(*lhs)
            .or_insert_with(|| (Interval::empty(), Interval::empty()));
        entry
            .0
            .union_in_place(&Interval::full().apply_predicate(*pred, rhs));
        entry
            .1
            .union_in_place(&Interval::full().apply_predicate(pred.inverse(), rhs));
    }

    let mut evidence = IncorrectEvidence::default();
    for (lhs, (first, second)) in implied {
        let Some(call) = call_of(program, lhs.value) else {
            continue;
        };
        let Some(callees) = ctx.callgraph.callees(call) else {
            continue;
        };
        let covered_by = |checked: &Interval| {
            callees.iter().all(|&callee| match intervals.get((callee, lhs.slot)) {
                None => true,
                Some(interval) if interval.is_empty() || interval.is_full() => true,
                Some(interval) => interval.is_subset_of(checked),
            })
        };
        let correct = covered_by(&first) || covered_by(&second);
        for &callee in callees {
            evidence.counts.entry(callee).or_default().record(!correct);
        }
        if !correct {
            trace!(function = %program.function(func).name, %call, "check misses error values");
            evidence.sites.push((
                SiteKey::of(program, call),
                SiteReport {
                    call,
                    checked: Some((first, second)),
                },
            ));
        }
    }
    evidence
}

fn learned_confidence(confidence: &BTreeMap<SlotKey, f64>, key: SlotKey) -> f64 {
    confidence.get(&key).copied().unwrap_or(1.0)
}

/// Error values truncated to a width that cannot hold them
///
/// Results compared or switched on directly are exempt; only the truncated copy is
/// suspicious.
fn find_truncations(
    ctx: &AnalysisContext<'_>,
    intervals: &ErrorIntervals,
    confidence: &BTreeMap<SlotKey, f64>,
) -> Vec<ViolationRecord> {
    let program = ctx.program;
    let mut records = Vec::new();
    for ((func, slot), interval) in intervals.iter() {
        if slot != 0 || interval.is_empty() {
            continue;
        }
        let (Some(lowest), Some(highest)) = (interval.lowest(), interval.highest()) else {
            continue;
        };
        for call in ctx.callgraph.callers(func) {
            if !ctx.is_analysed(program.function_of(call)) {
                continue;
            }
            let users = program.users(call);
            if users.iter().any(|&user| {
                matches!(
                    program.kind(user),
                    InstKind::Cmp { .. } | InstKind::Switch { .. }
                )
            }) {
                continue;
            }
            for &user in users {
                let InstKind::Cast {
                    kind: CastKind::Trunc,
                    ..
                } = program.kind(user)
                else {
                    continue;
                };
                let Some(width) = program.inst(user).ty.int_width() else {
                    continue;
                };
                if width >= 64 || width == 0 {
                    continue;
                }
                let lower = -(1i64 << (width - 1));
                let upper = (1i64 << (width - 1)) - 1;
                if (lowest as i64) >= lower && (highest as i64) <= upper {
                    continue;
                }
                info!(
                    caller = %program.function(program.function_of(call)).name,
                    callee = %program.function(func).name,
                    width,
                    "potential bug: truncation of error values"
                );
                let loc = program.inst(user).loc.as_ref().or(program.inst(call).loc.as_ref());
                records.push(ViolationRecord {
                    location: loc.map(SourceLocation::from),
                    kind: ViolationKind::Truncation,
                    confidence: learned_confidence(confidence, (func, 0)),
                    callees: vec![program.function(func).name.clone()],
                    evidence: vec![interval.clone()],
                });
            }
        }
    }
    records
}

/// Sign convention counts of one return type name
#[derive(Debug, Clone, Copy, Default)]
struct SignednessCounter {
    negative: u32,
    zero: u32,
    positive: u32,
}

impl SignednessCounter {
    fn update(&mut self, signedness: i8) {
        match signedness {
            -1 => self.negative += 1,
            1 => self.positive += 1,
            _ => self.zero += 1,
        }
    }

    /// The strictly dominant sign, or 0
    fn verdict(&self) -> i8 {
        if self.negative > self.zero && self.negative > self.positive {
            -1
        } else if self.positive > self.zero && self.positive > self.negative {
            1
        } else {
            0
        }
    }
}

/// Functions whose error sign disagrees with the convention of their return type name
fn find_signedness_bugs(
    ctx: &AnalysisContext<'_>,
    intervals: &ErrorIntervals,
    confidence: &BTreeMap<SlotKey, f64>,
) -> Vec<ViolationRecord> {
    let program = ctx.program;
    let typed: Vec<(SlotKey, &str, &Interval)> = intervals
        .iter()
        .filter_map(|(key, interval)| {
            let function = program.function(key.0);
            if interval.is_empty() || function.is_declaration() {
                return None;
            }
            let name = function.ret_type_name.as_deref()?;
            Some((key, name, interval))
        })
        .collect();

    let mut counters: BTreeMap<&str, SignednessCounter> = BTreeMap::new();
    for &(_, name, interval) in &typed {
        counters.entry(name).or_default().update(interval.signedness());
    }
    for (name, counter) in &counters {
        debug!(type_name = name, verdict = counter.verdict(), ?counter, "signedness convention");
    }

    let mut records = Vec::new();
    for &(key, name, interval) in &typed {
        let signedness = interval.signedness();
        let verdict = counters.get(name).map_or(0, SignednessCounter::verdict);
        if signedness == 0 || verdict == 0 || signedness == verdict {
            continue;
        }
        let function = program.function(key.0);
        info!(function = %function.name, type_name = name, "potential bug: signedness");
        records.push(ViolationRecord {
            location: function.loc.as_ref().map(SourceLocation::from),
            kind: ViolationKind::Signedness,
            confidence: learned_confidence(confidence, key),
            callees: vec![function.name.clone()],
            evidence: vec![interval.clone()],
        });
    }
    records
}
