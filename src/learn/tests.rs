use super::*;
use crate::callgraph::{BasicAliasOracle, CallGraph};
use crate::checks::identify_sanity_checks;
use crate::config::AnalysisConfig;
use crate::context::ErrorIntervals;
use crate::ir::{CastKind, IrType, Predicate, ProgramBuilder};

fn context<'a>(
    program: &'a Program,
    callgraph: &'a CallGraph,
    config: &'a AnalysisConfig,
    analysed: &[FuncId],
) -> AnalysisContext<'a> {
    let mut ctx = AnalysisContext::new(program, callgraph, &BasicAliasOracle, config);
    for &func in analysed {
        let checks = identify_sanity_checks(program, &BasicAliasOracle, func);
        ctx.add_function(func, checks);
    }
    ctx
}

/// `func` calls `source` three times, each followed by `if (x < 0) { log(); return -1; }`
fn repeated_checks() -> (Program, FuncId, FuncId) {
    checked_source(false, false)
}

/// Variants of [`repeated_checks`]: `limit_rhs` compares against `limit()` instead of 0,
/// `shared_tail` makes every error block jump to one shared `return -1` block
fn checked_source(limit_rhs: bool, shared_tail: bool) -> (Program, FuncId, FuncId) {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let limit = pb.declare(m, "limit", vec![], IrType::Int(32));
    let log = pb.declare(m, "log_error", vec![], IrType::Void);
    let func = pb.declare(m, "func", vec![], IrType::Int(32));
    {
        let mut fb = pb.define(func);
        let mut current = fb.create_block();
        let tail = shared_tail.then(|| fb.create_block());
        for _ in 0..3 {
            let err = fb.create_block();
            let next = fb.create_block();
            fb.switch_to(current);
            let c = fb.call(source, vec![]);
            let rhs = if limit_rhs {
                fb.call(limit, vec![])
            } else {
                Value::int(0, 32)
            };
            let t = fb.icmp(Predicate::Slt, c, rhs);
            fb.branch(t, err, next);
            fb.switch_to(err);
            fb.call(log, vec![]);
            match tail {
                Some(tail) => {
                    fb.jump(tail);
                }
                None => {
                    fb.ret(Some(Value::int(-1, 32)));
                }
            }
            current = next;
        }
        if let Some(tail) = tail {
            fb.switch_to(tail);
            fb.ret(Some(Value::int(-1, 32)));
        }
        fb.switch_to(current);
        fb.ret(Some(Value::int(0, 32)));
    }
    (pb.finish(), source, func)
}

#[test]
fn test_should_replace_prefers_fewer_branches() {
    let data = |lcs, len, sum| SafetyCheckData {
        error_block: Some(BlockId(0)),
        lcs,
        len,
        sum,
    };
    assert!(SafetyCheckData::should_replace(None, &data(1, 3, 4)));
    assert!(SafetyCheckData::should_replace(Some(&data(3, 3, 2)), &data(1, 5, 0)));
    assert!(!SafetyCheckData::should_replace(Some(&data(1, 3, 0)), &data(5, 1, 2)));
    // Same branch count: a longer common subsequence wins
    assert!(SafetyCheckData::should_replace(Some(&data(1, 3, 0)), &data(2, 4, 0)));
    // Same subsequence: a shorter path wins
    assert!(SafetyCheckData::should_replace(Some(&data(2, 4, 0)), &data(2, 3, 0)));
    assert!(!SafetyCheckData::should_replace(Some(&data(2, 3, 0)), &data(2, 4, 0)));
}

#[test]
fn test_pool_subsets() {
    let narrow = Interval::singleton(-1);
    let wide = Interval::from_range(i32::MIN, -1);
    let histogram = Histogram::from([(narrow.clone(), 2), (wide.clone(), 2)]);

    // Definitions: the narrower observation also counts for the wider one
    let pooled: Histogram = store::pool_subsets(histogram.clone(), false)
        .into_iter()
        .collect();
    assert_eq!(pooled, Histogram::from([(narrow.clone(), 2), (wide.clone(), 4)]));

    // Declarations: the wider observation folds into the narrower one
    let pooled: Histogram = store::pool_subsets(histogram, true).into_iter().collect();
    assert_eq!(pooled, Histogram::from([(narrow, 4), (wide, 0)]));
}

#[test]
fn test_determine_error_branch() {
    let (program, source, func) = repeated_checks();
    let callgraph = CallGraph::from_direct_calls(&program);
    let call = program
        .calls_in(func)
        .find(|&c| program.direct_callee(c) == Some(source))
        .unwrap();

    let mut intervals = ErrorIntervals::new();
    let decide = |intervals: &ErrorIntervals, pred, rhs| {
        determine_error_branch(intervals, &callgraph, pred, 0, rhs, call)
    };
    assert_eq!(decide(&intervals, Predicate::Slt, 0), None);

    intervals.replace((source, 0), Interval::empty());
    assert_eq!(decide(&intervals, Predicate::Slt, 0), None);

    intervals.replace((source, 0), Interval::from_range(i32::MIN, -1));
    assert_eq!(decide(&intervals, Predicate::Slt, 0), Some(true));
    assert_eq!(decide(&intervals, Predicate::Sge, 0), Some(false));
    assert_eq!(decide(&intervals, Predicate::Eq, 0), Some(false));
    assert_eq!(decide(&intervals, Predicate::Ne, 0), Some(true));
}

#[test]
fn test_learns_callee_and_propagates_to_caller() {
    let (program, source, func) = repeated_checks();
    let callgraph = CallGraph::from_direct_calls(&program);
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);

    let report = Learner::new(&ctx).run().unwrap();
    assert_eq!(report.matched_checks, 3);
    assert!(report.handlers.is_empty());
    assert_eq!(
        report.histograms.get(&(source, 0)),
        Some(&Histogram::from([(Interval::from_range(i32::MIN, -1), 3)]))
    );

    let tables = ctx.into_tables().unwrap();
    assert_eq!(
        tables.intervals.get((source, 0)),
        Some(&Interval::from_range(i32::MIN, -1))
    );
    assert_eq!(tables.confidence.get(&(source, 0)), Some(&1.0));
    assert_eq!(tables.intervals.get((func, 0)), Some(&Interval::singleton(-1)));
}

#[test]
fn test_associate_requires_support_and_fraction() {
    let (program, source, func) = repeated_checks();
    let callgraph = CallGraph::from_direct_calls(&program);
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);
    let log = program.function_by_name("log_error").unwrap();

    let counts = BTreeMap::from([
        (
            log,
            HandlerCounts {
                in_error: 12,
                not_in_error: 0,
            },
        ),
        (
            source,
            HandlerCounts {
                in_error: 12,
                not_in_error: 5,
            },
        ),
        (
            func,
            HandlerCounts {
                in_error: 3,
                not_in_error: 0,
            },
        ),
    ]);
    let handlers = association::associate(&ctx, &counts).unwrap();
    assert_eq!(handlers, BTreeSet::from([log]));

    // A function with an interval of its own is never a handler
    ctx.tables()
        .unwrap()
        .intervals
        .replace((log, 0), Interval::empty());
    assert!(association::associate(&ctx, &counts).unwrap().is_empty());
}

#[test]
fn test_error_successor_and_stage1_inversion() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let log = pb.declare(m, "log_error", vec![], IrType::Void);
    let func = pb.declare(m, "func", vec![], IrType::Int(32));
    let (entry, err) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let ok = fb.create_block();
        let err = fb.create_block();
        let out = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let t = fb.icmp(Predicate::Eq, c, Value::int(0, 32));
        fb.branch(t, ok, err);
        fb.switch_to(ok);
        fb.ret(Some(Value::int(0, 32)));
        fb.switch_to(err);
        fb.call(log, vec![]);
        fb.jump(out);
        fb.switch_to(out);
        fb.ret(Some(Value::int(-22, 32)));
        (entry, err)
    };
    let program = pb.finish();
    let callgraph = CallGraph::from_direct_calls(&program);
    let handlers = BTreeSet::from([log]);

    assert_eq!(error_successor(&program, &callgraph, &handlers, entry), Some(err));
    assert_eq!(error_successor(&program, &callgraph, &BTreeSet::new(), entry), None);

    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);
    let evidence = association::match_with_handlers(&ctx, func, &handlers, &BTreeSet::new());
    assert_eq!(evidence.matched.len(), 1);
    // The error side is the false branch of `c == 0`
    assert_eq!(
        evidence.histograms.get(&(source, 0)),
        Some(&Histogram::from([(
            Interval::full().apply_predicate(Predicate::Ne, 0),
            1
        )]))
    );
}

#[test]
fn test_non_constant_rhs_is_not_evidence() {
    let (program, source, func) = checked_source(true, false);
    let limit = program.function_by_name("limit").unwrap();
    let callgraph = CallGraph::from_direct_calls(&program);
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);

    let report = Learner::new(&ctx).run().unwrap();
    assert!(report.histograms.get(&(source, 0)).is_none());
    assert!(report.histograms.get(&(limit, 0)).is_none());

    let tables = ctx.into_tables().unwrap();
    assert_eq!(tables.intervals.get((source, 0)), None);
    assert_eq!(tables.confidence.get(&(source, 0)), None);
}

#[test]
fn test_match_length_counts_path_blocks() {
    let (program, _, func) = checked_source(false, true);
    let callgraph = CallGraph::from_direct_calls(&program);
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);

    let evidence = similarity::match_function(&ctx, func);
    assert_eq!(evidence.matched.len(), 3);
    // check block, error block, shared tail; the summary only holds the call and return
    for data in evidence.matched.values() {
        assert_eq!(data.sum, 0);
        assert_eq!(data.len, 3);
    }
}

#[test]
fn test_extended_comparison_is_not_evidence() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let failed = pb.declare(m, "failed", vec![], IrType::Int(32));
    let entry = {
        let mut fb = pb.define(failed);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let t = fb.icmp(Predicate::Slt, c, Value::int(0, 32));
        let z = fb.cast(CastKind::ZExt, t, IrType::Int(32));
        fb.ret(Some(z));
        entry
    };
    let program = pb.finish();
    let callgraph = CallGraph::from_direct_calls(&program);
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[failed]);

    let (id, condition) = ctx.checks_with_ids(failed).next().unwrap();
    assert!(condition.is_comparison());
    assert!(!condition.is_from_branch());

    let matched = BTreeMap::from([(id, SafetyCheckData::from_error_block(entry))]);
    let mut histograms = Histograms::new();
    process_safety_check_mapping(&ctx, &matched, &mut histograms);
    assert!(histograms.is_empty());

    let report = Learner::new(&ctx).run().unwrap();
    assert_eq!(report.matched_checks, 0);
    assert!(report.histograms.get(&(source, 0)).is_none());
}

#[test]
fn test_coarse_only_calls_are_not_learned_from() {
    let (program, source, func) = repeated_checks();
    let mut callgraph = CallGraph::from_direct_calls(&program);
    let calls: Vec<InstId> = program
        .calls_in(func)
        .filter(|&c| program.direct_callee(c) == Some(source))
        .collect();
    assert_eq!(calls.len(), 3);
    for call in calls {
        callgraph.add_indirect_targets(call, [source], true);
    }
    let config = AnalysisConfig::default();
    let ctx = context(&program, &callgraph, &config, &[func]);

    let report = Learner::new(&ctx).run().unwrap();
    assert_eq!(report.matched_checks, 3);
    assert!(report.histograms.get(&(source, 0)).is_none());
    assert_eq!(ctx.into_tables().unwrap().intervals.get((source, 0)), None);
}
