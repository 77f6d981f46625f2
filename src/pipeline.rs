//! Stage driver
//!
//! Runs the whole analysis over one program:
//! 1. Validate every defined function; malformed ones are rejected on their own
//! 2. Apply the allowlist and extract sanity checks
//! 3. Learn error intervals ([`crate::learn`])
//! 4. Find violations ([`crate::violations`])

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::callgraph::{AliasOracle, BasicAliasOracle, CallGraph};
use crate::checks::identify_sanity_checks;
use crate::config::AnalysisConfig;
use crate::context::{AnalysisContext, ErrorIntervals, SlotKey};
use crate::error::{AnalysisError, IrError};
use crate::interval::Interval;
use crate::ir::{FuncId, Program, validate_function};
use crate::learn::{LearnReport, Learner};
use crate::violations::{ViolationFinder, ViolationRecord};

/// Everything one analysis run produced
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutcome {
    pub intervals: ErrorIntervals,
    pub confidence: BTreeMap<SlotKey, f64>,
    pub violations: Vec<ViolationRecord>,
    /// Functions excluded because their bodies are malformed
    pub rejected: Vec<(FuncId, IrError)>,
    pub learned: LearnReport,
}

impl AnalysisOutcome {
    /// Learned interval of the function called `name`, slot 0
    pub fn interval_of(
        &self,
        program: &Program,
        name: &str,
    ) -> Result<Option<&Interval>, AnalysisError> {
        let func = program
            .function_by_name(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_string()))?;
        Ok(self.intervals.get((func, 0)))
    }

    /// Violation records as a JSON array
    pub fn violations_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.violations)
    }
}

pub struct Analyzer<'a> {
    program: &'a Program,
    callgraph: &'a CallGraph,
    alias: &'a dyn AliasOracle,
    config: &'a AnalysisConfig,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        program: &'a Program,
        callgraph: &'a CallGraph,
        alias: &'a dyn AliasOracle,
        config: &'a AnalysisConfig,
    ) -> Self {
        Self {
            program,
            callgraph,
            alias,
            config,
        }
    }

    /// Build the analysis context from validated, allowed functions
    fn prepare(&self) -> (AnalysisContext<'a>, Vec<(FuncId, IrError)>) {
        let program = self.program;
        let mut ctx = AnalysisContext::new(program, self.callgraph, self.alias, self.config);
        let mut rejected = Vec::new();
        let mut total_checks = 0;

        for function in program.functions() {
            if function.is_declaration() || !self.config.is_allowed(&function.name) {
                continue;
            }
            if let Err(err) = validate_function(program, function.id) {
                warn!(function = %function.name, error = %err, "rejecting malformed function");
                rejected.push((function.id, err));
                continue;
            }
            let checks = identify_sanity_checks(program, self.alias, function.id);
            if self.config.show_safety_checks {
                for condition in &checks {
                    info!(function = %function.name, ?condition, "sanity check");
                }
            }
            total_checks += checks.len();
            ctx.add_function(function.id, checks);
        }

        info!(
            functions = ctx.analysed_functions().count(),
            rejected = rejected.len(),
            checks = total_checks,
            "identified sanity checks"
        );
        (ctx, rejected)
    }

    pub fn run(&self) -> Result<AnalysisOutcome, AnalysisError> {
        let (ctx, rejected) = self.prepare();

        let learned = Learner::new(&ctx).run()?;
        let violations = ViolationFinder::new(&ctx).run()?;
        let tables = ctx.into_tables()?;

        Ok(AnalysisOutcome {
            intervals: tables.intervals,
            confidence: tables.confidence,
            violations,
            rejected,
            learned,
        })
    }
}

/// Analyse `program` with direct calls only and the syntactic alias oracle
pub fn analyze(program: &Program, config: &AnalysisConfig) -> Result<AnalysisOutcome, AnalysisError> {
    let callgraph = CallGraph::from_direct_calls(program);
    Analyzer::new(program, &callgraph, &BasicAliasOracle, config).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrType, Predicate, ProgramBuilder, Value};

    #[test]
    fn test_rejected_and_disallowed_functions_are_skipped() {
        let mut pb = ProgramBuilder::new();
        let m = pb.add_module("m");
        let broken = pb.declare(m, "broken", vec![], IrType::Void);
        let skipped = pb.declare(m, "skipped", vec![], IrType::Int(32));
        let kept = pb.declare(m, "kept", vec![], IrType::Int(32));
        {
            let mut fb = pb.define(broken);
            let entry = fb.create_block();
            fb.switch_to(entry);
            fb.alloca();
        }
        for func in [skipped, kept] {
            let mut fb = pb.define(func);
            let entry = fb.create_block();
            fb.switch_to(entry);
            fb.ret(Some(Value::int(0, 32)));
        }
        let program = pb.finish();
        let callgraph = CallGraph::from_direct_calls(&program);
        let config = AnalysisConfig::from_pairs([("allowlist", "broken,kept")]).unwrap();

        let analyzer = Analyzer::new(&program, &callgraph, &BasicAliasOracle, &config);
        let (ctx, rejected) = analyzer.prepare();
        assert_eq!(ctx.analysed_functions().collect::<Vec<_>>(), vec![kept]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, broken);
        assert!(matches!(rejected[0].1, IrError::MissingTerminator { .. }));
    }

    #[test]
    fn test_analyze_learns_and_looks_up_by_name() {
        let mut pb = ProgramBuilder::new();
        let m = pb.add_module("m");
        let source = pb.declare(m, "source", vec![], IrType::Int(32));
        let log = pb.declare(m, "log_error", vec![], IrType::Void);
        let func = pb.declare(m, "func", vec![], IrType::Int(32));
        {
            let mut fb = pb.define(func);
            let mut current = fb.create_block();
            for _ in 0..3 {
                let err = fb.create_block();
                let next = fb.create_block();
                fb.switch_to(current);
                let c = fb.call(source, vec![]);
                let t = fb.icmp(Predicate::Slt, c, Value::int(0, 32));
                fb.branch(t, err, next);
                fb.switch_to(err);
                fb.call(log, vec![]);
                fb.ret(Some(Value::int(-1, 32)));
                current = next;
            }
            fb.switch_to(current);
            fb.ret(Some(Value::int(0, 32)));
        }
        let program = pb.finish();

        let outcome = analyze(&program, &AnalysisConfig::default()).unwrap();
        assert!(outcome.rejected.is_empty());
        assert!(matches!(
            outcome.interval_of(&program, "nope"),
            Err(AnalysisError::UnknownFunction(name)) if name == "nope"
        ));
        assert_eq!(
            outcome.interval_of(&program, "source").unwrap(),
            Some(&Interval::from_range(i32::MIN, -1))
        );
        assert!(outcome.violations_json().unwrap().starts_with('['));
    }
}
