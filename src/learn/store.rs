//! Turning histograms into learned intervals
//!
//! Steps, in order:
//! - value-set refinement of each histogram (see [`crate::vsa`])
//! - subset pooling, so narrow and wide observations of the same error support each other
//! - fraction thresholding into the shared table, with the best fraction as confidence
//! - transitive empties for thin wrappers that return the call directly

use tracing::{debug, trace};

use super::{Histogram, Histograms};
use crate::context::{AnalysisContext, SlotKey};
use crate::error::AnalysisError;
use crate::interval::Interval;
use crate::ir::{FuncId, InstKind, Value};
use crate::vsa::FunctionVsa;

/// Store every histogram into the context's tables; returns the number of slots written
pub(super) fn store_data(
    ctx: &AnalysisContext<'_>,
    mut histograms: Histograms,
) -> Result<usize, AnalysisError> {
    let program = ctx.program;

    if ctx.config.refine_vsa {
        let snapshot = histograms.clone();
        let mut vsa = FunctionVsa::new(program, ctx.callgraph, ctx.alias, &snapshot);
        for (&(func, _), histogram) in histograms.iter_mut() {
            if program.function(func).is_declaration() {
                continue;
            }
            *histogram = if program.returns_single_constant(func) {
                Histogram::from([(Interval::empty(), 1)])
            } else {
                vsa.refine(func, histogram)
            };
        }
    }

    let mut tables = ctx.tables()?;
    let mut stored = 0;
    for (key, histogram) in histograms {
        let declaration = program.function(key.0).is_declaration();
        let pooled = pool_subsets(histogram, declaration);
        let total: u64 = pooled.iter().map(|(_, count)| *count as u64).sum();
        if total == 0 {
            continue;
        }

        let mut best = 0.0f64;
        let mut passed = false;
        for (interval, count) in &pooled {
            let fraction = *count as f64 / total as f64;
            best = best.max(fraction);
            if fraction >= ctx.config.interval_confidence {
                tables.intervals.interval_for(key, false).intersect_in_place(interval);
                passed = true;
            }
        }
        if !passed {
            tables.intervals.replace(key, Interval::empty());
        }
        tables.confidence.insert(key, best);
        stored += 1;

        debug!(
            function = %program.function(key.0).name,
            slot = key.1,
            interval = ?tables.intervals.get(key),
            confidence = best,
            "learned error interval"
        );
    }

    let empties: Vec<SlotKey> = tables
        .intervals
        .iter()
        .filter(|(_, interval)| interval.is_empty())
        .map(|(key, _)| key)
        .collect();
    for (func, _) in empties {
        for wrapper in returning_wrappers(ctx, func) {
            trace!(wrapper = %program.function(wrapper).name, "returns a call with no known shape");
            tables.intervals.replace((wrapper, 0), Interval::empty());
        }
    }

    Ok(stored)
}

/// Pool observations that are subsets of each other
///
/// For declarations a wider observation seen no more often than a narrower one folds
/// into the narrower one. For definitions the narrower one adds its count to the wider
/// one and stays.
pub(super) fn pool_subsets(histogram: Histogram, declaration: bool) -> Vec<(Interval, u32)> {
    let mut entries: Vec<(Interval, u32)> = histogram.into_iter().collect();
    for i in 0..entries.len() {
        if entries[i].1 == 0 {
            continue;
        }
        for j in 0..entries.len() {
            if i == j || entries[j].1 == 0 || entries[j].1 > entries[i].1 {
                continue;
            }
            let folds = if declaration {
                entries[i].0.is_subset_of(&entries[j].0)
            } else {
                entries[j].0.is_subset_of(&entries[i].0)
            };
            if !folds {
                continue;
            }
            entries[i].1 += entries[j].1;
            if declaration {
                entries[j].1 = 0;
            }
        }
    }
    entries
}

/// Single-block functions that return the direct call of `func`
fn returning_wrappers(ctx: &AnalysisContext<'_>, func: FuncId) -> Vec<FuncId> {
    let program = ctx.program;
    let mut wrappers = Vec::new();
    for call in ctx.callgraph.callers(func) {
        if program.direct_callee(call) != Some(func) {
            continue;
        }
        let caller = program.function_of(call);
        if program.function(caller).blocks.len() != 1 {
            continue;
        }
        let returns_call = program.returns_in(caller).any(|ret| {
            matches!(
                program.kind(ret),
                InstKind::Return { value: Some(Value::Inst(v)) } if *v == call
            )
        });
        if returns_call {
            wrappers.push(caller);
        }
    }
    wrappers
}
