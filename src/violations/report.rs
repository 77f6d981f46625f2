//! Violation records and scoring
//!
//! Candidate sites are grouped by source location. A site's score is the Wilson lower
//! bound of the fraction of call sites of the same callees that handle the error
//! correctly; sites below the kind's threshold are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::callgraph::CallGraph;
use crate::context::ErrorIntervals;
use crate::interval::Interval;
use crate::ir::{DebugLoc, FuncId, InstId, Program};

/// z for a 90% confidence interval
pub const WILSON_Z: f64 = 1.645;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    /// A call whose error value is never checked
    Missing,
    /// A check that does not cover every error value
    Incorrect,
    /// An error value truncated to a width that cannot hold it
    Truncation,
    /// An error sign disagreeing with the convention of the return type
    Signedness,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::Missing => "missing",
            ViolationKind::Incorrect => "incorrect",
            ViolationKind::Truncation => "truncation",
            ViolationKind::Signedness => "signedness",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl From<&DebugLoc> for SourceLocation {
    fn from(loc: &DebugLoc) -> Self {
        Self {
            file: loc.file.clone(),
            line: loc.line,
            column: loc.column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One reported violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub location: Option<SourceLocation>,
    pub kind: ViolationKind,
    /// Report score for missing and incorrect checks, learned confidence otherwise
    pub confidence: f64,
    pub callees: Vec<String>,
    /// Callee error intervals first, then the checked intervals when there are any
    pub evidence: Vec<Interval>,
}

/// Per-callee tally of badly handled and all call sites
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CountPair {
    pub incorrect: f64,
    pub total: f64,
}

impl CountPair {
    pub fn record(&mut self, incorrect: bool) {
        self.total += 1.0;
        if incorrect {
            self.incorrect += 1.0;
        }
    }
}

/// Where a candidate was found; calls without debug info stand for themselves
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiteKey {
    Source(SourceLocation),
    Inst(InstId),
}

impl SiteKey {
    pub fn of(program: &Program, inst: InstId) -> Self {
        match &program.inst(inst).loc {
            Some(loc) => SiteKey::Source(loc.into()),
            None => SiteKey::Inst(inst),
        }
    }

    fn location(&self) -> Option<SourceLocation> {
        match self {
            SiteKey::Source(loc) => Some(loc.clone()),
            SiteKey::Inst(_) => None,
        }
    }
}

/// A call found to be unchecked, or checked with the given condition intervals
#[derive(Debug, Clone, PartialEq)]
pub struct SiteReport {
    pub call: InstId,
    pub checked: Option<(Interval, Interval)>,
}

pub type Sites = BTreeMap<SiteKey, Vec<SiteReport>>;

/// Wilson score lower bound for `positive` successes out of `total`
pub fn wilson_lower(positive: f64, total: f64, z: f64) -> f64 {
    if total < 0.001 {
        return 0.0;
    }
    let p = positive / total;
    let z2 = z * z;
    let centre = p + z2 / (2.0 * total);
    let spread = z * ((p * (1.0 - p) + z2 / (4.0 * total)) / total).sqrt();
    ((centre - spread) / (1.0 + z2 / total)).clamp(0.0, 1.0)
}

/// Inputs shared by every scoring pass
pub struct Scorer<'a> {
    pub program: &'a Program,
    pub callgraph: &'a CallGraph,
    pub intervals: &'a ErrorIntervals,
}

impl Scorer<'_> {
    /// Score grouped sites of one kind and keep those at or above `threshold`
    pub fn score(
        &self,
        kind: ViolationKind,
        sites: &Sites,
        counts: &BTreeMap<FuncId, CountPair>,
        threshold: f64,
    ) -> Vec<ViolationRecord> {
        let mut records = Vec::new();
        for (site, reports) in sites {
            let Some(first) = reports.first() else {
                continue;
            };
            let Some(callees) = self.callgraph.callees(first.call) else {
                continue;
            };
            if callees.is_empty()
                || callees
                    .iter()
                    .all(|&callee| self.program.function(callee).attrs.pure)
            {
                continue;
            }

            let mut sum = CountPair::default();
            for callee in callees {
                let pair = counts.get(callee).copied().unwrap_or_default();
                sum.incorrect += pair.incorrect;
                sum.total += pair.total;
            }
            let amount = callees.len() as f64;
            sum.incorrect /= amount;
            sum.total /= amount;

            let score = wilson_lower(sum.total - sum.incorrect, sum.total, WILSON_Z);
            if score < threshold {
                trace!(?site, score, %kind, "below threshold");
                continue;
            }

            let record = ViolationRecord {
                location: site.location(),
                kind,
                confidence: score,
                callees: self.callee_names(callees),
                evidence: self.evidence(callees, reports),
            };
            info!(
                location = ?record.location,
                %kind,
                score,
                incorrect = sum.incorrect,
                correct = sum.total - sum.incorrect,
                "potential bug"
            );
            records.push(record);
        }
        records
    }

    fn callee_names(&self, callees: &BTreeSet<FuncId>) -> Vec<String> {
        callees
            .iter()
            .map(|&callee| self.program.function(callee).name.clone())
            .collect()
    }

    /// Union of the callees' error intervals, then every checked interval pair
    fn evidence(&self, callees: &BTreeSet<FuncId>, reports: &[SiteReport]) -> Vec<Interval> {
        let mut union = Interval::empty();
        for &callee in callees {
            if let Some(interval) = self.intervals.get((callee, 0))
                && !interval.is_empty()
            {
                union.union_in_place(interval);
            }
        }
        let mut evidence = vec![union];
        for report in reports {
            if let Some((first, second)) = &report.checked {
                evidence.push(first.clone());
                evidence.push(second.clone());
            }
        }
        evidence
    }
}
