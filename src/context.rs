//! Shared analysis state
//!
//! [`AnalysisContext`] bundles the read-only inputs of a run (program, call graph,
//! alias oracle, configuration, extracted checks) with the tables every stage reads and
//! writes. The tables sit behind one mutex; workers lock it once per function they
//! merge, never while analysing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::callgraph::{AliasOracle, CallGraph};
use crate::checks::{AbstractCondition, CheckId};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::interval::Interval;
use crate::ir::{FuncId, InstId, ModuleId, Program};

/// A function's return slot; slot 0 is the plain return value
pub type SlotKey = (FuncId, u32);

/// Error-return intervals per function return slot
///
/// A missing entry means nothing is known. An empty interval means the function must
/// be checked but the shape of its error values is unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorIntervals {
    intervals: BTreeMap<SlotKey, Interval>,
}

impl ErrorIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: SlotKey) -> Option<&Interval> {
        self.intervals.get(&key)
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.intervals.contains_key(&key)
    }

    /// Entry for `key`, created full or empty when absent
    pub fn interval_for(&mut self, key: SlotKey, empty_by_default: bool) -> &mut Interval {
        self.intervals.entry(key).or_insert_with(|| {
            if empty_by_default {
                Interval::empty()
            } else {
                Interval::full()
            }
        })
    }

    /// Insert unless an entry already exists
    pub fn insert(&mut self, key: SlotKey, interval: Interval) {
        self.intervals.entry(key).or_insert(interval);
    }

    pub fn replace(&mut self, key: SlotKey, interval: Interval) {
        self.intervals.insert(key, interval);
    }

    /// Move every entry of `other` in, unioning with existing entries
    pub fn merge_union(&mut self, other: ErrorIntervals) {
        for (key, interval) in other.intervals {
            match self.intervals.get_mut(&key) {
                Some(existing) => existing.union_in_place(&interval),
                None => {
                    self.intervals.insert(key, interval);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &Interval)> + '_ {
        self.intervals.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Intersection of the known intervals of every callee of `call`
    ///
    /// `None` when the call has no callees or none of them has an entry.
    pub fn callee_intersection(
        &self,
        callgraph: &CallGraph,
        call: InstId,
        slot: u32,
    ) -> Option<Interval> {
        let mut accumulated: Option<Interval> = None;
        for &callee in callgraph.callees(call)? {
            let Some(interval) = self.get((callee, slot)) else {
                continue;
            };
            match &mut accumulated {
                Some(acc) => acc.intersect_in_place(interval),
                None => accumulated = Some(interval.clone()),
            }
        }
        accumulated
    }
}

/// Tables shared by all stages
#[derive(Debug, Clone, Default)]
pub struct SharedTables {
    pub intervals: ErrorIntervals,
    /// Fraction of evidence behind each learned interval
    pub confidence: BTreeMap<SlotKey, f64>,
}

pub struct AnalysisContext<'a> {
    pub program: &'a Program,
    pub callgraph: &'a CallGraph,
    pub alias: &'a dyn AliasOracle,
    pub config: &'a AnalysisConfig,
    /// Functions that passed validation and the allowlist
    analysed: BTreeSet<FuncId>,
    checks: HashMap<FuncId, Vec<AbstractCondition>>,
    shared: Mutex<SharedTables>,
}

impl<'a> AnalysisContext<'a> {
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
            analysed: BTreeSet::new(),
            checks: HashMap::new(),
            shared: Mutex::new(SharedTables::default()),
        }
    }

    /// Register a function for analysis together with its extracted checks
    pub fn add_function(&mut self, func: FuncId, checks: Vec<AbstractCondition>) {
        self.analysed.insert(func);
        self.checks.insert(func, checks);
    }

    pub fn is_analysed(&self, func: FuncId) -> bool {
        self.analysed.contains(&func)
    }

    pub fn analysed_functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.analysed.iter().copied()
    }

    pub fn checks_of(&self, func: FuncId) -> &[AbstractCondition] {
        self.checks.get(&func).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Checks of a function with their stable ids
    pub fn checks_with_ids(
        &self,
        func: FuncId,
    ) -> impl Iterator<Item = (CheckId, &AbstractCondition)> + '_ {
        self.checks_of(func)
            .iter()
            .enumerate()
            .map(move |(index, condition)| {
                (
                    CheckId {
                        func,
                        index: index as u32,
                    },
                    condition,
                )
            })
    }

    pub fn condition(&self, id: CheckId) -> Option<&AbstractCondition> {
        self.checks_of(id.func).get(id.index as usize)
    }

    pub fn total_checks(&self) -> usize {
        self.checks.values().map(Vec::len).sum()
    }

    pub fn tables(&self) -> Result<MutexGuard<'_, SharedTables>, AnalysisError> {
        self.shared.lock().map_err(|_| AnalysisError::LockPoisoned)
    }

    pub fn into_tables(self) -> Result<SharedTables, AnalysisError> {
        self.shared
            .into_inner()
            .map_err(|_| AnalysisError::LockPoisoned)
    }

    /// Run `work` once per module on up to `config.threads` scoped workers
    ///
    /// Workers pull modules from a shared counter. The first error stops every worker
    /// from taking new modules and is returned.
    pub fn for_each_module<F>(&self, work: F) -> Result<(), AnalysisError>
    where
        F: Fn(ModuleId) -> Result<(), AnalysisError> + Sync,
    {
        let modules: Vec<ModuleId> = self.program.modules().iter().map(|m| m.id).collect();
        let workers = self.config.threads.min(modules.len());
        if workers <= 1 {
            return modules.iter().try_for_each(|&module| work(module));
        }

        let next = AtomicUsize::new(0);
        let failure: Mutex<Option<AnalysisError>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(&module) = modules.get(index) else {
                            break;
                        };
                        if let Err(err) = work(module) {
                            next.store(modules.len(), Ordering::Relaxed);
                            if let Ok(mut slot) = failure.lock() {
                                slot.get_or_insert(err);
                            }
                            break;
                        }
                    }
                });
            }
        });
        match failure.into_inner() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(AnalysisError::LockPoisoned),
        }
    }
}
