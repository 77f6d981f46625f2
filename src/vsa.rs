//! Value-set analysis of function return values
//!
//! [`FunctionVsa::compute_range`] bounds the values a function can return by walking
//! its return operands. The result narrows learned histograms before they are turned
//! into error intervals. The walk is conservative in a specific direction:
//! - arguments and arithmetic results contribute nothing (error values are produced
//!   by the function itself, not computed)
//! - unsupported instructions and unknown memory contribute the full range
//! - a value seen twice in one walk contributes nothing, so cycles never widen a range

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::callgraph::{AliasOracle, CallGraph};
use crate::interval::Interval;
use crate::ir::{BinOpKind, CastKind, FuncId, InstKind, IrType, Program, Value};
use crate::learn::Histograms;

/// Inclusive signed range of a fixed bit width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantRange {
    bits: u32,
    bounds: Bounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bounds {
    Empty,
    Full,
    Span(i128, i128),
}

fn signed_min(bits: u32) -> i128 {
    -(1i128 << (bits.clamp(1, 64) - 1))
}

fn signed_max(bits: u32) -> i128 {
    (1i128 << (bits.clamp(1, 64) - 1)) - 1
}

impl ConstantRange {
    pub fn empty(bits: u32) -> Self {
        Self {
            bits,
            bounds: Bounds::Empty,
        }
    }

    pub fn full(bits: u32) -> Self {
        Self {
            bits,
            bounds: Bounds::Full,
        }
    }

    pub fn singleton(value: i64, bits: u32) -> Self {
        Self::new(value as i128, value as i128, bits)
    }

    /// `[low, high]`, collapsing to full when it covers the whole width
    pub fn new(low: i128, high: i128, bits: u32) -> Self {
        let bounds = if low > high {
            Bounds::Empty
        } else if low <= signed_min(bits) && high >= signed_max(bits) {
            Bounds::Full
        } else {
            Bounds::Span(low, high)
        };
        Self { bits, bounds }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bounds == Bounds::Empty
    }

    pub fn is_full(&self) -> bool {
        self.bounds == Bounds::Full
    }

    /// Lowest and highest member as signed values
    pub fn bounds(&self) -> Option<(i128, i128)> {
        match self.bounds {
            Bounds::Empty => None,
            Bounds::Full => Some((signed_min(self.bits), signed_max(self.bits))),
            Bounds::Span(low, high) => Some((low, high)),
        }
    }

    /// Smallest range containing both
    pub fn union(&self, other: &ConstantRange) -> ConstantRange {
        match (self.bounds(), other.bounds()) {
            (None, _) => ConstantRange { bits: self.bits, ..*other },
            (_, None) => *self,
            (Some((l1, h1)), Some((l2, h2))) => Self::new(l1.min(l2), h1.max(h2), self.bits),
        }
    }

    pub fn intersection(&self, other: &ConstantRange) -> ConstantRange {
        match (self.bounds(), other.bounds()) {
            (Some((l1, h1)), Some((l2, h2))) => Self::new(l1.max(l2), h1.min(h2), self.bits),
            _ => Self::empty(self.bits),
        }
    }

    pub fn truncate(&self, bits: u32) -> ConstantRange {
        match self.bounds() {
            None => Self::empty(bits),
            Some((low, high)) if low >= signed_min(bits) && high <= signed_max(bits) => {
                Self::new(low, high, bits)
            }
            Some(_) => Self::full(bits),
        }
    }

    pub fn zero_extend(&self, bits: u32) -> ConstantRange {
        let Some((low, high)) = self.bounds() else {
            return Self::empty(bits);
        };
        if bits <= self.bits {
            return self.truncate(bits);
        }
        let modulus = 1i128 << self.bits.clamp(1, 64);
        if low >= 0 {
            Self::new(low, high, bits)
        } else if high < 0 {
            Self::new(low + modulus, high + modulus, bits)
        } else {
            Self::new(0, modulus - 1, bits)
        }
    }

    pub fn sign_extend(&self, bits: u32) -> ConstantRange {
        match self.bounds() {
            None => Self::empty(bits),
            Some((low, high)) if bits >= self.bits => Self::new(low, high, bits),
            Some(_) => self.truncate(bits),
        }
    }

    pub fn sext_or_trunc(&self, bits: u32) -> ConstantRange {
        if bits >= self.bits {
            self.sign_extend(bits)
        } else {
            self.truncate(bits)
        }
    }
}

fn width_of(ty: &IrType) -> u32 {
    match ty {
        IrType::Int(bits) => *bits,
        IrType::Ptr => 64,
        _ => 32,
    }
}

/// Operators whose results are computed rather than chosen from a set of constants
fn is_arithmetic(op: BinOpKind) -> bool {
    matches!(
        op,
        BinOpKind::Add
            | BinOpKind::Sub
            | BinOpKind::Mul
            | BinOpKind::SDiv
            | BinOpKind::UDiv
            | BinOpKind::SRem
            | BinOpKind::Or
    )
}

pub struct FunctionVsa<'a> {
    program: &'a Program,
    callgraph: &'a CallGraph,
    alias: &'a dyn AliasOracle,
    /// Learned histograms, consulted when a range comes out full
    histograms: &'a Histograms,
    ranges: HashMap<FuncId, ConstantRange>,
}

impl<'a> FunctionVsa<'a> {
    pub fn new(
        program: &'a Program,
        callgraph: &'a CallGraph,
        alias: &'a dyn AliasOracle,
        histograms: &'a Histograms,
    ) -> Self {
        Self {
            program,
            callgraph,
            alias,
            histograms,
            ranges: HashMap::new(),
        }
    }

    /// Range of the values `func` may return
    pub fn compute_range(&mut self, func: FuncId) -> ConstantRange {
        let mut visited = HashSet::new();
        self.function_range(func, &mut visited)
    }

    fn function_range(&mut self, func: FuncId, visited: &mut HashSet<Value>) -> ConstantRange {
        let program = self.program;
        let function = program.function(func);
        let Some(bits) = function.ret.int_width() else {
            return ConstantRange::full(32);
        };
        if let Some(range) = self.ranges.get(&func) {
            return *range;
        }

        let mut range = if function.is_declaration() {
            ConstantRange::full(bits)
        } else {
            ConstantRange::empty(bits)
        };
        for ret in program.returns_in(func) {
            if let InstKind::Return { value: Some(value) } = program.kind(ret) {
                range = range.union(&self.value_range(*value, func, visited));
            }
        }

        if range.is_full()
            && let Some(unique) = self.unique_interval(func)
            && let (Some(low), Some(high)) = (unique.lowest(), unique.highest())
        {
            range = ConstantRange::new(low as i128, high as i128, bits);
        }

        trace!(function = %function.name, ?range, "return value range");
        self.ranges.insert(func, range);
        range
    }

    /// The single interval learned for `func`, if its histogram holds exactly one
    fn unique_interval(&self, func: FuncId) -> Option<&'a Interval> {
        let histogram = self.histograms.get(&(func, 0))?;
        if histogram.len() != 1 {
            return None;
        }
        histogram.keys().next()
    }

    fn value_range(
        &mut self,
        value: Value,
        func: FuncId,
        visited: &mut HashSet<Value>,
    ) -> ConstantRange {
        let program = self.program;
        let bits = width_of(&program.type_of(value));
        match value {
            Value::Const(c) if c.value == i32::MAX as i64 => return ConstantRange::full(bits),
            Value::Const(c) => return ConstantRange::singleton(c.value, bits),
            Value::Null => return ConstantRange::singleton(0, bits),
            _ => {}
        }
        // Flags and their arithmetic are not worth modelling
        if bits == 1 {
            return ConstantRange::full(1);
        }
        if !visited.insert(value) {
            return ConstantRange::empty(bits);
        }

        if let Value::Arg { .. } = value {
            return ConstantRange::empty(bits);
        }
        let Value::Inst(id) = value else {
            return ConstantRange::full(bits);
        };

        match program.kind(id) {
            InstKind::Call { .. } => {
                let mut range = ConstantRange::empty(bits);
                let Some(callees) = self.callgraph.callees(id) else {
                    return range;
                };
                for &callee in callees {
                    range = range.union(&self.function_range(callee, visited));
                    if range.is_full() {
                        break;
                    }
                }
                range
            }
            InstKind::Select {
                if_true, if_false, ..
            } => {
                let range = self.value_range(*if_true, func, visited);
                if range.is_full() {
                    return range;
                }
                range.union(&self.value_range(*if_false, func, visited))
            }
            InstKind::Phi { incoming } => {
                let mut range = ConstantRange::empty(bits);
                for (_, incoming_value) in incoming {
                    range = range.union(&self.value_range(*incoming_value, func, visited));
                    if range.is_full() {
                        break;
                    }
                }
                range
            }
            InstKind::Cast { kind, value: inner } => {
                let inner_range = self.value_range(*inner, func, visited);
                match kind {
                    CastKind::Trunc => inner_range.truncate(bits),
                    CastKind::ZExt => inner_range.zero_extend(bits),
                    CastKind::SExt => inner_range.sign_extend(bits),
                    _ => ConstantRange::full(bits),
                }
            }
            InstKind::BinOp { op, lhs, rhs } => {
                if is_arithmetic(*op) {
                    return ConstantRange::empty(bits);
                }
                if let Some(InstKind::BinOp { op: inner, .. }) = program.kind_of(*lhs)
                    && is_arithmetic(*inner)
                {
                    return ConstantRange::empty(bits);
                }
                match (op, rhs.as_const()) {
                    (BinOpKind::And, Some(mask)) if mask.value >= 0 => {
                        ConstantRange::new(0, mask.value as i128, bits)
                    }
                    _ => ConstantRange::full(bits),
                }
            }
            InstKind::Load { ptr } => self.load_range(*ptr, bits, func, visited),
            _ => ConstantRange::full(bits),
        }
    }

    /// Union of everything stored to an aliasing address in the same function
    fn load_range(
        &mut self,
        ptr: Value,
        bits: u32,
        func: FuncId,
        visited: &mut HashSet<Value>,
    ) -> ConstantRange {
        let program = self.program;
        let stores: Vec<Value> = program
            .insts_in(func)
            .filter_map(|inst| match program.kind(inst) {
                InstKind::Store { ptr: target, value }
                    if self.alias.may_alias(program, ptr, *target) =>
                {
                    Some(*value)
                }
                _ => None,
            })
            .collect();

        if stores.is_empty() {
            // Memory filled in behind our back by a callee
            if let Some(InstKind::Gep { .. }) = program.kind_of(ptr) {
                let (base, _) = program.strip_constant_offsets(ptr);
                let Some(base_inst) = base.as_inst() else {
                    return ConstantRange::full(bits);
                };
                let Some(callees) = self.callgraph.callees(base_inst) else {
                    return ConstantRange::empty(bits);
                };
                let writes = callees.iter().any(|&callee| {
                    program
                        .insts_in(callee)
                        .any(|inst| matches!(program.kind(inst), InstKind::Store { .. }))
                });
                return if writes {
                    ConstantRange::full(bits)
                } else {
                    ConstantRange::empty(bits)
                };
            }
            return ConstantRange::full(bits);
        }

        let mut range = ConstantRange::empty(bits);
        for stored in stores {
            range = range.union(&self.value_range(stored, func, visited).sext_or_trunc(bits));
        }
        range
    }

    /// Narrow a histogram of learned intervals with the function's return range
    ///
    /// Intervals are intersected with the range clamped to `i32`; identical results
    /// have their counts merged. An empty range empties every interval.
    pub fn refine(&mut self, func: FuncId, histogram: &BTreeMap<Interval, u32>) -> BTreeMap<Interval, u32> {
        let function = self.program.function(func);
        if function.is_declaration() || !function.ret.is_int() {
            return histogram.clone();
        }
        let range = self.compute_range(func);
        debug!(function = %function.name, ?range, "refining learned intervals");

        let mut refined: BTreeMap<Interval, u32> = BTreeMap::new();
        for (interval, count) in histogram {
            let narrowed = match range.bounds() {
                None => Interval::empty(),
                Some(_) if range.is_full() => interval.clone(),
                Some((low, high)) => {
                    let low = low.max(i32::MIN as i128) as i32;
                    let high = high.min(i32::MAX as i128) as i32;
                    if high < low {
                        continue;
                    }
                    Interval::from_range(low, high).intersection(interval)
                }
            };
            *refined.entry(narrowed).or_insert(0) += count;
        }
        refined
    }
}

#[cfg(test)]
mod tests;
